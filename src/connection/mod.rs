//! Long-lived client connections.
//!
//! Each accepted connection owns a bounded outbound queue and two tasks: a
//! writer draining that queue onto the socket, and a reader pulling chunks
//! off the socket, extracting frames, and handing each one to the message
//! handler's interceptor chain. Teardown runs once, from the reader task,
//! whichever side closed first.

pub mod manager;
pub(crate) mod transport;

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::FrameExtractor,
    dispatch::MessageHandler,
    error::{FrameError, SendError},
    message::Message,
    packet::Packer,
    request::Request,
};

use transport::{TransportReader, TransportWriter};

/// Hook invoked with a connection at lifecycle edges.
pub type ConnectionHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Everything needed to spawn a connection's tasks.
pub(crate) struct ConnectionParams {
    pub id: u64,
    pub worker_id: u32,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
    pub msg_handler: Arc<MessageHandler>,
    pub extractor: Option<FrameExtractor>,
    pub packer: Arc<dyn Packer>,
    pub max_msg_chan_len: usize,
    pub io_read_buff_size: usize,
    pub heartbeat_max: Duration,
    /// Runs exactly once when the connection winds down.
    pub on_teardown: Option<Box<dyn FnOnce(&Arc<Connection>) + Send>>,
    /// Tracker for graceful shutdown; `None` spawns untracked tasks.
    pub tracker: Option<TaskTracker>,
}

/// One accepted client endpoint.
pub struct Connection {
    id: u64,
    worker_id: u32,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    out_tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    heartbeat_max: Duration,
    packer: Arc<dyn Packer>,
    token: CancellationToken,
    heartbeat_token: Mutex<Option<CancellationToken>>,
}

impl Connection {
    /// Build the connection and spawn its reader and writer tasks.
    pub(crate) fn spawn(params: ConnectionParams) -> Arc<Self> {
        let ConnectionParams {
            id,
            worker_id,
            remote_addr,
            local_addr,
            reader,
            writer,
            msg_handler,
            extractor,
            packer,
            max_msg_chan_len,
            io_read_buff_size,
            heartbeat_max,
            on_teardown,
            tracker,
        } = params;

        let (out_tx, out_rx) = mpsc::channel(max_msg_chan_len.max(1));
        let conn = Arc::new(Self {
            id,
            worker_id,
            remote_addr,
            local_addr,
            out_tx,
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            heartbeat_max,
            packer,
            token: CancellationToken::new(),
            heartbeat_token: Mutex::new(None),
        });

        let write_task = write_loop(Arc::clone(&conn), writer, out_rx);
        let read_task = read_loop(
            Arc::clone(&conn),
            reader,
            msg_handler,
            extractor,
            io_read_buff_size,
            on_teardown,
        );
        match tracker {
            Some(tracker) => {
                tracker.spawn(write_task);
                tracker.spawn(read_task);
            }
            None => {
                tokio::spawn(write_task);
                tokio::spawn(read_task);
            }
        }
        conn
    }

    /// Server-assigned monotonic connection id.
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    /// Worker id claimed at acceptance.
    #[must_use]
    pub fn worker_id(&self) -> u32 { self.worker_id }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr { self.remote_addr }

    /// Local address of the accepting listener.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Whether the peer has shown life within the liveness deadline.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let last = *self.last_activity.lock().expect("activity clock poisoned");
        last.elapsed() <= self.heartbeat_max
    }

    /// Pack `data` under `msg_id` and queue it for sending.
    ///
    /// Awaits when the outbound queue is full.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] when the connection is closed or closing and
    /// [`SendError::Oversize`] when `data` exceeds the maximum packet size.
    pub async fn send_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed(self.id));
        }
        let msg = Message::new(msg_id, data.into());
        let frame = self.packer.pack(&msg).map_err(|err| match err {
            FrameError::TooLong { length, max } => SendError::Oversize { size: length, max },
            other => SendError::Io(std::io::Error::other(other)),
        })?;
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| SendError::Closed(self.id))
    }

    /// Stop the connection: further sends fail, both tasks wind down, and
    /// teardown runs from the reader task.
    pub fn stop(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("stopping connection {}", self.id);
        }
        self.token.cancel();
        if let Some(heartbeat) = self
            .heartbeat_token
            .lock()
            .expect("heartbeat slot poisoned")
            .take()
        {
            heartbeat.cancel();
        }
    }

    /// Attach the cancellation handle of this connection's heartbeat task.
    pub(crate) fn bind_heartbeat(&self, token: CancellationToken) {
        if self.closed.load(Ordering::SeqCst) {
            token.cancel();
            return;
        }
        *self
            .heartbeat_token
            .lock()
            .expect("heartbeat slot poisoned") = Some(token);
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    fn wind_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.token.cancel();
        if let Some(heartbeat) = self
            .heartbeat_token
            .lock()
            .expect("heartbeat slot poisoned")
            .take()
        {
            heartbeat.cancel();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: Box<dyn TransportWriter>,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            () = conn.token.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = writer.write_frame(frame).await {
                    log::warn!("write failed on connection {}: {err}", conn.id);
                    conn.stop();
                    break;
                }
            }
        }
    }
    writer.shutdown().await;
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: Box<dyn TransportReader>,
    msg_handler: Arc<MessageHandler>,
    mut extractor: Option<FrameExtractor>,
    chunk_size: usize,
    on_teardown: Option<Box<dyn FnOnce(&Arc<Connection>) + Send>>,
) {
    let chunk_size = chunk_size.max(64);
    loop {
        tokio::select! {
            () = conn.token.cancelled() => break,
            read = reader.read_chunk(chunk_size) => {
                match read {
                    Ok(chunk) if chunk.is_empty() => {
                        log::debug!("connection {} closed by peer", conn.id);
                        break;
                    }
                    Ok(chunk) => {
                        conn.touch();
                        dispatch_chunk(&conn, &msg_handler, extractor.as_mut(), chunk).await;
                    }
                    Err(err) => {
                        log::warn!("read failed on connection {}: {err}", conn.id);
                        break;
                    }
                }
            }
        }
    }

    conn.wind_down();
    if let Some(teardown) = on_teardown {
        teardown(&conn);
    }
}

/// Turn one transport chunk into zero or more routed requests.
///
/// An oversize frame is logged and skipped; the stream resynchronizes
/// behind it and the connection carries on. Any other extraction failure
/// means the stream no longer lines up with the frame descriptor, so the
/// connection is stopped.
async fn dispatch_chunk(
    conn: &Arc<Connection>,
    msg_handler: &Arc<MessageHandler>,
    extractor: Option<&mut FrameExtractor>,
    chunk: Bytes,
) {
    match extractor {
        Some(extractor) => {
            extractor.push(&chunk);
            loop {
                match extractor.try_next() {
                    Ok(Some(frame)) => {
                        submit(conn, msg_handler, frame).await;
                    }
                    Ok(None) => break,
                    Err(err @ FrameError::TooLong { .. }) => {
                        log::warn!("oversize frame on connection {}: {err}", conn.id);
                    }
                    Err(err) => {
                        log::error!("unrecoverable frame error on connection {}: {err}", conn.id);
                        conn.stop();
                        break;
                    }
                }
            }
        }
        None => submit(conn, msg_handler, chunk).await,
    }
}

async fn submit(conn: &Arc<Connection>, msg_handler: &Arc<MessageHandler>, frame: Bytes) {
    let request = Request::new(Arc::clone(conn), Message::from_raw(frame));
    if let Err(err) = msg_handler.execute(request).await {
        log::warn!("dropping frame on connection {}: {err}", conn.id);
    }
}
