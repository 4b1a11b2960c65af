//! Per-connection liveness probing.
//!
//! A server carries one [`Heartbeat`] template; each accepted connection
//! gets its own probe task driven by that template. The task wakes on an
//! interval and either sends a heartbeat frame or, when the peer has gone
//! quiet past the liveness deadline, runs the not-alive callback (stopping
//! the connection by default). Stopping a probe cancels its token and never
//! blocks, no matter what the task is currently doing.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    error::SendError,
    request::Request,
    router::{Router, RouterHandler, handler},
};

/// Message id auto-registered for heartbeat frames.
pub const HEARTBEAT_DEFAULT_MSG_ID: u32 = 99999;

/// Builds the heartbeat payload for a connection.
pub type HeartbeatMsgFn = Arc<dyn Fn(&Arc<Connection>) -> Vec<u8> + Send + Sync>;

/// Runs when the remote peer missed its liveness deadline.
pub type NotAliveFn = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// User-supplied replacement for the default heartbeat send.
pub type BeatFn =
    Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<(), SendError>> + Send + Sync>;

/// Customization hooks for [`crate::server::Server::start_heartbeat_with_options`].
#[derive(Default)]
pub struct HeartbeatOptions {
    /// Replaces the default payload generator.
    pub make_msg: Option<HeartbeatMsgFn>,
    /// Replaces the default not-alive handling (stop the connection).
    pub on_remote_not_alive: Option<NotAliveFn>,
    /// Message id to register instead of [`HEARTBEAT_DEFAULT_MSG_ID`].
    pub msg_id: Option<u32>,
    /// Classic router handling inbound heartbeats.
    pub router: Option<Arc<dyn Router>>,
    /// Slices handlers handling inbound heartbeats.
    pub slices: Vec<RouterHandler>,
    /// Replaces the default heartbeat send entirely.
    pub beat: Option<BeatFn>,
}

/// Server-wide heartbeat template; one probe task is started per connection.
pub struct Heartbeat {
    interval: Duration,
    make_msg: HeartbeatMsgFn,
    on_remote_not_alive: NotAliveFn,
    msg_id: u32,
    router: Arc<dyn Router>,
    slices: Vec<RouterHandler>,
    beat: Option<BeatFn>,
}

impl Heartbeat {
    /// Template with default message, callback, id, and routes.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            make_msg: Arc::new(default_message),
            on_remote_not_alive: Arc::new(default_not_alive),
            msg_id: HEARTBEAT_DEFAULT_MSG_ID,
            router: Arc::new(DefaultHeartbeatRouter),
            slices: vec![handler(default_heartbeat_handler)],
            beat: None,
        }
    }

    /// Template customized by `options`.
    #[must_use]
    pub fn with_options(interval: Duration, options: HeartbeatOptions) -> Self {
        let mut heartbeat = Self::new(interval);
        if let Some(make_msg) = options.make_msg {
            heartbeat.make_msg = make_msg;
        }
        if let Some(not_alive) = options.on_remote_not_alive {
            heartbeat.on_remote_not_alive = not_alive;
        }
        if let Some(msg_id) = options.msg_id {
            heartbeat.msg_id = msg_id;
        }
        if let Some(router) = options.router {
            heartbeat.router = router;
        }
        if !options.slices.is_empty() {
            heartbeat.slices = options.slices;
        }
        heartbeat.beat = options.beat;
        heartbeat
    }

    /// Message id heartbeat frames are routed under.
    #[must_use]
    pub fn msg_id(&self) -> u32 { self.msg_id }

    /// Classic router to register for [`Heartbeat::msg_id`].
    #[must_use]
    pub fn router(&self) -> Arc<dyn Router> { Arc::clone(&self.router) }

    /// Slices handlers to register for [`Heartbeat::msg_id`].
    #[must_use]
    pub fn slices(&self) -> Vec<RouterHandler> { self.slices.clone() }

    /// Start a probe task bound to `conn`.
    ///
    /// The returned token cancels the task; cancelling is idempotent and
    /// never blocks.
    pub fn start_for(self: &Arc<Self>, conn: Arc<Connection>) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat.interval);
            // The first tick completes immediately; a probe that fires at
            // bind time would race connection setup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => heartbeat.check(&conn).await,
                }
            }
        });
        token
    }

    /// Send one heartbeat frame to `conn`.
    ///
    /// # Errors
    ///
    /// Propagates the connection's [`SendError`].
    pub async fn send_heartbeat(&self, conn: &Arc<Connection>) -> Result<(), SendError> {
        let payload = (self.make_msg)(conn);
        conn.send_msg(self.msg_id, payload).await
    }

    async fn check(&self, conn: &Arc<Connection>) {
        if !conn.is_alive() {
            (self.on_remote_not_alive)(Arc::clone(conn));
            return;
        }
        let result = match &self.beat {
            Some(beat) => beat(Arc::clone(conn)).await,
            None => self.send_heartbeat(conn).await,
        };
        if let Err(err) = result {
            log::error!("heartbeat send failed on connection {}: {err}", conn.id());
        }
    }
}

/// Default route for inbound heartbeat frames: log and move on.
struct DefaultHeartbeatRouter;

impl Router for DefaultHeartbeatRouter {
    fn handle(&self, request: &mut Request) { default_heartbeat_handler(request); }
}

fn default_heartbeat_handler(request: &mut Request) {
    let peer = request
        .connection()
        .map(|conn| conn.remote_addr().to_string())
        .unwrap_or_else(|| "<detached>".to_owned());
    log::info!(
        "receive heartbeat from {peer}, msg id = {}, {} bytes",
        request.msg_id(),
        request.data().len()
    );
}

fn default_message(conn: &Arc<Connection>) -> Vec<u8> {
    format!("heartbeat [{}->{}]", conn.local_addr(), conn.remote_addr()).into_bytes()
}

fn default_not_alive(conn: Arc<Connection>) {
    log::info!(
        "remote connection {} is not alive, stopping it",
        conn.remote_addr()
    );
    conn.stop();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        codec::{FrameDecoder, FrameExtractor, TlvDecoder},
        config::ServerConfig,
        connection::{ConnectionParams, transport},
        dispatch::MessageHandler,
        packet::{Packer, TlvPacker},
    };

    fn spawn_conn(
        heartbeat_max: Duration,
    ) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (reader, writer) = transport::split_duplex(ours);
        let mh = Arc::new(MessageHandler::new(&ServerConfig::default()));
        let conn = Connection::spawn(ConnectionParams {
            id: 1,
            worker_id: 0,
            remote_addr: "127.0.0.1:9".parse().expect("addr"),
            local_addr: "127.0.0.1:10".parse().expect("addr"),
            reader,
            writer,
            msg_handler: mh,
            extractor: TlvDecoder::default().length_field().map(FrameExtractor::new),
            packer: Arc::new(TlvPacker::new(4096)),
            max_msg_chan_len: 8,
            io_read_buff_size: 64,
            heartbeat_max,
            on_teardown: None,
            tracker: None,
        });
        (conn, theirs)
    }

    #[rstest]
    #[tokio::test]
    async fn live_connection_receives_heartbeat_frames() {
        let (conn, theirs) = spawn_conn(Duration::from_secs(60));
        let heartbeat = Arc::new(Heartbeat::new(Duration::from_millis(10)));
        let token = heartbeat.start_for(Arc::clone(&conn));

        let (mut peer_read, _peer_write) = tokio::io::split(theirs);
        let mut head = [0_u8; 8];
        peer_read.read_exact(&mut head).await.expect("frame head");
        let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        assert_eq!(id, HEARTBEAT_DEFAULT_MSG_ID);

        let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
        let mut body = vec![0_u8; len];
        peer_read.read_exact(&mut body).await.expect("frame body");
        let text = String::from_utf8(body).expect("utf8 payload");
        assert!(text.starts_with("heartbeat ["));

        token.cancel();
    }

    #[rstest]
    #[tokio::test]
    async fn quiet_peer_triggers_the_not_alive_callback() {
        let (conn, _theirs) = spawn_conn(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let heartbeat = Arc::new(Heartbeat::with_options(
            Duration::from_millis(15),
            HeartbeatOptions {
                on_remote_not_alive: Some(Arc::new(move |conn| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    conn.stop();
                })),
                ..HeartbeatOptions::default()
            },
        ));
        let token = heartbeat.start_for(Arc::clone(&conn));

        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fired.load(Ordering::SeqCst) > 0);
        token.cancel();
    }

    #[rstest]
    #[tokio::test]
    async fn custom_beat_replaces_the_default_send() {
        let (conn, _theirs) = spawn_conn(Duration::from_secs(60));
        let beats = Arc::new(AtomicUsize::new(0));
        let beats2 = Arc::clone(&beats);
        let heartbeat = Arc::new(Heartbeat::with_options(
            Duration::from_millis(10),
            HeartbeatOptions {
                beat: Some(Arc::new(move |_conn| {
                    let beats = Arc::clone(&beats2);
                    Box::pin(async move {
                        beats.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })),
                ..HeartbeatOptions::default()
            },
        ));
        let token = heartbeat.start_for(Arc::clone(&conn));

        for _ in 0..100 {
            if beats.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(beats.load(Ordering::SeqCst) >= 2);
        token.cancel();
    }
}
