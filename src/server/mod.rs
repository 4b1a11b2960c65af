//! The server orchestrator.
//!
//! [`Server`] ties the subsystems together: it owns the configuration, the
//! message handler (chain + routers + worker pool), the connection manager,
//! and the heartbeat template. `start` installs the decoder at the head of
//! the interceptor chain, spins up the worker pool, and spawns the
//! listeners; `serve` additionally blocks until SIGINT/SIGTERM and then
//! stops everything.

mod accept;
mod ws;

pub use ws::{WebsocketAuth, WsUpgradeRequest};

use std::{
    net::SocketAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::{FrameDecoder, FrameExtractor, LengthField, TlvDecoder},
    config::{RouterModel, ServerConfig, ServerMode},
    connection::{
        Connection, ConnectionHook, ConnectionParams, manager::ConnectionManager,
        transport::{TransportReader, TransportWriter},
    },
    dispatch::MessageHandler,
    error::{RegistrationError, ServerError},
    heartbeat::{Heartbeat, HeartbeatOptions},
    interceptor::Interceptor,
    packet::{Packer, TlvPacker},
    router::{GroupRouter, Router, RouterHandler},
};

/// A TCP/WebSocket server dispatching framed messages to user handlers.
pub struct Server {
    config: ServerConfig,
    msg_handler: Arc<MessageHandler>,
    conn_mgr: Arc<ConnectionManager>,
    packer: RwLock<Arc<dyn Packer>>,
    decoder: RwLock<Option<Arc<dyn FrameDecoder>>>,
    heartbeat: RwLock<Option<Arc<Heartbeat>>>,
    on_conn_start: RwLock<Option<ConnectionHook>>,
    on_conn_stop: RwLock<Option<ConnectionHook>>,
    websocket_auth: RwLock<Option<WebsocketAuth>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_conn_id: AtomicU64,
    tcp_bound: RwLock<Option<SocketAddr>>,
    ws_bound: RwLock<Option<SocketAddr>>,
}

impl Server {
    /// Build a server from an injected configuration.
    ///
    /// The default wire format is TLV: a [`TlvPacker`] for outbound frames
    /// and a [`TlvDecoder`] at the head of the interceptor chain, both
    /// bounded by `max_packet_size`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let msg_handler = Arc::new(MessageHandler::new(&config));
        let max_packet = config.max_packet_size;
        Arc::new(Self {
            msg_handler,
            conn_mgr: Arc::new(ConnectionManager::new()),
            packer: RwLock::new(Arc::new(TlvPacker::new(max_packet))),
            decoder: RwLock::new(Some(Arc::new(TlvDecoder::new(max_packet as usize)))),
            heartbeat: RwLock::new(None),
            on_conn_start: RwLock::new(None),
            on_conn_stop: RwLock::new(None),
            websocket_auth: RwLock::new(None),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn_id: AtomicU64::new(0),
            tcp_bound: RwLock::new(None),
            ws_bound: RwLock::new(None),
            config,
        })
    }

    /// The injected configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig { &self.config }

    /// Server identity string.
    #[must_use]
    pub fn name(&self) -> &str { &self.config.name }

    /// The connection registry.
    #[must_use]
    pub fn conn_manager(&self) -> &Arc<ConnectionManager> { &self.conn_mgr }

    /// The message handler owning routers, chain, and worker pool.
    #[must_use]
    pub fn message_handler(&self) -> &Arc<MessageHandler> { &self.msg_handler }

    /// Register a classic router for `id`.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::WrongRouterModel`] when the server runs the
    /// slices model, [`RegistrationError::DuplicateRoute`] when `id` is
    /// taken.
    pub fn add_router(&self, id: u32, router: Arc<dyn Router>) -> Result<(), RegistrationError> {
        self.require_model(RouterModel::Classic)?;
        self.msg_handler.add_router(id, router)
    }

    /// Register slices handlers for `id`.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::WrongRouterModel`] when the server runs the
    /// classic model, [`RegistrationError::DuplicateRoute`] when `id` is
    /// taken.
    pub fn add_router_slices(
        &self,
        id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RegistrationError> {
        self.require_model(RouterModel::Slices)?;
        self.msg_handler.add_router_slices(id, handlers)
    }

    /// Create a slices group over `start..=end`.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::WrongRouterModel`] when the server runs the
    /// classic model.
    pub fn group(
        &self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<GroupRouter, RegistrationError> {
        self.require_model(RouterModel::Slices)?;
        Ok(self.msg_handler.group(start, end, handlers))
    }

    /// Append global prefix handlers for future slices registrations.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::WrongRouterModel`] when the server runs the
    /// classic model.
    pub fn use_handlers(
        &self,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RegistrationError> {
        self.require_model(RouterModel::Slices)?;
        self.msg_handler.use_handlers(handlers);
        Ok(())
    }

    /// Append a user interceptor to the chain body.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.msg_handler.add_interceptor(interceptor);
    }

    /// Replace the head-of-chain decoder. Configure before `start`.
    pub fn set_decoder(&self, decoder: Arc<dyn FrameDecoder>) {
        *self.decoder.write().expect("decoder slot poisoned") = Some(decoder);
    }

    /// The installed decoder's frame descriptor, if any.
    #[must_use]
    pub fn length_field(&self) -> Option<LengthField> {
        self.decoder
            .read()
            .expect("decoder slot poisoned")
            .as_ref()
            .and_then(|decoder| decoder.length_field())
    }

    /// Replace the outbound packer.
    pub fn set_packer(&self, packer: Arc<dyn Packer>) {
        *self.packer.write().expect("packer slot poisoned") = packer;
    }

    /// Hook invoked after each connection is accepted and registered.
    pub fn set_on_conn_start(&self, hook: ConnectionHook) {
        *self.on_conn_start.write().expect("hook slot poisoned") = Some(hook);
    }

    /// Hook invoked as each connection winds down.
    pub fn set_on_conn_stop(&self, hook: ConnectionHook) {
        *self.on_conn_stop.write().expect("hook slot poisoned") = Some(hook);
    }

    /// Auth hook consulted before each WebSocket upgrade.
    pub fn set_websocket_auth(&self, auth: WebsocketAuth) {
        *self.websocket_auth.write().expect("auth slot poisoned") = Some(auth);
    }

    /// Start heartbeat probing with default behavior.
    ///
    /// Registers the heartbeat message id against the active router model.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateRoute`] when the heartbeat id is taken.
    pub fn start_heartbeat(&self, interval: Duration) -> Result<(), RegistrationError> {
        self.install_heartbeat(Heartbeat::new(interval))
    }

    /// Start heartbeat probing with customized behavior.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateRoute`] when the heartbeat id is taken.
    pub fn start_heartbeat_with_options(
        &self,
        interval: Duration,
        options: HeartbeatOptions,
    ) -> Result<(), RegistrationError> {
        self.install_heartbeat(Heartbeat::with_options(interval, options))
    }

    /// Bind listeners and begin serving in the background.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when a listener address cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        log::info!(
            "[start] server {} v{} starting",
            self.config.name,
            self.config.version
        );

        if let Some(decoder) = self.decoder.read().expect("decoder slot poisoned").clone() {
            self.msg_handler.install_decoder(decoder);
        }
        self.msg_handler.start_worker_pool();

        if matches!(self.config.mode, ServerMode::Tcp | ServerMode::Both) {
            let listener = bind(&self.config.tcp_addr()).await?;
            *self.tcp_bound.write().expect("addr slot poisoned") =
                listener.local_addr().ok();
            self.tracker
                .spawn(accept::tcp_accept_loop(Arc::clone(self), listener));
        }
        if matches!(self.config.mode, ServerMode::Websocket | ServerMode::Both) {
            let listener = bind(&self.config.ws_addr()).await?;
            *self.ws_bound.write().expect("addr slot poisoned") =
                listener.local_addr().ok();
            self.tracker
                .spawn(ws::ws_accept_loop(Arc::clone(self), listener));
        }
        Ok(())
    }

    /// Start, then block until SIGINT/SIGTERM, then stop.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when a listener address cannot be bound.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        self.start().await?;
        shutdown_signal().await;
        log::info!("[serve] server {} interrupted", self.config.name);
        self.stop().await;
        Ok(())
    }

    /// Stop accepting, stop all connections, and wait for tasks to finish.
    pub async fn stop(&self) {
        log::info!("[stop] server {}", self.config.name);
        self.conn_mgr.clear();
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Local address of the bound TCP listener, once started.
    #[must_use]
    pub fn tcp_bound_addr(&self) -> Option<SocketAddr> {
        *self.tcp_bound.read().expect("addr slot poisoned")
    }

    /// Local address of the bound WebSocket listener, once started.
    #[must_use]
    pub fn ws_bound_addr(&self) -> Option<SocketAddr> {
        *self.ws_bound.read().expect("addr slot poisoned")
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    pub(crate) fn tracker(&self) -> &TaskTracker { &self.tracker }

    pub(crate) fn at_capacity(&self) -> bool { self.conn_mgr.len() >= self.config.max_conn }

    pub(crate) fn websocket_auth(&self) -> Option<WebsocketAuth> {
        self.websocket_auth
            .read()
            .expect("auth slot poisoned")
            .clone()
    }

    /// Wire up one accepted transport as a connection.
    pub(crate) fn start_conn(
        self: &Arc<Self>,
        reader: Box<dyn TransportReader>,
        writer: Box<dyn TransportWriter>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        message_delimited: bool,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(worker_id) = self.msg_handler.claim_worker(conn_id) else {
            log::error!("no free worker for connection {conn_id}; dropping it");
            return;
        };

        let extractor = if message_delimited {
            None
        } else {
            self.length_field().map(FrameExtractor::new)
        };
        let packer = self.packer.read().expect("packer slot poisoned").clone();

        let server = Arc::clone(self);
        let on_teardown: Box<dyn FnOnce(&Arc<Connection>) + Send> = Box::new(move |conn| {
            if let Some(hook) = server
                .on_conn_stop
                .read()
                .expect("hook slot poisoned")
                .clone()
            {
                hook(conn);
            }
            server.msg_handler.release_worker(conn.worker_id());
            server.conn_mgr.remove(conn.id());
        });

        let conn = Connection::spawn(ConnectionParams {
            id: conn_id,
            worker_id,
            remote_addr,
            local_addr,
            reader,
            writer,
            msg_handler: Arc::clone(&self.msg_handler),
            extractor,
            packer,
            max_msg_chan_len: self.config.max_msg_chan_len,
            io_read_buff_size: self.config.io_read_buff_size,
            heartbeat_max: self.config.heartbeat_max_duration(),
            on_teardown: Some(on_teardown),
            tracker: Some(self.tracker.clone()),
        });
        self.conn_mgr.add(Arc::clone(&conn));

        if let Some(heartbeat) = self
            .heartbeat
            .read()
            .expect("heartbeat slot poisoned")
            .clone()
        {
            let token = heartbeat.start_for(Arc::clone(&conn));
            conn.bind_heartbeat(token);
        }
        if let Some(hook) = self
            .on_conn_start
            .read()
            .expect("hook slot poisoned")
            .clone()
        {
            hook(&conn);
        }
        log::debug!("connection {conn_id} started on worker {worker_id} from {remote_addr}");
    }

    fn require_model(&self, expected: RouterModel) -> Result<(), RegistrationError> {
        let active = self.config.router_model();
        if active == expected {
            Ok(())
        } else {
            Err(RegistrationError::WrongRouterModel { active })
        }
    }

    fn install_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RegistrationError> {
        match self.config.router_model() {
            RouterModel::Classic => {
                self.msg_handler
                    .add_router(heartbeat.msg_id(), heartbeat.router())?;
            }
            RouterModel::Slices => {
                self.msg_handler
                    .add_router_slices(heartbeat.msg_id(), heartbeat.slices())?;
            }
        }
        *self.heartbeat.write().expect("heartbeat slot poisoned") = Some(Arc::new(heartbeat));
        Ok(())
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_owned(),
            source,
        })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            log::error!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
