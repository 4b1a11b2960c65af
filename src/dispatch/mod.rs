//! Message dispatch: binding inbound frames to user handlers through the
//! worker pool.
//!
//! [`MessageHandler`] owns the router tables, the interceptor chain, and
//! the worker pool. It installs a dispatcher stage as the permanent tail of
//! the chain; when a frame reaches the tail it is moved onto the worker
//! queue chosen by the connection's affinity, or onto an ephemeral task
//! when the pool is disabled.

mod worker;

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

pub use worker::WORKER_ID_WITHOUT_POOL;
use worker::WorkerPool;

use crate::{
    codec::FrameDecoder,
    config::{RouterModel, ServerConfig},
    error::{FrameError, RegistrationError},
    interceptor::{Chain, ChainBuilder, IcResponse, Interceptor},
    panic::format_panic,
    request::{Request, Task},
    router::{GroupRouter, Router, RouterHandler, RouterSlices},
};

/// Routes inbound frames to user handlers under bounded concurrency.
pub struct MessageHandler {
    core: Arc<DispatchCore>,
    chain: RwLock<ChainBuilder>,
}

impl MessageHandler {
    /// Build a handler sized and modeled from `config`.
    ///
    /// The dispatcher tail is installed here, exactly once.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let core = Arc::new(DispatchCore {
            model: config.router_model(),
            routers: RwLock::new(HashMap::new()),
            slices: Arc::new(RouterSlices::new()),
            pool: WorkerPool::new(config),
        });

        let mut chain = ChainBuilder::new();
        chain.set_tail(Arc::new(DispatchTail(Arc::clone(&core))));

        Self {
            core,
            chain: RwLock::new(chain),
        }
    }

    /// Dispatch model this handler runs.
    #[must_use]
    pub fn model(&self) -> RouterModel { self.core.model }

    /// Register a classic router for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateRoute`] when `id` is taken.
    pub fn add_router(&self, id: u32, router: Arc<dyn Router>) -> Result<(), RegistrationError> {
        let mut routers = self.core.routers.write().expect("router table poisoned");
        if routers.contains_key(&id) {
            return Err(RegistrationError::DuplicateRoute(id));
        }
        routers.insert(id, router);
        log::info!("add router for msg id {id}");
        Ok(())
    }

    /// Register slices handlers for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateRoute`] when `id` is taken.
    pub fn add_router_slices(
        &self,
        id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RegistrationError> {
        self.core.slices.add_handler(id, handlers)
    }

    /// Append global prefix handlers for future slices registrations.
    pub fn use_handlers(&self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.core.slices.use_handlers(handlers);
    }

    /// Create a slices group over `start..=end`.
    #[must_use]
    pub fn group(
        &self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter {
        self.core.slices.group(start, end, handlers)
    }

    /// Append a user interceptor to the chain body.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.chain
            .write()
            .expect("chain builder poisoned")
            .add_interceptor(interceptor);
    }

    /// Install `decoder` as the head of the chain.
    pub fn install_decoder(&self, decoder: Arc<dyn FrameDecoder>) {
        self.chain
            .write()
            .expect("chain builder poisoned")
            .set_head(Arc::new(DecoderStage(decoder)));
    }

    /// Spawn the pool's worker tasks. Call once at server start.
    pub fn start_worker_pool(&self) { self.core.pool.start(&self.core); }

    /// Run `request` through the interceptor chain from the head.
    ///
    /// # Errors
    ///
    /// Returns the [`FrameError`] of whichever stage rejected the frame; the
    /// caller logs it and the connection continues.
    pub async fn execute(&self, request: Request) -> Result<IcResponse, FrameError> {
        let interceptors = self
            .chain
            .read()
            .expect("chain builder poisoned")
            .assemble();
        crate::interceptor::execute_chain(&interceptors, request).await
    }

    /// Claim a worker id for a newly accepted connection.
    pub(crate) fn claim_worker(&self, conn_id: u64) -> Option<u32> { self.core.pool.claim(conn_id) }

    /// Release a worker id when its connection closes.
    pub(crate) fn release_worker(&self, worker_id: u32) { self.core.pool.release(worker_id); }

    /// Run `func` on the worker owning `worker_id`, after queued frames.
    pub(crate) async fn submit_func(&self, worker_id: u32, func: Box<dyn FnOnce() + Send>) {
        self.core.pool.submit(worker_id, Task::Func(func)).await;
    }
}

/// Shared dispatch state referenced by both the handler and its tail stage.
///
/// Keeping the tail a separate value holding an `Arc` of this core avoids
/// the handler owning an interceptor list that contains itself.
pub(crate) struct DispatchCore {
    model: RouterModel,
    routers: RwLock<HashMap<u32, Arc<dyn Router>>>,
    slices: Arc<RouterSlices>,
    pool: WorkerPool,
}

impl DispatchCore {
    /// Route one request on the current worker.
    pub(crate) fn run_request(&self, request: &mut Request, worker_id: usize) {
        match self.model {
            RouterModel::Classic => {
                let router = {
                    let routers = self.routers.read().expect("router table poisoned");
                    routers.get(&request.msg_id()).cloned()
                };
                let Some(router) = router else {
                    log::error!("api msg id {} is not found", request.msg_id());
                    return;
                };
                request.bind_router(router);
                self.trap(worker_id, || request.call());
            }
            RouterModel::Slices => {
                let Some(handlers) = self.slices.get_handlers(request.msg_id()) else {
                    log::error!("api msg id {} is not found", request.msg_id());
                    return;
                };
                request.bind_router_slices(handlers);
                self.trap(worker_id, || request.router_slices_next());
            }
        }
    }

    /// Run an internal function task on the current worker.
    pub(crate) fn run_func(&self, func: Box<dyn FnOnce() + Send>, worker_id: usize) {
        self.trap(worker_id, func);
    }

    /// Trap boundary: a handler fault is logged with the worker id and must
    /// not kill the worker.
    fn trap<F: FnOnce()>(&self, worker_id: usize, f: F) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            log::error!("worker {worker_id} handler panic: {}", format_panic(payload));
        }
    }
}

/// The permanent tail of the interceptor chain.
struct DispatchTail(Arc<DispatchCore>);

#[async_trait]
impl Interceptor for DispatchTail {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
        let Some(request) = chain.take_request() else {
            return chain.proceed().await;
        };

        if self.0.pool.size() > 0 {
            let worker_id = request
                .connection()
                .map_or(WORKER_ID_WITHOUT_POOL as u32, |conn| conn.worker_id());
            self.0
                .pool
                .submit(worker_id, Task::Request(Box::new(request)))
                .await;
        } else {
            // Degenerate no-pool mode: one ephemeral task per frame, no
            // queueing and no ordering guarantee.
            let core = Arc::clone(&self.0);
            tokio::spawn(async move {
                let mut request = request;
                core.run_request(&mut request, WORKER_ID_WITHOUT_POOL);
            });
        }
        chain.proceed().await
    }
}

/// Adapter installing a [`FrameDecoder`] as a plain chain stage.
struct DecoderStage(Arc<dyn FrameDecoder>);

#[async_trait]
impl Interceptor for DecoderStage {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
        self.0.intercept(chain).await
    }
}
