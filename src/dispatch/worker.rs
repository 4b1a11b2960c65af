//! The bounded worker pool and connection-to-worker affinity.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;

use crate::{
    config::{ServerConfig, WorkerMode},
    request::Task,
};

use super::DispatchCore;

/// Worker id reported in logs when the pool is disabled and frames run on
/// ephemeral tasks.
pub const WORKER_ID_WITHOUT_POOL: usize = 0;

/// Fixed set of single-consumer task queues, one worker draining each.
pub(crate) struct WorkerPool {
    mode: WorkerMode,
    size: u32,
    senders: Vec<mpsc::Sender<Task>>,
    receivers: Mutex<Vec<Option<mpsc::Receiver<Task>>>>,
    free_ids: Mutex<HashSet<u32>>,
}

impl WorkerPool {
    /// Size the pool from configuration.
    ///
    /// In `Bind` mode the configured pool size is overridden to `max_conn`
    /// and every worker id starts out free.
    pub(crate) fn new(config: &ServerConfig) -> Self {
        let size = match config.worker_mode {
            WorkerMode::Bind => config.max_conn as u32,
            WorkerMode::Hash => config.worker_pool_size,
        };
        let capacity = config.max_worker_task_len.max(1);

        let mut senders = Vec::with_capacity(size as usize);
        let mut receivers = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(Some(rx));
        }

        let free_ids = match config.worker_mode {
            WorkerMode::Bind => (0..size).collect(),
            WorkerMode::Hash => HashSet::new(),
        };

        Self {
            mode: config.worker_mode,
            size,
            senders,
            receivers: Mutex::new(receivers),
            free_ids: Mutex::new(free_ids),
        }
    }

    /// Number of workers in the pool; zero means the pool is disabled.
    pub(crate) fn size(&self) -> u32 { self.size }

    /// Claim a worker id for a newly accepted connection.
    ///
    /// Hash mode derives the id from the connection id so all frames of a
    /// connection land on the same worker; Bind mode takes an id from the
    /// free pool and returns `None` when every slot is taken.
    pub(crate) fn claim(&self, conn_id: u64) -> Option<u32> {
        if self.size == 0 {
            return Some(WORKER_ID_WITHOUT_POOL as u32);
        }
        match self.mode {
            WorkerMode::Bind => {
                let mut free = self.free_ids.lock().expect("free worker set poisoned");
                let id = free.iter().next().copied()?;
                free.remove(&id);
                Some(id)
            }
            WorkerMode::Hash => Some((conn_id % u64::from(self.size)) as u32),
        }
    }

    /// Return a worker id to the free pool when its connection closes.
    pub(crate) fn release(&self, worker_id: u32) {
        if self.mode == WorkerMode::Bind {
            self.free_ids
                .lock()
                .expect("free worker set poisoned")
                .insert(worker_id);
        }
    }

    /// Enqueue a task on `worker_id`'s queue.
    ///
    /// Awaits when the queue is full, back-pressuring the producer; nothing
    /// is dropped silently.
    pub(crate) async fn submit(&self, worker_id: u32, task: Task) {
        let Some(sender) = self.senders.get(worker_id as usize) else {
            log::error!("no task queue for worker {worker_id}");
            return;
        };
        if sender.send(task).await.is_err() {
            log::error!("worker {worker_id} queue is gone; dropping task");
        }
    }

    /// Spawn one worker task per queue.
    pub(crate) fn start(&self, core: &Arc<DispatchCore>) {
        let mut receivers = self.receivers.lock().expect("worker receivers poisoned");
        for (worker_id, slot) in receivers.iter_mut().enumerate() {
            let Some(rx) = slot.take() else { continue };
            let core = Arc::clone(core);
            tokio::spawn(worker_loop(core, worker_id, rx));
        }
    }
}

/// Drain one queue forever, running each task inside the trap boundary.
async fn worker_loop(core: Arc<DispatchCore>, worker_id: usize, mut rx: mpsc::Receiver<Task>) {
    log::info!("worker {worker_id} started");
    while let Some(task) = rx.recv().await {
        match task {
            Task::Request(mut request) => core.run_request(&mut request, worker_id),
            Task::Func(func) => core.run_func(func, worker_id),
        }
    }
    log::info!("worker {worker_id} stopped");
}
