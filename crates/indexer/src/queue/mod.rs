//! The cycle's work queue. One pluggable backend plus a guaranteed
//! in-process fallback; a remote backend that fails `is_indexing` or
//! `load_uuids` is abandoned for the rest of the process lifetime, because a
//! flapping backend would corrupt cycle accounting.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    knobs::{
        QUEUE_DB,
        QUEUE_HOST,
        QUEUE_NAME,
        QUEUE_PORT,
        QUEUE_TYPE,
        QUEUE_WORKER_GET_SIZE,
    },
    types::{
        Uid,
        UidError,
    },
};
use parking_lot::Mutex;

pub mod memory;
pub mod redis;

pub use self::{
    memory::MemoryQueue,
    redis::RedisQueue,
};

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// True between a successful `load_uuids` and `close_indexing`, while
    /// any loaded UID is still unaccounted for.
    async fn is_indexing(&self) -> anyhow::Result<bool>;

    /// Accept the cycle's UID set, returning how many were actually
    /// accepted. The caller treats a short count as fatal for the cycle.
    async fn load_uuids(&self, uids: Vec<Uid>) -> anyhow::Result<usize>;

    /// Slice up to `max` UIDs off the front.
    async fn get_batch(&self, max: usize) -> anyhow::Result<Vec<Uid>>;

    /// Account for one processed batch.
    async fn report(&self, successes: usize, errors: Vec<UidError>) -> anyhow::Result<()>;

    /// Drain accumulated errors; each error is observed exactly once.
    async fn pop_errors(&self) -> anyhow::Result<Vec<UidError>>;

    /// End the cycle, returning any UIDs still enqueued (the undone set).
    async fn close_indexing(&self) -> anyhow::Result<Vec<Uid>>;
}

/// Queue facade owning the failover policy. All pipeline code goes through
/// this; nothing holds a backend directly.
pub struct WorkQueue {
    remote: Mutex<Option<Arc<dyn QueueBackend>>>,
    fallback: Arc<dyn QueueBackend>,
}

impl WorkQueue {
    pub fn from_knobs() -> Self {
        let remote: Option<Arc<dyn QueueBackend>> = match QUEUE_TYPE.as_str() {
            "redis" => Some(Arc::new(RedisQueue::new(
                &QUEUE_HOST,
                *QUEUE_PORT,
                *QUEUE_DB,
                QUEUE_NAME.clone(),
            ))),
            "memory" => None,
            other => {
                tracing::warn!("Unknown queue_type {other:?}, using the in-process queue");
                None
            },
        };
        Self::new(remote, *QUEUE_WORKER_GET_SIZE)
    }

    pub fn in_process(capacity: usize) -> Self {
        Self::new(None, capacity)
    }

    pub fn new(remote: Option<Arc<dyn QueueBackend>>, capacity: usize) -> Self {
        Self {
            remote: Mutex::new(remote),
            fallback: Arc::new(MemoryQueue::new(capacity)),
        }
    }

    fn active(&self) -> Arc<dyn QueueBackend> {
        self.remote
            .lock()
            .clone()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn fail_over(&self, op: &str, e: &anyhow::Error) -> Arc<dyn QueueBackend> {
        let mut remote = self.remote.lock();
        if let Some(backend) = remote.take() {
            tracing::warn!(
                "{} backend failed during {op}, permanently switching to {}: {e:#}",
                backend.name(),
                self.fallback.name(),
            );
        }
        self.fallback.clone()
    }

    pub async fn is_indexing(&self) -> anyhow::Result<bool> {
        match self.active().is_indexing().await {
            Ok(indexing) => Ok(indexing),
            Err(e) => self.fail_over("is_indexing", &e).is_indexing().await,
        }
    }

    pub async fn load_uuids(&self, uids: Vec<Uid>) -> anyhow::Result<usize> {
        match self.active().load_uuids(uids.clone()).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => self.fail_over("load_uuids", &e).load_uuids(uids).await,
        }
    }

    pub async fn get_batch(&self, max: usize) -> anyhow::Result<Vec<Uid>> {
        self.active().get_batch(max).await
    }

    pub async fn report(&self, successes: usize, errors: Vec<UidError>) -> anyhow::Result<()> {
        self.active().report(successes, errors).await
    }

    pub async fn pop_errors(&self) -> anyhow::Result<Vec<UidError>> {
        self.active().pop_errors().await
    }

    pub async fn close_indexing(&self) -> anyhow::Result<Vec<Uid>> {
        self.active().close_indexing().await
    }

    /// Hand out a worker-side handle. All handles account into the same
    /// cycle, whichever backend is active.
    pub fn get_worker(self: &Arc<Self>) -> QueueWorker {
        QueueWorker {
            queue: self.clone(),
        }
    }
}

/// A worker's view of the queue: pull batches, report outcomes.
pub struct QueueWorker {
    queue: Arc<WorkQueue>,
}

impl QueueWorker {
    pub async fn get_batch(&self, max: usize) -> anyhow::Result<Vec<Uid>> {
        self.queue.get_batch(max).await
    }

    pub async fn report(&self, successes: usize, errors: Vec<UidError>) -> anyhow::Result<()> {
        self.queue.report(successes, errors).await
    }
}
