//! The in-process queue backend: a bounded FIFO shared between the
//! controller and workers. Always available; the failover target.

use std::{
    collections::VecDeque,
    mem,
};

use async_trait::async_trait;
use common::types::{
    Uid,
    UidError,
};
use parking_lot::Mutex;

use crate::queue::QueueBackend;

#[derive(Default)]
struct Inner {
    queue: VecDeque<Uid>,
    loaded: usize,
    successes: usize,
    errored: usize,
    errors: Vec<UidError>,
    indexing: bool,
}

pub struct MemoryQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_indexing(&self) -> anyhow::Result<bool> {
        let inner = self.inner.lock();
        Ok(inner.indexing && inner.successes + inner.errored < inner.loaded)
    }

    async fn load_uuids(&self, uids: Vec<Uid>) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(!inner.indexing, "queue already loaded for a cycle");
        // A bounded queue accepts what fits; the short count is the caller's
        // signal.
        let accepted = uids.len().min(self.capacity);
        inner.queue = uids.into_iter().take(accepted).collect();
        inner.loaded = accepted;
        inner.successes = 0;
        inner.errored = 0;
        inner.errors = Vec::new();
        inner.indexing = accepted > 0;
        Ok(accepted)
    }

    async fn get_batch(&self, max: usize) -> anyhow::Result<Vec<Uid>> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.queue.len());
        Ok(inner.queue.drain(..take).collect())
    }

    async fn report(&self, successes: usize, errors: Vec<UidError>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.successes += successes;
        inner.errored += errors.len();
        inner.errors.extend(errors);
        Ok(())
    }

    async fn pop_errors(&self) -> anyhow::Result<Vec<UidError>> {
        Ok(mem::take(&mut self.inner.lock().errors))
    }

    async fn close_indexing(&self) -> anyhow::Result<Vec<Uid>> {
        let mut inner = self.inner.lock();
        inner.indexing = false;
        inner.loaded = 0;
        inner.successes = 0;
        inner.errored = 0;
        Ok(mem::take(&mut inner.queue).into())
    }
}
