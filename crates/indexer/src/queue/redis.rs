//! Remote queue backend over a key-value store with atomic list primitives.
//! Gives cross-process durability when configured; any failure surfaces to
//! the facade, which fails over to the in-process queue for good.

use std::{
    num::NonZeroUsize,
    time::Duration,
};

use anyhow::Context;
use common::{
    backoff::Backoff,
    knobs::QUEUE_WORKER_GET_SIZE,
    types::{
        Uid,
        UidError,
    },
};
use redis::{
    aio::MultiplexedConnection,
    AsyncCommands,
};

use crate::queue::QueueBackend;

const CONNECT_ATTEMPTS: u32 = 3;
const INITIAL_CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(2);
const LOAD_CHUNK: usize = 10_000;

pub struct RedisQueue {
    url: String,
    name: String,
    capacity: usize,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueue {
    pub fn new(host: &str, port: u16, db: i64, name: String) -> Self {
        Self {
            url: format!("redis://{host}:{port}/{db}"),
            name,
            capacity: *QUEUE_WORKER_GET_SIZE,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.name)
    }

    async fn connection(&self) -> anyhow::Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let client = redis::Client::open(self.url.as_str())
            .with_context(|| format!("invalid queue server url {}", self.url))?;
        let mut backoff = Backoff::new(INITIAL_CONNECT_BACKOFF, MAX_CONNECT_BACKOFF);
        let conn = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => break conn,
                Err(e) if backoff.failures() + 1 < CONNECT_ATTEMPTS => {
                    let delay = backoff.fail(&mut rand::rng());
                    tracing::warn!("Queue server connect failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e).context("queue server unreachable"),
            }
        };
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn counter(&self, conn: &mut MultiplexedConnection, suffix: &str) -> anyhow::Result<usize> {
        let value: Option<usize> = conn.get(self.key(suffix)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn delete_all(&self, conn: &mut MultiplexedConnection) -> anyhow::Result<()> {
        let keys: Vec<String> = ["uuids", "errors", "loaded", "success", "errored", "indexing"]
            .iter()
            .map(|suffix| self.key(suffix))
            .collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn is_indexing(&self) -> anyhow::Result<bool> {
        let mut conn = self.connection().await?;
        let flag: Option<String> = conn.get(self.key("indexing")).await?;
        if flag.as_deref() != Some("1") {
            return Ok(false);
        }
        let loaded = self.counter(&mut conn, "loaded").await?;
        let success = self.counter(&mut conn, "success").await?;
        let errored = self.counter(&mut conn, "errored").await?;
        Ok(success + errored < loaded)
    }

    async fn load_uuids(&self, uids: Vec<Uid>) -> anyhow::Result<usize> {
        let mut conn = self.connection().await?;
        self.delete_all(&mut conn).await?;
        let accepted = uids.len().min(self.capacity);
        if accepted == 0 {
            return Ok(0);
        }
        let uids: Vec<String> = uids.into_iter().take(accepted).map(|u| u.to_string()).collect();
        for chunk in uids.chunks(LOAD_CHUNK) {
            let _: () = conn.rpush(self.key("uuids"), chunk).await?;
        }
        let _: () = conn.set(self.key("loaded"), accepted).await?;
        let _: () = conn.set(self.key("indexing"), "1").await?;
        let queued: usize = conn.llen(self.key("uuids")).await?;
        Ok(queued)
    }

    async fn get_batch(&self, max: usize) -> anyhow::Result<Vec<Uid>> {
        let Some(max) = NonZeroUsize::new(max) else {
            return Ok(Vec::new());
        };
        let mut conn = self.connection().await?;
        let popped: Vec<String> = conn.lpop(self.key("uuids"), Some(max)).await?;
        popped.iter().map(|s| s.parse()).collect()
    }

    async fn report(&self, successes: usize, errors: Vec<UidError>) -> anyhow::Result<()> {
        let mut conn = self.connection().await?;
        if successes > 0 {
            let _: () = conn.incr(self.key("success"), successes).await?;
        }
        if !errors.is_empty() {
            let serialized: Vec<String> = errors
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<_, _>>()?;
            let _: () = conn.rpush(self.key("errors"), serialized).await?;
            let _: () = conn.incr(self.key("errored"), errors.len()).await?;
        }
        Ok(())
    }

    async fn pop_errors(&self) -> anyhow::Result<Vec<UidError>> {
        let mut conn = self.connection().await?;
        let pending: usize = conn.llen(self.key("errors")).await?;
        let Some(pending) = NonZeroUsize::new(pending) else {
            return Ok(Vec::new());
        };
        let popped: Vec<String> = conn.lpop(self.key("errors"), Some(pending)).await?;
        popped
            .iter()
            .map(|s| serde_json::from_str(s).context("unparseable queued error"))
            .collect()
    }

    async fn close_indexing(&self) -> anyhow::Result<Vec<Uid>> {
        let mut conn = self.connection().await?;
        let leftovers: Vec<String> = conn.lrange(self.key("uuids"), 0, -1).await?;
        self.delete_all(&mut conn).await?;
        leftovers.iter().map(|s| s.parse()).collect()
    }
}
