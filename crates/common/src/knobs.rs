//! Tunable limits and parameters for the reindex pipeline.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Defaults follow the production deployment the pipeline was sized
//! for.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Number of indexing workers per cycle.
pub static INDEXER_PROCESSES: LazyLock<usize> = LazyLock::new(|| env_config("INDEXER_PROCESSES", 1));

/// How many UIDs a worker pulls from the queue at once. Bounds per-worker
/// memory and the blast radius of a worker crash.
pub static QUEUE_WORKER_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("QUEUE_WORKER_CHUNK_SIZE", 1024));

/// How many UIDs one reporting round covers.
pub static QUEUE_WORKER_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("QUEUE_WORKER_BATCH_SIZE", 5000));

/// Upper bound on the number of UIDs the queue will accept for one cycle.
pub static QUEUE_WORKER_GET_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("QUEUE_WORKER_GET_SIZE", 2_000_000));

/// Queue backend: "memory" or "redis". Anything unrecognized falls back to
/// the in-process queue.
pub static QUEUE_TYPE: LazyLock<String> =
    LazyLock::new(|| env_config("QUEUE_TYPE", "memory".to_owned()));

/// Key prefix for the remote queue backend.
pub static QUEUE_NAME: LazyLock<String> =
    LazyLock::new(|| env_config("QUEUE_NAME", "indxQ".to_owned()));

/// Remote queue backend location.
pub static QUEUE_HOST: LazyLock<String> =
    LazyLock::new(|| env_config("QUEUE_HOST", "localhost".to_owned()));
pub static QUEUE_PORT: LazyLock<u16> = LazyLock::new(|| env_config("QUEUE_PORT", 6379));
pub static QUEUE_DB: LazyLock<i64> = LazyLock::new(|| env_config("QUEUE_DB", 2));

/// Debug cap: when non-zero, a cycle touches at most this many UIDs.
pub static INDEXER_SHORT_UUIDS: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXER_SHORT_UUIDS", 0));

/// When set, per-UID update infos for the first completed cycle are written
/// here, one JSON object per line. Empty disables.
pub static INDEXER_INITIAL_LOG_PATH: LazyLock<String> =
    LazyLock::new(|| env_config("INDEXER_INITIAL_LOG_PATH", String::new()));

/// Comma-separated names of downstream indexers to stage completed UID sets
/// for, e.g. "vis_indexer,region_indexer". Empty disables staging.
pub static STAGE_FOR_FOLLOWUP: LazyLock<String> =
    LazyLock::new(|| env_config("STAGE_FOR_FOLLOWUP", String::new()));

/// Hard ceiling on boolean clauses in one invalidation query. Must track the
/// search backend's configured limit; exceeding it widens to a full reindex.
pub static MAX_CLAUSES: LazyLock<usize> = LazyLock::new(|| env_config("MAX_CLAUSES", 8192));

/// Size cap on the invalidation query result. A larger hit count widens to a
/// full reindex since the truncated result would be unsafe.
pub static SEARCH_MAX: LazyLock<usize> = LazyLock::new(|| env_config("SEARCH_MAX", 99_999));

/// Name of the meta index holding cycle state documents.
pub static META_INDEX: LazyLock<String> =
    LazyLock::new(|| env_config("META_INDEX", "meta".to_owned()));

/// Wall-clock budget for one cycle's run loop, in seconds. 0 disables.
pub static INDEXER_RUN_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INDEXER_RUN_TIMEOUT_SECS", 0)));

/// Per-UID error count at which the run loop gives up on the cycle.
pub static INDEXER_MAX_ERRORS: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEXER_MAX_ERRORS", 100_000));

/// How long a worker waits for its connection to reach the cycle's xmin
/// before the cycle aborts.
pub static SNAPSHOT_BIND_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SNAPSHOT_BIND_TIMEOUT_SECS", 60)));

/// Poll interval while waiting for a lagging worker connection.
pub static SNAPSHOT_BIND_POLL_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SNAPSHOT_BIND_POLL_INTERVAL_MS", 100)));

/// Upper bound on one worker batch, snapshot binding included. The redesigned
/// replacement for the historical per-process alarm.
pub static WORKER_WATCHDOG_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WORKER_WATCHDOG_TIMEOUT_SECS", 600)));

/// Request timeout for document writes to the search store.
pub static SEARCH_WRITE_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SEARCH_WRITE_TIMEOUT_SECS", 30)));

/// Request timeout for the invalidation query.
pub static SEARCH_QUERY_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SEARCH_QUERY_TIMEOUT_SECS", 60)));
