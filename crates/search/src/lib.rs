//! Search-store access for the reindex pipeline.
//!
//! The store holds one index per item type plus a meta index for cycle
//! state. Document writes use external-version-gte semantics so a slow
//! writer from an older cycle can never overwrite a newer rendition; the
//! version stamped on every document is the writing cycle's xmin.

use std::collections::BTreeSet;

use async_trait::async_trait;
use common::types::{
    Uid,
    Xid,
};
use serde_json::{
    json,
    Value as JsonValue,
};

mod es;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use es::EsSearchStore;

/// Alias covering every per-type document index, used by the invalidation
/// query and by index-wide admin operations.
pub const RESOURCES_INDEX: &str = "resources";

/// Write failure, classified the way the worker retry loop consumes it.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// The store already holds this id at a strictly newer version. The
    /// document is current; the write is done.
    #[error("version conflict writing {id} at version {version}")]
    VersionConflict { id: String, version: Xid },

    /// Connection lost, read timeout, throttling. Worth retrying with
    /// backoff.
    #[error("retryable transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of a synced-flush request. A conflict only means the index is
/// still being written and is not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    Conflict,
}

/// Ids (and the unbounded hit count) of documents whose `embedded_uuids`
/// intersect `updated` or whose `linked_uuids` intersect `renamed`.
#[derive(Debug, Default)]
pub struct RelatedUids {
    pub hits: BTreeSet<Uid>,
    pub total: u64,
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Write one rendered document to its per-type index under external
    /// version `version`.
    async fn index_document(
        &self,
        index: &str,
        id: &Uid,
        version: Xid,
        body: &JsonValue,
    ) -> Result<(), WriteError>;

    /// Make recent writes visible to search.
    async fn refresh(&self, index: &str) -> anyhow::Result<()>;

    /// Best-effort synced flush for faster recovery after a full reindex.
    async fn flush_synced(&self, index: &str) -> anyhow::Result<FlushOutcome>;

    /// The invalidation query (one bool query, ids only, capped at `max`).
    /// Term caching is disabled: every cycle's input set is different and
    /// cached terms would poison memory.
    async fn related_uids(
        &self,
        index: &str,
        updated: &BTreeSet<Uid>,
        renamed: &BTreeSet<Uid>,
        max: usize,
    ) -> anyhow::Result<RelatedUids>;

    /// Cycle-state documents in the meta index, by well-known id.
    async fn get_meta(&self, index: &str, id: &str) -> anyhow::Result<Option<JsonValue>>;
    async fn put_meta(&self, index: &str, id: &str, body: &JsonValue) -> anyhow::Result<()>;
    async fn delete_meta(&self, index: &str, id: &str) -> anyhow::Result<()>;
}

pub(crate) fn related_query(updated: &BTreeSet<Uid>, renamed: &BTreeSet<Uid>) -> JsonValue {
    let updated: Vec<&str> = updated.iter().map(|u| u.as_str()).collect();
    let renamed: Vec<&str> = renamed.iter().map(|u| u.as_str()).collect();
    json!({
        "query": {
            "bool": {
                "should": [
                    { "terms": { "embedded_uuids": updated, "_cache": false } },
                    { "terms": { "linked_uuids": renamed, "_cache": false } },
                ],
            },
        },
        "_source": false,
    })
}
