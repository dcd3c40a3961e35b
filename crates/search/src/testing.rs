//! In-memory search store for tests. Models the pieces of the contract the
//! pipeline depends on: external-version-gte writes, refresh visibility for
//! the invalidation query, meta documents, and injectable write failures.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::Arc,
};

use async_trait::async_trait;
use common::types::{
    Uid,
    Xid,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::{
    FlushOutcome,
    RelatedUids,
    SearchStore,
    WriteError,
};

/// One scripted failure for `index_document`, consumed per attempt.
#[derive(Clone, Copy, Debug)]
pub enum InjectedFailure {
    Transport,
    Other,
    Conflict,
}

#[derive(Clone, Debug)]
struct StoredDoc {
    version: u64,
    body: JsonValue,
    /// Set by `refresh`; only visible docs are searchable.
    visible: bool,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, BTreeMap<String, StoredDoc>>,
    meta: BTreeMap<String, BTreeMap<String, JsonValue>>,
    failures: BTreeMap<String, VecDeque<InjectedFailure>>,
    meta_put_failures: BTreeMap<String, u32>,
    write_attempts: BTreeMap<String, u32>,
    refreshes: u32,
    related_queries: u32,
    flushes: u32,
    flush_conflict: bool,
}

#[derive(Clone, Default)]
pub struct MemorySearchStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a searchable document, e.g. an already-indexed rendition from a
    /// prior cycle.
    pub fn seed_document(&self, index: &str, uid: &Uid, version: Xid, body: JsonValue) {
        self.inner.lock().docs.entry(index.to_owned()).or_default().insert(
            uid.to_string(),
            StoredDoc {
                version: version.0,
                body,
                visible: true,
            },
        );
    }

    pub fn inject_write_failures(
        &self,
        uid: &Uid,
        failures: impl IntoIterator<Item = InjectedFailure>,
    ) {
        self.inner
            .lock()
            .failures
            .entry(uid.to_string())
            .or_default()
            .extend(failures);
    }

    pub fn document(&self, index: &str, uid: &Uid) -> Option<(Xid, JsonValue)> {
        let inner = self.inner.lock();
        let doc = inner.docs.get(index)?.get(uid.as_str())?;
        Some((Xid(doc.version), doc.body.clone()))
    }

    pub fn document_count(&self) -> usize {
        self.inner.lock().docs.values().map(|idx| idx.len()).sum()
    }

    pub fn write_attempts(&self, uid: &Uid) -> u32 {
        self.inner
            .lock()
            .write_attempts
            .get(uid.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn refresh_count(&self) -> u32 {
        self.inner.lock().refreshes
    }

    pub fn related_query_count(&self) -> u32 {
        self.inner.lock().related_queries
    }

    pub fn flush_count(&self) -> u32 {
        self.inner.lock().flushes
    }

    pub fn set_flush_conflict(&self, conflict: bool) {
        self.inner.lock().flush_conflict = conflict;
    }

    /// Fail the next `count` meta writes for `id`.
    pub fn inject_meta_put_failures(&self, id: &str, count: u32) {
        self.inner
            .lock()
            .meta_put_failures
            .insert(id.to_owned(), count);
    }

    pub fn meta_doc(&self, index: &str, id: &str) -> Option<JsonValue> {
        self.inner.lock().meta.get(index)?.get(id).cloned()
    }

    pub fn put_meta_doc(&self, index: &str, id: &str, body: JsonValue) {
        self.inner
            .lock()
            .meta
            .entry(index.to_owned())
            .or_default()
            .insert(id.to_owned(), body);
    }
}

fn uid_terms(body: &JsonValue, field: &str) -> BTreeSet<String> {
    body.get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchStore for MemorySearchStore {
    async fn index_document(
        &self,
        index: &str,
        id: &Uid,
        version: Xid,
        body: &JsonValue,
    ) -> Result<(), WriteError> {
        let mut inner = self.inner.lock();
        *inner.write_attempts.entry(id.to_string()).or_default() += 1;
        if let Some(queue) = inner.failures.get_mut(id.as_str()) {
            match queue.pop_front() {
                Some(InjectedFailure::Transport) => {
                    return Err(WriteError::Transport(anyhow::anyhow!(
                        "injected transport error for {id}"
                    )));
                },
                Some(InjectedFailure::Other) => {
                    return Err(WriteError::Other(anyhow::anyhow!(
                        "injected write error for {id}"
                    )));
                },
                Some(InjectedFailure::Conflict) => {
                    return Err(WriteError::VersionConflict {
                        id: id.to_string(),
                        version,
                    });
                },
                None => {},
            }
        }
        let docs = inner.docs.entry(index.to_owned()).or_default();
        if let Some(existing) = docs.get(id.as_str()) {
            if version.0 < existing.version {
                return Err(WriteError::VersionConflict {
                    id: id.to_string(),
                    version,
                });
            }
        }
        docs.insert(
            id.to_string(),
            StoredDoc {
                version: version.0,
                body: body.clone(),
                visible: false,
            },
        );
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.refreshes += 1;
        for docs in inner.docs.values_mut() {
            for doc in docs.values_mut() {
                doc.visible = true;
            }
        }
        Ok(())
    }

    async fn flush_synced(&self, _index: &str) -> anyhow::Result<FlushOutcome> {
        let mut inner = self.inner.lock();
        inner.flushes += 1;
        if inner.flush_conflict {
            return Ok(FlushOutcome::Conflict);
        }
        Ok(FlushOutcome::Flushed)
    }

    async fn related_uids(
        &self,
        _index: &str,
        updated: &BTreeSet<Uid>,
        renamed: &BTreeSet<Uid>,
        max: usize,
    ) -> anyhow::Result<RelatedUids> {
        let updated: BTreeSet<&str> = updated.iter().map(|u| u.as_str()).collect();
        let renamed: BTreeSet<&str> = renamed.iter().map(|u| u.as_str()).collect();
        let mut inner = self.inner.lock();
        inner.related_queries += 1;
        let inner = &*inner;
        let mut matched = BTreeSet::new();
        for (id, doc) in inner.docs.values().flatten() {
            if !doc.visible {
                continue;
            }
            let embedded = uid_terms(&doc.body, "embedded_uuids");
            let linked = uid_terms(&doc.body, "linked_uuids");
            let hit = embedded.iter().any(|u| updated.contains(u.as_str()))
                || linked.iter().any(|u| renamed.contains(u.as_str()));
            if hit {
                matched.insert(id.clone());
            }
        }
        let total = matched.len() as u64;
        let hits = matched
            .into_iter()
            .take(max)
            .map(|id| id.parse())
            .collect::<anyhow::Result<BTreeSet<Uid>>>()?;
        Ok(RelatedUids { hits, total })
    }

    async fn get_meta(&self, index: &str, id: &str) -> anyhow::Result<Option<JsonValue>> {
        Ok(self.meta_doc(index, id))
    }

    async fn put_meta(&self, index: &str, id: &str, body: &JsonValue) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(remaining) = inner.meta_put_failures.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("injected meta write failure for {id}");
                }
            }
        }
        self.put_meta_doc(index, id, body.clone());
        Ok(())
    }

    async fn delete_meta(&self, index: &str, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(meta) = inner.meta.get_mut(index) {
            meta.remove(id);
        }
        Ok(())
    }
}
