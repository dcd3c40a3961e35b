//! Durable cycle state, persisted in the search store itself under
//! well-known meta document ids. There is deliberately no second database:
//! if the search store is gone, there is nothing to keep consistent anyway.

use std::{
    collections::BTreeSet,
    sync::Arc,
};

use anyhow::Context;
use chrono::{
    DateTime,
    Utc,
};
use common::{
    knobs::META_INDEX,
    types::{
        Uid,
        UidError,
        Xid,
    },
};
use parking_lot::Mutex;
use search::SearchStore;
use serde::{
    Deserialize,
    Serialize,
};

/// Meta document id for the current cycle state.
pub const STATE_DOC_ID: &str = "indexing";
/// Meta document id for externally submitted priority requests.
pub const PRIORITY_DOC_ID: &str = "reindex";

const REDACTED_ERROR: &str = "Error occurred during indexing, check the logs";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xmin: Option<Xid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_xmin: Option<Xid>,
    #[serde(default)]
    pub txn_count: u64,
    #[serde(default)]
    pub invalidated: u64,
    #[serde(default)]
    pub referencing: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub renamed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_xid: Option<Xid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_txn_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_lag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<BTreeSet<String>>,
    /// UIDs enqueued but unconfirmed when the cycle ended; merged into the
    /// next cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undone: Vec<Uid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<UidError>,
    /// Cycle-level failure, set only when the cycle aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An externally submitted request to force-reindex a UID set, persisted
/// under [`PRIORITY_DOC_ID`] until a cycle drains it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PriorityRequest {
    #[serde(default)]
    pub uuids: Vec<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<BTreeSet<String>>,
    /// Pinned watermark for a pre-staged cycle; absent means "resolve
    /// normally".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xmin: Option<Xid>,
    /// Who to tell when the requested UIDs have all been indexed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

/// What `priority_cycle` hands the controller at the start of every cycle.
#[derive(Debug, Default)]
pub struct PriorityCycle {
    pub xmin: Option<Xid>,
    pub uids: BTreeSet<Uid>,
    pub types: Option<BTreeSet<String>>,
    /// A previous cycle aborted mid-run. Its staged set is discarded; the
    /// cycle recomputes from `last_xmin`.
    pub restart: bool,
}

pub struct IndexerState {
    search: Arc<dyn SearchStore>,
    meta_index: String,
    followups: Vec<String>,
    pending_notify: Mutex<Vec<String>>,
}

impl IndexerState {
    pub fn new(search: Arc<dyn SearchStore>, followups: Vec<String>) -> Self {
        Self {
            search,
            meta_index: META_INDEX.clone(),
            followups,
            pending_notify: Mutex::new(Vec::new()),
        }
    }

    pub fn followups(&self) -> &[String] {
        &self.followups
    }

    pub async fn load(&self) -> anyhow::Result<CycleState> {
        match self.search.get_meta(&self.meta_index, STATE_DOC_ID).await? {
            Some(doc) => serde_json::from_value(doc).context("unparseable cycle state document"),
            None => Ok(CycleState::default()),
        }
    }

    /// Drain any priority request and the previous cycle's undone set.
    /// Called once at the start of every cycle.
    pub async fn priority_cycle(&self) -> anyhow::Result<PriorityCycle> {
        let mut cycle = PriorityCycle::default();

        let previous = self.load().await?;
        if previous.status.as_deref() == Some("indexing") {
            // Aborted mid-run. Mark it so the flag fires exactly once.
            cycle.restart = true;
            let mut aborted = previous.clone();
            aborted.status = Some("aborted".to_owned());
            aborted.undone = Vec::new();
            self.put_state(&aborted).await?;
        } else {
            cycle.uids.extend(previous.undone.iter().cloned());
        }

        if let Some(doc) = self
            .search
            .get_meta(&self.meta_index, PRIORITY_DOC_ID)
            .await?
        {
            let request: PriorityRequest =
                serde_json::from_value(doc).context("unparseable priority request")?;
            cycle.uids.extend(request.uuids);
            cycle.types = request.types;
            cycle.xmin = request.xmin;
            *self.pending_notify.lock() = request.notify;
            self.search
                .delete_meta(&self.meta_index, PRIORITY_DOC_ID)
                .await?;
        }

        Ok(cycle)
    }

    pub fn log_reindex_init_state(&self, cycle: &PriorityCycle) {
        if cycle.restart {
            tracing::warn!("Previous indexing cycle aborted mid-run; recomputing from last_xmin");
        }
        if !cycle.uids.is_empty() {
            tracing::info!(
                "Reindex cycle starting with {} staged uuids{}",
                cycle.uids.len(),
                cycle
                    .xmin
                    .map(|x| format!(" at pinned xmin {x}"))
                    .unwrap_or_default(),
            );
        }
    }

    /// Record the cycle as in flight. Every enqueued UID lands in `undone`
    /// so that an abort leaves a complete trail.
    pub async fn begin_cycle(
        &self,
        uids: &BTreeSet<Uid>,
        state: &mut CycleState,
    ) -> anyhow::Result<()> {
        state.status = Some("indexing".to_owned());
        state.invalidated = uids.len() as u64;
        let mut staged = state.clone();
        staged.undone = uids.iter().cloned().collect();
        self.put_state(&staged).await
    }

    /// The only place `last_xmin` advances. Partial success with per-UID
    /// errors still advances it; the failed UIDs ride along in `errors` and
    /// `undone` instead.
    pub async fn finish_cycle(
        &self,
        state: &mut CycleState,
        errors: Vec<UidError>,
        undone: Vec<Uid>,
        record: bool,
    ) -> anyhow::Result<()> {
        state.status = Some("done".to_owned());
        // A pinned priority cycle can run at an older xmin than the
        // persisted watermark; the watermark itself never regresses.
        state.last_xmin = state.xmin.max(state.last_xmin);
        state.undone = undone;
        state.errors = errors;

        let mut persisted = state.clone();
        if !record {
            persisted.errors = Vec::new();
        }
        if let Err(e) = self.put_state(&persisted).await {
            tracing::warn!("Could not persist cycle state, redacting errors: {e:#}");
            for error in &state.errors {
                tracing::error!(
                    "Indexing error for {}, error message: {}",
                    error.uuid,
                    error.error_message
                );
            }
            for error in &mut persisted.errors {
                error.error_message = REDACTED_ERROR.to_owned();
            }
            self.put_state(&persisted).await?;
            if record {
                state.errors = persisted.errors;
            }
        }
        Ok(())
    }

    /// Stage the completed identifier set for each configured downstream
    /// indexer, keyed `<name>_indexing`. Runs before the main run so a
    /// mid-run crash still leaves a consistent hand-off; the record is never
    /// read back in this process.
    pub async fn stage_followup(&self, xmin: Xid, uids: &BTreeSet<Uid>) -> anyhow::Result<()> {
        for name in &self.followups {
            let doc = serde_json::json!({
                "xmin": xmin,
                "uuids": uids.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
            });
            self.search
                .put_meta(&self.meta_index, &format!("{name}_indexing"), &doc)
                .await
                .with_context(|| format!("failed to stage uuids for {name}"))?;
        }
        Ok(())
    }

    /// Notification sinks are external; completion is reported to the log.
    pub fn send_notices(&self) {
        let recipients = std::mem::take(&mut *self.pending_notify.lock());
        if !recipients.is_empty() {
            tracing::info!(
                "Requested reindexing complete, notifying {}",
                recipients.join(", ")
            );
        }
    }

    async fn put_state(&self, state: &CycleState) -> anyhow::Result<()> {
        let doc = serde_json::to_value(state)?;
        self.search
            .put_meta(&self.meta_index, STATE_DOC_ID, &doc)
            .await
    }
}
