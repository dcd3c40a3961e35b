//! One reindex cycle, run as a linear state machine:
//!
//! ```text
//! IDLE -> RESOLVE -> SNAPSHOT -> LOAD -> RUN -> FINALIZE -> NOTIFY -> IDLE
//!                                  \______ FAIL ______________/
//! ```
//!
//! Cycles are strictly serial; the queue's "already indexing" check enforces
//! at most one active cycle. Ordering of UIDs within a cycle is unspecified
//! and per-UID outcomes never depend on it.

use std::{
    collections::BTreeSet,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use chrono::Utc;
use common::{
    knobs::{
        INDEXER_INITIAL_LOG_PATH,
        INDEXER_MAX_ERRORS,
        INDEXER_PROCESSES,
        INDEXER_RUN_TIMEOUT,
        INDEXER_SHORT_UUIDS,
        QUEUE_WORKER_BATCH_SIZE,
        QUEUE_WORKER_CHUNK_SIZE,
        STAGE_FOR_FOLLOWUP,
    },
    types::{
        SnapshotToken,
        Uid,
        UidError,
        Xid,
    },
};
use postgres::PrimaryStore;
use search::{
    FlushOutcome,
    SearchStore,
    RESOURCES_INDEX,
};
use serde::Deserialize;

use crate::{
    embed::DocumentRenderer,
    queue::WorkQueue,
    resolver::{
        self,
        ResolveLimits,
    },
    state::{
        CycleState,
        IndexerState,
    },
    worker::{
        spawn_workers,
        UpdateInfo,
        WorkerContext,
    },
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Body of the trigger endpoint's POST request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IndexRequest {
    /// Persist per-UID errors with the final state document.
    #[serde(default)]
    pub record: bool,
    /// Resolve only; skip snapshot, load, and run.
    #[serde(default)]
    pub dry_run: bool,
    /// The primary store is a standby: weaker isolation, no snapshot export.
    #[serde(default)]
    pub recovery: bool,
    /// Override the persisted watermark (first boot, or operator repair).
    #[serde(default)]
    pub last_xmin: Option<Xid>,
    /// Restrict a first-cycle full reindex to these item types.
    #[serde(default)]
    pub types: Option<BTreeSet<String>>,
}

/// The final cycle state (the trigger endpoint's response body) plus the
/// per-UID timing records.
#[derive(Debug)]
pub struct CycleOutcome {
    pub state: CycleState,
    pub update_infos: Vec<UpdateInfo>,
}

/// The watermark a finished cycle left behind. A non-finalized state
/// document (aborted or in-flight) contributes only the watermark it
/// inherited, never the xmin it was attempting.
fn persisted_last_xmin(prior: &CycleState) -> Option<Xid> {
    if prior.status.as_deref() == Some("done") {
        prior.xmin.max(prior.last_xmin)
    } else {
        prior.last_xmin
    }
}

#[derive(Default)]
struct RunResult {
    update_infos: Vec<UpdateInfo>,
    errors: Vec<UidError>,
    undone: Vec<Uid>,
    fatal: Option<anyhow::Error>,
}

pub struct CycleController {
    primary: Arc<dyn PrimaryStore>,
    search: Arc<dyn SearchStore>,
    renderer: Arc<dyn DocumentRenderer>,
    queue: Arc<WorkQueue>,
    state: IndexerState,
    processes: usize,
    chunk_size: usize,
    batch_size: usize,
    limits: ResolveLimits,
    short_uuids: usize,
    run_timeout: Duration,
    max_errors: usize,
    initial_log_path: Option<PathBuf>,
}

impl CycleController {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        search: Arc<dyn SearchStore>,
        renderer: Arc<dyn DocumentRenderer>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        let followups: Vec<String> = STAGE_FOR_FOLLOWUP
            .split(',')
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        let initial_log_path =
            (!INDEXER_INITIAL_LOG_PATH.is_empty()).then(|| PathBuf::from(&*INDEXER_INITIAL_LOG_PATH));
        Self {
            primary,
            state: IndexerState::new(search.clone(), followups),
            search,
            renderer,
            queue,
            processes: *INDEXER_PROCESSES,
            chunk_size: *QUEUE_WORKER_CHUNK_SIZE,
            batch_size: *QUEUE_WORKER_BATCH_SIZE,
            limits: ResolveLimits::from_knobs(),
            short_uuids: *INDEXER_SHORT_UUIDS,
            run_timeout: *INDEXER_RUN_TIMEOUT,
            max_errors: *INDEXER_MAX_ERRORS,
            initial_log_path,
        }
    }

    pub fn with_followups(mut self, followups: Vec<String>) -> Self {
        self.state = IndexerState::new(self.search.clone(), followups);
        self
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_resolve_limits(mut self, limits: ResolveLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_short_uuids(mut self, short_uuids: usize) -> Self {
        self.short_uuids = short_uuids;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn with_initial_log_path(mut self, path: PathBuf) -> Self {
        self.initial_log_path = Some(path);
        self
    }

    /// Run one cycle to completion. Per-UID failures are accumulated into
    /// the returned state; only infrastructure failures (state store
    /// unreachable, primary store gone) surface as `Err`.
    pub async fn run_cycle(&self, request: IndexRequest) -> anyhow::Result<CycleOutcome> {
        let priority = self.state.priority_cycle().await?;
        self.state.log_reindex_init_state(&priority);
        let prior = self.state.load().await?;
        let mut result = CycleState::default();

        // A staged priority request pins its own watermark; everything else
        // resolves against the transaction log.
        let staged = priority.xmin.is_some() && !priority.uids.is_empty() && !priority.restart;
        let mut invalidated: BTreeSet<Uid>;
        let full_reindex: bool;
        let xmin: Xid;
        let mut first_txn = None;
        if staged {
            xmin = priority.xmin.expect("staged priority cycle carries an xmin");
            invalidated = priority.uids;
            full_reindex = invalidated.len() > self.limits.search_max;
            result.xmin = Some(xmin);
            result.last_xmin = persisted_last_xmin(&prior);
            result.invalidated = invalidated.len() as u64;
        } else {
            let last_xmin = request.last_xmin.or(persisted_last_xmin(&prior));
            let types = request.types.as_ref().or(priority.types.as_ref());
            let resolution = resolver::resolve(
                self.primary.as_ref(),
                self.search.as_ref(),
                last_xmin,
                &priority.uids,
                types,
                self.limits,
            )
            .await?;
            result.txn_count = resolution.txn_count;
            if resolution.txn_count == 0 && resolution.uids.is_empty() {
                result.xmin = prior.xmin;
                result.last_xmin = last_xmin;
                self.state.send_notices();
                return Ok(CycleOutcome {
                    state: result,
                    update_infos: Vec::new(),
                });
            }

            // SNAPSHOT: the watermark is minted only once there is work.
            xmin = self.primary.current_xmin(request.recovery).await?;
            invalidated = resolution.uids;
            full_reindex = resolution.full_reindex;
            first_txn = resolution.first_txn_timestamp;
            result.xmin = Some(xmin);
            result.last_xmin = last_xmin;
            result.invalidated = invalidated.len() as u64;
            result.referencing = resolution.referencing;
            result.updated = resolution.updated;
            result.renamed = resolution.renamed;
            result.max_xid = resolution.max_xid;
            result.first_txn_timestamp = resolution.first_txn_timestamp;
            result.types = types.cloned();
        }

        if self.short_uuids > 0 && invalidated.len() > self.short_uuids {
            tracing::warn!(
                "Shorting {} uuids to {}",
                invalidated.len(),
                self.short_uuids
            );
            invalidated = invalidated.into_iter().take(self.short_uuids).collect();
            result.invalidated = invalidated.len() as u64;
        }

        let mut update_infos = Vec::new();
        if !invalidated.is_empty() && !request.dry_run {
            // Exporting a snapshot mints a new xid, so only do so when
            // required. Not possible on a standby.
            let snapshot = if request.recovery {
                None
            } else {
                Some(self.primary.export_snapshot().await?)
            };

            // LOAD: follow-ups are staged before the run so a mid-run crash
            // still leaves a consistent hand-off.
            self.state.stage_followup(xmin, &invalidated).await?;
            self.state.begin_cycle(&invalidated, &mut result).await?;

            let run = self.serve_objects(&invalidated, xmin, snapshot).await?;
            update_infos = run.update_infos;

            if let Some(fatal) = run.fatal {
                tracing::error!("Indexing cycle aborted: {fatal:#}");
                result.error = Some(format!("{fatal:#}"));
                result.errors = run.errors;
                self.primary.release_snapshot().await?;
                self.state.send_notices();
                return Ok(CycleOutcome {
                    state: result,
                    update_infos,
                });
            }

            // FINALIZE
            self.state
                .finish_cycle(&mut result, run.errors, run.undone, request.record)
                .await?;
            self.search.refresh(RESOURCES_INDEX).await?;
            if full_reindex {
                match self.search.flush_synced(RESOURCES_INDEX).await {
                    Ok(FlushOutcome::Flushed) => {},
                    Ok(FlushOutcome::Conflict) => {
                        tracing::debug!("Synced flush conflicted; the index is still being written");
                    },
                    Err(e) => tracing::warn!("Synced flush failed: {e:#}"),
                }
            }
        }

        self.primary.release_snapshot().await?;
        if let Some(first) = first_txn {
            let lag = (Utc::now() - first).num_milliseconds() as f64 / 1000.0;
            result.txn_lag = Some(format!("{lag:.3}s"));
        }
        self.state.send_notices();
        self.write_initial_log(&update_infos);
        Ok(CycleOutcome {
            state: result,
            update_infos,
        })
    }

    /// LOAD + RUN: fill the queue, start the worker pool, and drain until
    /// the queue empties, the error budget trips, or the wall clock runs out.
    async fn serve_objects(
        &self,
        uids: &BTreeSet<Uid>,
        xmin: Xid,
        snapshot: Option<SnapshotToken>,
    ) -> anyhow::Result<RunResult> {
        let mut run = RunResult::default();
        if self.queue.is_indexing().await? {
            run.fatal = Some(anyhow::anyhow!("cannot start indexing: already indexing"));
            return Ok(run);
        }

        let expected = uids.len();
        let loaded = self.queue.load_uuids(uids.iter().cloned().collect()).await?;
        if loaded != expected {
            run.fatal = Some(anyhow::anyhow!(
                "queue accepted {loaded} of {expected} uuids"
            ));
            run.undone = self.queue.close_indexing().await?;
            return Ok(run);
        }

        let ctx = Arc::new(WorkerContext::new(
            self.primary.clone(),
            self.search.clone(),
            self.renderer.clone(),
            self.queue.clone(),
            xmin,
            snapshot,
            self.chunk_size,
            self.batch_size,
        ));
        let mut handles = spawn_workers(ctx.clone(), self.processes);

        let deadline = (!self.run_timeout.is_zero()).then(|| Instant::now() + self.run_timeout);
        while self.queue.is_indexing().await? {
            run.errors.extend(self.queue.pop_errors().await?);
            if run.errors.len() > self.max_errors {
                run.fatal = Some(anyhow::anyhow!(
                    "error budget exceeded: {} uuids failed",
                    run.errors.len()
                ));
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                run.fatal = Some(anyhow::anyhow!("indexer run timeout"));
                break;
            }

            let mut i = 0;
            while i < handles.len() {
                if !handles[i].is_finished() {
                    i += 1;
                    continue;
                }
                match handles.swap_remove(i).await {
                    Ok(Ok(infos)) => run.update_infos.extend(infos),
                    Ok(Err(e)) => run.fatal = Some(e.context("indexing worker died")),
                    Err(join) => run.fatal = Some(anyhow::anyhow!("worker panicked: {join}")),
                }
                if run.fatal.is_some() {
                    break;
                }
            }
            if run.fatal.is_some() {
                break;
            }
            if handles.is_empty() && self.queue.is_indexing().await? {
                run.fatal = Some(anyhow::anyhow!("workers exited with work unaccounted for"));
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        // Workers finish their current batch and exit; the stop flag keeps
        // them from starting another one after a fatal break.
        if run.fatal.is_some() {
            ctx.stop.store(true, Ordering::Relaxed);
        }
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(infos)) => run.update_infos.extend(infos),
                Ok(Err(e)) => {
                    if run.fatal.is_none() {
                        run.fatal = Some(e.context("indexing worker died"));
                    }
                },
                Err(join) => {
                    if run.fatal.is_none() {
                        run.fatal = Some(anyhow::anyhow!("worker panicked: {join}"));
                    }
                },
            }
        }

        run.errors.extend(self.queue.pop_errors().await?);
        run.undone = self.queue.close_indexing().await?;
        Ok(run)
    }

    /// One-time dump of per-UID timings, for sizing the initial index build.
    /// A logging failure must not break cycle completion.
    fn write_initial_log(&self, update_infos: &[UpdateInfo]) {
        let Some(path) = &self.initial_log_path else {
            return;
        };
        if update_infos.is_empty() || path.exists() {
            return;
        }
        let write = || -> anyhow::Result<()> {
            let mut file = std::fs::File::create(path)?;
            for info in update_infos {
                serde_json::to_writer(&mut file, info)?;
                file.write_all(b"\n")?;
            }
            Ok(())
        };
        match write() {
            Ok(()) => tracing::warn!(
                "Logged {} uuids to {}, one per line",
                update_infos.len(),
                path.display()
            ),
            Err(e) => tracing::error!("Could not write initial indexing log: {e:#}"),
        }
    }
}
