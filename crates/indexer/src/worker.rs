//! The worker pool. Each worker pulls batches off the queue, binds its
//! private store connection to the cycle snapshot, renders each UID through
//! the embed endpoint, and writes the rendition with external versioning and
//! a fixed retry schedule.

use std::{
    mem,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use anyhow::Context;
use common::{
    knobs::WORKER_WATCHDOG_TIMEOUT,
    types::{
        SnapshotToken,
        Uid,
        UidError,
        Xid,
    },
};
use postgres::PrimaryStore;
use search::{
    SearchStore,
    WriteError,
};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    embed::{
        DocumentRenderer,
        RenderError,
    },
    queue::WorkQueue,
};

/// Backoff delays between write attempts on transport-level errors, in
/// seconds. Five attempts total.
const WRITE_BACKOFF_SCHEDULE: [u64; 5] = [0, 10, 20, 40, 80];

#[derive(Clone, Debug, Serialize)]
pub struct WriteAttempt {
    pub backoff_secs: u64,
    pub run_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Timing record for one processed UID, returned with the batch report and
/// optionally dumped to the initial indexing log.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateInfo {
    pub uuid: Uid,
    pub xmin: Xid,
    pub render_ms: u64,
    pub write_ms: u64,
    pub run_ms: u64,
    pub attempts: Vec<WriteAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UidError>,
}

pub(crate) struct WorkerContext {
    pub primary: Arc<dyn PrimaryStore>,
    pub search: Arc<dyn SearchStore>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub queue: Arc<WorkQueue>,
    pub xmin: Xid,
    pub snapshot: Option<SnapshotToken>,
    pub chunk_size: usize,
    pub batch_size: usize,
    /// Set by the controller on a fatal break; workers finish their current
    /// chunk and exit instead of pulling another one.
    pub stop: AtomicBool,
}

impl WorkerContext {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        search: Arc<dyn SearchStore>,
        renderer: Arc<dyn DocumentRenderer>,
        queue: Arc<WorkQueue>,
        xmin: Xid,
        snapshot: Option<SnapshotToken>,
        chunk_size: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            primary,
            search,
            renderer,
            queue,
            xmin,
            snapshot,
            chunk_size,
            batch_size,
            stop: AtomicBool::new(false),
        }
    }
}

pub(crate) fn spawn_workers(
    ctx: Arc<WorkerContext>,
    count: usize,
) -> Vec<JoinHandle<anyhow::Result<Vec<UpdateInfo>>>> {
    (0..count)
        .map(|worker_id| {
            let ctx = ctx.clone();
            tokio::spawn(async move { run_worker(worker_id, ctx).await })
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
) -> anyhow::Result<Vec<UpdateInfo>> {
    let worker = ctx.queue.get_worker();
    let mut infos = Vec::new();
    // `chunk_size` bounds one pull (and so per-worker memory); `batch_size`
    // is the reporting cadence.
    let mut pending_successes = 0usize;
    let mut pending_errors: Vec<UidError> = Vec::new();
    let mut since_report = 0usize;
    let mut fatal = None;
    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }
        let chunk = worker.get_batch(ctx.chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        tracing::info!("Worker {worker_id} processing a chunk of {}", chunk.len());
        since_report += chunk.len();
        let outcome = tokio::time::timeout(*WORKER_WATCHDOG_TIMEOUT, process_chunk(&ctx, chunk))
            .await
            .map_err(|_| anyhow::anyhow!("worker {worker_id} hit the watchdog mid-chunk"))?;
        let chunk_result = match outcome {
            Ok(chunk_result) => chunk_result,
            Err(e) => {
                fatal = Some(e);
                break;
            },
        };
        pending_successes += chunk_result.successes;
        pending_errors.extend(chunk_result.errors);
        infos.extend(chunk_result.infos);
        if since_report >= ctx.batch_size {
            worker
                .report(pending_successes, mem::take(&mut pending_errors))
                .await?;
            pending_successes = 0;
            since_report = 0;
        }
    }
    if since_report > 0 || pending_successes > 0 || !pending_errors.is_empty() {
        worker.report(pending_successes, pending_errors).await?;
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(infos),
    }
}

struct ChunkResult {
    infos: Vec<UpdateInfo>,
    successes: usize,
    errors: Vec<UidError>,
}

/// One chunk under one snapshot binding. The binding is acquired at chunk
/// start and released at chunk end, so a leaked transaction can outlive its
/// chunk only until the watchdog fires.
async fn process_chunk(ctx: &WorkerContext, chunk: Vec<Uid>) -> anyhow::Result<ChunkResult> {
    let binding = ctx
        .primary
        .bind_snapshot(ctx.snapshot.as_ref(), ctx.xmin)
        .await
        .context("worker could not enter the cycle snapshot")?;

    let mut result = ChunkResult {
        infos: Vec::with_capacity(chunk.len()),
        successes: 0,
        errors: Vec::new(),
    };
    let mut fatal = None;
    for uid in chunk {
        match update_object(ctx, uid).await {
            Ok(info) => {
                match &info.error {
                    Some(error) => result.errors.push(error.clone()),
                    None => result.successes += 1,
                }
                result.infos.push(info);
            },
            Err(e) => {
                // Statement error: the session is poisoned and must roll
                // back before this worker could continue.
                fatal = Some(e);
                break;
            },
        }
    }

    binding.release().await?;
    match fatal {
        Some(e) => Err(e),
        None => Ok(result),
    }
}

async fn update_object(ctx: &WorkerContext, uid: Uid) -> anyhow::Result<UpdateInfo> {
    let started = Instant::now();
    let mut info = UpdateInfo {
        uuid: uid.clone(),
        xmin: ctx.xmin,
        render_ms: 0,
        write_ms: 0,
        run_ms: 0,
        attempts: Vec::new(),
        error: None,
    };

    let render_started = Instant::now();
    let rendered = ctx.renderer.render(&uid).await;
    info.render_ms = render_started.elapsed().as_millis() as u64;
    let doc = match rendered {
        Ok(doc) => doc,
        Err(RenderError::Statement { uid, source }) => {
            return Err(source.context(format!("statement error rendering {uid}")));
        },
        Err(RenderError::Other(e)) => {
            let message = format!("Error rendering /{uid}/@@index-data: {e:#}");
            tracing::error!("{message}");
            info.error = Some(UidError::new(uid, message));
            info.run_ms = started.elapsed().as_millis() as u64;
            return Ok(info);
        },
    };

    let write_started = Instant::now();
    let mut last_exc = None;
    for backoff_secs in WRITE_BACKOFF_SCHEDULE {
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        let attempt_started = Instant::now();
        let outcome = ctx
            .search
            .index_document(&doc.item_type, &uid, ctx.xmin, &doc.body)
            .await;
        let mut attempt = WriteAttempt {
            backoff_secs,
            run_ms: attempt_started.elapsed().as_millis() as u64,
            error: None,
        };
        let done = match outcome {
            Ok(()) => {
                last_exc = None;
                true
            },
            Err(WriteError::VersionConflict { .. }) => {
                // A later cycle already wrote a strictly newer version; this
                // rendition is obsolete and the UID is done.
                tracing::warn!("Conflict indexing {uid} at version {}", ctx.xmin);
                last_exc = None;
                true
            },
            Err(WriteError::Transport(e)) => {
                let message = format!("Retryable error indexing {uid}: {e:#}");
                tracing::warn!("{message}");
                attempt.error = Some(message.clone());
                last_exc = Some(message);
                false
            },
            Err(WriteError::Other(e)) => {
                let message = format!("Error indexing {uid}: {e:#}");
                tracing::error!("{message}");
                attempt.error = Some(message.clone());
                last_exc = Some(message);
                true
            },
        };
        info.attempts.push(attempt);
        if done {
            break;
        }
    }
    info.write_ms = write_started.elapsed().as_millis() as u64;

    if let Some(message) = last_exc {
        info.error = Some(UidError::new(uid, message));
    }
    info.run_ms = started.elapsed().as_millis() as u64;
    Ok(info)
}
