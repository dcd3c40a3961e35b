//! End-to-end cycle scenarios against the in-memory primary store, search
//! store, and renderer.

use std::sync::Arc;

use chrono::Utc;
use common::types::{
    Uid,
    UidError,
    Xid,
};
use maplit::btreeset;
use postgres::testing::FakePrimary;
use pretty_assertions::assert_eq;
use search::testing::{
    InjectedFailure,
    MemorySearchStore,
};
use serde_json::json;

use crate::{
    controller::{
        CycleController,
        IndexRequest,
    },
    embed::testing::{
        FakeRenderer,
        RenderFailure,
    },
    queue::WorkQueue,
    resolver::ResolveLimits,
    state::{
        CycleState,
        IndexerState,
        PRIORITY_DOC_ID,
        STATE_DOC_ID,
    },
};

const META: &str = "meta";

fn uid(n: u32) -> Uid {
    format!("00000000-0000-0000-0000-0000{n:08x}")
        .parse()
        .unwrap()
}

struct Harness {
    primary: Arc<FakePrimary>,
    search: Arc<MemorySearchStore>,
    renderer: Arc<FakeRenderer>,
}

impl Harness {
    fn new() -> Self {
        Self {
            primary: Arc::new(FakePrimary::new()),
            search: Arc::new(MemorySearchStore::new()),
            renderer: Arc::new(FakeRenderer::new()),
        }
    }

    fn controller(&self) -> CycleController {
        CycleController::new(
            self.primary.clone(),
            self.search.clone(),
            self.renderer.clone(),
            Arc::new(WorkQueue::in_process(1_000_000)),
        )
        .with_resolve_limits(ResolveLimits {
            max_clauses: 64,
            search_max: 50,
        })
    }

    /// Register an object with the primary store and the renderer.
    fn add_object(
        &self,
        uid: &Uid,
        item_type: &str,
        embeds: impl IntoIterator<Item = Uid>,
        links: impl IntoIterator<Item = Uid>,
    ) {
        self.primary.add_object(uid.clone(), item_type);
        self.renderer.add_object(uid, item_type, embeds, links);
    }

    /// Persist a finalized cycle at watermark `xmin`, as if a prior cycle
    /// completed cleanly.
    fn seed_finished_cycle(&self, xmin: u64) {
        self.search.put_meta_doc(
            META,
            STATE_DOC_ID,
            json!({"status": "done", "xmin": xmin, "last_xmin": xmin}),
        );
    }

    fn persisted_state(&self) -> CycleState {
        serde_json::from_value(self.search.meta_doc(META, STATE_DOC_ID).unwrap()).unwrap()
    }
}

#[tokio::test]
async fn test_cold_start_runs_a_full_reindex() {
    let h = Harness::new();
    let (a, b) = (uid(1), uid(2));
    h.add_object(&a, "snowball", [], []);
    h.add_object(&b, "snowflake", [], []);
    for xid in [5, 6, 7] {
        h.primary
            .add_transaction(Xid(xid), Utc::now(), [a.clone(), b.clone()], []);
    }

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // No last_xmin anywhere: branch 1, everything is reindexed.
    assert_eq!(outcome.state.xmin, Some(Xid(8)));
    assert_eq!(outcome.state.last_xmin, Some(Xid(8)));
    assert!(outcome.state.errors.is_empty());
    assert_eq!(h.search.document("snowball", &a).unwrap().0, Xid(8));
    assert_eq!(h.search.document("snowflake", &b).unwrap().0, Xid(8));
    assert_eq!(h.primary.snapshot_exports(), 1);
    assert_eq!(h.persisted_state().last_xmin, Some(Xid(8)));
    // Full reindex requests a synced flush.
    assert_eq!(h.search.flush_count(), 1);
    // The invalidation query is never issued on the full-reindex branch.
    assert_eq!(h.search.related_query_count(), 0);
}

#[tokio::test]
async fn test_empty_cycle_is_a_noop() {
    let h = Harness::new();
    h.add_object(&uid(1), "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.set_xmin(Xid(9));

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.state.txn_count, 0);
    assert_eq!(outcome.state.last_xmin, Some(Xid(5)));
    assert_eq!(h.search.document_count(), 0);
    // No snapshot is exported, and the persisted state is untouched.
    assert_eq!(h.primary.snapshot_exports(), 0);
    assert_eq!(h.persisted_state().xmin, Some(Xid(5)));
}

#[tokio::test]
async fn test_transitive_invalidation_through_embedded_uuids() {
    let h = Harness::new();
    let (x, y) = (uid(1), uid(2));
    h.add_object(&x, "snowball", [y.clone()], []);
    h.add_object(&y, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.search.seed_document(
        "snowball",
        &x,
        Xid(5),
        json!({
            "embedded_uuids": [x.to_string(), y.to_string()],
            "linked_uuids": [],
        }),
    );
    h.primary.add_transaction(Xid(6), Utc::now(), [y.clone()], []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // X embeds Y, so updating Y rewrites X too.
    assert_eq!(outcome.state.invalidated, 2);
    assert_eq!(outcome.state.referencing, 1);
    assert_eq!(h.search.document("snowball", &x).unwrap().0, Xid(7));
    assert_eq!(h.search.document("snowball", &y).unwrap().0, Xid(7));
    assert!(outcome.state.txn_lag.is_some());
}

#[tokio::test]
async fn test_rename_invalidates_referrers_only() {
    let h = Harness::new();
    let (z, w) = (uid(1), uid(2));
    h.add_object(&z, "snowball", [], [w.clone()]);
    h.add_object(&w, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.search.seed_document(
        "snowball",
        &z,
        Xid(5),
        json!({
            "embedded_uuids": [z.to_string()],
            "linked_uuids": [w.to_string()],
        }),
    );
    h.primary.add_transaction(Xid(6), Utc::now(), [], [w.clone()]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.state.invalidated, 1);
    assert_eq!(h.search.document("snowball", &z).unwrap().0, Xid(7));
    // The renamed object itself keeps its old rendition.
    assert_eq!(h.search.document("snowball", &w), None);
}

#[tokio::test]
async fn test_clause_ceiling_widens_to_full_reindex() {
    let h = Harness::new();
    let (a, b) = (uid(1), uid(2));
    h.add_object(&a, "snowball", [], []);
    h.add_object(&b, "snowball", [], []);
    h.seed_finished_cycle(5);
    let many: Vec<Uid> = (100..165).map(uid).collect();
    h.primary.add_transaction(Xid(6), Utc::now(), many, []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // 65 mutated uids against a 64-clause ceiling: every known object is
    // rebuilt without ever issuing the invalidation query.
    assert_eq!(h.search.related_query_count(), 0);
    assert_eq!(outcome.state.invalidated, 2);
    assert!(h.search.document("snowball", &a).is_some());
    assert!(h.search.document("snowball", &b).is_some());
    assert_eq!(h.search.flush_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_retry_with_backoff() {
    let h = Harness::new();
    let q = uid(1);
    h.add_object(&q, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [q.clone()], []);
    h.search
        .inject_write_failures(&q, [InjectedFailure::Transport, InjectedFailure::Transport]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // Written exactly once after two retries; no error recorded.
    assert_eq!(h.search.write_attempts(&q), 3);
    assert_eq!(h.search.document("snowball", &q).unwrap().0, Xid(7));
    assert!(outcome.state.errors.is_empty());
    assert!(outcome.state.undone.is_empty());
    let attempts = &outcome.update_infos[0].attempts;
    assert_eq!(
        attempts.iter().map(|a| a.backoff_secs).collect::<Vec<_>>(),
        vec![0, 10, 20]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_record_the_uid() {
    let h = Harness::new();
    let q = uid(1);
    h.add_object(&q, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [q.clone()], []);
    h.search.inject_write_failures(&q, [InjectedFailure::Transport; 5]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(h.search.write_attempts(&q), 5);
    assert_eq!(h.search.document("snowball", &q), None);
    assert_eq!(outcome.state.errors.len(), 1);
    assert_eq!(outcome.state.errors[0].uuid, q);
    // The cycle still finalizes; the failed uid is reprocessed on its next
    // mutation or by a priority request.
    assert_eq!(outcome.state.last_xmin, Some(Xid(7)));
}

#[tokio::test]
async fn test_version_conflict_counts_as_success() {
    let h = Harness::new();
    let r = uid(1);
    h.add_object(&r, "snowball", [], []);
    h.seed_finished_cycle(5);
    // A later cycle (version 100) already wrote R.
    h.search.seed_document(
        "snowball",
        &r,
        Xid(100),
        json!({"embedded_uuids": [r.to_string()], "linked_uuids": [], "rev": "newer"}),
    );
    h.primary.add_transaction(Xid(6), Utc::now(), [r.clone()], []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert!(outcome.state.errors.is_empty());
    assert!(outcome.state.undone.is_empty());
    let (version, body) = h.search.document("snowball", &r).unwrap();
    assert_eq!(version, Xid(100));
    assert_eq!(body["rev"], "newer");
    assert_eq!(outcome.state.last_xmin, Some(Xid(7)));
}

#[tokio::test]
async fn test_render_error_is_recorded_and_cycle_continues() {
    let h = Harness::new();
    let (good, bad) = (uid(1), uid(2));
    h.add_object(&good, "snowball", [], []);
    h.add_object(&bad, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary
        .add_transaction(Xid(6), Utc::now(), [good.clone(), bad.clone()], []);
    h.renderer
        .inject_render_failures(&bad, [RenderFailure::Other]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert!(h.search.document("snowball", &good).is_some());
    assert_eq!(h.search.document("snowball", &bad), None);
    assert_eq!(outcome.state.errors.len(), 1);
    assert!(outcome.state.errors[0]
        .error_message
        .contains("@@index-data"));
    assert_eq!(outcome.state.last_xmin, Some(Xid(7)));
}

#[tokio::test]
async fn test_statement_error_aborts_the_cycle() {
    let h = Harness::new();
    let (good, poisoned) = (uid(1), uid(2));
    h.add_object(&good, "snowball", [], []);
    h.add_object(&poisoned, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary
        .add_transaction(Xid(6), Utc::now(), [good.clone(), poisoned.clone()], []);
    h.renderer
        .inject_render_failures(&poisoned, [RenderFailure::Statement]);

    let controller = h.controller();
    let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();

    assert!(outcome.state.error.is_some());
    // The watermark must not advance past an aborted cycle.
    let persisted = h.persisted_state();
    assert_eq!(persisted.status.as_deref(), Some("indexing"));
    assert_eq!(persisted.last_xmin, Some(Xid(5)));

    // The next cycle observes the abort, recomputes from last_xmin, and
    // succeeds once the poison is gone.
    let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();
    assert!(outcome.state.error.is_none());
    assert_eq!(outcome.state.last_xmin, Some(Xid(7)));
    assert!(h.search.document("snowball", &good).is_some());
    assert!(h.search.document("snowball", &poisoned).is_some());
}

#[tokio::test]
async fn test_undone_uids_merge_into_the_next_cycle() {
    let h = Harness::new();
    let u = uid(1);
    h.add_object(&u, "snowball", [], []);
    h.search.put_meta_doc(
        META,
        STATE_DOC_ID,
        json!({
            "status": "done",
            "xmin": 9,
            "last_xmin": 9,
            "undone": [u.to_string()],
        }),
    );
    h.primary.set_xmin(Xid(12));

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.state.txn_count, 0);
    assert_eq!(h.search.document("snowball", &u).unwrap().0, Xid(12));
    assert_eq!(outcome.state.last_xmin, Some(Xid(12)));
}

#[tokio::test]
async fn test_restart_flag_discards_the_staged_set() {
    let h = Harness::new();
    let u = uid(1);
    h.add_object(&u, "snowball", [], []);
    h.search.put_meta_doc(
        META,
        STATE_DOC_ID,
        json!({
            "status": "indexing",
            "xmin": 9,
            "last_xmin": 5,
            "undone": [u.to_string()],
        }),
    );
    h.primary.set_xmin(Xid(9));

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // Restart policy: the staged set is dropped, the cycle recomputes from
    // last_xmin, and with no transactions that is a no-op.
    assert_eq!(outcome.state.txn_count, 0);
    assert_eq!(h.search.document_count(), 0);
    let persisted = h.persisted_state();
    assert_eq!(persisted.status.as_deref(), Some("aborted"));
    assert_eq!(persisted.last_xmin, Some(Xid(5)));
    assert!(persisted.undone.is_empty());
}

#[tokio::test]
async fn test_priority_request_is_drained_and_idempotent() {
    let h = Harness::new();
    let p = uid(1);
    h.add_object(&p, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.set_xmin(Xid(8));
    h.search.put_meta_doc(
        META,
        PRIORITY_DOC_ID,
        json!({"uuids": [p.to_string()], "notify": ["ops"]}),
    );

    let controller = h.controller();
    let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();
    assert_eq!(h.search.document("snowball", &p).unwrap().0, Xid(8));
    assert_eq!(outcome.state.last_xmin, Some(Xid(8)));
    assert!(outcome.state.errors.is_empty());
    // Drained: the request document is gone.
    assert_eq!(h.search.meta_doc(META, PRIORITY_DOC_ID), None);

    // Submitting the same request again converges to the same watermark
    // with no new errors.
    h.search.put_meta_doc(META, PRIORITY_DOC_ID, json!({"uuids": [p.to_string()]}));
    let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();
    assert_eq!(outcome.state.last_xmin, Some(Xid(8)));
    assert!(outcome.state.errors.is_empty());
}

#[tokio::test]
async fn test_pinned_priority_cycle_never_regresses_the_watermark() {
    let h = Harness::new();
    let p = uid(1);
    h.add_object(&p, "snowball", [], []);
    h.seed_finished_cycle(9);
    h.search.put_meta_doc(
        META,
        PRIORITY_DOC_ID,
        json!({"uuids": [p.to_string()], "xmin": 6}),
    );

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // The staged cycle runs at its pinned (older) xmin...
    assert_eq!(outcome.state.xmin, Some(Xid(6)));
    assert_eq!(h.search.document("snowball", &p).unwrap().0, Xid(6));
    // ...but the persisted watermark stays monotonic.
    assert_eq!(h.persisted_state().last_xmin, Some(Xid(9)));
}

#[tokio::test]
async fn test_followup_staging_precedes_the_run() {
    let h = Harness::new();
    let (a, b) = (uid(1), uid(2));
    h.add_object(&a, "snowball", [], []);
    h.add_object(&b, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary
        .add_transaction(Xid(6), Utc::now(), [a.clone(), b.clone()], []);

    let controller = h
        .controller()
        .with_followups(vec!["vis_indexer".to_owned(), "region_indexer".to_owned()]);
    controller.run_cycle(IndexRequest::default()).await.unwrap();

    for name in ["vis_indexer_indexing", "region_indexer_indexing"] {
        let staged = h.search.meta_doc(META, name).unwrap();
        assert_eq!(staged["xmin"], json!(7));
        let mut uuids: Vec<String> =
            serde_json::from_value(staged["uuids"].clone()).unwrap();
        uuids.sort();
        assert_eq!(uuids, vec![a.to_string(), b.to_string()]);
    }
}

#[tokio::test]
async fn test_short_uuids_caps_the_cycle() {
    let h = Harness::new();
    for n in 1..=5 {
        h.add_object(&uid(n), "snowball", [], []);
    }

    let outcome = h
        .controller()
        .with_short_uuids(2)
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.state.invalidated, 2);
    assert_eq!(h.search.document_count(), 2);
}

#[tokio::test]
async fn test_dry_run_resolves_without_writing() {
    let h = Harness::new();
    let a = uid(1);
    h.add_object(&a, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [a.clone()], []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.state.invalidated, 1);
    assert_eq!(h.search.document_count(), 0);
    assert_eq!(h.primary.snapshot_exports(), 0);
    assert_eq!(h.persisted_state().xmin, Some(Xid(5)));
}

#[tokio::test]
async fn test_recovery_mode_skips_snapshot_export() {
    let h = Harness::new();
    let a = uid(1);
    h.add_object(&a, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [a.clone()], []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest {
            recovery: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(h.primary.snapshot_exports(), 0);
    assert_eq!(h.search.document("snowball", &a).unwrap().0, Xid(7));
    assert!(outcome.state.errors.is_empty());
}

#[tokio::test]
async fn test_concurrent_cycle_is_rejected() {
    let h = Harness::new();
    let a = uid(1);
    h.add_object(&a, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [a.clone()], []);

    let queue = Arc::new(WorkQueue::in_process(1_000_000));
    queue.load_uuids(vec![uid(99)]).await.unwrap();

    let controller = CycleController::new(
        h.primary.clone(),
        h.search.clone(),
        h.renderer.clone(),
        queue,
    );
    let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();
    assert!(outcome
        .state
        .error
        .as_deref()
        .unwrap()
        .contains("already indexing"));
    assert_eq!(h.search.document_count(), 0);
}

#[tokio::test]
async fn test_flush_conflict_is_ignored_on_full_reindex() {
    let h = Harness::new();
    h.add_object(&uid(1), "snowball", [], []);
    h.search.set_flush_conflict(true);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert!(outcome.state.error.is_none());
    assert_eq!(h.search.flush_count(), 1);
}

#[tokio::test]
async fn test_worker_pool_drains_the_queue() {
    let h = Harness::new();
    let uids: Vec<Uid> = (1..=50).map(uid).collect();
    for u in &uids {
        h.add_object(u, "snowball", [], []);
    }

    let outcome = h
        .controller()
        .with_processes(4)
        .with_chunk_size(8)
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert_eq!(h.search.document_count(), 50);
    assert_eq!(outcome.update_infos.len(), 50);
    assert!(outcome.state.errors.is_empty());
    // Every batch binding was released.
    assert_eq!(h.primary.bindings_unreleased(), 0);
    assert!(h.primary.bindings_opened() >= 4);
}

#[tokio::test]
async fn test_accounting_adds_up() {
    let h = Harness::new();
    let uids: Vec<Uid> = (1..=10).map(uid).collect();
    for u in &uids {
        h.add_object(u, "snowball", [], []);
    }
    h.seed_finished_cycle(5);
    h.primary
        .add_transaction(Xid(6), Utc::now(), uids.clone(), []);
    h.renderer
        .inject_render_failures(&uids[0], [RenderFailure::Other]);
    h.renderer
        .inject_render_failures(&uids[1], [RenderFailure::Other]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // written + errors + undone covers the whole invalidation set.
    let written = h.search.document_count() as u64;
    let errored = outcome.state.errors.len() as u64;
    let undone = outcome.state.undone.len() as u64;
    assert_eq!(written + errored + undone, outcome.state.invalidated);
}

#[tokio::test]
async fn test_record_flag_redacts_unpersistable_errors() {
    let h = Harness::new();
    let state = IndexerState::new(h.search.clone(), vec![]);
    let mut cycle = CycleState {
        xmin: Some(Xid(7)),
        last_xmin: Some(Xid(5)),
        ..Default::default()
    };
    let errors = vec![UidError::new(uid(1), "disk exploded in great detail")];
    h.search.inject_meta_put_failures(STATE_DOC_ID, 1);

    state
        .finish_cycle(&mut cycle, errors, vec![], true)
        .await
        .unwrap();

    // The second attempt persists with the message redacted.
    let persisted = h.persisted_state();
    assert_eq!(persisted.errors.len(), 1);
    assert_eq!(
        persisted.errors[0].error_message,
        "Error occurred during indexing, check the logs"
    );
    assert_eq!(persisted.last_xmin, Some(Xid(7)));
}

#[tokio::test]
async fn test_record_flag_controls_error_persistence() {
    let h = Harness::new();
    let bad = uid(1);
    h.add_object(&bad, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [bad.clone()], []);
    h.renderer
        .inject_render_failures(&bad, [RenderFailure::Other]);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    // Without `record`, errors are returned to the caller but not persisted.
    assert_eq!(outcome.state.errors.len(), 1);
    assert!(h.persisted_state().errors.is_empty());
}

#[tokio::test]
async fn test_initial_indexing_log_is_written_once() {
    let h = Harness::new();
    h.add_object(&uid(1), "snowball", [], []);
    h.add_object(&uid(2), "snowball", [], []);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("initial-indexing.log");

    let controller = h.controller().with_initial_log_path(path.clone());
    controller.run_cycle(IndexRequest::default()).await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 2);

    // A later cycle leaves the existing log alone.
    h.primary
        .add_transaction(Xid(20), Utc::now(), [uid(1)], []);
    controller.run_cycle(IndexRequest::default()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
}

#[tokio::test]
async fn test_types_filter_restricts_cold_start() {
    let h = Harness::new();
    let (a, b) = (uid(1), uid(2));
    h.add_object(&a, "snowball", [], []);
    h.add_object(&b, "snowflake", [], []);

    let outcome = h
        .controller()
        .run_cycle(IndexRequest {
            types: Some(btreeset! {"snowflake".to_owned()}),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.state.invalidated, 1);
    assert_eq!(h.search.document("snowball", &a), None);
    assert!(h.search.document("snowflake", &b).is_some());
}

#[tokio::test]
async fn test_last_xmin_is_monotone_across_cycles() {
    let h = Harness::new();
    let a = uid(1);
    h.add_object(&a, "snowball", [], []);

    let controller = h.controller();
    let mut watermarks: Vec<Xid> = Vec::new();
    for xid in [5u64, 9, 14] {
        h.primary
            .add_transaction(Xid(xid), Utc::now(), [a.clone()], []);
        let outcome = controller.run_cycle(IndexRequest::default()).await.unwrap();
        watermarks.push(outcome.state.last_xmin.unwrap());
    }
    let mut sorted = watermarks.clone();
    sorted.sort();
    assert_eq!(watermarks, sorted);
}

#[tokio::test(start_paused = true)]
async fn test_bind_timeout_is_fatal_to_the_cycle() {
    let h = Harness::new();
    let a = uid(1);
    h.add_object(&a, "snowball", [], []);
    h.seed_finished_cycle(5);
    h.primary.add_transaction(Xid(6), Utc::now(), [a.clone()], []);
    // Worker connections lag far behind the coordinator and never catch up.
    h.primary.set_worker_xmin(Xid(2));

    let outcome = h
        .controller()
        .run_cycle(IndexRequest::default())
        .await
        .unwrap();

    assert!(outcome.state.error.is_some());
    assert_eq!(h.search.document_count(), 0);
    // Aborted: the watermark stays put.
    assert_eq!(h.persisted_state().last_xmin, Some(Xid(5)));
}
