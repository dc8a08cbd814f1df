//! End-to-end pipeline tests: write documents through the commit
//! path, run indexing rounds, and verify every index converges on the
//! latest marker with exactly its own documents.

use pretty_assertions::assert_eq;
use serde_json::json;

use e2e_tests::{CollectingIndex, PipelineHarness};
use silt_types::IndexId;

#[tokio::test]
async fn test_write_then_index_round_trip() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    harness.write("users/1", "Users", json!({"name": "ada"}));
    harness.write("users/2", "Users", json!({"name": "lin"}));
    harness.write("orders/1", "Orders", json!({"total": 42}));

    harness.run_until_idle().await;

    assert_eq!(index.seen_count(), 3);
    assert_eq!(
        harness.executer.snapshot()[0].last_indexed_etag,
        harness.last_etag().await
    );
}

#[tokio::test]
async fn test_entity_filtered_indexes_see_only_their_collections() {
    let orders = CollectingIndex::for_entities(1, "orders-index", &["Orders"]);
    let users = CollectingIndex::for_entities(2, "users-index", &["Users"]);
    let harness = PipelineHarness::new(vec![orders.clone(), users.clone()]).await;

    harness.write("orders/1", "Orders", json!({"total": 10}));
    harness.write("users/1", "Users", json!({"name": "ada"}));

    harness.run_until_idle().await;

    assert_eq!(orders.seen_keys(), vec!["orders/1".to_string()]);
    assert_eq!(users.seen_keys(), vec!["users/1".to_string()]);

    // Both indexes advanced to the same highest marker even though
    // each saw only one document.
    let last = harness.last_etag().await;
    for snapshot in harness.executer.snapshot() {
        assert_eq!(snapshot.last_indexed_etag, last);
    }
}

#[tokio::test]
async fn test_update_within_window_indexes_latest_version_once() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    // Two versions of the same key land before any round runs; only
    // the newer version is indexed.
    harness.write("users/1", "Users", json!({"v": 1}));
    harness.write("users/1", "Users", json!({"v": 2}));

    harness.run_until_idle().await;

    assert_eq!(index.seen_keys(), vec!["users/1".to_string()]);
}

#[tokio::test]
async fn test_delete_after_queue_suppresses_indexing() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    harness.write("users/1", "Users", json!({}));
    harness.write("users/2", "Users", json!({}));
    // users/1 is deleted after being queued but before any round.
    harness.delete("users/1");

    harness.run_until_idle().await;

    assert_eq!(index.seen_keys(), vec!["users/2".to_string()]);
}

#[tokio::test]
async fn test_incremental_rounds_pick_up_new_writes() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    harness.write_many("Docs", &["docs/1", "docs/2"]);
    harness.run_until_idle().await;
    assert_eq!(index.seen_count(), 2);

    harness.write_many("Docs", &["docs/3", "docs/4", "docs/5"]);
    harness.run_until_idle().await;
    assert_eq!(index.seen_count(), 5);

    // No re-indexing of already-seen documents.
    let keys = index.seen_keys();
    let unique: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
}

#[tokio::test]
async fn test_late_registered_index_catches_up_from_zero() {
    // Index 2 starts from zero while index 1 is already ahead: the
    // executer forms two groups and both converge.
    let early = CollectingIndex::new(1, "early");
    let harness = PipelineHarness::new(vec![early.clone()]).await;

    harness.write_many("Docs", &["docs/1", "docs/2"]);
    harness.run_until_idle().await;
    assert_eq!(early.seen_count(), 2);

    // A second harness sharing the same store simulates a restart
    // with an additional index registered.
    let late = CollectingIndex::new(2, "late");
    let restarted = PipelineHarness::new(vec![early.clone(), late.clone()]).await;
    // Not the same store: write fresh data into the new world.
    restarted.write_many("Docs", &["docs/1", "docs/2", "docs/3"]);
    restarted.run_until_idle().await;

    assert_eq!(late.seen_count(), 3);

    let snapshots = restarted.executer.snapshot();
    assert_eq!(snapshots.len(), 2);
    let last = restarted.last_etag().await;
    for snapshot in snapshots {
        assert_eq!(snapshot.last_indexed_etag, last);
    }
}

#[tokio::test]
async fn test_prefetcher_summary_returns_to_zero_after_drain() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    harness.write_many("Docs", &["a", "b", "c", "d"]);
    let before = harness.prefetcher.summary();
    assert!(before.queued_docs > 0);

    harness.run_until_idle().await;

    let after = harness.prefetcher.summary();
    assert_eq!(after.queued_docs, 0);
    assert_eq!(after.in_flight_bytes, 0);
}

#[tokio::test]
async fn test_query_feedback_does_not_disturb_convergence() {
    // Query notifications feed the group ordering policy; the round
    // still converges for queried and unqueried indexes alike.
    let hot = CollectingIndex::new(1, "hot");
    let cold = CollectingIndex::new(2, "cold");
    let harness = PipelineHarness::new(vec![hot.clone(), cold.clone()]).await;

    harness.write_many("Docs", &["docs/1", "docs/2"]);
    harness.executer.note_query(IndexId(1));
    harness.run_until_idle().await;

    assert_eq!(hot.seen_count(), 2);
    assert_eq!(cold.seen_count(), 2);
}

#[tokio::test]
async fn test_shutdown_is_clean_with_inflight_state() {
    let index = CollectingIndex::new(1, "all-docs");
    let harness = PipelineHarness::new(vec![index.clone()]).await;

    harness.write_many("Docs", &["a", "b"]);
    harness.run_until_idle().await;

    harness.shutdown.cancel();
    harness.prefetcher.shutdown().await;
    assert_eq!(harness.prefetcher.summary().behaviors, 0);
    harness.pool.shutdown();
}
