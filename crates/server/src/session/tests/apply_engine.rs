//! Applying client-originated changes: conflicts, fallback, grouping.

use tabsync_proto::{ChangeOp, FramePayload, Lsn, SyncPhase};

use super::helpers::{client_change, connect, test_env};
use crate::config::SyncConfig;
use crate::order;
use crate::db::DomainTables;
use crate::session::ApplyEngine;

fn lsn(s: &str) -> Lsn {
	s.parse().unwrap()
}

#[tokio::test(flavor = "current_thread")]
async fn stale_client_update_is_skipped_not_error() {
	let env = test_env(SyncConfig::default());
	env.feed.set_server_lsn(lsn("0/F"));
	env.writer.preload("task", "t1", "2024-02-01T00:00:00Z");

	let mut client = connect(&env.deps, "c1", lsn("0/F")).await;
	assert!(matches!(
		client.next_payload().await,
		FramePayload::SrvStateChange { state: SyncPhase::Live, .. }
	));

	// The client's copy is older than the stored row, date-only timestamp
	// included.
	client
		.send(FramePayload::CltSendChanges {
			changes: vec![client_change("task", ChangeOp::Update, "t1", "2023-12-31")],
		})
		.await;

	match client.next_payload().await {
		FramePayload::SrvChangesReceived { change_ids } => {
			assert_eq!(change_ids, vec!["t1".to_string()]);
		}
		other => panic!("expected srv_changes_received, got {other:?}"),
	}
	match client.next_payload().await {
		FramePayload::SrvChangesApplied {
			applied_changes,
			success,
			error,
		} => {
			assert_eq!(applied_changes, vec!["t1".to_string()]);
			assert!(success);
			assert!(error.is_none());
		}
		other => panic!("expected srv_changes_applied, got {other:?}"),
	}
	// Successful apply cycles finish with a noop heartbeat batch.
	match client.next_payload().await {
		FramePayload::SrvSendChanges {
			changes, last_lsn, ..
		} => {
			assert!(changes.is_empty());
			assert_eq!(last_lsn, Lsn::ZERO);
		}
		other => panic!("expected srv_send_changes, got {other:?}"),
	}

	// The stored row kept its newer version.
	assert_eq!(
		env.writer.stored("task", "t1"),
		Some("2024-02-01T00:00:00Z".parse().unwrap())
	);
}

#[tokio::test(flavor = "current_thread")]
async fn upsert_group_splits_applied_and_skipped() {
	let env = test_env(SyncConfig::default());
	env.writer.preload("task", "stale", "2024-02-01T00:00:00Z");
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	let outcome = engine
		.apply(
			vec![
				client_change("task", ChangeOp::Insert, "stale", "2024-01-01T00:00:00Z"),
				client_change("task", ChangeOp::Insert, "fresh", "2024-01-01T00:00:00Z"),
			],
			&tables,
		)
		.await;

	assert!(outcome.success());
	assert_eq!(outcome.applied, vec!["fresh".to_string()]);
	assert_eq!(outcome.skipped, vec!["stale".to_string()]);
	assert_eq!(outcome.processed_ids().len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn batch_failure_falls_back_to_per_row() {
	let env = test_env(SyncConfig::default());
	env.writer.fail_batches_for("task");
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	let outcome = engine
		.apply(
			vec![
				client_change("task", ChangeOp::Insert, "t1", "2024-01-01T00:00:00Z"),
				client_change("task", ChangeOp::Insert, "t2", "2024-01-01T00:00:00Z"),
			],
			&tables,
		)
		.await;

	// One failed batch call, then one call per row.
	assert_eq!(env.writer.batch_sizes(), vec![2, 1, 1]);
	assert!(outcome.success());
	assert_eq!(outcome.applied.len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn groups_run_writes_first_then_deletes_children_first() {
	let env = test_env(SyncConfig::default());
	env.writer.preload("task", "t1", "2024-01-01T00:00:00Z");
	env.writer.preload("project", "p1", "2024-01-01T00:00:00Z");
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	let outcome = engine
		.apply(
			vec![
				client_change("task", ChangeOp::Delete, "t1", "2024-06-01T00:00:00Z"),
				client_change("project", ChangeOp::Delete, "p1", "2024-06-01T00:00:00Z"),
				client_change("user", ChangeOp::Insert, "u2", "2024-06-01T00:00:00Z"),
			],
			&tables,
		)
		.await;

	assert!(outcome.success());
	assert_eq!(
		env.writer.ops(),
		vec![
			"upsert user x1".to_string(),
			"delete task t1".to_string(),
			"delete project p1".to_string(),
		]
	);
}

#[tokio::test(flavor = "current_thread")]
async fn delete_respects_the_version_guard() {
	let env = test_env(SyncConfig::default());
	env.writer.preload("task", "t1", "2024-02-01T00:00:00Z");
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	// Guard older than the stored row: the delete is skipped.
	let outcome = engine
		.apply(
			vec![client_change(
				"task",
				ChangeOp::Delete,
				"t1",
				"2024-01-01T00:00:00Z",
			)],
			&tables,
		)
		.await;
	assert!(outcome.success());
	assert_eq!(outcome.skipped, vec!["t1".to_string()]);
	assert!(env.writer.stored("task", "t1").is_some());

	// Guard at or past the stored row: the delete lands.
	let outcome = engine
		.apply(
			vec![client_change(
				"task",
				ChangeOp::Delete,
				"t1",
				"2024-03-01T00:00:00Z",
			)],
			&tables,
		)
		.await;
	assert_eq!(outcome.applied, vec!["t1".to_string()]);
	assert!(env.writer.stored("task", "t1").is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_table_is_a_non_conflict_error() {
	let env = test_env(SyncConfig::default());
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	let outcome = engine
		.apply(
			vec![
				client_change("sys_secrets", ChangeOp::Insert, "x", "2024-01-01T00:00:00Z"),
				client_change("user", ChangeOp::Insert, "u1", "2024-01-01T00:00:00Z"),
			],
			&tables,
		)
		.await;

	assert!(!outcome.success());
	assert!(outcome.error.unwrap().contains("unknown table"));
	// The valid group still ran.
	assert_eq!(outcome.applied, vec!["u1".to_string()]);
}

#[tokio::test(flavor = "current_thread")]
async fn dedupe_applies_at_most_one_version_per_row() {
	let env = test_env(SyncConfig::default());
	let engine = ApplyEngine::new(env.writer.clone(), SyncConfig::default());
	let tables = env.tables.list_tables().await.unwrap();

	let deduped = order::dedupe_latest(vec![
		client_change("task", ChangeOp::Insert, "t1", "2024-01-01T00:00:00Z"),
		client_change("task", ChangeOp::Insert, "t1", "2024-01-05T00:00:00Z"),
	]);
	let outcome = engine.apply(deduped, &tables).await;

	assert_eq!(outcome.applied, vec!["t1".to_string()]);
	assert_eq!(
		env.writer.stored("task", "t1"),
		Some("2024-01-05T00:00:00Z".parse().unwrap())
	);
	assert_eq!(env.writer.batch_sizes(), vec![1]);
}
