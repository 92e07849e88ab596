//! Deduplication and hierarchy ordering for change batches.
//!
//! Writes must land parents before children and deletes must land children
//! before parents, so batches are reordered by the domain hierarchy level
//! before shipping or applying: non-deletes first (ascending level), then
//! deletes (descending level), stable within each group.

use std::collections::HashMap;

use tabsync_proto::{ChangeOp, TableChange};

use crate::db::TableSpec;

/// Build a `table → hierarchy level` lookup from the domain table list.
#[must_use]
pub fn level_map(tables: &[TableSpec]) -> HashMap<String, i32> {
	tables
		.iter()
		.map(|t| (t.name.clone(), t.level))
		.collect()
}

/// Collapse a batch to at most one change per `(table, id)`, keeping the
/// change with the greatest `updated_at`. Survivors keep the batch position
/// of their first occurrence. Changes without an id are never collapsed.
#[must_use]
pub fn dedupe_latest(changes: Vec<TableChange>) -> Vec<TableChange> {
	let mut kept: Vec<TableChange> = Vec::with_capacity(changes.len());
	let mut index: HashMap<(String, String), usize> = HashMap::new();

	for change in changes {
		let Some(id) = change.id().map(str::to_string) else {
			kept.push(change);
			continue;
		};
		let key = (change.table.clone(), id);
		match index.get(&key) {
			Some(&pos) => {
				if change.effective_updated_at() >= kept[pos].effective_updated_at() {
					kept[pos] = change;
				}
			}
			None => {
				index.insert(key, kept.len());
				kept.push(change);
			}
		}
	}
	kept
}

/// Reorder a batch for shipping or applying.
///
/// Tables missing from `levels` sort at level 0.
pub fn order_changes(changes: &mut [TableChange], levels: &HashMap<String, i32>) {
	let level = |c: &TableChange| levels.get(&c.table).copied().unwrap_or(0);
	changes.sort_by_key(|c| match c.op {
		ChangeOp::Insert | ChangeOp::Update => (0, level(c)),
		// Deletes run children-first, so deeper levels sort earlier.
		ChangeOp::Delete => (1, -level(c)),
	});
}

#[cfg(test)]
mod tests {
	use chrono::{DateTime, Utc};

	use super::*;

	fn change(table: &str, op: ChangeOp, id: &str, updated_at: &str) -> TableChange {
		TableChange {
			table: table.to_string(),
			op,
			data: serde_json::json!({ "id": id })
				.as_object()
				.unwrap()
				.clone(),
			updated_at: Some(updated_at.parse::<DateTime<Utc>>().unwrap()),
			lsn: None,
		}
	}

	fn levels() -> HashMap<String, i32> {
		[
			("user".to_string(), 0),
			("project".to_string(), 1),
			("task".to_string(), 2),
		]
		.into_iter()
		.collect()
	}

	#[test]
	fn dedupe_keeps_greatest_updated_at() {
		let batch = vec![
			change("task", ChangeOp::Update, "t1", "2024-01-02T00:00:00Z"),
			change("task", ChangeOp::Update, "t1", "2024-01-01T00:00:00Z"),
			change("task", ChangeOp::Update, "t2", "2024-01-01T00:00:00Z"),
		];
		let deduped = dedupe_latest(batch);
		assert_eq!(deduped.len(), 2);
		assert_eq!(
			deduped[0].effective_updated_at(),
			"2024-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
		);
	}

	#[test]
	fn later_equal_timestamp_wins() {
		let mut older = change("task", ChangeOp::Update, "t1", "2024-01-01T00:00:00Z");
		older.data.insert("v".to_string(), serde_json::json!(1));
		let mut newer = change("task", ChangeOp::Update, "t1", "2024-01-01T00:00:00Z");
		newer.data.insert("v".to_string(), serde_json::json!(2));

		let deduped = dedupe_latest(vec![older, newer]);
		assert_eq!(deduped.len(), 1);
		assert_eq!(deduped[0].data["v"], 2);
	}

	#[test]
	fn non_deletes_precede_deletes() {
		// Mirrors the mixed-batch case: delete task t1, delete project p1
		// (p1 parent of t1), insert user u2. Expected order: u2, t1, p1.
		let mut batch = vec![
			change("task", ChangeOp::Delete, "t1", "2024-01-01T00:00:00Z"),
			change("project", ChangeOp::Delete, "p1", "2024-01-01T00:00:00Z"),
			change("user", ChangeOp::Insert, "u2", "2024-01-01T00:00:00Z"),
		];
		order_changes(&mut batch, &levels());

		let ids: Vec<_> = batch.iter().map(|c| c.id().unwrap()).collect();
		assert_eq!(ids, vec!["u2", "t1", "p1"]);
	}

	#[test]
	fn non_deletes_order_parents_first() {
		let mut batch = vec![
			change("task", ChangeOp::Insert, "t1", "2024-01-01T00:00:00Z"),
			change("user", ChangeOp::Insert, "u1", "2024-01-01T00:00:00Z"),
			change("project", ChangeOp::Update, "p1", "2024-01-01T00:00:00Z"),
		];
		order_changes(&mut batch, &levels());

		let ids: Vec<_> = batch.iter().map(|c| c.id().unwrap()).collect();
		assert_eq!(ids, vec!["u1", "p1", "t1"]);
	}

	#[test]
	fn ordering_is_stable_within_a_level() {
		let mut batch = vec![
			change("task", ChangeOp::Update, "a", "2024-01-01T00:00:00Z"),
			change("task", ChangeOp::Update, "b", "2024-01-01T00:00:00Z"),
			change("task", ChangeOp::Update, "c", "2024-01-01T00:00:00Z"),
		];
		order_changes(&mut batch, &levels());

		let ids: Vec<_> = batch.iter().map(|c| c.id().unwrap()).collect();
		assert_eq!(ids, vec!["a", "b", "c"]);
	}
}
