//! Apply engine for client-originated changes.
//!
//! Changes are deduplicated per `(table, id)` by greatest `updated_at`,
//! grouped by `(table, op)`, and applied group-by-group: inserts as one
//! multi-row upsert, updates and deletes row-by-row. Conflict resolution is
//! delegated to the database trigger layer; a row the trigger rejects comes
//! back as zero affected rows and is counted as skipped, never as an error.
//! A group-level failure for any other reason falls back to per-row apply so
//! one poisoned row cannot sink its whole group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tabsync_proto::{ChangeOp, TableChange};

use crate::config::SyncConfig;
use crate::db::{ChangeWriter, TableSpec};
use crate::error::{Result, SyncError};
use crate::order;

/// Summary of one apply attempt.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
	/// Row ids the database actually touched.
	pub applied: Vec<String>,
	/// Row ids rejected by the conflict layer.
	pub skipped: Vec<String>,
	/// First non-conflict error message observed, if any.
	pub error: Option<String>,
}

impl ApplyOutcome {
	/// Whether the attempt finished without a non-conflict error.
	#[must_use]
	pub fn success(&self) -> bool {
		self.error.is_none()
	}

	/// All processed ids: applied first, then conflict-skipped.
	#[must_use]
	pub fn processed_ids(&self) -> Vec<String> {
		let mut ids = self.applied.clone();
		ids.extend(self.skipped.iter().cloned());
		ids
	}

	fn record_error(&mut self, message: String) {
		tracing::warn!(error = %message, "apply error");
		if self.error.is_none() {
			self.error = Some(message);
		}
	}
}

/// Applies deduplicated client changes through a [`ChangeWriter`].
pub struct ApplyEngine {
	writer: Arc<dyn ChangeWriter>,
	config: SyncConfig,
}

impl ApplyEngine {
	/// Build an engine over a writer.
	#[must_use]
	pub fn new(writer: Arc<dyn ChangeWriter>, config: SyncConfig) -> Self {
		Self { writer, config }
	}

	/// Apply an already-deduplicated batch.
	///
	/// Groups run non-deletes first in hierarchy order, then deletes in
	/// reverse hierarchy order, so parent rows exist before their children
	/// and children disappear before their parents.
	pub async fn apply(&self, changes: Vec<TableChange>, tables: &[TableSpec]) -> ApplyOutcome {
		let known: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
		let levels = order::level_map(tables);
		let mut outcome = ApplyOutcome::default();

		let mut groups: Vec<((String, ChangeOp), Vec<TableChange>)> = Vec::new();
		let mut index: HashMap<(String, ChangeOp), usize> = HashMap::new();
		for change in changes {
			if change.id().is_none() {
				outcome.record_error(format!(
					"change for table {} is missing an id",
					change.table
				));
				continue;
			}
			let key = (change.table.clone(), change.op);
			match index.get(&key) {
				Some(&pos) => groups[pos].1.push(change),
				None => {
					index.insert(key.clone(), groups.len());
					groups.push((key, vec![change]));
				}
			}
		}

		let level = |table: &str| levels.get(table).copied().unwrap_or(0);
		groups.sort_by_key(|((table, op), _)| match op {
			ChangeOp::Insert | ChangeOp::Update => (0, level(table)),
			ChangeOp::Delete => (1, -level(table)),
		});

		for ((table, op), rows) in groups {
			if !known.contains(table.as_str()) {
				outcome.record_error(format!("unknown table {table}"));
				continue;
			}
			match op {
				ChangeOp::Insert => self.apply_insert_group(&table, rows, &mut outcome).await,
				ChangeOp::Update => {
					for row in rows {
						self.apply_update_row(&table, row, &mut outcome).await;
					}
				}
				ChangeOp::Delete => {
					for row in rows {
						self.apply_delete_row(&table, &row, &mut outcome).await;
					}
				}
			}
		}
		outcome
	}

	async fn apply_insert_group(
		&self,
		table: &str,
		rows: Vec<TableChange>,
		outcome: &mut ApplyOutcome,
	) {
		match self.writer.upsert_rows(table, &rows).await {
			Ok(returned) => settle_upserted(&rows, &returned, outcome),
			Err(e) => {
				tracing::warn!(
					table = %table,
					error = %e,
					"batch upsert failed, falling back to per-row apply"
				);
				for row in rows {
					let applied = self
						.with_row_timeout(self.writer.upsert_rows(table, std::slice::from_ref(&row)))
						.await;
					match applied {
						Ok(returned) => settle_upserted(std::slice::from_ref(&row), &returned, outcome),
						Err(e) => outcome.record_error(e.to_string()),
					}
				}
			}
		}
	}

	async fn apply_update_row(&self, table: &str, row: TableChange, outcome: &mut ApplyOutcome) {
		let id = row.id().unwrap_or_default().to_string();
		match self
			.with_row_timeout(self.writer.update_row(table, &row))
			.await
		{
			Ok(Some(id)) => outcome.applied.push(id),
			Ok(None) => outcome.skipped.push(id),
			Err(e) => outcome.record_error(e.to_string()),
		}
	}

	async fn apply_delete_row(&self, table: &str, row: &TableChange, outcome: &mut ApplyOutcome) {
		let id = row.id().unwrap_or_default().to_string();
		match self
			.with_row_timeout(
				self.writer
					.delete_row(table, &id, row.effective_updated_at()),
			)
			.await
		{
			Ok(Some(id)) => outcome.applied.push(id),
			Ok(None) => outcome.skipped.push(id),
			Err(e) => outcome.record_error(e.to_string()),
		}
	}

	async fn with_row_timeout<T>(
		&self,
		op: impl std::future::Future<Output = Result<T>>,
	) -> Result<T> {
		match tokio::time::timeout(self.config.row_timeout, op).await {
			Ok(result) => result,
			Err(_) => Err(SyncError::OpTimeout(self.config.row_timeout)),
		}
	}
}

/// Classify an upserted group: rows present in `returned` were applied, the
/// rest were rejected by the conflict layer.
fn settle_upserted(rows: &[TableChange], returned: &[String], outcome: &mut ApplyOutcome) {
	let returned: HashSet<&str> = returned.iter().map(String::as_str).collect();
	for row in rows {
		let id = row.id().unwrap_or_default();
		if returned.contains(id) {
			outcome.applied.push(id.to_string());
		} else {
			outcome.skipped.push(id.to_string());
		}
	}
}
