//! Database-facing interfaces of the sync engine.
//!
//! The session core never talks to Postgres directly; it goes through three
//! narrow traits so the drivers can be exercised against in-memory fakes:
//!
//! - [`ChangeFeed`] — ordered committed changes past an LSN, plus the
//!   current server position. Populated externally (logical decoding or a
//!   `change_history` table).
//! - [`DomainTables`] — the replicated tables in hierarchy order, and
//!   primary-key-ordered pagination over their rows.
//! - [`ChangeWriter`] — bulk and per-row apply of client-originated changes
//!   with last-writer-wins semantics delegated to the database trigger layer.
//!
//! The production implementations live in the `postgres` submodule and are
//! re-exported here.

mod postgres;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tabsync_proto::{Lsn, TableChange};

pub use postgres::{Db, PgChangeFeed, PgChangeWriter, PgDomainTables};

use crate::error::Result;

/// One replicated domain table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
	/// Table name.
	pub name: String,
	/// Hierarchy level; parents carry lower values than children.
	pub level: i32,
	/// Whether the primary key gives a stable pagination order.
	///
	/// Tables without one cannot be snapshot and the initial sync driver
	/// refuses to operate on them.
	pub ordered_pk: bool,
}

/// A page of snapshot rows from one domain table.
#[derive(Debug, Clone)]
pub struct TablePage {
	/// Full rows in primary-key order.
	pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
	/// Cursor for the next page; `None` when the table is exhausted.
	pub next_after_id: Option<String>,
	/// Whether more rows exist past this page.
	pub has_more: bool,
}

/// A batch of feed items past a position.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
	/// Changes in ascending LSN order, each carrying its LSN.
	pub items: Vec<TableChange>,
	/// Whether more changes exist past this batch.
	pub has_more: bool,
}

/// Ordered committed changes, strictly greater than a given LSN.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
	/// Fetch up to `limit` changes with `lsn > since`, ascending.
	async fn changes_since(&self, since: Lsn, limit: usize) -> Result<FeedPage>;

	/// The server's current log position.
	async fn current_server_lsn(&self) -> Result<Lsn>;
}

/// The replicated domain tables and their rows.
#[async_trait]
pub trait DomainTables: Send + Sync {
	/// All domain tables, ascending by hierarchy level.
	async fn list_tables(&self) -> Result<Vec<TableSpec>>;

	/// One page of rows ordered by primary key, starting after `after_id`.
	async fn page(&self, table: &str, after_id: Option<&str>, limit: usize) -> Result<TablePage>;
}

/// Applies client-originated changes.
///
/// Every method returns the ids of rows the database actually touched; a row
/// the trigger layer rejected as stale is simply absent from the result.
#[async_trait]
pub trait ChangeWriter: Send + Sync {
	/// Multi-row upsert. Returns the ids of rows inserted or updated.
	async fn upsert_rows(&self, table: &str, rows: &[TableChange]) -> Result<Vec<String>>;

	/// Single-row update. Returns the id when the row was updated.
	async fn update_row(&self, table: &str, row: &TableChange) -> Result<Option<String>>;

	/// Single-row guarded delete. Returns the id when the row was deleted.
	async fn delete_row(
		&self,
		table: &str,
		id: &str,
		updated_at: DateTime<Utc>,
	) -> Result<Option<String>>;
}
