//! Postgres implementations of the database interfaces.
//!
//! Connections are acquired per operation and dropped on completion,
//! including error paths; nothing here pools. Each connection's background
//! task is spawned onto the runtime and logs on failure.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tabsync_proto::{ChangeOp, Lsn, TableChange};
use tokio_postgres::{Client, NoTls};

use super::{ChangeFeed, ChangeWriter, DomainTables, FeedPage, TablePage, TableSpec, sql};
use crate::error::{Result, SyncError};

/// Connection factory for a single Postgres database.
#[derive(Debug, Clone)]
pub struct Db {
	config: tokio_postgres::Config,
}

impl Db {
	/// Build a factory from a connection string.
	pub fn from_url(url: &str) -> Result<Self> {
		let config: tokio_postgres::Config = url
			.parse()
			.map_err(|e| SyncError::InvalidArgument(format!("bad database url: {e}")))?;
		Ok(Self { config })
	}

	/// Open one connection; the caller drops it to release it.
	pub async fn connect(&self) -> Result<Client> {
		let (client, connection) = self.config.connect(NoTls).await?;
		tokio::spawn(async move {
			if let Err(e) = connection.await {
				tracing::warn!(error = %e, "postgres connection task ended with error");
			}
		});
		Ok(client)
	}

	/// Open one connection with a session-level statement timeout.
	pub async fn connect_with_statement_timeout(
		&self,
		timeout: std::time::Duration,
	) -> Result<Client> {
		let client = self.connect().await?;
		client
			.batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
			.await?;
		Ok(client)
	}
}

/// Change feed backed by a `change_history` table with a `pg_lsn` column.
#[derive(Debug, Clone)]
pub struct PgChangeFeed {
	db: Db,
}

impl PgChangeFeed {
	/// Wrap a connection factory.
	#[must_use]
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
	async fn changes_since(&self, since: Lsn, limit: usize) -> Result<FeedPage> {
		let client = self.db.connect().await?;
		let rows = client
			.query(
				"SELECT ch.\"table_name\", ch.\"op\", ch.\"data\", ch.\"updated_at\", \
				 ch.\"lsn\"::text \
				 FROM \"change_history\" AS ch \
				 WHERE ch.\"lsn\" > $1::pg_lsn \
				 ORDER BY ch.\"lsn\" ASC \
				 LIMIT $2",
				&[&since.to_string(), &((limit + 1) as i64)],
			)
			.await?;

		let mut items = Vec::with_capacity(rows.len().min(limit));
		for row in &rows {
			let table: String = row.get(0);
			let op: String = row.get(1);
			let Ok(op) = op.parse::<ChangeOp>() else {
				tracing::warn!(table = %table, op = %op, "skipping feed row with unknown op");
				continue;
			};
			let data: serde_json::Value = row.get(2);
			let Some(data) = data.as_object().cloned() else {
				tracing::warn!(table = %table, "skipping feed row with non-object data");
				continue;
			};
			let updated_at: DateTime<Utc> = row.get(3);
			let lsn: String = row.get(4);
			let lsn = lsn
				.parse::<Lsn>()
				.map_err(|e| SyncError::InvalidArgument(e.to_string()))?;
			items.push(TableChange {
				table,
				op,
				data,
				updated_at: Some(updated_at),
				lsn: Some(lsn),
			});
		}

		let has_more = items.len() > limit;
		items.truncate(limit);
		Ok(FeedPage { items, has_more })
	}

	async fn current_server_lsn(&self) -> Result<Lsn> {
		let client = self.db.connect().await?;
		let row = client
			.query_one("SELECT pg_current_wal_lsn()::text", &[])
			.await?;
		let lsn: String = row.get(0);
		lsn.parse()
			.map_err(|e: tabsync_proto::LsnParseError| SyncError::InvalidArgument(e.to_string()))
	}
}

/// Domain table registry and pagination backed by a `sync_tables` table.
#[derive(Debug, Clone)]
pub struct PgDomainTables {
	db: Db,
}

impl PgDomainTables {
	/// Wrap a connection factory.
	#[must_use]
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}

#[async_trait]
impl DomainTables for PgDomainTables {
	async fn list_tables(&self) -> Result<Vec<TableSpec>> {
		let client = self.db.connect().await?;
		let rows = client
			.query(
				"SELECT \"table_name\", \"level\", \"ordered_pk\" \
				 FROM \"sync_tables\" \
				 ORDER BY \"level\" ASC, \"table_name\" ASC",
				&[],
			)
			.await?;
		Ok(rows
			.iter()
			.map(|row| TableSpec {
				name: row.get(0),
				level: row.get(1),
				ordered_pk: row.get(2),
			})
			.collect())
	}

	async fn page(&self, table: &str, after_id: Option<&str>, limit: usize) -> Result<TablePage> {
		let client = self.db.connect().await?;
		let statement = sql::page_sql(table, after_id.is_some());
		let fetch = (limit + 1) as i64;
		let rows = match after_id {
			Some(after) => client.query(&statement, &[&after, &fetch]).await?,
			None => client.query(&statement, &[&fetch]).await?,
		};

		let mut page_rows = Vec::with_capacity(rows.len().min(limit));
		let mut last_id = None;
		for row in rows.iter().take(limit) {
			let data: serde_json::Value = row.get(0);
			let Some(data) = data.as_object().cloned() else {
				return Err(SyncError::FatalInternal(format!(
					"to_jsonb produced a non-object row for table {table}"
				)));
			};
			last_id = Some(row.get::<_, String>(1));
			page_rows.push(data);
		}

		Ok(TablePage {
			rows: page_rows,
			next_after_id: last_id,
			has_more: rows.len() > limit,
		})
	}
}

/// Applies client-originated changes with trigger-delegated conflict checks.
#[derive(Debug, Clone)]
pub struct PgChangeWriter {
	db: Db,
	statement_timeout: std::time::Duration,
}

impl PgChangeWriter {
	/// Wrap a connection factory.
	#[must_use]
	pub fn new(db: Db, statement_timeout: std::time::Duration) -> Self {
		Self {
			db,
			statement_timeout,
		}
	}

	async fn client(&self) -> Result<Client> {
		self.db
			.connect_with_statement_timeout(self.statement_timeout)
			.await
	}
}

/// Sorted union of the data columns across a group of rows.
fn column_union(rows: &[TableChange]) -> Vec<String> {
	let mut columns = BTreeSet::new();
	for row in rows {
		for key in row.data.keys() {
			columns.insert(key.clone());
		}
	}
	columns.into_iter().collect()
}

#[async_trait]
impl ChangeWriter for PgChangeWriter {
	async fn upsert_rows(&self, table: &str, rows: &[TableChange]) -> Result<Vec<String>> {
		if rows.is_empty() {
			return Ok(Vec::new());
		}
		let columns = column_union(rows);
		let payload = serde_json::Value::Array(
			rows.iter()
				.map(|r| serde_json::Value::Object(r.data.clone()))
				.collect(),
		);

		let client = self.client().await?;
		let returned = client
			.query(&sql::upsert_sql(table, &columns), &[&payload])
			.await?;
		Ok(returned.iter().map(|row| row.get(0)).collect())
	}

	async fn update_row(&self, table: &str, row: &TableChange) -> Result<Option<String>> {
		let columns: Vec<String> = row.data.keys().cloned().collect();
		if columns.iter().all(|c| c == "id") {
			// Nothing but the key: no columns to assign.
			return Ok(None);
		}
		let payload = serde_json::Value::Object(row.data.clone());

		let client = self.client().await?;
		let returned = client
			.query(&sql::update_sql(table, &columns), &[&payload])
			.await?;
		Ok(returned.first().map(|r| r.get(0)))
	}

	async fn delete_row(
		&self,
		table: &str,
		id: &str,
		updated_at: DateTime<Utc>,
	) -> Result<Option<String>> {
		let client = self.client().await?;
		let returned = client
			.query(&sql::delete_sql(table), &[&id, &updated_at])
			.await?;
		Ok(returned.first().map(|r| r.get(0)))
	}
}
