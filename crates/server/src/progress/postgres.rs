//! Postgres-backed progress store.
//!
//! One `sync_progress` table holds every client's namespace, keyed by
//! `(namespace, key)`. Plain single-row statements give the read-your-writes
//! guarantee the trait requires.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ProgressFactory, ProgressStore};
use crate::db::Db;
use crate::error::Result;

/// One client's namespace in the `sync_progress` table.
#[derive(Debug, Clone)]
pub struct PgProgressStore {
	db: Db,
	namespace: String,
}

impl PgProgressStore {
	/// Open the namespace for `namespace` (the client id).
	#[must_use]
	pub fn new(db: Db, namespace: impl Into<String>) -> Self {
		Self {
			db,
			namespace: namespace.into(),
		}
	}
}

#[async_trait]
impl ProgressStore for PgProgressStore {
	async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
		let client = self.db.connect().await?;
		client
			.execute(
				"INSERT INTO \"sync_progress\" (\"namespace\", \"key\", \"value\") \
				 VALUES ($1, $2, $3) \
				 ON CONFLICT (\"namespace\", \"key\") \
				 DO UPDATE SET \"value\" = EXCLUDED.\"value\", \"updated_at\" = now()",
				&[&self.namespace, &key, &value],
			)
			.await?;
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
		let client = self.db.connect().await?;
		let row = client
			.query_opt(
				"SELECT \"value\" FROM \"sync_progress\" \
				 WHERE \"namespace\" = $1 AND \"key\" = $2",
				&[&self.namespace, &key],
			)
			.await?;
		Ok(row.map(|r| r.get(0)))
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
		let client = self.db.connect().await?;
		let pattern = format!("{}%", escape_like(prefix));
		let rows = client
			.query(
				"SELECT \"key\", \"value\" FROM \"sync_progress\" \
				 WHERE \"namespace\" = $1 AND \"key\" LIKE $2 \
				 ORDER BY \"key\" ASC",
				&[&self.namespace, &pattern],
			)
			.await?;
		Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
	}
}

/// Escape `%`, `_` and `\` so a prefix matches literally under `LIKE`.
fn escape_like(prefix: &str) -> String {
	let mut out = String::with_capacity(prefix.len());
	for c in prefix.chars() {
		if matches!(c, '%' | '_' | '\\') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

/// Factory handing out [`PgProgressStore`] namespaces.
#[derive(Debug, Clone)]
pub struct PgProgressFactory {
	db: Db,
}

impl PgProgressFactory {
	/// Wrap a connection factory.
	#[must_use]
	pub fn new(db: Db) -> Self {
		Self { db }
	}

	/// Create the `sync_progress` table when it does not exist yet.
	pub async fn ensure_schema(&self) -> Result<()> {
		let client = self.db.connect().await?;
		client
			.batch_execute(
				"CREATE TABLE IF NOT EXISTS \"sync_progress\" (\
				 \"namespace\" text NOT NULL, \
				 \"key\" text NOT NULL, \
				 \"value\" jsonb NOT NULL, \
				 \"updated_at\" timestamptz NOT NULL DEFAULT now(), \
				 PRIMARY KEY (\"namespace\", \"key\"))",
			)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl ProgressFactory for PgProgressFactory {
	async fn open(&self, client_id: &str) -> Result<Arc<dyn ProgressStore>> {
		Ok(Arc::new(PgProgressStore::new(self.db.clone(), client_id)))
	}
}
