//! Durable per-client sync progress.
//!
//! The progress store is the only state that survives eviction, crash, or
//! transport loss, and therefore the only state the session may trust. It is
//! a key-value namespace scoped to one client with read-your-writes puts.
//! The resident [`crate::session`] state is a disposable cache over it.
//!
//! Key layout (kept verbatim for operator tooling):
//!
//! | Key | Value |
//! |---|---|
//! | `current_client_id` | The owning client id; restores identity after eviction. |
//! | `client:<id>:lsn` | Last acknowledged LSN. |
//! | `client:<id>:syncState` | Current sync phase. |
//! | `initial_sync_state` | The [`InitialSyncProgress`] record. |
//! | `lastWakeTime` | Diagnostic: last client wake in epoch millis. |

pub mod keys;
mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabsync_proto::{Lsn, SyncPhase};

pub use memory::{MemoryProgress, MemoryProgressFactory};
pub use postgres::{PgProgressFactory, PgProgressStore};

use crate::error::{Result, SyncError};

/// A durable key-value namespace scoped to one client.
#[async_trait]
pub trait ProgressStore: Send + Sync {
	/// Store a value. Must be read-your-writes: a `get` issued after `put`
	/// returns observes the written value.
	async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

	/// Fetch a value.
	async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

	/// All entries whose key starts with `prefix`, sorted by key.
	async fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Opens the per-client progress namespace.
#[async_trait]
pub trait ProgressFactory: Send + Sync {
	/// Open (or re-open) the namespace for `client_id`.
	async fn open(&self, client_id: &str) -> Result<Arc<dyn ProgressStore>>;
}

/// Status of an initial sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialSyncStatus {
	/// Chunks are still being shipped or acknowledged.
	InProgress,
	/// The terminal ack was received; the record is retained for audit.
	Complete,
}

/// Durable cursor for an in-flight initial sync.
///
/// Persisted after every chunk ack so that a reconnect resumes at the next
/// chunk without reshipping acknowledged data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncProgress {
	/// Table currently being shipped, if any.
	pub current_table: Option<String>,
	/// Last chunk number acknowledged for `current_table`.
	pub last_acked_chunk: u32,
	/// Primary key of the last row in the last acknowledged chunk.
	pub cursor: Option<String>,
	/// Tables fully shipped and acknowledged, in ship order.
	pub completed_tables: Vec<String>,
	/// Server LSN captured before the first chunk.
	pub start_lsn: Lsn,
	/// Epoch millis when the run began.
	pub started_at_millis: i64,
	/// Whether the run is still in flight.
	pub status: InitialSyncStatus,
}

impl InitialSyncProgress {
	/// A fresh record for a run starting at `start_lsn`.
	#[must_use]
	pub fn begin(start_lsn: Lsn, started_at_millis: i64) -> Self {
		Self {
			current_table: None,
			last_acked_chunk: 0,
			cursor: None,
			completed_tables: Vec::new(),
			start_lsn,
			started_at_millis,
			status: InitialSyncStatus::InProgress,
		}
	}
}

/// Typed accessor over a client's [`ProgressStore`] namespace.
#[derive(Clone)]
pub struct SessionProgress {
	store: Arc<dyn ProgressStore>,
	client_id: String,
}

impl SessionProgress {
	/// Wrap a store for `client_id`.
	pub fn new(store: Arc<dyn ProgressStore>, client_id: impl Into<String>) -> Self {
		Self {
			store,
			client_id: client_id.into(),
		}
	}

	/// The client this namespace belongs to.
	#[must_use]
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// The last acknowledged LSN; `0/0` when nothing is stored.
	pub async fn client_lsn(&self) -> Result<Lsn> {
		let key = keys::client_lsn(&self.client_id);
		match self.store.get(&key).await? {
			None => Ok(Lsn::ZERO),
			Some(value) => decode(&key, value),
		}
	}

	/// Persist an acknowledged LSN, verifying the write by reading it back.
	///
	/// A value lower than the stored one is not written: acknowledged
	/// positions never regress.
	pub async fn set_client_lsn(&self, lsn: Lsn) -> Result<()> {
		let current = self.client_lsn().await?;
		if lsn < current {
			tracing::warn!(
				client_id = %self.client_id,
				stored = %current,
				offered = %lsn,
				"refusing LSN regression"
			);
			return Ok(());
		}

		let key = keys::client_lsn(&self.client_id);
		self.store
			.put(&key, serde_json::to_value(lsn).map_err(store_err)?)
			.await?;

		let stored: Lsn = match self.store.get(&key).await? {
			Some(value) => decode(&key, value)?,
			None => Lsn::ZERO,
		};
		if stored != lsn {
			return Err(SyncError::Progress(format!(
				"LSN read-back mismatch: wrote {lsn}, read {stored}"
			)));
		}
		Ok(())
	}

	/// Overwrite the stored LSN with the client-reported position.
	///
	/// Used at connect time, where the client's own durable position is
	/// authoritative even when it sits behind the stored value; the resend
	/// this causes is bounded and idempotent.
	pub async fn reset_client_lsn(&self, lsn: Lsn) -> Result<()> {
		let current = self.client_lsn().await?;
		if lsn < current {
			tracing::warn!(
				client_id = %self.client_id,
				stored = %current,
				reported = %lsn,
				"client reconnected behind stored position"
			);
		}
		self.store
			.put(
				&keys::client_lsn(&self.client_id),
				serde_json::to_value(lsn).map_err(store_err)?,
			)
			.await
	}

	/// The stored sync phase, if any.
	pub async fn sync_phase(&self) -> Result<Option<SyncPhase>> {
		let key = keys::client_sync_state(&self.client_id);
		match self.store.get(&key).await? {
			None => Ok(None),
			Some(value) => decode(&key, value).map(Some),
		}
	}

	/// Persist the sync phase.
	pub async fn set_sync_phase(&self, phase: SyncPhase) -> Result<()> {
		self.store
			.put(
				&keys::client_sync_state(&self.client_id),
				serde_json::to_value(phase).map_err(store_err)?,
			)
			.await
	}

	/// The stored initial-sync cursor, if any.
	pub async fn initial_progress(&self) -> Result<Option<InitialSyncProgress>> {
		match self.store.get(keys::INITIAL_SYNC_STATE).await? {
			None => Ok(None),
			Some(value) => decode(keys::INITIAL_SYNC_STATE, value).map(Some),
		}
	}

	/// Persist the initial-sync cursor.
	pub async fn set_initial_progress(&self, progress: &InitialSyncProgress) -> Result<()> {
		self.store
			.put(
				keys::INITIAL_SYNC_STATE,
				serde_json::to_value(progress).map_err(store_err)?,
			)
			.await
	}

	/// Persist the owning client id so eviction can restore identity.
	pub async fn set_current_client_id(&self) -> Result<()> {
		self.store
			.put(
				keys::CURRENT_CLIENT_ID,
				serde_json::Value::String(self.client_id.clone()),
			)
			.await
	}

	/// The stored owning client id, if any.
	pub async fn current_client_id(&self) -> Result<Option<String>> {
		Ok(self
			.store
			.get(keys::CURRENT_CLIENT_ID)
			.await?
			.and_then(|v| v.as_str().map(str::to_string)))
	}

	/// Record a client wake for diagnostics.
	pub async fn record_wake(&self, millis: i64) -> Result<()> {
		self.store
			.put(keys::LAST_WAKE_TIME, serde_json::json!(millis))
			.await
	}
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T> {
	serde_json::from_value(value)
		.map_err(|e| SyncError::Progress(format!("undecodable value at `{key}`: {e}")))
}

fn store_err(e: serde_json::Error) -> SyncError {
	SyncError::Progress(e.to_string())
}
