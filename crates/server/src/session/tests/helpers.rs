//! Common test utilities: scripted collaborators and a frame-level client.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tabsync_proto::{Frame, FramePayload, Lsn, TableChange};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::db::{
	ChangeFeed, ChangeWriter, DomainTables, FeedPage, TablePage, TableSpec,
};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::progress::MemoryProgressFactory;
use crate::registry::ClientRegistry;
use crate::session::{FrameSink, Quarantine, SessionDeps, SessionHandle, SessionService};

/// Change feed fed from a scripted list of changes.
#[derive(Default)]
pub(crate) struct ScriptedFeed {
	items: Mutex<Vec<TableChange>>,
	server_lsn: Mutex<Lsn>,
	poisoned: Mutex<bool>,
}

impl ScriptedFeed {
	pub fn set_server_lsn(&self, lsn: Lsn) {
		*self.server_lsn.lock().unwrap() = lsn;
	}

	pub fn push(&self, change: TableChange) {
		self.items.lock().unwrap().push(change);
	}

	/// Make the next `current_server_lsn` call fail with an invariant
	/// violation.
	pub fn poison_server_lsn(&self) {
		*self.poisoned.lock().unwrap() = true;
	}
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
	async fn changes_since(&self, since: Lsn, limit: usize) -> Result<FeedPage> {
		let mut matching: Vec<TableChange> = self
			.items
			.lock()
			.unwrap()
			.iter()
			.filter(|c| c.lsn.is_some_and(|lsn| lsn > since))
			.cloned()
			.collect();
		matching.sort_by_key(|c| c.lsn);
		let has_more = matching.len() > limit;
		matching.truncate(limit);
		Ok(FeedPage {
			items: matching,
			has_more,
		})
	}

	async fn current_server_lsn(&self) -> Result<Lsn> {
		if std::mem::take(&mut *self.poisoned.lock().unwrap()) {
			return Err(SyncError::FatalInternal(
				"injected invariant violation".to_string(),
			));
		}
		Ok(*self.server_lsn.lock().unwrap())
	}
}

/// Domain tables with scripted rows, paged by id like the real adapter.
pub(crate) struct ScriptedTables {
	tables: Vec<TableSpec>,
	rows: Mutex<HashMap<String, BTreeMap<String, serde_json::Map<String, serde_json::Value>>>>,
}

impl ScriptedTables {
	/// The standard three-table hierarchy: user < project < task.
	pub fn standard() -> Self {
		Self {
			tables: vec![
				spec("user", 0),
				spec("project", 1),
				spec("task", 2),
			],
			rows: Mutex::new(HashMap::new()),
		}
	}

	pub fn insert_row(&self, table: &str, id: &str, updated_at: &str) {
		let row = serde_json::json!({ "id": id, "updated_at": updated_at })
			.as_object()
			.unwrap()
			.clone();
		self.rows
			.lock()
			.unwrap()
			.entry(table.to_string())
			.or_default()
			.insert(id.to_string(), row);
	}
}

fn spec(name: &str, level: i32) -> TableSpec {
	TableSpec {
		name: name.to_string(),
		level,
		ordered_pk: true,
	}
}

#[async_trait]
impl DomainTables for ScriptedTables {
	async fn list_tables(&self) -> Result<Vec<TableSpec>> {
		Ok(self.tables.clone())
	}

	async fn page(&self, table: &str, after_id: Option<&str>, limit: usize) -> Result<TablePage> {
		let rows = self.rows.lock().unwrap();
		let Some(table_rows) = rows.get(table) else {
			return Ok(TablePage {
				rows: Vec::new(),
				next_after_id: None,
				has_more: false,
			});
		};

		let remaining: Vec<_> = table_rows
			.iter()
			.filter(|(id, _)| after_id.is_none_or(|after| id.as_str() > after))
			.collect();
		let has_more = remaining.len() > limit;
		let page: Vec<_> = remaining.into_iter().take(limit).collect();
		let next_after_id = page.last().map(|(id, _)| (*id).clone());
		Ok(TablePage {
			rows: page.into_iter().map(|(_, row)| row.clone()).collect(),
			next_after_id,
			has_more,
		})
	}
}

/// Change writer with trigger-equivalent last-writer-wins semantics.
///
/// Rows apply only when the incoming version is strictly newer than the
/// stored one; deletes apply only when the stored version is not newer than
/// the incoming guard. Group upserts for tables in `fail_batches` error, to
/// exercise the per-row fallback.
#[derive(Default)]
pub(crate) struct RecordingWriter {
	state: Mutex<HashMap<(String, String), DateTime<Utc>>>,
	fail_batches: Mutex<HashSet<String>>,
	batch_calls: Mutex<Vec<usize>>,
	ops: Mutex<Vec<String>>,
}

impl RecordingWriter {
	pub fn preload(&self, table: &str, id: &str, updated_at: &str) {
		self.state.lock().unwrap().insert(
			(table.to_string(), id.to_string()),
			updated_at.parse().unwrap(),
		);
	}

	pub fn stored(&self, table: &str, id: &str) -> Option<DateTime<Utc>> {
		self.state
			.lock()
			.unwrap()
			.get(&(table.to_string(), id.to_string()))
			.copied()
	}

	pub fn fail_batches_for(&self, table: &str) {
		self.fail_batches.lock().unwrap().insert(table.to_string());
	}

	/// Sizes of the upsert batches seen, in call order.
	pub fn batch_sizes(&self) -> Vec<usize> {
		self.batch_calls.lock().unwrap().clone()
	}

	/// Every write call in arrival order, e.g. `"upsert user x1"`.
	pub fn ops(&self) -> Vec<String> {
		self.ops.lock().unwrap().clone()
	}

	fn try_upsert(&self, table: &str, row: &TableChange) -> Option<String> {
		let id = row.id()?.to_string();
		let incoming = row.effective_updated_at();
		let mut state = self.state.lock().unwrap();
		let key = (table.to_string(), id.clone());
		match state.get(&key) {
			Some(stored) if incoming <= *stored => None,
			_ => {
				state.insert(key, incoming);
				Some(id)
			}
		}
	}
}

#[async_trait]
impl ChangeWriter for RecordingWriter {
	async fn upsert_rows(&self, table: &str, rows: &[TableChange]) -> Result<Vec<String>> {
		self.batch_calls.lock().unwrap().push(rows.len());
		self.ops
			.lock()
			.unwrap()
			.push(format!("upsert {table} x{}", rows.len()));
		if rows.len() > 1 && self.fail_batches.lock().unwrap().contains(table) {
			return Err(SyncError::Progress("injected batch failure".to_string()));
		}
		Ok(rows
			.iter()
			.filter_map(|row| self.try_upsert(table, row))
			.collect())
	}

	async fn update_row(&self, table: &str, row: &TableChange) -> Result<Option<String>> {
		let Some(id) = row.id().map(str::to_string) else {
			return Ok(None);
		};
		self.ops.lock().unwrap().push(format!("update {table} {id}"));
		// An UPDATE of a missing row affects zero rows.
		let key = (table.to_string(), id.clone());
		let mut state = self.state.lock().unwrap();
		match state.get(&key) {
			None => Ok(None),
			Some(stored) if row.effective_updated_at() <= *stored => Ok(None),
			Some(_) => {
				state.insert(key, row.effective_updated_at());
				Ok(Some(id))
			}
		}
	}

	async fn delete_row(
		&self,
		table: &str,
		id: &str,
		updated_at: DateTime<Utc>,
	) -> Result<Option<String>> {
		self.ops.lock().unwrap().push(format!("delete {table} {id}"));
		let key = (table.to_string(), id.to_string());
		let mut state = self.state.lock().unwrap();
		match state.get(&key) {
			Some(stored) if *stored <= updated_at => {
				state.remove(&key);
				Ok(Some(id.to_string()))
			}
			_ => Ok(None),
		}
	}
}

/// Scripted collaborators plus the deps bundle wired over them.
pub(crate) struct TestEnv {
	pub feed: Arc<ScriptedFeed>,
	pub tables: Arc<ScriptedTables>,
	pub writer: Arc<RecordingWriter>,
	pub progress: Arc<MemoryProgressFactory>,
	pub deps: SessionDeps,
}

pub(crate) fn test_env(config: SyncConfig) -> TestEnv {
	let feed = Arc::new(ScriptedFeed::default());
	let tables = Arc::new(ScriptedTables::standard());
	let writer = Arc::new(RecordingWriter::default());
	let progress = Arc::new(MemoryProgressFactory::default());
	let deps = SessionDeps {
		feed: feed.clone(),
		tables: tables.clone(),
		writer: writer.clone(),
		progress: progress.clone(),
		registry: Arc::new(ClientRegistry::default()),
		quarantine: Arc::new(Quarantine::default()),
		metrics: Arc::new(Metrics::default()),
		config,
	};
	TestEnv {
		feed,
		tables,
		writer,
		progress,
		deps,
	}
}

pub(crate) fn test_deps() -> SessionDeps {
	test_env(SyncConfig::default()).deps
}

/// A frame-level test client attached to a session actor.
pub(crate) struct TestClient {
	pub client_id: String,
	pub handle: SessionHandle,
	pub rx: mpsc::UnboundedReceiver<Frame>,
	#[allow(dead_code)]
	pub closer: CancellationToken,
}

impl TestClient {
	/// Receive the next outbound frame, panicking after two seconds.
	pub async fn next_payload(&mut self) -> FramePayload {
		let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
			.await
			.expect("timed out waiting for a frame")
			.expect("transport closed");
		frame.payload
	}

	/// Send a client frame into the actor.
	pub async fn send(&self, payload: FramePayload) {
		self.handle
			.frame(Frame::new(&self.client_id, payload))
			.await;
	}
}

/// Spawn a session actor and attach a test transport.
pub(crate) async fn connect(deps: &SessionDeps, client_id: &str, lsn: Lsn) -> TestClient {
	let handle = SessionService::start(client_id, deps.clone());
	attach(&handle, deps, client_id, lsn).await
}

/// Attach a fresh test transport to an existing actor (reconnect).
pub(crate) async fn attach(
	handle: &SessionHandle,
	deps: &SessionDeps,
	client_id: &str,
	lsn: Lsn,
) -> TestClient {
	let (tx, rx) = mpsc::unbounded_channel();
	let closer = CancellationToken::new();
	let sink = FrameSink::new(client_id, tx, closer.clone(), deps.metrics.clone());
	handle.accept(sink, lsn).await;
	TestClient {
		client_id: client_id.to_string(),
		handle: handle.clone(),
		rx,
		closer,
	}
}

/// Build a feed change carrying an LSN.
pub(crate) fn feed_change(
	table: &str,
	op: tabsync_proto::ChangeOp,
	id: &str,
	updated_at: &str,
	lsn: &str,
) -> TableChange {
	TableChange {
		table: table.to_string(),
		op,
		data: serde_json::json!({ "id": id, "updated_at": updated_at })
			.as_object()
			.unwrap()
			.clone(),
		updated_at: Some(updated_at.parse().unwrap()),
		lsn: Some(lsn.parse().unwrap()),
	}
}

/// Build a client-originated change without an LSN.
pub(crate) fn client_change(
	table: &str,
	op: tabsync_proto::ChangeOp,
	id: &str,
	updated_at: &str,
) -> TableChange {
	TableChange {
		table: table.to_string(),
		op,
		data: serde_json::json!({ "id": id, "updated_at": updated_at })
			.as_object()
			.unwrap()
			.clone(),
		updated_at: None,
		lsn: None,
	}
}
