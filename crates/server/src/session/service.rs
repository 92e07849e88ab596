//! The session actor.

use std::sync::Arc;

use chrono::Utc;
use tabsync_proto::{Frame, FrameKind, FramePayload, Lsn, SyncPhase, TableChange};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::commands::SessionCmd;
use super::handle::SessionHandle;
use super::{FrameSink, Quarantine, WorkflowCtx, apply::ApplyEngine, feeder, initial, strategy};
use crate::config::SyncConfig;
use crate::correlator::Correlator;
use crate::db::{ChangeFeed, ChangeWriter, DomainTables};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::order;
use crate::progress::{InitialSyncStatus, ProgressFactory, SessionProgress};
use crate::registry::ClientRegistry;

/// Shared collaborators handed to every session actor.
#[derive(Clone)]
pub struct SessionDeps {
	/// Ordered committed changes.
	pub feed: Arc<dyn ChangeFeed>,
	/// Domain tables and snapshot pagination.
	pub tables: Arc<dyn DomainTables>,
	/// Apply target for client-originated changes.
	pub writer: Arc<dyn ChangeWriter>,
	/// Durable per-client progress namespaces.
	pub progress: Arc<dyn ProgressFactory>,
	/// Advisory client registry.
	pub registry: Arc<ClientRegistry>,
	/// Clients refused until the process restarts.
	pub quarantine: Arc<Quarantine>,
	/// Process-wide counters.
	pub metrics: Arc<Metrics>,
	/// Engine tunables.
	pub config: SyncConfig,
}

/// Actor owning one client's sync session.
///
/// Processes one command at a time; the sync workflow runs as a spawned task
/// so the transport handshake returns immediately, and blocks on
/// acknowledgement frames through the correlator this actor feeds.
pub struct SessionService {
	client_id: String,
	rx: mpsc::Receiver<SessionCmd>,
	tx: mpsc::Sender<SessionCmd>,
	deps: SessionDeps,
	correlator: Arc<Correlator>,
	sink: Option<FrameSink>,
	notify: Arc<Notify>,
	apply: ApplyEngine,
	progress: Option<SessionProgress>,
	workflow_cancel: CancellationToken,
	quarantined: bool,
}

impl SessionService {
	/// Spawn the actor for `client_id`.
	pub fn start(client_id: impl Into<String>, deps: SessionDeps) -> SessionHandle {
		let client_id = client_id.into();
		let (tx, rx) = mpsc::channel(64);
		let service = Self {
			correlator: Arc::new(Correlator::new(deps.config.queue_capacity)),
			apply: ApplyEngine::new(deps.writer.clone(), deps.config.clone()),
			client_id,
			rx,
			tx: tx.clone(),
			deps,
			sink: None,
			notify: Arc::new(Notify::new()),
			progress: None,
			workflow_cancel: CancellationToken::new(),
			quarantined: false,
		};
		tokio::spawn(service.run());
		SessionHandle::new(tx)
	}

	async fn run(mut self) {
		// Restore durable identity before handling any frame; the runtime
		// may have reinstantiated this actor after eviction.
		match self.deps.progress.open(&self.client_id).await {
			Ok(store) => {
				let progress = SessionProgress::new(store, &self.client_id);
				if let Err(e) = progress.set_current_client_id().await {
					tracing::warn!(client_id = %self.client_id, error = %e, "failed to persist client identity");
				}
				self.progress = Some(progress);
			}
			Err(e) => {
				tracing::error!(client_id = %self.client_id, error = %e, "failed to open progress store");
			}
		}

		while let Some(cmd) = self.rx.recv().await {
			match cmd {
				SessionCmd::Accept { sink, client_lsn } => {
					self.handle_accept(sink, client_lsn);
				}
				SessionCmd::Frame { frame } => self.handle_frame(frame).await,
				SessionCmd::Disconnect { reason, clean } => {
					self.handle_disconnect(&reason, clean);
				}
				SessionCmd::Notify { lsn } => {
					tracing::debug!(client_id = %self.client_id, lsn = %lsn, "feed notification");
					self.notify.notify_one();
				}
				SessionCmd::Fatal { reason } => self.handle_fatal(&reason),
				SessionCmd::PushStats => self.handle_push_stats(),
				SessionCmd::Shutdown => break,
			}
		}

		self.workflow_cancel.cancel();
		self.correlator.close();
	}

	fn handle_accept(&mut self, sink: FrameSink, client_lsn: Lsn) {
		if self.quarantined {
			tracing::warn!(client_id = %self.client_id, "refusing transport for quarantined session");
			let _ = sink.send(FramePayload::SrvError);
			sink.close();
			return;
		}

		// A second transport for the same client replaces the first: the old
		// workflow is cancelled and its pending waits are released.
		self.workflow_cancel.cancel();
		self.correlator.close();
		if let Some(old) = self.sink.take() {
			old.close();
		}
		self.correlator = Arc::new(Correlator::new(self.deps.config.queue_capacity));
		self.workflow_cancel = CancellationToken::new();
		self.sink = Some(sink.clone());
		self.deps.registry.connect(&self.client_id);

		let Some(progress) = self.progress.clone() else {
			tracing::error!(client_id = %self.client_id, "no progress store, refusing session");
			let _ = sink.send(FramePayload::SrvError);
			sink.close();
			return;
		};

		let ctx = WorkflowCtx {
			client_id: self.client_id.clone(),
			sink,
			correlator: self.correlator.clone(),
			progress,
			feed: self.deps.feed.clone(),
			tables: self.deps.tables.clone(),
			registry: self.deps.registry.clone(),
			metrics: self.deps.metrics.clone(),
			config: self.deps.config.clone(),
			notify: self.notify.clone(),
			cancel: self.workflow_cancel.clone(),
		};
		let cancel = self.workflow_cancel.clone();
		let fatal_tx = self.tx.clone();
		tokio::spawn(async move {
			tokio::select! {
				() = cancel.cancelled() => {}
				res = run_workflow(&ctx, client_lsn) => {
					if let Err(e) = res {
						if e.is_fatal() {
							tracing::error!(client_id = %ctx.client_id, error = %e, "invariant violation, quarantining session");
							let _ = fatal_tx
								.send(SessionCmd::Fatal {
									reason: e.to_string(),
								})
								.await;
						} else {
							match &e {
								SyncError::Transport(_) | SyncError::AckTimeout(_) => {
									tracing::info!(client_id = %ctx.client_id, error = %e, "sync workflow ended");
								}
								_ => {
									tracing::error!(client_id = %ctx.client_id, error = %e, "sync workflow failed");
								}
							}
						}
						let _ = ctx.sink.send(FramePayload::SrvError);
						ctx.sink.close();
					}
				}
			}
		});
	}

	/// Quarantine the session: refuse every frame and transport from here on.
	///
	/// Durable progress is left intact; only a process restart readmits the
	/// client.
	fn handle_fatal(&mut self, reason: &str) {
		tracing::error!(client_id = %self.client_id, reason = %reason, "session quarantined");
		self.quarantined = true;
		self.deps.quarantine.mark(&self.client_id);
		self.deps.registry.disconnect(&self.client_id);
		self.workflow_cancel.cancel();
		self.correlator.close();
		if let Some(sink) = self.sink.take() {
			sink.close();
		}
	}

	async fn handle_frame(&mut self, frame: Frame) {
		if self.quarantined {
			tracing::warn!(
				client_id = %self.client_id,
				kind = %frame.payload.kind(),
				"dropping frame for quarantined session"
			);
			return;
		}
		Metrics::add(&self.deps.metrics.frames_in, 1);

		// Acknowledgement types resolve waits in the drivers.
		if matches!(
			frame.payload.kind(),
			FrameKind::CltInitReceived | FrameKind::CltInitProcessed | FrameKind::CltChangesReceived
		) {
			self.correlator.offer(frame);
			return;
		}

		match frame.payload {
			FramePayload::CltSendChanges { changes } => {
				self.handle_client_changes(changes).await;
			}
			FramePayload::CltHeartbeat { lsn, active } => {
				self.deps
					.registry
					.heartbeat(&self.client_id, Some(lsn), active);
				let now = Utc::now().timestamp_millis();
				self.deps.metrics.record_wake(now);
				if let Some(progress) = &self.progress
					&& let Err(e) = progress.record_wake(now).await
				{
					tracing::warn!(client_id = %self.client_id, error = %e, "failed to record wake");
				}
			}
			FramePayload::CltChangesApplied { last_lsn, .. } => {
				self.deps.registry.set_lsn(&self.client_id, last_lsn);
			}
			FramePayload::CltCatchupReceived { lsn } => {
				self.deps.registry.set_lsn(&self.client_id, lsn);
			}
			FramePayload::CltError => {
				tracing::warn!(client_id = %self.client_id, "client reported an error");
			}
			FramePayload::Unknown => {
				tracing::warn!(client_id = %self.client_id, "ignoring unknown frame type");
			}
			other => {
				tracing::warn!(
					client_id = %self.client_id,
					kind = %other.kind(),
					"ignoring unexpected frame from client"
				);
			}
		}
	}

	/// Apply client-originated changes and report both protocol replies.
	async fn handle_client_changes(&mut self, changes: Vec<TableChange>) {
		let Some(sink) = self.sink.clone() else {
			tracing::warn!(client_id = %self.client_id, "client changes with no transport attached");
			return;
		};

		let deduped = order::dedupe_latest(changes);
		let change_ids: Vec<String> = deduped
			.iter()
			.filter_map(|c| c.id().map(str::to_string))
			.collect();
		let _ = sink.send(FramePayload::SrvChangesReceived { change_ids });

		let tables = match self.deps.tables.list_tables().await {
			Ok(tables) => tables,
			Err(e) => {
				tracing::error!(client_id = %self.client_id, error = %e, "failed to list domain tables");
				let _ = sink.send(FramePayload::SrvChangesApplied {
					applied_changes: Vec::new(),
					success: false,
					error: Some(e.to_string()),
				});
				return;
			}
		};

		let outcome = self.apply.apply(deduped, &tables).await;
		Metrics::add(&self.deps.metrics.changes_applied, outcome.applied.len() as u64);
		Metrics::add(&self.deps.metrics.changes_skipped, outcome.skipped.len() as u64);

		let success = outcome.success();
		let _ = sink.send(FramePayload::SrvChangesApplied {
			applied_changes: outcome.processed_ids(),
			success,
			error: outcome.error,
		});

		// Noop heartbeat batch confirming a successful apply cycle.
		if success {
			let _ = sink.send(FramePayload::SrvSendChanges {
				changes: Vec::new(),
				last_lsn: Lsn::ZERO,
				sequence: None,
			});
		}
	}

	fn handle_disconnect(&mut self, reason: &str, clean: bool) {
		tracing::info!(client_id = %self.client_id, reason = %reason, clean, "transport disconnected");
		self.deps.registry.disconnect(&self.client_id);
		self.workflow_cancel.cancel();
		self.correlator.close();
		if let Some(sink) = self.sink.take() {
			sink.close();
		}
	}

	fn handle_push_stats(&self) {
		let Some(sink) = &self.sink else {
			return;
		};
		if let Some(reg) = self.deps.registry.get(&self.client_id) {
			let _ = sink.send(FramePayload::SrvStateChange {
				state: reg.phase,
				lsn: reg.last_acked_lsn,
			});
		}
	}
}

/// The per-connect sync workflow: register, persist, select, drive.
async fn run_workflow(ctx: &WorkflowCtx, reported_lsn: Lsn) -> Result<()> {
	ctx.progress.set_current_client_id().await?;
	ctx.progress.reset_client_lsn(reported_lsn).await?;

	let mut forced_phase = None;
	loop {
		if ctx.cancel.is_cancelled() {
			return Ok(());
		}

		// An unfinished initial sync pins the session to INITIAL (its
		// durable baseline would otherwise be abandoned half-shipped).
		let initial_pending = matches!(
			ctx.progress.initial_progress().await?,
			Some(p) if p.status == InitialSyncStatus::InProgress
		);
		let client_lsn = ctx.progress.client_lsn().await?;
		let phase = if initial_pending {
			SyncPhase::Initial
		} else if let Some(forced) = forced_phase.take() {
			forced
		} else {
			let server_lsn = ctx.feed.current_server_lsn().await?;
			strategy::select_phase(client_lsn, server_lsn)
		};

		ctx.progress.set_sync_phase(phase).await?;
		ctx.registry.set_phase(&ctx.client_id, phase);
		ctx.sink.send(FramePayload::SrvStateChange {
			state: phase,
			lsn: client_lsn,
		})?;
		tracing::info!(client_id = %ctx.client_id, phase = %phase, lsn = %client_lsn, "entering sync phase");

		match phase {
			SyncPhase::Initial => initial::run(ctx).await?,
			SyncPhase::Catchup => {
				feeder::run_catchup(ctx).await?;
				// The tail was reached and acked; go LIVE directly. The feed
				// tail can sit behind the raw server position, so deriving
				// the phase again could pin the session in CATCHUP.
				forced_phase = Some(SyncPhase::Live);
			}
			SyncPhase::Live => return feeder::run_live(ctx).await,
		}
	}
}
