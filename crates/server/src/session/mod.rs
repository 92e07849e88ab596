//! Per-client sync session actor.
//!
//! # Purpose
//!
//! - Define the session actor that owns one client's replication state
//!   machine: phase selection, snapshot shipping, change feeding, and apply
//!   of client-originated changes.
//! - Describe the interlocked chunk protocol: every outbound chunk blocks on
//!   its matching acknowledgement frame before progress is persisted.
//! - Exclude transport framing and HTTP routing; see [`crate::net`] and
//!   [`crate::control`].
//!
//! # Mental model
//!
//! - One [`SessionService`] actor exists per client id; the
//!   [`crate::manager::SessionManager`] serializes instantiation.
//! - The actor's inbox is the only way in. Transport events arrive as
//!   [`SessionCmd`] messages; the actor processes one command at a time.
//! - The sync workflow (select phase, run driver) runs as a task spawned off
//!   the actor so the transport handshake returns immediately. The workflow
//!   blocks on acknowledgement frames through the [`crate::correlator`],
//!   which the actor feeds from inbound frames.
//! - Resident state is a cache. Anything needed after eviction, crash, or
//!   reconnect lives in the [`crate::progress`] store: the acked LSN, the
//!   initial-sync cursor, the sync phase, and the owning client id.
//! - Phase selection is pure: `0/0` means INITIAL, behind the server means
//!   CATCHUP, caught up means LIVE. An unfinished initial sync pins the
//!   session to INITIAL across reconnects until its terminal ack lands.
//!
//! # Invariants
//!
//! 1. A client's acknowledged LSN never decreases across its registration.
//!    - Enforced in: `SessionProgress::set_client_lsn`
//!    - Tested by: `progress::tests::acked_lsn_never_regresses`
//! 2. A chunk counts as acknowledged only after its matching ack frame is
//!    received and the cursor persisted; partial sends are re-sent.
//!    - Enforced in: `initial::run`, `feeder::feed_pass`
//!    - Tested by: `session::tests::initial_sync::resume_skips_acked_chunks`
//! 3. A client in INITIAL stays in INITIAL across reconnects until the
//!    snapshot's terminal ack is received.
//!    - Enforced in: `service::run_workflow`
//!    - Tested by: `session::tests::initial_sync::reconnect_mid_initial_stays_initial`
//! 4. At most one session actor exists per client id.
//!    - Enforced in: `SessionManager::session_for`
//!    - Tested by: `manager::tests::second_accept_reuses_the_actor`
//! 5. The durable LSN plus the durable initial-sync cursor suffice to resume
//!    after any crash without unbounded re-sends.
//!    - Enforced in: `initial::run` (per-chunk persistence), `feeder::feed_pass`
//!      (persist only after ack)
//!    - Tested by: `session::tests::initial_sync::resume_skips_acked_chunks`
//!
//! # Data flow
//!
//! 1. Transport accept: the manager validates the client id and LSN grammar,
//!    then sends `SessionCmd::Accept` with a fresh [`FrameSink`].
//! 2. The actor registers the client, persists the reported LSN, and spawns
//!    the workflow task.
//! 3. The workflow selects INITIAL, CATCHUP, or LIVE and runs the matching
//!    driver; drivers send frames through the sink and await acks through
//!    the correlator.
//! 4. Inbound frames reach the actor; acknowledgement types are offered to
//!    the correlator, `clt_send_changes` runs the apply engine inline, and
//!    bookkeeping types update the advisory registry.
//! 5. Disconnect cancels the workflow and closes the correlator; durable
//!    progress is untouched, so the next accept resumes.
//!
//! # Failure modes and recovery
//!
//! - Ack timeout: the driver aborts its phase; only acked positions were
//!   persisted, so the next connect re-sends from the durable cursor.
//! - Transport loss mid-apply: the apply completes against the database; the
//!   reply frames are dropped with the sink. The client re-sends and the
//!   trigger layer makes the replay harmless.
//! - Workflow failure: logged, `srv_error` emitted best-effort, transport
//!   closed. Durable progress is left intact.
//! - Invariant violation: the session is quarantined. The actor drops every
//!   further frame, refuses replacement transports, and the manager refuses
//!   accepts for the client id until the process restarts.
//!   - Enforced in: `SessionService::handle_fatal`, `SessionManager::accept`
//!   - Tested by: `session::tests::lifecycle::invariant_violation_quarantines_the_client`
//! - Eviction: the runtime may drop the actor while the client is parked.
//!   The `current_client_id` key restores identity when the next inbound
//!   frame reinstantiates the session.

mod apply;
mod commands;
mod feeder;
mod handle;
mod initial;
mod service;
mod strategy;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tabsync_proto::{Frame, FramePayload, Lsn};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

pub use apply::{ApplyEngine, ApplyOutcome};
pub use commands::SessionCmd;
pub use handle::SessionHandle;
pub use service::{SessionDeps, SessionService};
pub use strategy::select_phase;

use crate::config::SyncConfig;
use crate::correlator::Correlator;
use crate::db::{ChangeFeed, DomainTables};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::progress::SessionProgress;
use crate::registry::ClientRegistry;

/// Outbound half of a client transport.
///
/// Frames are enveloped with the session's client id and queued for the
/// transport writer. Closing cancels the transport from the server side.
#[derive(Debug, Clone)]
pub struct FrameSink {
	client_id: String,
	tx: mpsc::UnboundedSender<Frame>,
	closer: CancellationToken,
	metrics: Arc<Metrics>,
}

impl FrameSink {
	/// Wrap a transport writer queue.
	#[must_use]
	pub fn new(
		client_id: impl Into<String>,
		tx: mpsc::UnboundedSender<Frame>,
		closer: CancellationToken,
		metrics: Arc<Metrics>,
	) -> Self {
		Self {
			client_id: client_id.into(),
			tx,
			closer,
			metrics,
		}
	}

	/// Envelope and queue a frame for the transport writer.
	pub fn send(&self, payload: FramePayload) -> Result<()> {
		let frame = Frame::new(&self.client_id, payload);
		self.tx
			.send(frame)
			.map_err(|_| SyncError::Transport("transport writer gone".to_string()))?;
		Metrics::add(&self.metrics.frames_out, 1);
		Ok(())
	}

	/// Ask the transport to close from the server side.
	pub fn close(&self) {
		self.closer.cancel();
	}
}

/// Everything a driver needs to run one phase of the workflow.
#[derive(Clone)]
pub(crate) struct WorkflowCtx {
	pub client_id: String,
	pub sink: FrameSink,
	pub correlator: Arc<Correlator>,
	pub progress: SessionProgress,
	pub feed: Arc<dyn ChangeFeed>,
	pub tables: Arc<dyn DomainTables>,
	pub registry: Arc<ClientRegistry>,
	pub metrics: Arc<Metrics>,
	pub config: SyncConfig,
	pub notify: Arc<Notify>,
	pub cancel: CancellationToken,
}

/// Clients whose session hit an invariant violation.
///
/// A marked client is refused — frames, new transports, and manager accepts
/// alike — until the process restarts; nothing removes entries at runtime.
#[derive(Debug, Default)]
pub struct Quarantine {
	inner: Mutex<HashSet<String>>,
}

impl Quarantine {
	/// Mark a client as quarantined.
	pub fn mark(&self, client_id: &str) {
		self.inner.lock().unwrap().insert(client_id.to_string());
	}

	/// Whether a client is quarantined.
	#[must_use]
	pub fn contains(&self, client_id: &str) -> bool {
		self.inner.lock().unwrap().contains(client_id)
	}
}

/// Validate an optional client-reported LSN, normalizing absence to `0/0`.
pub fn parse_reported_lsn(raw: Option<&str>) -> Result<Lsn> {
	match raw {
		None => Ok(Lsn::ZERO),
		Some(s) => s
			.parse()
			.map_err(|e: tabsync_proto::LsnParseError| SyncError::InvalidArgument(e.to_string())),
	}
}

#[cfg(test)]
pub(crate) mod tests;
