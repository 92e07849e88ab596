//! Session manager: the runtime guarantee of one actor per client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tabsync_proto::{Frame, Lsn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::session::{FrameSink, SessionDeps, SessionHandle, SessionService, parse_reported_lsn};

/// Owns every live session actor and serializes their instantiation.
///
/// Accepting a transport for a client that already has an actor routes the
/// transport to the existing actor, which in turn replaces its previous
/// transport. Actors survive disconnects so reconnecting clients keep their
/// correlation state cheap to rebuild; the sweep drops actors whose
/// registration has gone stale.
pub struct SessionManager {
	deps: SessionDeps,
	sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
	/// Build a manager over shared collaborators.
	#[must_use]
	pub fn new(deps: SessionDeps) -> Arc<Self> {
		Arc::new(Self {
			deps,
			sessions: Mutex::new(HashMap::new()),
		})
	}

	/// The shared collaborators, for the control surface.
	#[must_use]
	pub fn deps(&self) -> &SessionDeps {
		&self.deps
	}

	fn session_for(&self, client_id: &str) -> SessionHandle {
		let mut sessions = self.sessions.lock().unwrap();
		sessions
			.entry(client_id.to_string())
			.or_insert_with(|| SessionService::start(client_id, self.deps.clone()))
			.clone()
	}

	/// Attach a transport for `client_id`.
	///
	/// Validates the client id and the LSN grammar before any actor is
	/// touched; a missing LSN normalizes to `0/0`. Quarantined clients are
	/// refused until the process restarts. Returns the session handle, the
	/// outbound frame stream for the transport writer, and the token the
	/// server cancels to close the transport.
	pub async fn accept(
		&self,
		client_id: &str,
		raw_lsn: Option<&str>,
	) -> Result<(SessionHandle, mpsc::UnboundedReceiver<Frame>, CancellationToken)> {
		if client_id.is_empty() {
			return Err(SyncError::InvalidArgument("missing clientId".to_string()));
		}
		if self.deps.quarantine.contains(client_id) {
			return Err(SyncError::FatalInternal(format!(
				"client {client_id} is quarantined until restart"
			)));
		}
		let client_lsn = parse_reported_lsn(raw_lsn)?;

		let handle = self.session_for(client_id);
		let (tx, rx) = mpsc::unbounded_channel();
		let closer = CancellationToken::new();
		let sink = FrameSink::new(client_id, tx, closer.clone(), self.deps.metrics.clone());
		handle.accept(sink, client_lsn).await;
		Ok((handle, rx, closer))
	}

	/// Look up the live session for a client, if any.
	#[must_use]
	pub fn get(&self, client_id: &str) -> Option<SessionHandle> {
		self.sessions.lock().unwrap().get(client_id).cloned()
	}

	/// Wake a client's live loop for one feed pass.
	///
	/// Returns false when the client has no resident actor; its next connect
	/// will catch up from the durable position anyway.
	pub async fn notify(&self, client_id: &str, lsn: Lsn) -> bool {
		let handle = self.get(client_id);
		match handle {
			Some(handle) => {
				handle.notify(lsn).await;
				true
			}
			None => false,
		}
	}

	/// Sweep stale registrations and evict their actors.
	pub async fn sweep(&self) {
		let removed = self
			.deps
			.registry
			.sweep(self.deps.config.sweep_horizon);
		if removed.is_empty() {
			return;
		}
		let handles: Vec<SessionHandle> = {
			let mut sessions = self.sessions.lock().unwrap();
			removed
				.iter()
				.filter_map(|id| sessions.remove(id))
				.collect()
		};
		for handle in handles {
			handle.shutdown().await;
		}
	}

	/// Stop every session actor. Durable progress is retained.
	pub async fn shutdown(&self) {
		let handles: Vec<SessionHandle> = {
			let mut sessions = self.sessions.lock().unwrap();
			sessions.drain().map(|(_, h)| h).collect()
		};
		for handle in handles {
			handle.shutdown().await;
		}
	}

	/// Number of resident session actors.
	#[doc(hidden)]
	#[must_use]
	pub fn session_count(&self) -> usize {
		self.sessions.lock().unwrap().len()
	}
}
