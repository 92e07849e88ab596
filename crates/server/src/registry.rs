//! Advisory client registry.
//!
//! Shared map of `client_id` to connection bookkeeping for operator
//! visibility. Eventually consistent by design: nothing in the sync engine
//! may trust it for correctness. The durable source of truth for a client's
//! position is the progress store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tabsync_proto::{Lsn, SyncPhase};

/// Bookkeeping for one known client.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
	/// The client's unique identifier.
	pub client_id: String,
	/// Whether a transport is currently attached.
	pub active: bool,
	/// Last time the client connected, heartbeat or acked.
	pub last_seen: DateTime<Utc>,
	/// Last position the client acknowledged, as far as the registry knows.
	pub last_acked_lsn: Lsn,
	/// Current sync phase.
	pub phase: SyncPhase,
}

/// Shared advisory registry of client registrations.
#[derive(Debug, Default)]
pub struct ClientRegistry {
	inner: Mutex<HashMap<String, ClientRegistration>>,
}

impl ClientRegistry {
	/// Register or refresh a client on connect.
	pub fn connect(&self, client_id: &str) {
		let mut inner = self.inner.lock().unwrap();
		let entry = inner
			.entry(client_id.to_string())
			.or_insert_with(|| ClientRegistration {
				client_id: client_id.to_string(),
				active: false,
				last_seen: Utc::now(),
				last_acked_lsn: Lsn::ZERO,
				phase: SyncPhase::Initial,
			});
		entry.active = true;
		entry.last_seen = Utc::now();
	}

	/// Mark a client disconnected; the registration is retained.
	pub fn disconnect(&self, client_id: &str) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(entry) = inner.get_mut(client_id) {
			entry.active = false;
			entry.last_seen = Utc::now();
		}
	}

	/// Refresh liveness from a client heartbeat.
	pub fn heartbeat(&self, client_id: &str, lsn: Option<Lsn>, active: bool) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(entry) = inner.get_mut(client_id) {
			entry.last_seen = Utc::now();
			entry.active = active;
			if let Some(lsn) = lsn {
				entry.last_acked_lsn = entry.last_acked_lsn.max(lsn);
			}
		}
	}

	/// Record an acknowledged position.
	pub fn set_lsn(&self, client_id: &str, lsn: Lsn) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(entry) = inner.get_mut(client_id) {
			entry.last_acked_lsn = entry.last_acked_lsn.max(lsn);
			entry.last_seen = Utc::now();
		}
	}

	/// Record a phase transition.
	pub fn set_phase(&self, client_id: &str, phase: SyncPhase) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(entry) = inner.get_mut(client_id) {
			entry.phase = phase;
		}
	}

	/// Look up a single registration.
	#[must_use]
	pub fn get(&self, client_id: &str) -> Option<ClientRegistration> {
		self.inner.lock().unwrap().get(client_id).cloned()
	}

	/// Clone all registrations for the control surface.
	#[must_use]
	pub fn snapshot(&self) -> Vec<ClientRegistration> {
		let inner = self.inner.lock().unwrap();
		let mut all: Vec<_> = inner.values().cloned().collect();
		all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
		all
	}

	/// Drop registrations that have been inactive past `horizon`.
	///
	/// This administrative sweep is the only way a registration is destroyed.
	/// Returns the removed client ids.
	pub fn sweep(&self, horizon: Duration) -> Vec<String> {
		let Some(cutoff) = chrono::Duration::from_std(horizon)
			.ok()
			.and_then(|d| Utc::now().checked_sub_signed(d))
		else {
			return Vec::new();
		};
		let mut inner = self.inner.lock().unwrap();
		let stale: Vec<String> = inner
			.values()
			.filter(|r| !r.active && r.last_seen < cutoff)
			.map(|r| r.client_id.clone())
			.collect();
		for id in &stale {
			inner.remove(id);
			tracing::info!(client_id = %id, "swept stale client registration");
		}
		stale
	}
}
