//! Process-wide sync counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters exposed on the control surface.
///
/// All counters are monotonically increasing except `last_wake_millis`,
/// which records the most recent client wake.
#[derive(Debug, Default)]
pub struct Metrics {
	/// Frames accepted from clients.
	pub frames_in: AtomicU64,
	/// Frames handed to transports.
	pub frames_out: AtomicU64,
	/// Changes shipped to clients across snapshot and feed paths.
	pub changes_shipped: AtomicU64,
	/// Client-originated changes applied to the database.
	pub changes_applied: AtomicU64,
	/// Client-originated changes skipped as conflicts.
	pub changes_skipped: AtomicU64,
	/// Milliseconds since epoch of the most recent client wake.
	pub last_wake_millis: AtomicI64,
}

impl Metrics {
	/// Bump a counter by `n`.
	pub fn add(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}

	/// Record a client wake at `millis`.
	pub fn record_wake(&self, millis: i64) {
		self.last_wake_millis.store(millis, Ordering::Relaxed);
	}

	/// Snapshot the counters as JSON for the control surface.
	#[must_use]
	pub fn snapshot(&self) -> serde_json::Value {
		serde_json::json!({
			"framesIn": self.frames_in.load(Ordering::Relaxed),
			"framesOut": self.frames_out.load(Ordering::Relaxed),
			"changesShipped": self.changes_shipped.load(Ordering::Relaxed),
			"changesApplied": self.changes_applied.load(Ordering::Relaxed),
			"changesSkipped": self.changes_skipped.load(Ordering::Relaxed),
			"lastWakeTime": self.last_wake_millis.load(Ordering::Relaxed),
		})
	}
}
