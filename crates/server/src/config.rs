//! Tunables for the sync engine.

use std::time::Duration;

/// Configuration shared by every session actor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Rows fetched per database cursor page during initial sync.
	pub page_size: usize,
	/// Rows or changes delivered per wire chunk.
	pub chunk_size: usize,
	/// How long to wait for an acknowledgement frame.
	pub frame_wait: Duration,
	/// Session-level statement timeout applied to apply connections.
	pub statement_timeout: Duration,
	/// Deadline for a single-row database operation.
	pub row_timeout: Duration,
	/// Idle interval between live-phase heartbeats.
	pub live_tick: Duration,
	/// Maximum buffered inbound frames per frame type.
	pub queue_capacity: usize,
	/// Registrations inactive for longer than this are swept.
	pub sweep_horizon: Duration,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			page_size: 1000,
			chunk_size: 2000,
			frame_wait: Duration::from_secs(30),
			statement_timeout: Duration::from_secs(20),
			row_timeout: Duration::from_secs(10),
			live_tick: Duration::from_secs(30),
			queue_capacity: 256,
			sweep_horizon: Duration::from_secs(24 * 60 * 60),
		}
	}
}
