//! Key names in the progress namespace.

/// Restores the owning client id after eviction.
pub const CURRENT_CLIENT_ID: &str = "current_client_id";

/// The [`super::InitialSyncProgress`] record.
pub const INITIAL_SYNC_STATE: &str = "initial_sync_state";

/// Diagnostic: last client wake in epoch millis.
pub const LAST_WAKE_TIME: &str = "lastWakeTime";

/// Last acknowledged LSN for a client.
#[must_use]
pub fn client_lsn(client_id: &str) -> String {
	format!("client:{client_id}:lsn")
}

/// Current sync phase for a client.
#[must_use]
pub fn client_sync_state(client_id: &str) -> String {
	format!("client:{client_id}:syncState")
}
