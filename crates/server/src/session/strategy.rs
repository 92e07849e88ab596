//! Phase selection.

use tabsync_proto::{Lsn, SyncPhase};

/// Pick the sync phase for a client at `client_lsn` against `server_lsn`.
///
/// `0/0` always selects INITIAL regardless of server state; a client equal
/// to the server goes LIVE, not CATCHUP. Pure: no state is consulted or
/// mutated.
#[must_use]
pub fn select_phase(client_lsn: Lsn, server_lsn: Lsn) -> SyncPhase {
	if client_lsn.is_zero() {
		SyncPhase::Initial
	} else if client_lsn < server_lsn {
		SyncPhase::Catchup
	} else {
		SyncPhase::Live
	}
}
