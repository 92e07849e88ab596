//! Commands for the session actor.

use tabsync_proto::{Frame, Lsn};

use super::FrameSink;

/// Inbox messages for a [`super::SessionService`].
#[derive(Debug)]
pub enum SessionCmd {
	/// Attach a transport; replaces any previous transport for the client.
	Accept {
		/// Outbound half of the new transport.
		sink: FrameSink,
		/// Client-reported position, already validated and normalized.
		client_lsn: Lsn,
	},
	/// An inbound frame from the client.
	Frame {
		/// The decoded frame.
		frame: Frame,
	},
	/// The transport closed.
	Disconnect {
		/// Human-readable close reason.
		reason: String,
		/// Whether the close was a clean shutdown.
		clean: bool,
	},
	/// New changes appeared in the feed; wake the live loop.
	Notify {
		/// Server position that triggered the notification.
		lsn: Lsn,
	},
	/// The workflow observed an invariant violation; quarantine the session.
	Fatal {
		/// What was violated.
		reason: String,
	},
	/// Forward a sync-stats frame to the connected client.
	PushStats,
	/// Stop the actor. Durable progress is retained.
	Shutdown,
}
