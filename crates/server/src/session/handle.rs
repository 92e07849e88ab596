//! Handle for communicating with a session actor.

use tabsync_proto::{Frame, Lsn};
use tokio::sync::mpsc;

use super::FrameSink;
use super::commands::SessionCmd;

/// Cloneable handle to one [`super::SessionService`].
///
/// Sends are fire-and-forget: a dropped actor simply discards them, which is
/// the correct behavior for every caller here.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
	/// Wraps a command sender in a typed handle.
	#[must_use]
	pub fn new(tx: mpsc::Sender<SessionCmd>) -> Self {
		Self { tx }
	}

	/// Attach a transport.
	pub async fn accept(&self, sink: FrameSink, client_lsn: Lsn) {
		let _ = self.tx.send(SessionCmd::Accept { sink, client_lsn }).await;
	}

	/// Deliver an inbound frame.
	pub async fn frame(&self, frame: Frame) {
		let _ = self.tx.send(SessionCmd::Frame { frame }).await;
	}

	/// Report a transport close.
	pub async fn disconnect(&self, reason: impl Into<String>, clean: bool) {
		let _ = self
			.tx
			.send(SessionCmd::Disconnect {
				reason: reason.into(),
				clean,
			})
			.await;
	}

	/// Wake the live loop for one feed pass.
	pub async fn notify(&self, lsn: Lsn) {
		let _ = self.tx.send(SessionCmd::Notify { lsn }).await;
	}

	/// Forward a sync-stats frame to the connected client.
	pub async fn push_stats(&self) {
		let _ = self.tx.send(SessionCmd::PushStats).await;
	}

	/// Stop the actor.
	pub async fn shutdown(&self) {
		let _ = self.tx.send(SessionCmd::Shutdown).await;
	}
}
