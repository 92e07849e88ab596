//! Error types for the sync core.

use std::time::Duration;

use tabsync_proto::FrameKind;
use thiserror::Error;

/// Errors surfaced by the sync core.
///
/// CRDT conflicts are deliberately absent: a conflict-skipped row is an
/// expected outcome, counted in the apply summary rather than raised.
#[derive(Debug, Error)]
pub enum SyncError {
	/// Malformed input from the caller or transport: bad LSN grammar,
	/// missing client id, a table outside the domain registry.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	/// The transport failed or closed underneath the session. Non-fatal;
	/// durable progress is retained and the next connect resumes.
	#[error("transport error: {0}")]
	Transport(String),

	/// No matching frame arrived inside the wait window. Aborts the current
	/// phase only; acked progress is already persisted.
	#[error("timed out waiting for `{0}` frame")]
	AckTimeout(FrameKind),

	/// A database operation exceeded its deadline.
	#[error("operation timed out after {0:?}")]
	OpTimeout(Duration),

	/// A non-conflict database failure.
	#[error("database error: {0}")]
	Statement(#[from] tokio_postgres::Error),

	/// The durable progress store misbehaved (failed write, failed
	/// read-back verification, undecodable stored value).
	#[error("progress store error: {0}")]
	Progress(String),

	/// An invariant was violated; the session refuses further work until
	/// the runtime restarts it.
	#[error("invariant violation: {0}")]
	FatalInternal(String),
}

impl SyncError {
	/// Whether this error quarantines the session instead of merely ending
	/// the current phase.
	#[must_use]
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::FatalInternal(_))
	}
}

/// Result alias used throughout the sync core.
pub type Result<T> = std::result::Result<T, SyncError>;
