//! Frame envelope and payload variants for the sync wire protocol.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lsn::Lsn;
use crate::types::{BatchSequence, InitSequence, SyncPhase, TableChange};

/// One JSON frame on the wire.
///
/// Every frame carries the envelope fields (`messageId`, `timestamp`,
/// `clientId`) alongside a payload tagged by `type`. Frames missing any
/// envelope field are rejected at decode time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
	/// Opaque unique identifier for this frame.
	#[serde(rename = "messageId")]
	pub message_id: String,
	/// Milliseconds since the Unix epoch at send time.
	pub timestamp: i64,
	/// Client the frame belongs to.
	#[serde(rename = "clientId")]
	pub client_id: String,
	/// The typed payload.
	#[serde(flatten)]
	pub payload: FramePayload,
}

impl Frame {
	/// Build a frame with a fresh message id and the current timestamp.
	#[must_use]
	pub fn new(client_id: impl Into<String>, payload: FramePayload) -> Self {
		Self {
			message_id: Uuid::new_v4().to_string(),
			timestamp: Utc::now().timestamp_millis(),
			client_id: client_id.into(),
			payload,
		}
	}
}

/// Payload variants, one per wire `type`.
///
/// `srv_*` frames travel server to client, `clt_*` frames client to server.
/// Types this server does not recognize decode as [`FramePayload::Unknown`]
/// so the session can log and ignore them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FramePayload {
	/// Initial sync is starting; `serverLSN` is the snapshot baseline.
	#[serde(rename = "srv_init_start")]
	SrvInitStart {
		/// Server LSN captured before the first chunk.
		#[serde(rename = "serverLSN")]
		server_lsn: Lsn,
	},
	/// One chunk of snapshot rows for a table.
	#[serde(rename = "srv_init_changes")]
	SrvInitChanges {
		/// Snapshot rows, each carrying an insert-or-update op.
		changes: Vec<TableChange>,
		/// Chunk position within the table.
		sequence: InitSequence,
	},
	/// All tables have been shipped.
	#[serde(rename = "srv_init_complete")]
	SrvInitComplete {
		/// The snapshot baseline LSN, unchanged from `srv_init_start`.
		#[serde(rename = "serverLSN")]
		server_lsn: Lsn,
	},
	/// The client's acknowledged LSN advanced.
	#[serde(rename = "srv_lsn_update")]
	SrvLsnUpdate {
		/// New acknowledged position.
		lsn: Lsn,
	},
	/// The session moved to a new sync phase.
	#[serde(rename = "srv_state_change")]
	SrvStateChange {
		/// The phase entered.
		state: SyncPhase,
		/// Acknowledged position at the transition.
		lsn: Lsn,
	},
	/// A batch of committed changes past the client's position.
	#[serde(rename = "srv_send_changes")]
	SrvSendChanges {
		/// Ordered, deduplicated changes.
		changes: Vec<TableChange>,
		/// Greatest LSN included in the batch; `0/0` for noop heartbeats.
		#[serde(rename = "lastLSN")]
		last_lsn: Lsn,
		/// Batch position when the send spans several batches.
		#[serde(skip_serializing_if = "Option::is_none")]
		sequence: Option<BatchSequence>,
	},
	/// Client-sent changes were received and deduplicated.
	#[serde(rename = "srv_changes_received")]
	SrvChangesReceived {
		/// Row ids retained after deduplication.
		#[serde(rename = "changeIds")]
		change_ids: Vec<String>,
	},
	/// Result of applying client-sent changes.
	#[serde(rename = "srv_changes_applied")]
	SrvChangesApplied {
		/// Row ids processed, including conflict-skipped rows.
		#[serde(rename = "appliedChanges")]
		applied_changes: Vec<String>,
		/// False only when a non-conflict error was observed.
		success: bool,
		/// First non-conflict error message, when any.
		#[serde(skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	/// Server-side failure; carries only the envelope.
	#[serde(rename = "srv_error")]
	SrvError,
	/// Keepalive.
	#[serde(rename = "srv_heartbeat")]
	SrvHeartbeat,
	/// Acknowledges one snapshot chunk.
	#[serde(rename = "clt_init_received")]
	CltInitReceived {
		/// Table the chunk belonged to.
		table: String,
		/// Acknowledged chunk number.
		chunk: u32,
	},
	/// The client has durably processed the full snapshot.
	#[serde(rename = "clt_init_processed")]
	CltInitProcessed,
	/// Client-originated changes to apply on the server.
	#[serde(rename = "clt_send_changes")]
	CltSendChanges {
		/// Changed rows.
		changes: Vec<TableChange>,
	},
	/// Acknowledges a `srv_send_changes` batch.
	#[serde(rename = "clt_changes_received")]
	CltChangesReceived {
		/// Row ids the client received.
		#[serde(rename = "changeIds")]
		change_ids: Vec<String>,
		/// Echo of the batch's `lastLSN`.
		#[serde(rename = "lastLSN")]
		last_lsn: Lsn,
	},
	/// The client finished applying a batch locally.
	#[serde(rename = "clt_changes_applied")]
	CltChangesApplied {
		/// Row ids the client applied.
		#[serde(rename = "changeIds")]
		change_ids: Vec<String>,
		/// Position the client has applied through.
		#[serde(rename = "lastLSN")]
		last_lsn: Lsn,
	},
	/// Progress marker during catchup.
	#[serde(rename = "clt_catchup_received")]
	CltCatchupReceived {
		/// Position the client has received through.
		lsn: Lsn,
	},
	/// Client keepalive with its current position.
	#[serde(rename = "clt_heartbeat")]
	CltHeartbeat {
		/// Client's persisted position.
		lsn: Lsn,
		/// Whether the client considers itself actively syncing.
		active: bool,
	},
	/// Client-side failure; carries only the envelope.
	#[serde(rename = "clt_error")]
	CltError,
	/// Any frame type this server does not recognize.
	#[serde(other)]
	Unknown,
}

/// Discriminant of a [`FramePayload`], used as the correlator's queue key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FrameKind {
	SrvInitStart,
	SrvInitChanges,
	SrvInitComplete,
	SrvLsnUpdate,
	SrvStateChange,
	SrvSendChanges,
	SrvChangesReceived,
	SrvChangesApplied,
	SrvError,
	SrvHeartbeat,
	CltInitReceived,
	CltInitProcessed,
	CltSendChanges,
	CltChangesReceived,
	CltChangesApplied,
	CltCatchupReceived,
	CltHeartbeat,
	CltError,
	Unknown,
}

impl FramePayload {
	/// The payload's discriminant.
	#[must_use]
	pub fn kind(&self) -> FrameKind {
		match self {
			Self::SrvInitStart { .. } => FrameKind::SrvInitStart,
			Self::SrvInitChanges { .. } => FrameKind::SrvInitChanges,
			Self::SrvInitComplete { .. } => FrameKind::SrvInitComplete,
			Self::SrvLsnUpdate { .. } => FrameKind::SrvLsnUpdate,
			Self::SrvStateChange { .. } => FrameKind::SrvStateChange,
			Self::SrvSendChanges { .. } => FrameKind::SrvSendChanges,
			Self::SrvChangesReceived { .. } => FrameKind::SrvChangesReceived,
			Self::SrvChangesApplied { .. } => FrameKind::SrvChangesApplied,
			Self::SrvError => FrameKind::SrvError,
			Self::SrvHeartbeat => FrameKind::SrvHeartbeat,
			Self::CltInitReceived { .. } => FrameKind::CltInitReceived,
			Self::CltInitProcessed => FrameKind::CltInitProcessed,
			Self::CltSendChanges { .. } => FrameKind::CltSendChanges,
			Self::CltChangesReceived { .. } => FrameKind::CltChangesReceived,
			Self::CltChangesApplied { .. } => FrameKind::CltChangesApplied,
			Self::CltCatchupReceived { .. } => FrameKind::CltCatchupReceived,
			Self::CltHeartbeat { .. } => FrameKind::CltHeartbeat,
			Self::CltError => FrameKind::CltError,
			Self::Unknown => FrameKind::Unknown,
		}
	}
}

impl fmt::Display for FrameKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::SrvInitStart => "srv_init_start",
			Self::SrvInitChanges => "srv_init_changes",
			Self::SrvInitComplete => "srv_init_complete",
			Self::SrvLsnUpdate => "srv_lsn_update",
			Self::SrvStateChange => "srv_state_change",
			Self::SrvSendChanges => "srv_send_changes",
			Self::SrvChangesReceived => "srv_changes_received",
			Self::SrvChangesApplied => "srv_changes_applied",
			Self::SrvError => "srv_error",
			Self::SrvHeartbeat => "srv_heartbeat",
			Self::CltInitReceived => "clt_init_received",
			Self::CltInitProcessed => "clt_init_processed",
			Self::CltSendChanges => "clt_send_changes",
			Self::CltChangesReceived => "clt_changes_received",
			Self::CltChangesApplied => "clt_changes_applied",
			Self::CltCatchupReceived => "clt_catchup_received",
			Self::CltHeartbeat => "clt_heartbeat",
			Self::CltError => "clt_error",
			Self::Unknown => "unknown",
		};
		f.write_str(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_and_tag_use_wire_names() {
		let frame = Frame::new(
			"c1",
			FramePayload::SrvInitStart {
				server_lsn: "0/16".parse().unwrap(),
			},
		);
		let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["type"], "srv_init_start");
		assert_eq!(json["clientId"], "c1");
		assert_eq!(json["serverLSN"], "0/16");
		assert!(json["messageId"].is_string());
		assert!(json["timestamp"].is_i64());
	}

	#[test]
	fn camel_case_payload_fields() {
		let frame = Frame::new(
			"c1",
			FramePayload::CltChangesReceived {
				change_ids: vec!["t1".to_string()],
				last_lsn: "0/F".parse().unwrap(),
			},
		);
		let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["changeIds"][0], "t1");
		assert_eq!(json["lastLSN"], "0/F");
	}

	#[test]
	fn unrecognized_type_decodes_as_unknown() {
		let raw = serde_json::json!({
			"type": "clt_future_feature",
			"messageId": "m1",
			"timestamp": 0,
			"clientId": "c1",
			"whatever": true,
		});
		let frame: Frame = serde_json::from_value(raw).unwrap();
		assert!(matches!(frame.payload, FramePayload::Unknown));
	}

	#[test]
	fn optional_sequence_is_omitted_when_absent() {
		let frame = Frame::new(
			"c1",
			FramePayload::SrvSendChanges {
				changes: Vec::new(),
				last_lsn: Lsn::ZERO,
				sequence: None,
			},
		);
		let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["lastLSN"], "0/0");
		assert!(json.get("sequence").is_none());
	}
}
