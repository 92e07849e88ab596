//! Value types carried inside sync frames.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

/// Operation kind for a logical table change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
	/// Row creation; applied as an upsert on the receiving side.
	Insert,
	/// Row mutation.
	Update,
	/// Row removal.
	Delete,
}

impl ChangeOp {
	/// The wire name of the operation.
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Insert => "insert",
			Self::Update => "update",
			Self::Delete => "delete",
		}
	}
}

impl std::str::FromStr for ChangeOp {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"insert" => Ok(Self::Insert),
			"update" => Ok(Self::Update),
			"delete" => Ok(Self::Delete),
			other => Err(format!("unknown change op `{other}`")),
		}
	}
}

/// Phase of a client's sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncPhase {
	/// Bulk baseline load for a fresh client.
	Initial,
	/// Replaying committed changes the client missed.
	Catchup,
	/// Tailing the change feed as changes arrive.
	Live,
}

impl fmt::Display for SyncPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Initial => "INITIAL",
			Self::Catchup => "CATCHUP",
			Self::Live => "LIVE",
		};
		f.write_str(s)
	}
}

/// A logical change to one row of a domain table.
///
/// `data` holds the full row as a JSON object; schemas vary per table, so the
/// columns are not modeled statically. `data["id"]` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableChange {
	/// Domain table the row belongs to.
	pub table: String,
	/// Operation kind.
	pub op: ChangeOp,
	/// Full row content keyed by column name.
	pub data: serde_json::Map<String, serde_json::Value>,
	/// Row version used for last-writer-wins comparison.
	///
	/// Clients are not required to set this at the top level; when absent the
	/// `updated_at` column inside `data` is consulted instead.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
	/// Log position the change was committed at, when known.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub lsn: Option<Lsn>,
}

impl TableChange {
	/// The row's primary key, if `data` carries one.
	#[must_use]
	pub fn id(&self) -> Option<&str> {
		self.data.get("id").and_then(|v| v.as_str())
	}

	/// The row version used for last-writer-wins comparison.
	///
	/// Prefers the top-level `updated_at`, falling back to the `updated_at`
	/// column inside `data`. Rows with no parseable version compare as the
	/// epoch, i.e. they lose every conflict.
	#[must_use]
	pub fn effective_updated_at(&self) -> DateTime<Utc> {
		if let Some(ts) = self.updated_at {
			return ts;
		}
		self.data
			.get("updated_at")
			.and_then(|v| v.as_str())
			.and_then(parse_timestamp)
			.unwrap_or(DateTime::UNIX_EPOCH)
	}
}

/// Parse a row timestamp, tolerating date-only values clients sometimes send.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
	if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
		return Some(ts.with_timezone(&Utc));
	}
	let date: NaiveDate = s.parse().ok()?;
	Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Position of an initial-sync chunk within its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSequence {
	/// Table the chunk belongs to.
	pub table: String,
	/// 1-based chunk number within the table.
	pub chunk: u32,
	/// Cumulative row count shipped for the table, including this chunk.
	pub total: u64,
}

/// Position of a change batch within a multi-batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSequence {
	/// 1-based batch number.
	pub chunk: u32,
	/// Total batches in the send, when known.
	pub total: u32,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn change(data: serde_json::Value) -> TableChange {
		TableChange {
			table: "task".to_string(),
			op: ChangeOp::Update,
			data: data.as_object().unwrap().clone(),
			updated_at: None,
			lsn: None,
		}
	}

	#[test]
	fn effective_updated_at_falls_back_to_data_column() {
		let c = change(serde_json::json!({
			"id": "t1",
			"updated_at": "2024-02-01T00:00:00Z",
		}));
		assert_eq!(
			c.effective_updated_at(),
			"2024-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
		);
	}

	#[test]
	fn effective_updated_at_tolerates_date_only_values() {
		let c = change(serde_json::json!({ "id": "t1", "updated_at": "2023-12-31" }));
		assert_eq!(
			c.effective_updated_at(),
			"2023-12-31T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
		);
	}

	#[test]
	fn missing_version_loses_every_conflict() {
		let c = change(serde_json::json!({ "id": "t1" }));
		assert_eq!(c.effective_updated_at(), DateTime::UNIX_EPOCH);
	}

	#[test]
	fn sync_phase_wire_names_are_uppercase() {
		assert_eq!(serde_json::to_string(&SyncPhase::Live).unwrap(), "\"LIVE\"");
		assert_eq!(SyncPhase::Catchup.to_string(), "CATCHUP");
	}
}
