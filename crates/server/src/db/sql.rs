//! SQL text builders for the apply and snapshot paths.
//!
//! Row payloads travel as one `jsonb` parameter and are expanded server-side
//! with `jsonb_populate_record(set)`, so statements never interpolate values.
//! Identifiers are quoted with the Postgres escaping rules; table names must
//! additionally be validated against the domain registry before any builder
//! here is called.

use postgres_protocol::escape::escape_identifier;

/// Multi-row upsert from a `jsonb` array parameter.
///
/// The CRDT trigger rejects stale rows, which then simply do not appear in
/// the `RETURNING` set.
#[must_use]
pub fn upsert_sql(table: &str, columns: &[String]) -> String {
	let t = escape_identifier(table);
	let cols = columns
		.iter()
		.map(|c| escape_identifier(c))
		.collect::<Vec<_>>()
		.join(", ");
	let sets = columns
		.iter()
		.filter(|c| c.as_str() != "id")
		.map(|c| {
			let c = escape_identifier(c);
			format!("{c} = EXCLUDED.{c}")
		})
		.collect::<Vec<_>>()
		.join(", ");
	// An id-only row has nothing to update on conflict.
	let conflict = if sets.is_empty() {
		"DO NOTHING".to_string()
	} else {
		format!("DO UPDATE SET {sets}")
	};
	format!(
		"INSERT INTO {t} ({cols}) \
		 SELECT {cols} FROM jsonb_populate_recordset(NULL::{t}, $1::jsonb) \
		 ON CONFLICT (\"id\") {conflict} \
		 RETURNING \"id\"::text"
	)
}

/// Single-row update from a `jsonb` object parameter.
#[must_use]
pub fn update_sql(table: &str, columns: &[String]) -> String {
	let t = escape_identifier(table);
	let sets = columns
		.iter()
		.filter(|c| c.as_str() != "id")
		.map(|c| {
			let c = escape_identifier(c);
			format!("{c} = r.{c}")
		})
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"UPDATE {t} AS t SET {sets} \
		 FROM jsonb_populate_record(NULL::{t}, $1::jsonb) AS r \
		 WHERE t.\"id\" = r.\"id\" \
		 RETURNING t.\"id\"::text"
	)
}

/// Single-row delete guarded by the row version.
///
/// Triggers cannot veto deletes the way they veto updates, so the
/// last-writer-wins guard lives in the `WHERE` clause.
#[must_use]
pub fn delete_sql(table: &str) -> String {
	let t = escape_identifier(table);
	format!(
		"DELETE FROM {t} \
		 WHERE \"id\"::text = $1 AND \"updated_at\" <= $2 \
		 RETURNING \"id\"::text"
	)
}

/// One snapshot page in primary-key order.
///
/// The cursor compares the textual form of the key so it totals across key
/// types; `ORDER BY` uses the same form to stay consistent with it.
#[must_use]
pub fn page_sql(table: &str, with_cursor: bool) -> String {
	let t = escape_identifier(table);
	let cursor = if with_cursor {
		" WHERE t.\"id\"::text > $1"
	} else {
		""
	};
	let limit = if with_cursor { "$2" } else { "$1" };
	format!(
		"SELECT to_jsonb(t) AS row, t.\"id\"::text AS id \
		 FROM {t} AS t{cursor} \
		 ORDER BY t.\"id\"::text \
		 LIMIT {limit}"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cols(names: &[&str]) -> Vec<String> {
		names.iter().map(|s| (*s).to_string()).collect()
	}

	#[test]
	fn upsert_covers_all_columns_and_excludes_id_from_set() {
		let sql = upsert_sql("task", &cols(&["id", "title", "updated_at"]));
		assert_eq!(
			sql,
			"INSERT INTO \"task\" (\"id\", \"title\", \"updated_at\") \
			 SELECT \"id\", \"title\", \"updated_at\" \
			 FROM jsonb_populate_recordset(NULL::\"task\", $1::jsonb) \
			 ON CONFLICT (\"id\") DO UPDATE SET \
			 \"title\" = EXCLUDED.\"title\", \"updated_at\" = EXCLUDED.\"updated_at\" \
			 RETURNING \"id\"::text"
		);
	}

	#[test]
	fn id_only_upsert_degrades_to_do_nothing() {
		let sql = upsert_sql("task", &cols(&["id"]));
		assert!(sql.contains("ON CONFLICT (\"id\") DO NOTHING"));
		assert!(!sql.contains("DO UPDATE"));
	}

	#[test]
	fn update_assigns_from_populated_record() {
		let sql = update_sql("task", &cols(&["id", "title"]));
		assert!(sql.contains("UPDATE \"task\" AS t SET \"title\" = r.\"title\""));
		assert!(sql.contains("WHERE t.\"id\" = r.\"id\""));
		assert!(sql.ends_with("RETURNING t.\"id\"::text"));
	}

	#[test]
	fn delete_guards_on_updated_at() {
		let sql = delete_sql("task");
		assert!(sql.contains("\"id\"::text = $1 AND \"updated_at\" <= $2"));
	}

	#[test]
	fn page_sql_switches_cursor_placeholder() {
		let first = page_sql("user", false);
		assert!(first.contains("LIMIT $1"));
		assert!(!first.contains("WHERE"));

		let rest = page_sql("user", true);
		assert!(rest.contains("WHERE t.\"id\"::text > $1"));
		assert!(rest.contains("LIMIT $2"));
	}

	#[test]
	fn identifiers_are_escaped() {
		let sql = delete_sql("weird\"table");
		assert!(sql.contains("\"weird\"\"table\""));
	}
}
