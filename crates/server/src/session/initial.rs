//! Initial sync driver: ship a consistent baseline to a fresh client.
//!
//! Tables are walked parents-first; each table is paged by primary key and
//! shipped as acknowledged chunks. The cursor is persisted after every ack,
//! so a disconnect resumes at the next chunk of the same table and completed
//! tables are never re-shipped. The snapshot baseline LSN is captured once,
//! before the first chunk, and survives reconnects with the cursor.

use chrono::Utc;
use tabsync_proto::{ChangeOp, Frame, FrameKind, FramePayload, InitSequence, TableChange};

use super::WorkflowCtx;
use crate::db::{ChangeFeed, DomainTables};
use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::progress::{InitialSyncProgress, InitialSyncStatus};

pub(crate) async fn run(ctx: &WorkflowCtx) -> Result<()> {
	let tables = ctx.tables.list_tables().await?;
	if let Some(bad) = tables.iter().find(|t| !t.ordered_pk) {
		return Err(SyncError::InvalidArgument(format!(
			"table {} has no stable primary-key order and cannot be snapshot",
			bad.name
		)));
	}

	let mut progress = match ctx.progress.initial_progress().await? {
		Some(p) if p.status == InitialSyncStatus::InProgress => {
			tracing::info!(
				client_id = %ctx.client_id,
				start_lsn = %p.start_lsn,
				table = ?p.current_table,
				chunk = p.last_acked_chunk,
				"resuming initial sync"
			);
			ctx.sink.send(FramePayload::SrvInitStart {
				server_lsn: p.start_lsn,
			})?;
			p
		}
		_ => {
			let start_lsn = ctx.feed.current_server_lsn().await?;
			let p = InitialSyncProgress::begin(start_lsn, Utc::now().timestamp_millis());
			ctx.progress.set_initial_progress(&p).await?;
			tracing::info!(client_id = %ctx.client_id, start_lsn = %start_lsn, "starting initial sync");
			ctx.sink
				.send(FramePayload::SrvInitStart { server_lsn: start_lsn })?;
			p
		}
	};

	for table in &tables {
		if progress.completed_tables.contains(&table.name) {
			continue;
		}
		ship_table(ctx, &table.name, &mut progress).await?;

		progress.completed_tables.push(table.name.clone());
		progress.current_table = None;
		progress.last_acked_chunk = 0;
		progress.cursor = None;
		ctx.progress.set_initial_progress(&progress).await?;
	}

	ctx.sink.send(FramePayload::SrvInitComplete {
		server_lsn: progress.start_lsn,
	})?;
	ctx.correlator
		.wait_for(FrameKind::CltInitProcessed, |_| true, ctx.config.frame_wait)
		.await?;

	progress.status = InitialSyncStatus::Complete;
	ctx.progress.set_initial_progress(&progress).await?;

	let server_lsn = ctx.feed.current_server_lsn().await?;
	ctx.progress.set_client_lsn(server_lsn).await?;
	ctx.registry.set_lsn(&ctx.client_id, server_lsn);
	ctx.sink.send(FramePayload::SrvLsnUpdate { lsn: server_lsn })?;

	tracing::info!(
		client_id = %ctx.client_id,
		start_lsn = %progress.start_lsn,
		server_lsn = %server_lsn,
		"initial sync complete"
	);
	Ok(())
}

/// Ship one table's remaining chunks, blocking on each ack.
async fn ship_table(
	ctx: &WorkflowCtx,
	table: &str,
	progress: &mut InitialSyncProgress,
) -> Result<()> {
	let resuming = progress.current_table.as_deref() == Some(table);
	let mut chunk_no = if resuming { progress.last_acked_chunk } else { 0 };
	let mut cursor = if resuming { progress.cursor.clone() } else { None };
	// Only the final chunk of a table can be partial, so the resumed row
	// count is exact for every already-acked chunk.
	let mut shipped = u64::from(chunk_no) * ctx.config.chunk_size as u64;

	if !resuming {
		progress.current_table = Some(table.to_string());
		progress.last_acked_chunk = 0;
		progress.cursor = None;
		ctx.progress.set_initial_progress(progress).await?;
	}

	loop {
		let (rows, exhausted) = assemble_chunk(ctx, table, &mut cursor).await?;
		if rows.is_empty() {
			return Ok(());
		}

		chunk_no += 1;
		shipped += rows.len() as u64;
		Metrics::add(&ctx.metrics.changes_shipped, rows.len() as u64);
		ctx.sink.send(FramePayload::SrvInitChanges {
			changes: rows,
			sequence: InitSequence {
				table: table.to_string(),
				chunk: chunk_no,
				total: shipped,
			},
		})?;

		let want_table = table.to_string();
		let want_chunk = chunk_no;
		ctx.correlator
			.wait_for(
				FrameKind::CltInitReceived,
				move |f: &Frame| {
					matches!(
						&f.payload,
						FramePayload::CltInitReceived { table, chunk }
							if *table == want_table && *chunk == want_chunk
					)
				},
				ctx.config.frame_wait,
			)
			.await?;

		progress.current_table = Some(table.to_string());
		progress.last_acked_chunk = chunk_no;
		progress.cursor = cursor.clone();
		ctx.progress.set_initial_progress(progress).await?;

		if exhausted {
			return Ok(());
		}
	}
}

/// Assemble one wire chunk from database pages starting at `cursor`.
///
/// Returns the chunk and whether the table is exhausted behind it.
async fn assemble_chunk(
	ctx: &WorkflowCtx,
	table: &str,
	cursor: &mut Option<String>,
) -> Result<(Vec<TableChange>, bool)> {
	let mut changes = Vec::new();
	let mut exhausted = false;

	while changes.len() < ctx.config.chunk_size {
		let want = (ctx.config.chunk_size - changes.len()).min(ctx.config.page_size);
		let page = ctx.tables.page(table, cursor.as_deref(), want).await?;
		if let Some(next) = &page.next_after_id {
			*cursor = Some(next.clone());
		}
		for data in page.rows {
			changes.push(snapshot_change(table, data));
		}
		if !page.has_more {
			exhausted = true;
			break;
		}
	}
	Ok((changes, exhausted))
}

/// Wrap a snapshot row as an insert-or-update change carrying its row version.
fn snapshot_change(table: &str, data: serde_json::Map<String, serde_json::Value>) -> TableChange {
	let mut change = TableChange {
		table: table.to_string(),
		op: ChangeOp::Update,
		data,
		updated_at: None,
		lsn: None,
	};
	change.updated_at = Some(change.effective_updated_at());
	change
}
