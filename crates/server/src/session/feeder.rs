//! Catchup and live feeding from the change feed.
//!
//! A feed pass drains everything past the client's acknowledged position in
//! chunked, interlocked batches: dedupe per `(table, id)`, reorder for the
//! hierarchy, send, block on the matching ack, persist the new position. In
//! CATCHUP the pass runs once and returns so the workflow can transition; in
//! LIVE the loop parks until a notification or heartbeat tick.

use tabsync_proto::{Frame, FrameKind, FramePayload};

use super::WorkflowCtx;
use crate::db::{ChangeFeed, DomainTables};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::order;

/// Drain the feed once, then return so the caller can go LIVE.
pub(crate) async fn run_catchup(ctx: &WorkflowCtx) -> Result<()> {
	let shipped = feed_pass(ctx).await?;
	tracing::debug!(client_id = %ctx.client_id, shipped, "catchup pass complete");
	Ok(())
}

/// Tail the feed until the workflow is cancelled.
pub(crate) async fn run_live(ctx: &WorkflowCtx) -> Result<()> {
	loop {
		feed_pass(ctx).await?;
		tokio::select! {
			() = ctx.notify.notified() => {}
			() = tokio::time::sleep(ctx.config.live_tick) => {
				ctx.sink.send(FramePayload::SrvHeartbeat)?;
			}
			() = ctx.cancel.cancelled() => return Ok(()),
		}
	}
}

/// Ship every change past the client's position, one acked batch at a time.
///
/// Returns the number of changes shipped. Only acknowledged positions are
/// persisted, so a failure anywhere re-sends from the last ack on the next
/// pass, which the client merges idempotently.
pub(crate) async fn feed_pass(ctx: &WorkflowCtx) -> Result<u64> {
	let tables = ctx.tables.list_tables().await?;
	let levels = order::level_map(&tables);
	let mut total = 0u64;

	loop {
		let since = ctx.progress.client_lsn().await?;
		let page = ctx.feed.changes_since(since, ctx.config.chunk_size).await?;
		if page.items.is_empty() {
			return Ok(total);
		}

		let mut changes = order::dedupe_latest(page.items);
		order::order_changes(&mut changes, &levels);
		let last_lsn = changes.iter().filter_map(|c| c.lsn).max().unwrap_or(since);

		let count = changes.len() as u64;
		ctx.sink.send(FramePayload::SrvSendChanges {
			changes,
			last_lsn,
			sequence: None,
		})?;

		let want = last_lsn;
		ctx.correlator
			.wait_for(
				FrameKind::CltChangesReceived,
				move |f: &Frame| {
					matches!(
						&f.payload,
						FramePayload::CltChangesReceived { last_lsn, .. } if *last_lsn == want
					)
				},
				ctx.config.frame_wait,
			)
			.await?;

		ctx.progress.set_client_lsn(last_lsn).await?;
		ctx.registry.set_lsn(&ctx.client_id, last_lsn);
		Metrics::add(&ctx.metrics.changes_shipped, count);
		total += count;

		if !page.has_more {
			return Ok(total);
		}
	}
}
