//! Frame correlation: typed queues plus filtered waiters.
//!
//! Drivers block on "the next `clt_init_received` for table X chunk N" while
//! the session actor keeps routing unrelated frames. The correlator owns one
//! bounded queue per frame type and a list of pending waiters; an inbound
//! frame resolves the first waiter whose filter matches, otherwise it is
//! queued. A waiter created while a matching frame sits queued is satisfied
//! synchronously. Transport close cancels every outstanding waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tabsync_proto::{Frame, FrameKind};
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};

type FrameFilter = Box<dyn Fn(&Frame) -> bool + Send>;

struct Waiter {
	id: u64,
	filter: FrameFilter,
	tx: oneshot::Sender<Frame>,
}

#[derive(Default)]
struct Inner {
	queues: HashMap<FrameKind, VecDeque<Frame>>,
	waiters: HashMap<FrameKind, Vec<Waiter>>,
	next_waiter_id: u64,
	closed: bool,
}

/// Per-session frame correlator.
pub struct Correlator {
	inner: Mutex<Inner>,
	queue_capacity: usize,
}

impl Correlator {
	/// Create a correlator whose per-type queues hold at most `queue_capacity`
	/// frames. On overflow the oldest frame is dropped with a warning.
	#[must_use]
	pub fn new(queue_capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			queue_capacity,
		}
	}

	/// Route an inbound frame to the first matching waiter, or queue it.
	pub fn offer(&self, frame: Frame) {
		let mut inner = self.inner.lock().unwrap();
		if inner.closed {
			return;
		}

		let kind = frame.payload.kind();
		let mut frame = frame;
		if let Some(waiters) = inner.waiters.get_mut(&kind) {
			while let Some(pos) = waiters.iter().position(|w| (w.filter)(&frame)) {
				let waiter = waiters.remove(pos);
				match waiter.tx.send(frame) {
					Ok(()) => return,
					// Waiter timed out between filter match and delivery;
					// recover the frame and try the next one.
					Err(returned) => frame = returned,
				}
			}
		}

		let queue = inner.queues.entry(kind).or_default();
		if queue.len() >= self.queue_capacity {
			queue.pop_front();
			tracing::warn!(kind = %kind, "frame queue overflow, dropping oldest");
		}
		queue.push_back(frame);
	}

	/// Wait for a frame of `kind` matching `filter`, up to `timeout`.
	///
	/// Frames already queued for `kind` are scanned first; the first match is
	/// consumed synchronously. Returns [`SyncError::AckTimeout`] when the
	/// deadline passes and [`SyncError::Transport`] when the correlator is
	/// closed while waiting.
	pub async fn wait_for(
		&self,
		kind: FrameKind,
		filter: impl Fn(&Frame) -> bool + Send + 'static,
		timeout: Duration,
	) -> Result<Frame> {
		let (waiter_id, rx) = {
			let mut inner = self.inner.lock().unwrap();
			if inner.closed {
				return Err(SyncError::Transport("session closed".to_string()));
			}

			if let Some(queue) = inner.queues.get_mut(&kind)
				&& let Some(pos) = queue.iter().position(&filter)
			{
				let frame = queue.remove(pos).unwrap();
				return Ok(frame);
			}

			let (tx, rx) = oneshot::channel();
			inner.next_waiter_id += 1;
			let waiter_id = inner.next_waiter_id;
			inner.waiters.entry(kind).or_default().push(Waiter {
				id: waiter_id,
				filter: Box::new(filter),
				tx,
			});
			(waiter_id, rx)
		};

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(frame)) => Ok(frame),
			Ok(Err(_)) => Err(SyncError::Transport("session closed".to_string())),
			Err(_) => {
				let mut inner = self.inner.lock().unwrap();
				if let Some(waiters) = inner.waiters.get_mut(&kind) {
					waiters.retain(|w| w.id != waiter_id);
				}
				Err(SyncError::AckTimeout(kind))
			}
		}
	}

	/// Cancel all outstanding waiters and drop queued frames.
	///
	/// Subsequent `offer` calls are ignored and subsequent `wait_for` calls
	/// fail immediately.
	pub fn close(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.closed = true;
		inner.waiters.clear();
		inner.queues.clear();
	}
}
