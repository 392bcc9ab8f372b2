//! Buffered priority queue (spec §4.1).
//!
//! A multi-writer, single-reader queue where each writer has a per-writer
//! credit limit and a priority class. The reader drains in strict priority
//! order (lowest numeric value first) and round-robins within a class, so
//! control messages, flow-control counters, and per-Flow data can all share
//! one output stream without one slow Flow starving the others.

mod cancel;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

pub use cancel::CancelToken;

/// Error returned by `Put`/`Get`/`Release` once the writer or queue has
/// closed, or the caller's cancel signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BqueueError {
    #[error("bqueue: operation cancelled")]
    Cancelled,
    #[error("bqueue: writer or queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BqueueError>;

/// Opaque identifier for a registered writer, returned by `Get` so the
/// reader can tell which logical writer (Flow, control channel, ...) the
/// batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

struct WriterState {
    priority: i32,
    /// Remaining credit in bytes. Ignored once `unlimited` is set.
    credit: i64,
    unlimited: bool,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    /// `Writer::Close()` was called: no more Puts will be accepted.
    writer_closed: bool,
}

impl WriterState {
    fn has_room(&self, len: usize) -> bool {
        self.unlimited || self.credit >= len as i64
    }

    fn is_drained(&self) -> bool {
        self.writer_closed && self.pending.is_empty()
    }
}

struct Inner {
    writers: HashMap<u64, WriterState>,
    /// Writer ids in registration order, grouped by priority class.
    order: BTreeMap<i32, Vec<u64>>,
    /// Round-robin cursor (index into `order[priority]`) per priority class.
    cursor: HashMap<i32, usize>,
    queue_closed: bool,
}

impl Inner {
    /// Picks the next ready writer (lowest priority number, round-robin
    /// within the class) and drains its whole pending batch.
    fn pop_ready(&mut self) -> Option<(WriterId, Vec<Bytes>)> {
        for (&priority, ids) in self.order.iter() {
            if ids.is_empty() {
                continue;
            }
            let start = self.cursor.get(&priority).copied().unwrap_or(0) % ids.len();
            for offset in 0..ids.len() {
                let idx = (start + offset) % ids.len();
                let id = ids[idx];
                let Some(state) = self.writers.get_mut(&id) else {
                    continue;
                };
                if state.pending.is_empty() {
                    continue;
                }
                let batch: Vec<Bytes> = state.pending.drain(..).collect();
                state.pending_bytes = 0;
                self.cursor.insert(priority, (idx + 1) % ids.len());
                return Some((WriterId(id), batch));
            }
        }
        None
    }

    fn all_drained(&self) -> bool {
        self.writers.values().all(|w| w.is_drained())
    }
}

/// The queue's reader half, plus the means to register writers.
#[derive(Clone)]
pub struct BQueue {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    writer_ready: Arc<Notify>,
    credit_ready: Arc<Notify>,
}

impl BQueue {
    pub fn new() -> Self {
        BQueue {
            inner: Arc::new(Mutex::new(Inner {
                writers: HashMap::new(),
                order: BTreeMap::new(),
                cursor: HashMap::new(),
                queue_closed: false,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            writer_ready: Arc::new(Notify::new()),
            credit_ready: Arc::new(Notify::new()),
        }
    }

    /// Allocates a logical writer with an independent credit allowance and
    /// priority class (lower numeric value is drained first).
    pub fn new_writer(&self, priority: i32, credit: i64) -> Writer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            inner.writers.insert(
                id,
                WriterState {
                    priority,
                    credit,
                    unlimited: credit < 0,
                    pending: VecDeque::new(),
                    pending_bytes: 0,
                    writer_closed: false,
                },
            );
            inner.order.entry(priority).or_default().push(id);
        }
        Writer {
            id,
            queue: self.clone(),
        }
    }

    /// Returns one ready writer and its coalesced pending batch, in
    /// priority then round-robin order. Blocks if nothing is ready.
    ///
    /// Registers interest on `writer_ready` with `enable()` before dropping
    /// the lock on each iteration: `notify_waiters()` (in `put`/`close`)
    /// only wakes listeners already registered, so a notification landing
    /// between the under-lock check and a bare `notified().await` would
    /// otherwise be lost and the reader would park with a ready item
    /// stranded (spec §4.4 half-close flag sitting unsent).
    pub async fn get(&self, cancel: &CancelToken) -> Result<(WriterId, Vec<Bytes>)> {
        let notified = self.writer_ready.notified();
        tokio::pin!(notified);
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(ready) = inner.pop_ready() {
                    return Ok(ready);
                }
                if inner.queue_closed && inner.all_drained() {
                    return Err(BqueueError::Closed);
                }
                notified.as_mut().enable();
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BqueueError::Cancelled),
                _ = notified.as_mut() => {
                    notified.set(self.writer_ready.notified());
                }
            }
        }
    }

    /// Closes the queue: no further writers may be registered, and `Get`
    /// drains remaining items before reporting `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.queue_closed = true;
        drop(inner);
        self.writer_ready.notify_waiters();
    }

    pub fn is_drained(&self) -> bool {
        self.inner.lock().all_drained()
    }
}

impl Default for BQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A single writer's handle into a `BQueue`.
#[derive(Clone)]
pub struct Writer {
    id: u64,
    queue: BQueue,
}

impl Writer {
    /// Enqueues `data`. Blocks while the writer has zero credit and no
    /// `Release` has arrived; fails with `Cancelled` if `cancel` fires
    /// first, and `Closed` if the writer or queue has closed.
    ///
    /// Same `enable()`-before-unlock discipline as `BQueue::get`: a
    /// `release`/`close` that fires `credit_ready.notify_waiters()` right
    /// after this loop drops the lock but before it starts waiting must
    /// not be lost, or the writer would stay parked past the credit that
    /// unblocks it.
    pub async fn put(&self, data: Bytes, cancel: &CancelToken) -> Result<()> {
        let notified = self.queue.credit_ready.notified();
        tokio::pin!(notified);
        loop {
            {
                let mut inner = self.queue.inner.lock();
                let closed = inner.queue_closed;
                let Some(state) = inner.writers.get_mut(&self.id) else {
                    return Err(BqueueError::Closed);
                };
                if closed || state.writer_closed {
                    return Err(BqueueError::Closed);
                }
                if state.has_room(data.len()) {
                    if !state.unlimited {
                        state.credit -= data.len() as i64;
                    }
                    state.pending_bytes += data.len();
                    state.pending.push_back(data);
                    drop(inner);
                    self.queue.writer_ready.notify_waiters();
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BqueueError::Cancelled),
                _ = notified.as_mut() => {
                    notified.set(self.queue.credit_ready.notified());
                }
            }
        }
    }

    /// Adds `n` credits. A negative `n` disables flow control for this
    /// writer permanently (used by control queues that must never block).
    pub fn release(&self, n: i64) {
        let mut inner = self.queue.inner.lock();
        if let Some(state) = inner.writers.get_mut(&self.id) {
            if n < 0 {
                state.unlimited = true;
            } else {
                state.credit = state.credit.saturating_add(n);
            }
        }
        drop(inner);
        self.queue.credit_ready.notify_waiters();
    }

    /// Signals no more writes are coming from this writer.
    pub fn close(&self) {
        let mut inner = self.queue.inner.lock();
        if let Some(state) = inner.writers.get_mut(&self.id) {
            state.writer_closed = true;
        }
        drop(inner);
        self.queue.writer_ready.notify_waiters();
    }

    pub fn is_drained(&self) -> bool {
        self.queue
            .inner
            .lock()
            .writers
            .get(&self.id)
            .map(WriterState::is_drained)
            .unwrap_or(true)
    }

    pub fn id(&self) -> WriterId {
        WriterId(self.id)
    }
}
