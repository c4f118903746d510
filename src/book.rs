use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::protocol::Reply;
use crate::registry::Addr;

/// Completion hook supplied by the caller at dispatch.
pub type Callback = Box<dyn FnOnce(Reply) + Send + 'static>;

/// Process-wide monotonically increasing request identifier.
pub fn next_request_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

enum RequestState {
    Open,
    Cancelled,
}

struct RequestRecord {
    state: RequestState,
    addr: Addr,
    callback: Option<Callback>,
}

/// Outcome of resolving a request id against the book.
pub enum Settled {
    /// The request was open: the record is gone and the callback (if
    /// any) is returned. The caller invokes it and then calls
    /// [`RequestBook::release`], so callbacks always run before the
    /// barrier can let `poll` return.
    Completed {
        addr: Addr,
        callback: Option<Callback>,
    },
    /// The request was cancelled by a timeout; its callback already ran.
    /// The record is erased and the reply must be dropped.
    Cancelled,
    /// No record exists for this id.
    Unknown,
}

/// Tracks in-flight requests and provides the batch completion barrier.
///
/// `pending` counts open requests and is published through a watch
/// channel; the barrier releases when it reaches zero. Cancellation is
/// the only failure path that decrements: a reply or error arriving for
/// a cancelled id erases the record without touching the count, so the
/// barrier can never release twice for one request.
pub struct RequestBook {
    inner: Mutex<BookInner>,
    pending_tx: watch::Sender<usize>,
}

struct BookInner {
    records: HashMap<u64, RequestRecord>,
    pending: usize,
}

impl Default for RequestBook {
    fn default() -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(BookInner {
                records: HashMap::new(),
                pending: 0,
            }),
            pending_tx,
        }
    }
}

impl RequestBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open request.
    pub fn begin(&self, id: u64, addr: Addr, callback: Option<Callback>) {
        let mut inner = self.inner.lock();
        inner.records.insert(
            id,
            RequestRecord {
                state: RequestState::Open,
                addr,
                callback,
            },
        );
        inner.pending += 1;
        self.pending_tx.send_replace(inner.pending);
    }

    /// Resolve a reply or connection error for `id`. A completed
    /// request's barrier slot stays held until [`RequestBook::release`].
    pub fn resolve(&self, id: u64) -> Settled {
        let mut inner = self.inner.lock();
        match inner.records.remove(&id) {
            Some(RequestRecord {
                state: RequestState::Open,
                addr,
                callback,
            }) => Settled::Completed { addr, callback },
            Some(RequestRecord {
                state: RequestState::Cancelled,
                ..
            }) => Settled::Cancelled,
            None => Settled::Unknown,
        }
    }

    /// Release the barrier slot of a resolved request.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        self.pending_tx.send_replace(inner.pending);
    }

    /// Flip every open request to cancelled, releasing the barrier.
    /// Returns each request's address and callback for the caller to
    /// mark down and notify.
    pub fn cancel_open(&self) -> Vec<(u64, Addr, Option<Callback>)> {
        let mut inner = self.inner.lock();
        let mut cancelled = Vec::new();
        for (id, record) in inner.records.iter_mut() {
            if matches!(record.state, RequestState::Open) {
                record.state = RequestState::Cancelled;
                cancelled.push((*id, record.addr.clone(), record.callback.take()));
            }
        }
        inner.pending -= cancelled.len();
        self.pending_tx.send_replace(inner.pending);
        cancelled
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Subscribe to pending-count changes; the barrier is the transition
    /// to zero.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }
}
