//! Per-endpoint admission state: the concurrency quotas, FIFO wait
//! queues, and admission/release algorithm from the dispatcher's core
//! design. One `EndpointState` exists per distinct `EndpointKey`,
//! created lazily on first request and never torn down (endpoints are
//! cheap, and request volume per distinct host is typically bounded).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use crate::operation::RequestClass;
use crate::worker::{PoolConfig, WorkerPool};

/// A queued waiter: released (its oneshot fires) once a slot of the
/// right class frees up, in strict FIFO order.
struct Waiter {
    class: RequestClass,
    notify: oneshot::Sender<()>,
}

struct Counts {
    /// Currently running requests, by class.
    running: [usize; 2],
    waiters: VecDeque<Waiter>,
    last_activity: Instant,
}

/// Per-endpoint concurrency quotas, wait queue, and the dedicated worker
/// pool that runs admitted operations against this endpoint.
///
/// Admission rule: `max_concurrent` bounds total in-flight
/// requests to the endpoint; `max_long` additionally bounds how many of
/// those may be `Long` class, so a burst of long-lived requests can
/// never starve `Short` traffic out of every slot — at least
/// `max_concurrent - max_long` slots are always `Short`-reachable.
///
/// Each endpoint gets its own `WorkerPool` rather than sharing one across
/// every endpoint the dispatcher talks to: a worker occupies its job slot
/// for the operation's entire lifetime, including any time spent waiting
/// for admission, so a shared pool would let one busy endpoint's backlog
/// starve workers away from an otherwise-idle endpoint.
pub struct EndpointState {
    max_concurrent: usize,
    max_long: usize,
    counts: Mutex<Counts>,
    pool: Arc<WorkerPool>,
}

impl EndpointState {
    pub fn new(max_concurrent: usize, max_long: usize, pool_config: PoolConfig) -> Self {
        Self {
            max_concurrent,
            max_long: max_long.min(max_concurrent),
            counts: Mutex::new(Counts {
                running: [0, 0],
                waiters: VecDeque::new(),
                last_activity: Instant::now(),
            }),
            pool: Arc::new(WorkerPool::new(pool_config)),
        }
    }

    /// This endpoint's dedicated worker pool.
    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    fn total_running(counts: &Counts) -> usize {
        counts.running[RequestClass::Short.index()] + counts.running[RequestClass::Long.index()]
    }

    fn can_admit(&self, counts: &Counts, class: RequestClass) -> bool {
        if Self::total_running(counts) >= self.max_concurrent {
            return false;
        }
        if class == RequestClass::Long && counts.running[RequestClass::Long.index()] >= self.max_long
        {
            return false;
        }
        true
    }

    /// Try to admit immediately. On success, the class's running count is
    /// incremented and the caller owns a slot until `release` is called.
    /// On failure, the caller is enqueued in FIFO order and the returned
    /// receiver resolves once a slot opens for it.
    pub fn admit_or_wait(&self, class: RequestClass) -> AdmitOutcome {
        let mut counts = self.counts.lock().unwrap();
        counts.last_activity = Instant::now();

        if counts.waiters.is_empty() && self.can_admit(&counts, class) {
            counts.running[class.index()] += 1;
            trace!(class = ?class, "admitted immediately");
            return AdmitOutcome::Admitted;
        }

        let (tx, rx) = oneshot::channel();
        counts.waiters.push_back(Waiter { class, notify: tx });
        AdmitOutcome::Queued(rx)
    }

    /// Non-blocking probe used by `is_long_request_allowed`: would a
    /// `Long` request be admitted right now, with no side effects.
    pub fn would_admit_long(&self) -> bool {
        let counts = self.counts.lock().unwrap();
        counts.waiters.is_empty() && self.can_admit(&counts, RequestClass::Long)
    }

    /// Fail-fast admission for `dispatch_long`: admits immediately and
    /// returns `true` if the endpoint's long quota has room right now,
    /// otherwise returns `false` with no side effects. Unlike
    /// `admit_or_wait`, a `Long` request that can't be admitted is never
    /// enqueued — the caller gets `ResourceExhausted` synchronously instead.
    pub fn try_admit_long(&self) -> bool {
        let mut counts = self.counts.lock().unwrap();
        counts.last_activity = Instant::now();
        if counts.waiters.is_empty() && self.can_admit(&counts, RequestClass::Long) {
            counts.running[RequestClass::Long.index()] += 1;
            true
        } else {
            false
        }
    }

    /// Release a slot previously obtained via `admit_or_wait`, waking the
    /// next eligible FIFO waiter(s) whose class now fits.
    pub fn release(&self, class: RequestClass) {
        let mut counts = self.counts.lock().unwrap();
        counts.running[class.index()] = counts.running[class.index()].saturating_sub(1);
        counts.last_activity = Instant::now();
        self.drain_waiters(&mut counts);
    }

    /// Drop every queued waiter without admitting them. Each waiter's
    /// `oneshot::Receiver` then resolves to a closed-channel error, which
    /// `run_operation` treats as `GatekeeperError::ShuttingDown`. Used by
    /// `UrlDispatcher::shutdown` so queued operations fail instead of
    /// waiting forever on a pool that will never take them.
    pub fn drain_waiters_for_shutdown(&self) {
        self.counts.lock().unwrap().waiters.clear();
    }

    fn drain_waiters(&self, counts: &mut Counts) {
        loop {
            let Some(front) = counts.waiters.front() else {
                return;
            };
            if front.notify.is_closed() {
                counts.waiters.pop_front();
                continue;
            }
            if !self.can_admit(counts, front.class) {
                return;
            }
            let waiter = counts.waiters.pop_front().unwrap();
            counts.running[waiter.class.index()] += 1;
            let _ = waiter.notify.send(());
        }
    }

    pub fn idle_since(&self) -> Instant {
        self.counts.lock().unwrap().last_activity
    }

    pub fn running_count(&self, class: RequestClass) -> usize {
        self.counts.lock().unwrap().running[class.index()]
    }

    pub fn waiting_count(&self) -> usize {
        self.counts.lock().unwrap().waiters.len()
    }
}

pub enum AdmitOutcome {
    Admitted,
    Queued(oneshot::Receiver<()>),
}
