//! `TimerService`: one process-wide scheduler behind a lazily-initialized
//! singleton, used by the dispatcher to enforce request timeouts and by
//! the worker pool to check idle workers for reclamation.
//!
//! A real wheel timer (`tokio::time::sleep` per-entry) would be more
//! precise, but this models a single coarse-grained run loop that wakes
//! on a fixed interval (or sooner, if a nearer deadline is scheduled)
//! and fires everything due — cheap to reason about, and coalesces many
//! near-simultaneous timeouts into one wake. Firing a callback that
//! panics must not kill the loop, so each fire is wrapped in
//! `catch_unwind`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, trace};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Entry {
    id: u64,
    deadline: Instant,
    seq: u64,
    owner: u64,
    action: Action,
}

/// Ordering key used by the heap: earliest deadline first, insertion
/// order breaks ties so same-deadline timers fire in schedule order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey(Instant, u64, u64);

enum Command {
    Schedule(Entry),
    Cancel(u64),
    CancelMatching(u64),
    Shutdown,
}

/// Handle to a scheduled timer. Dropping it does *not* cancel the timer;
/// call `cancel` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

pub struct TimerService {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

static INSTANCE: OnceLock<TimerService> = OnceLock::new();

impl TimerService {
    /// The process-wide instance, constructed on first access with the
    /// default 5s wake interval.
    pub fn global() -> &'static TimerService {
        Self::global_with_wake_interval(Duration::from_secs(5))
    }

    /// Like `global`, but lets the first caller in the process pick the
    /// wake interval. Only takes effect on the call that wins the
    /// `OnceLock` race; later callers (with a different interval) just
    /// get the already-running instance, consistent with this being a
    /// genuine process-wide singleton rather than a per-caller config.
    pub fn global_with_wake_interval(wake_interval: Duration) -> &'static TimerService {
        INSTANCE.get_or_init(|| TimerService::start(wake_interval))
    }

    fn start(wake_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(rx, wake_interval));
        Self {
            tx,
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Schedule `action` to run after `delay`, tagged with `owner` (an
    /// opaque caller-chosen id). Returns a handle usable with `cancel`, and
    /// `owner` is later usable with `cancel_matching` to cancel every
    /// still-pending entry sharing that tag in one call. The action runs
    /// on the timer's background task, so it must not block; spawn onto
    /// the worker pool for real work.
    pub fn schedule_after<F>(&self, delay: Duration, owner: u64, action: F) -> TimerHandle
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            deadline: Instant::now() + delay,
            seq,
            owner,
            action: Box::new(action),
        };
        // The background task only stops if the service itself is being
        // torn down process-wide (never, in practice); a send failure is
        // not actionable here.
        let _ = self.tx.send(Command::Schedule(entry));
        TimerHandle(id)
    }

    /// Cancel a previously scheduled timer. A no-op if it already fired
    /// or was already cancelled.
    pub fn cancel(&self, handle: TimerHandle) {
        let _ = self.tx.send(Command::Cancel(handle.0));
    }

    /// Cancel every still-pending timer scheduled with the given `owner`
    /// tag. Fire-and-forget, like `cancel` — entries that already fired
    /// are simply not found and ignored.
    pub fn cancel_matching(&self, owner: u64) {
        let _ = self.tx.send(Command::CancelMatching(owner));
    }

    /// Stop the background run loop. Pending timers never fire. Intended
    /// for tests and clean process shutdown; the process-wide singleton
    /// is not expected to be restarted afterward.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Command>, wake_interval: Duration) {
    let mut heap: BinaryHeap<Reverse<OrderKey>> = BinaryHeap::new();
    let mut entries: HashMap<u64, Entry> = HashMap::new();

    loop {
        let now = Instant::now();
        loop {
            let due = match heap.peek() {
                Some(Reverse(OrderKey(deadline, _, _))) if *deadline <= now => true,
                _ => false,
            };
            if !due {
                break;
            }
            let Reverse(OrderKey(_, _, id)) = heap.pop().unwrap();
            if let Some(entry) = entries.remove(&id) {
                fire(entry).await;
            }
        }

        let sleep_for = heap
            .peek()
            .map(|Reverse(OrderKey(deadline, _, _))| deadline.saturating_duration_since(now))
            .unwrap_or(wake_interval)
            .min(wake_interval);

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Schedule(entry)) => {
                        heap.push(Reverse(OrderKey(entry.deadline, entry.seq, entry.id)));
                        entries.insert(entry.id, entry);
                    }
                    Some(Command::Cancel(id)) => {
                        entries.remove(&id);
                    }
                    Some(Command::CancelMatching(owner)) => {
                        entries.retain(|_, entry| entry.owner != owner);
                    }
                    Some(Command::Shutdown) | None => return,
                }
            }
        }
    }
}

async fn fire(entry: Entry) {
    if crate::logging::filter().is_enabled(crate::logging::Source::Timer) {
        trace!(timer_id = entry.id, "timer fired");
    }
    let fut = AssertUnwindSafe((entry.action)());
    if let Err(panic) = fut.catch_unwind().await {
        error!(timer_id = entry.id, ?panic, "timer action panicked");
    }
}
