//! Generic bounded worker pool.
//!
//! Workers are tasks, not OS threads, grown lazily up to `size` as jobs
//! arrive, and reclaimed after sitting idle past `idle_timeout`. All
//! workers pull from one shared queue (work-conserving: no job waits
//! behind an idle worker while another is busy). A job that panics is
//! caught and logged; the worker that ran it keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, trace};

/// A unit of work submitted to the pool: an async closure, boxed so the
/// pool can be generic over job type.
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently-running worker tasks.
    pub size: usize,
    /// A worker that sits idle this long self-terminates; the pool grows
    /// a replacement lazily the next time backlog demands it.
    pub idle_timeout: Duration,
    /// After `idle_timeout` elapses with no job, a worker waits one more
    /// `reuse_grace` window before actually exiting — a short buffer
    /// that absorbs bursty-but-sparse traffic without thrashing workers.
    pub reuse_grace: Duration,
    /// Bound on the shared job queue. `submit` backpressures once full.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            idle_timeout: Duration::from_secs(15),
            reuse_grace: Duration::from_secs(10),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetrics {
    pub spawned_workers: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub jobs_ok: u64,
    pub jobs_err: u64,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    size: usize,
    idle_timeout: Duration,
    reuse_grace: Duration,
    spawned_workers: Arc<AtomicUsize>,
    active_workers: Arc<AtomicUsize>,
    jobs_ok: Arc<AtomicU64>,
    jobs_err: Arc<AtomicU64>,
    disposed: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            size: config.size.max(1),
            idle_timeout: config.idle_timeout,
            reuse_grace: config.reuse_grace,
            spawned_workers: Arc::new(AtomicUsize::new(0)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            jobs_ok: Arc::new(AtomicU64::new(0)),
            jobs_err: Arc::new(AtomicU64::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a job, growing the pool by one worker if capacity allows.
    /// Backpressures (via the bounded channel) once the queue is full,
    /// rather than spawning workers without bound. A disposed pool
    /// rejects new jobs outright but keeps draining what's already
    /// queued.
    pub async fn submit<F>(&self, job: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if self.disposed.load(Ordering::Acquire) {
            error!("worker pool disposed; job rejected");
            return;
        }
        self.maybe_grow();
        if self.tx.send(Box::new(job)).await.is_err() {
            error!("worker pool queue closed; job dropped");
        }
    }

    /// Stop accepting new jobs. Already-queued jobs still drain; workers
    /// exit on their own once the queue empties and they idle out.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Grow by one worker only if doing so is actually useful: there must
    /// be room under `size`, and every already-spawned worker must be busy
    /// (otherwise the new job would just queue behind an idle worker that
    /// could have taken it).
    fn maybe_grow(&self) {
        loop {
            let current = self.spawned_workers.load(Ordering::Acquire);
            if current >= self.size {
                return;
            }
            if self.active_workers.load(Ordering::Acquire) < current {
                return;
            }
            if self
                .spawned_workers
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    fn spawn_worker(&self) {
        let rx = self.rx.clone();
        let spawned_workers = self.spawned_workers.clone();
        let active_workers = self.active_workers.clone();
        let jobs_ok = self.jobs_ok.clone();
        let jobs_err = self.jobs_err.clone();
        let idle_timeout = self.idle_timeout;
        let reuse_grace = self.reuse_grace;

        tokio::spawn(async move {
            if crate::logging::filter().is_enabled(crate::logging::Source::WorkerPool) {
                trace!("worker starting");
            }
            loop {
                let job = {
                    let mut guard = rx.lock().await;
                    tokio::time::timeout(idle_timeout, guard.recv()).await
                };
                let job = match job {
                    Ok(Some(job)) => job,
                    Ok(None) => break, // pool disposed, channel closed
                    Err(_elapsed) => {
                        // One more short grace window before actually
                        // exiting, to absorb a burst that just missed
                        // idle_timeout rather than churn a fresh worker.
                        let mut guard = rx.lock().await;
                        match tokio::time::timeout(reuse_grace, guard.recv()).await {
                            Ok(Some(job)) => job,
                            Ok(None) => break,
                            Err(_elapsed) => {
                                trace!("worker idle past timeout and grace, terminating");
                                break;
                            }
                        }
                    }
                };

                active_workers.fetch_add(1, Ordering::AcqRel);
                let outcome = AssertUnwindSafe(job()).catch_unwind().await;
                active_workers.fetch_sub(1, Ordering::AcqRel);

                match outcome {
                    Ok(()) => {
                        jobs_ok.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(panic) => {
                        jobs_err.fetch_add(1, Ordering::Relaxed);
                        error!(?panic, "worker job panicked");
                    }
                }
            }
            spawned_workers.fetch_sub(1, Ordering::AcqRel);
            if crate::logging::filter().is_enabled(crate::logging::Source::WorkerPool) {
                debug!("worker terminated");
            }
        });
    }

    pub fn metrics(&self) -> PoolMetrics {
        let active = self.active_workers.load(Ordering::Relaxed);
        PoolMetrics {
            spawned_workers: self.spawned_workers.load(Ordering::Relaxed),
            active_workers: active,
            queue_depth: self.size.saturating_sub(active),
            jobs_ok: self.jobs_ok.load(Ordering::Relaxed),
            jobs_err: self.jobs_err.load(Ordering::Relaxed),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::new(PoolConfig {
            size: 2,
            ..Default::default()
        });
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
            .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn grows_lazily_up_to_size() {
        let pool = WorkerPool::new(PoolConfig {
            size: 3,
            ..Default::default()
        });
        let gate = Arc::new(Notify::new());
        for _ in 0..3 {
            let gate = gate.clone();
            pool.submit(move || async move { gate.notified().await }.boxed())
                .await;
            // Let the worker just spawned pick up its job and mark itself
            // active before the next submission's idle check runs.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.metrics().spawned_workers, 3);
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn idle_worker_is_reused_instead_of_growing() {
        let pool = WorkerPool::new(PoolConfig {
            size: 4,
            ..Default::default()
        });
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
            .await;
            // Each job finishes almost instantly, so the one worker spawned
            // for the first job should be idle again well before the next
            // submission arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.metrics().spawned_workers, 1);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_worker() {
        let pool = WorkerPool::new(PoolConfig {
            size: 1,
            ..Default::default()
        });
        pool.submit(|| async { panic!("boom") }.boxed()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let counter = Arc::new(StdAtomicUsize::new(0));
        let counter2 = counter.clone();
        pool.submit(move || {
            async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().jobs_err, 1);
    }

    #[tokio::test]
    async fn disposed_pool_rejects_new_jobs_but_keeps_metrics() {
        let pool = WorkerPool::new(PoolConfig {
            size: 1,
            ..Default::default()
        });
        let counter = Arc::new(StdAtomicUsize::new(0));
        pool.dispose();

        let counter2 = counter.clone();
        pool.submit(move || {
            async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pool.metrics().spawned_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_self_terminates() {
        let pool = WorkerPool::new(PoolConfig {
            size: 2,
            idle_timeout: Duration::from_millis(50),
            reuse_grace: Duration::from_millis(20),
            ..Default::default()
        });
        pool.submit(|| async {}.boxed()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(pool.metrics().spawned_workers, 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().spawned_workers, 0);
    }
}
