//! Integration scenarios against a fake transport: admission limits,
//! long-quota exhaustion, timeout-vs-stall races, FIFO wakeup order,
//! post-completion cancel, and worker-idle reclaim, all without
//! touching real sockets or DNS.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatekeeper::{
    DispatcherConfig, EndpointKey, GatekeeperError, Generation, Operation, OperationDelegate,
    OperationState, RequestSpec, ResponseMeta, Result, Transport, UrlDispatcher,
};
use tokio::sync::oneshot;

#[derive(Clone)]
enum Behavior {
    /// Respond successfully after `Duration`.
    Delay(Duration),
    /// Never produce a response; the operation can only end via timeout
    /// or cancellation.
    NeverResponds,
    /// Fail immediately with the given transport error text.
    Fail(String),
}

struct FakeTransport {
    behavior: Behavior,
}

impl FakeTransport {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self { behavior })
    }
}

fn still_current(op: &Operation, generation: Generation) -> bool {
    op.generation() == generation && !op.state().is_terminal()
}

#[async_trait]
impl Transport for FakeTransport {
    fn build_request(&self, spec: &RequestSpec) -> Result<reqwest::Request> {
        Ok(reqwest::Request::new(spec.method.clone(), spec.url.clone()))
    }

    async fn execute(
        &self,
        _request: reqwest::Request,
        op: Arc<Operation>,
        delegate: Arc<dyn OperationDelegate>,
        generation: Generation,
        response_ready: Option<oneshot::Sender<()>>,
    ) {
        match self.behavior.clone() {
            Behavior::NeverResponds => {
                futures::future::pending::<()>().await;
            }
            Behavior::Fail(reason) => {
                if !still_current(&op, generation) {
                    return;
                }
                op.transition(OperationState::Failed);
                delegate
                    .did_fail(&op, &GatekeeperError::Transport(reason))
                    .await;
            }
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                if !still_current(&op, generation) {
                    return;
                }
                if let Some(tx) = response_ready {
                    let _ = tx.send(());
                }
                let meta = ResponseMeta {
                    status: 200,
                    headers: reqwest::header::HeaderMap::new(),
                    url: reqwest::Url::parse("https://fake.test/ok").unwrap(),
                };
                op.set_response(meta.clone());
                delegate.did_receive_response(&op, &meta).await;
                if !still_current(&op, generation) {
                    return;
                }
                if op.transition(OperationState::Completed) {
                    delegate.did_finish(&op).await;
                }
            }
        }
    }
}

struct RecordingDelegate {
    finishes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    order: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl RecordingDelegate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            finishes: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(std::sync::Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl OperationDelegate for RecordingDelegate {
    async fn did_receive_response(&self, _op: &Operation, _response: &ResponseMeta) {}
    async fn did_receive_data(&self, _op: &Operation, _chunk: &[u8]) {}
    async fn did_finish(&self, op: &Operation) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(op.id());
    }
    async fn did_fail(&self, op: &Operation, _error: &GatekeeperError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(op.id());
    }
}

fn config(max_concurrent: usize, max_long: usize) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_per_endpoint: max_concurrent,
        max_long_per_endpoint: max_long,
        use_shared_transport: true,
        short_request_timeout: Duration::from_millis(200),
        long_request_timeout: Duration::from_millis(500),
        worker_pool_size: 4,
        worker_idle_timeout: Duration::from_millis(60),
        worker_reuse_grace: Duration::from_millis(30),
        worker_queue_capacity: 64,
        timer_wake_interval: Duration::from_millis(10),
    }
}

fn endpoint(url: &str) -> EndpointKey {
    EndpointKey::from_url(&reqwest::Url::parse(url).unwrap()).unwrap()
}

/// A third short request against a 2-slot endpoint queues rather than
/// failing, and is admitted once a running one finishes.
#[tokio::test]
async fn hard_cap_queues_excess_short_requests() {
    let dispatcher =
        UrlDispatcher::with_transport(config(2, 1), FakeTransport::new(Behavior::Delay(Duration::from_millis(80))));
    let url = reqwest::Url::parse("https://fake.test/a").unwrap();
    let delegate = RecordingDelegate::new();

    for _ in 0..3 {
        dispatcher
            .dispatch_short(RequestSpec::get(url.clone()), false, delegate.clone())
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(delegate.finishes.load(Ordering::SeqCst), 3);
}

/// A `Long` request against an exhausted long quota fails synchronously
/// with `ResourceExhausted` and is never enqueued.
#[tokio::test]
async fn long_quota_exhaustion_fails_without_queueing() {
    let dispatcher =
        UrlDispatcher::with_transport(config(4, 1), FakeTransport::new(Behavior::Delay(Duration::from_millis(200))));
    let url = reqwest::Url::parse("https://fake.test/stream").unwrap();
    let delegate = RecordingDelegate::new();

    dispatcher
        .dispatch_long(RequestSpec::get(url.clone()), false, delegate.clone())
        .await
        .unwrap();

    let result = dispatcher
        .dispatch_long(RequestSpec::get(url), false, delegate)
        .await;
    assert!(matches!(
        result,
        Err(GatekeeperError::ResourceExhausted { .. })
    ));
}

/// A stalled transport is cut off by the nominal timeout rather than
/// hanging forever.
#[tokio::test]
async fn timeout_preempts_a_stalled_transport() {
    let dispatcher = UrlDispatcher::with_transport(config(2, 1), FakeTransport::new(Behavior::NeverResponds));
    let url = reqwest::Url::parse("https://fake.test/stall").unwrap();
    let delegate = RecordingDelegate::new();

    let op = dispatcher
        .dispatch_short(RequestSpec::get(url), false, delegate.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(op.state(), OperationState::TimedOut);
    assert_eq!(delegate.failures.load(Ordering::SeqCst), 1);
}

/// Waiters queued behind an exhausted endpoint are admitted in the
/// order they arrived, not some other order.
#[tokio::test]
async fn queued_waiters_are_admitted_in_fifo_order() {
    let dispatcher =
        UrlDispatcher::with_transport(config(1, 1), FakeTransport::new(Behavior::Delay(Duration::from_millis(40))));
    let url = reqwest::Url::parse("https://fake.test/fifo").unwrap();
    let delegate = RecordingDelegate::new();

    let mut ops = Vec::new();
    for _ in 0..4 {
        let op = dispatcher
            .dispatch_short(RequestSpec::get(url.clone()), false, delegate.clone())
            .await
            .unwrap();
        ops.push(op.id());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*delegate.order.lock().unwrap(), ops);
}

/// Cancelling an operation that has already reached a terminal state is
/// a harmless no-op: the delegate isn't called a second time.
#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let dispatcher =
        UrlDispatcher::with_transport(config(2, 1), FakeTransport::new(Behavior::Delay(Duration::from_millis(10))));
    let url = reqwest::Url::parse("https://fake.test/done").unwrap();
    let delegate = RecordingDelegate::new();

    let op = dispatcher
        .dispatch_short(RequestSpec::get(url), false, delegate.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(op.state(), OperationState::Completed);

    dispatcher.cancel(&op);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(op.state(), OperationState::Completed);
    assert_eq!(delegate.finishes.load(Ordering::SeqCst), 1);
}

/// A worker pool that idles out still respawns a worker for the next
/// job against that endpoint.
#[tokio::test]
async fn worker_pool_respawns_after_idle_reclaim() {
    let dispatcher =
        UrlDispatcher::with_transport(config(2, 1), FakeTransport::new(Behavior::Delay(Duration::from_millis(5))));
    let url = reqwest::Url::parse("https://fake.test/reclaim").unwrap();
    let endpoint = endpoint("https://fake.test/reclaim");
    let delegate = RecordingDelegate::new();

    dispatcher
        .dispatch_short(RequestSpec::get(url.clone()), false, delegate.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        dispatcher.pool_metrics(&endpoint).unwrap().spawned_workers,
        0
    );

    dispatcher
        .dispatch_short(RequestSpec::get(url), false, delegate.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delegate.finishes.load(Ordering::SeqCst), 2);
}

/// `shutdown` drains queued waiters with `ShuttingDown` and stops
/// admitting new dispatches.
#[tokio::test]
async fn shutdown_drains_waiters_and_refuses_new_work() {
    let dispatcher =
        UrlDispatcher::with_transport(config(1, 1), FakeTransport::new(Behavior::NeverResponds));
    let url = reqwest::Url::parse("https://fake.test/shutdown").unwrap();
    let delegate = RecordingDelegate::new();

    // Occupies the one slot.
    dispatcher
        .dispatch_short(RequestSpec::get(url.clone()), false, delegate.clone())
        .await
        .unwrap();
    // Queues behind it.
    let queued = dispatcher
        .dispatch_short(RequestSpec::get(url.clone()), false, delegate.clone())
        .await
        .unwrap();

    dispatcher.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queued.state(), OperationState::Failed);

    let result = dispatcher
        .dispatch_short(RequestSpec::get(url), false, delegate)
        .await;
    assert!(matches!(result, Err(GatekeeperError::ShuttingDown)));
}
