//! `UrlDispatcher`: the component callers actually talk to. Ties
//! together `EndpointState` (admission), `WorkerPool` (execution),
//! `TimerService` (timeout enforcement) and a `Transport` (the HTTP
//! client) into the three dispatch entry points:
//! `dispatch_short`, `dispatch_long`, and the blocking
//! `dispatch_synchronous` pair.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::endpoint::EndpointKey;
use crate::endpoint_state::{AdmitOutcome, EndpointState};
use crate::operation::{
    AuthChallenge, AuthDecision, Operation, OperationDelegate, OperationState, RequestClass,
    RequestSpec, ResponseMeta,
};
use crate::timer::{TimerHandle, TimerService};
use crate::transport::{PerConnectionTransport, SessionTransport, Transport};
use crate::types::{GatekeeperError, Result};
use crate::worker::{PoolConfig, PoolMetrics};

struct Cancellation {
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherMetrics {
    pub live_operations: usize,
    pub tracked_endpoints: usize,
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

pub struct UrlDispatcher {
    id: u64,
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    endpoints: DashMap<EndpointKey, Arc<EndpointState>>,
    live: DashMap<u64, Cancellation>,
    shut_down: AtomicBool,
}

impl UrlDispatcher {
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        let transport: Arc<dyn Transport> = if config.use_shared_transport {
            match SessionTransport::new() {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    warn!(error = %e, "shared transport unavailable, falling back to per-connection");
                    Arc::new(PerConnectionTransport)
                }
            }
        } else {
            Arc::new(PerConnectionTransport)
        };

        Self::with_transport(config, transport)
    }

    /// Construct a dispatcher against a caller-supplied `Transport`,
    /// bypassing the `SessionTransport`/`PerConnectionTransport` selection
    /// `new` does. Exists so tests can exercise admission, timeout and
    /// cancellation behavior against a deterministic fake instead of real
    /// HTTP.
    pub fn with_transport(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        // Bind the singleton's wake interval the first time any
        // dispatcher is constructed in this process.
        TimerService::global_with_wake_interval(config.timer_wake_interval);

        Arc::new(Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            transport,
            endpoints: DashMap::new(),
            live: DashMap::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    fn endpoint_state(&self, key: &EndpointKey) -> Arc<EndpointState> {
        self.endpoints
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(EndpointState::new(
                    self.config.max_concurrent_per_endpoint,
                    self.config.max_long_per_endpoint,
                    PoolConfig {
                        size: self.config.worker_pool_size,
                        idle_timeout: self.config.worker_idle_timeout,
                        reuse_grace: self.config.worker_reuse_grace,
                        queue_capacity: self.config.worker_queue_capacity,
                    },
                ))
            })
            .clone()
    }

    /// Non-admitting probe: would a `Long` request to this endpoint be
    /// admitted right now. Used by callers that want to avoid enqueuing
    /// work they'd rather skip under backpressure.
    pub fn is_long_request_allowed(&self, endpoint: &EndpointKey) -> bool {
        self.endpoint_state(endpoint).would_admit_long()
    }

    /// Current count of `Running` operations of `class` against
    /// `endpoint`. Exposed for observability and tests; creates no
    /// state (an endpoint never seen yet simply reports zero).
    pub fn running_count(&self, endpoint: &EndpointKey, class: RequestClass) -> usize {
        self.endpoints
            .get(endpoint)
            .map(|s| s.running_count(class))
            .unwrap_or(0)
    }

    /// Snapshot of the worker pool dedicated to `endpoint`, or `None` if
    /// no request has touched it yet.
    pub fn pool_metrics(&self, endpoint: &EndpointKey) -> Option<PoolMetrics> {
        self.endpoints.get(endpoint).map(|s| s.pool().metrics())
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            live_operations: self.live.len(),
            tracked_endpoints: self.endpoints.len(),
        }
    }

    /// Cancel an in-flight or still-queued operation. Idempotent: a
    /// second cancel, or a cancel racing a natural completion, is a
    /// no-op (cancel is idempotent).
    pub fn cancel(&self, op: &Operation) {
        if !op.transition(OperationState::Cancelled) {
            return;
        }
        if let Some((_, cancellation)) = self.live.remove(&op.id()) {
            cancellation.notify.notify_waiters();
        }
    }

    /// Stop accepting new dispatches, dispose every per-endpoint worker
    /// pool, and fail every still-queued operation with `ShuttingDown`.
    ///
    /// This does not tear down the process-wide `TimerService` — other
    /// `UrlDispatcher` instances in the same process may still depend on
    /// it. Instead it cancels only this dispatcher's own pending timeout
    /// timers via `cancel_matching`, tagged by this dispatcher's id at
    /// scheduling time. Call `TimerService::global().shutdown()`
    /// separately if the whole process is exiting.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        for entry in self.endpoints.iter() {
            entry.value().drain_waiters_for_shutdown();
            entry.value().pool().dispose();
        }
        TimerService::global().cancel_matching(self.id);
    }

    /// Shared dispatch path. A malformed request (`NoTransport`) and a
    /// `Long` request against an exhausted quota (`ResourceExhausted`)
    /// both fail here, before any worker or endpoint registration — the
    /// former's `did_fail` is awaited so it is visible to the delegate
    /// before this call returns; the latter never reaches the delegate
    /// at all.
    async fn dispatch(
        self: &Arc<Self>,
        class: RequestClass,
        request: RequestSpec,
        gather_data: bool,
        delegate: Arc<dyn OperationDelegate>,
    ) -> Result<Arc<Operation>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GatekeeperError::ShuttingDown);
        }

        let endpoint = EndpointKey::from_url(&request.url)?;

        // Built before admission: a malformed request fails synchronously
        // and never touches the endpoint's quota.
        let built = match self.transport.build_request(&request) {
            Ok(built) => built,
            Err(e) => {
                let op = Arc::new(Operation::new(endpoint, class, request, gather_data));
                op.transition(OperationState::Failed);
                let err = e.clone_for_delegate();
                delegate.did_fail(&op, &err).await;
                return Err(e);
            }
        };

        let state = self.endpoint_state(&endpoint);

        // `Long` never queues: it either admits right now or fails
        // immediately with `ResourceExhausted`, without ever being
        // constructed as a live, delegate-visible operation.
        let admission = if class == RequestClass::Long {
            if state.try_admit_long() {
                AdmitOutcome::Admitted
            } else {
                return Err(GatekeeperError::ResourceExhausted {
                    endpoint: endpoint.clone(),
                    class,
                });
            }
        } else {
            state.admit_or_wait(class)
        };

        let op = Arc::new(Operation::new(endpoint.clone(), class, request, gather_data));
        let cancel_notify = Arc::new(Notify::new());
        self.live.insert(
            op.id(),
            Cancellation {
                notify: cancel_notify.clone(),
            },
        );

        let transport = self.transport.clone();
        let timeout = match class {
            RequestClass::Short => self.config.short_request_timeout,
            RequestClass::Long => self.config.long_request_timeout,
        };
        let pool = state.pool();
        let dispatcher_id = self.id;
        let dispatcher = self.clone();
        let op_for_job = op.clone();
        let op_id = op.id();

        tokio::spawn(async move {
            pool.submit(move || {
                run_operation(
                    op_for_job,
                    built,
                    state,
                    transport,
                    timeout,
                    delegate,
                    cancel_notify,
                    admission,
                    dispatcher_id,
                )
                .then(move |_| async move {
                    dispatcher.live.remove(&op_id);
                })
                .boxed()
            })
            .await;
        });

        Ok(op)
    }

    /// Asynchronous short-request dispatch. Never rejects for admission
    /// reasons — an exhausted endpoint queues the operation rather than
    /// failing it.
    pub async fn dispatch_short(
        self: &Arc<Self>,
        request: RequestSpec,
        gather_data: bool,
        delegate: Arc<dyn OperationDelegate>,
    ) -> Result<Arc<Operation>> {
        self.dispatch(RequestClass::Short, request, gather_data, delegate)
            .await
    }

    /// Asynchronous long-request dispatch. Fails immediately with
    /// `ResourceExhausted` if the endpoint's long quota is already full
    /// — the operation is never constructed.
    pub async fn dispatch_long(
        self: &Arc<Self>,
        request: RequestSpec,
        gather_data: bool,
        delegate: Arc<dyn OperationDelegate>,
    ) -> Result<Arc<Operation>> {
        self.dispatch(RequestClass::Long, request, gather_data, delegate)
            .await
    }

    /// Dispatch and asynchronously await the operation's terminal
    /// callback, returning once it fires. The caller's own delegate
    /// still receives every callback exactly as it would from
    /// `dispatch_short`/`dispatch_long`.
    pub async fn dispatch_synchronous(
        self: &Arc<Self>,
        class: RequestClass,
        request: RequestSpec,
        gather_data: bool,
        delegate: Arc<dyn OperationDelegate>,
    ) -> Result<Arc<Operation>> {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(CompletionDelegate {
            inner: delegate,
            tx: Mutex::new(Some(tx)),
        });
        let op = self.dispatch(class, request, gather_data, completion).await?;
        let _ = rx.await;
        Ok(op)
    }

    /// True blocking variant for synchronous callers outside the async
    /// runtime. Must not be called from within a runtime worker thread —
    /// doing so deadlocks, the same hazard as calling `block_on` on the
    /// thread that's supposed to drive the future it's blocking on.
    pub fn dispatch_synchronous_blocking(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        class: RequestClass,
        request: RequestSpec,
        gather_data: bool,
        delegate: Arc<dyn OperationDelegate>,
    ) -> Result<Arc<Operation>> {
        handle.block_on(self.dispatch_synchronous(class, request, gather_data, delegate))
    }
}

async fn run_operation(
    op: Arc<Operation>,
    request: reqwest::Request,
    state: Arc<EndpointState>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    delegate: Arc<dyn OperationDelegate>,
    cancel_notify: Arc<Notify>,
    admission: AdmitOutcome,
    dispatcher_id: u64,
) {
    op.transition(OperationState::Waiting);

    let class = op.class();
    match admission {
        AdmitOutcome::Admitted => {}
        AdmitOutcome::Queued(rx) => {
            tokio::select! {
                _ = cancel_notify.notified() => {
                    delegate.did_finish(&op).await;
                    return;
                }
                result = rx => {
                    if result.is_err() {
                        // Admission channel dropped without firing: the
                        // endpoint state was torn down underneath us.
                        op.transition(OperationState::Failed);
                        delegate
                            .did_fail(&op, &GatekeeperError::ShuttingDown)
                            .await;
                        return;
                    }
                }
            }
        }
    }

    if !op.transition(OperationState::Running) {
        // Cancelled while transitioning from Waiting to Running.
        state.release(class);
        delegate.did_finish(&op).await;
        return;
    }

    let generation = op.new_generation();
    let deadline_op = op.clone();
    let url_for_timeout = op.request().url.to_string();
    let timeout_handle: TimerHandle =
        TimerService::global().schedule_after(timeout, dispatcher_id, move || {
            let op = deadline_op.clone();
            let url = url_for_timeout.clone();
            async move {
                if op.generation() == generation && op.transition(OperationState::TimedOut) {
                    if crate::logging::filter().is_enabled(crate::logging::Source::Dispatcher) {
                        debug!(%url, "operation timed out");
                    }
                }
            }
            .boxed()
        });

    // Run the transport on its own task so a `Long` operation's first
    // response can be observed (and its timeout cancelled) without
    // waiting for the whole transfer to finish.
    let (resp_tx, mut resp_rx) = oneshot::channel::<()>();
    let mut exec_handle = tokio::spawn({
        let transport = transport.clone();
        let op = op.clone();
        let delegate = delegate.clone();
        async move {
            transport
                .execute(request, op, delegate, generation, Some(resp_tx))
                .await;
        }
    });

    let mut response_seen = false;
    loop {
        tokio::select! {
            _ = cancel_notify.notified() => {
                op.new_generation();
                TimerService::global().cancel(timeout_handle);
                state.release(class);
                exec_handle.abort();
                delegate.did_finish(&op).await;
                return;
            }
            result = &mut resp_rx, if class == RequestClass::Long && !response_seen => {
                response_seen = true;
                if result.is_ok() {
                    // Headers are in; a Long operation runs past its
                    // nominal timeout for as long as the stream keeps
                    // flowing, so the deadline no longer applies.
                    TimerService::global().cancel(timeout_handle);
                }
            }
            result = &mut exec_handle => {
                TimerService::global().cancel(timeout_handle);
                state.release(class);
                if let Err(join_err) = result {
                    if !join_err.is_cancelled() {
                        warn!(?join_err, "transport execution task panicked");
                    }
                }
                if op.state() == OperationState::TimedOut {
                    delegate
                        .did_fail(
                            &op,
                            &GatekeeperError::Timeout {
                                url: op.request().url.to_string(),
                                elapsed_ms: timeout.as_millis() as u64,
                            },
                        )
                        .await;
                }
                return;
            }
        }
    }
}

/// Wraps a caller-supplied delegate so `dispatch_synchronous` can learn
/// when the operation reaches its terminal callback, without changing
/// what the caller observes.
struct CompletionDelegate {
    inner: Arc<dyn OperationDelegate>,
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl CompletionDelegate {
    fn signal(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl OperationDelegate for CompletionDelegate {
    async fn did_receive_response(&self, op: &Operation, response: &ResponseMeta) {
        self.inner.did_receive_response(op, response).await;
    }

    async fn did_receive_data(&self, op: &Operation, chunk: &[u8]) {
        self.inner.did_receive_data(op, chunk).await;
    }

    async fn did_finish(&self, op: &Operation) {
        self.inner.did_finish(op).await;
        self.signal();
    }

    async fn did_fail(&self, op: &Operation, error: &GatekeeperError) {
        self.inner.did_fail(op, error).await;
        self.signal();
    }

    fn has_auth_challenge_handler(&self) -> bool {
        self.inner.has_auth_challenge_handler()
    }

    async fn will_send_request_for_authentication_challenge(
        &self,
        op: &Operation,
        challenge: &AuthChallenge,
    ) -> AuthDecision {
        self.inner
            .will_send_request_for_authentication_challenge(op, challenge)
            .await
    }
}

impl GatekeeperError {
    fn clone_for_delegate(&self) -> GatekeeperError {
        match self {
            GatekeeperError::ResourceExhausted { endpoint, class } => {
                GatekeeperError::ResourceExhausted {
                    endpoint: endpoint.clone(),
                    class: *class,
                }
            }
            GatekeeperError::Timeout { url, elapsed_ms } => GatekeeperError::Timeout {
                url: url.clone(),
                elapsed_ms: *elapsed_ms,
            },
            GatekeeperError::NoTransport { url, reason } => GatekeeperError::NoTransport {
                url: url.clone(),
                reason: reason.clone(),
            },
            GatekeeperError::Transport(s) => GatekeeperError::Transport(s.clone()),
            GatekeeperError::InvalidRequest(s) => GatekeeperError::InvalidRequest(s.clone()),
            GatekeeperError::ShuttingDown => GatekeeperError::ShuttingDown,
        }
    }
}
