//! Transport abstraction: the one capability the admission core needs
//! from an HTTP client — build a request, then drive it to completion
//! while reporting back through an `OperationDelegate`.
//!
//! Two implementations satisfy it. `SessionTransport` holds one shared,
//! cheaply-cloned `reqwest::Client` (the "session-based" mode — preferred,
//! `use_shared_transport = true`). `PerConnectionTransport` builds a fresh
//! client per operation (the fallback). Selection is a configuration
//! choice, not a platform-version branch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::operation::{
    AuthDecision, Generation, Operation, OperationDelegate, OperationState, RequestSpec,
    ResponseMeta,
};
use crate::types::{GatekeeperError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Build the underlying client request. A failure here must occur
    /// *before* the operation is admitted onto any endpoint quota — it
    /// is surfaced synchronously as `GatekeeperError::NoTransport`, per
    /// synchronously, never as a delegate callback
    /// racing admission.
    fn build_request(&self, spec: &RequestSpec) -> Result<reqwest::Request>;

    /// Drive an already-built request to completion, invoking delegate
    /// callbacks. Every callback first re-checks that `generation` still
    /// matches the operation's current transport-handle generation;
    /// a mismatch means a cancel or timeout already cleared the handle,
    /// and the callback is dropped silently.
    ///
    /// `response_ready`, when given, fires the moment a response arrives
    /// (before streaming its body) — the dispatcher uses this to cancel a
    /// `Long` operation's nominal timeout as soon as headers show up,
    /// rather than only once the whole stream has finished.
    async fn execute(
        &self,
        request: reqwest::Request,
        op: Arc<Operation>,
        delegate: Arc<dyn OperationDelegate>,
        generation: Generation,
        response_ready: Option<oneshot::Sender<()>>,
    );
}

/// Returns `true` if this callback is still current (no cancel/timeout
/// has raced ahead of it) and the operation has not already reached a
/// terminal state.
fn still_current(op: &Operation, generation: Generation) -> bool {
    op.generation() == generation && !op.state().is_terminal()
}

async fn drive(
    transport_name: &'static str,
    request: reqwest::Request,
    client: reqwest::Client,
    op: Arc<Operation>,
    delegate: Arc<dyn OperationDelegate>,
    generation: Generation,
    response_ready: Option<oneshot::Sender<()>>,
) {
    let url = op.request().url.clone();

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            if !still_current(&op, generation) {
                debug!(transport = transport_name, %url, "dropping late transport error after terminal transition");
                return;
            }
            op.set_error(e.to_string());
            op.transition(OperationState::Failed);
            delegate
                .did_fail(&op, &GatekeeperError::Transport(e.to_string()))
                .await;
            return;
        }
    };

    if !still_current(&op, generation) {
        debug!(transport = transport_name, %url, "dropping late response after terminal transition");
        return;
    }

    // A response arrived: signal it before streaming the body so the
    // caller can cancel a long-class operation's nominal timeout here,
    // once headers are in, rather than only at full completion.
    if let Some(tx) = response_ready {
        let _ = tx.send(());
    }

    let meta = ResponseMeta {
        status: response.status().as_u16(),
        headers: response.headers().clone(),
        url: response.url().clone(),
    };
    op.set_response(meta.clone());
    delegate.did_receive_response(&op, &meta).await;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if !still_current(&op, generation) {
            debug!(transport = transport_name, %url, "dropping late chunk after terminal transition");
            return;
        }
        match chunk {
            Ok(bytes) => {
                op.append_data(&bytes);
                delegate.did_receive_data(&op, &bytes).await;
            }
            Err(e) => {
                op.set_error(e.to_string());
                op.transition(OperationState::Failed);
                delegate
                    .did_fail(&op, &GatekeeperError::Transport(e.to_string()))
                    .await;
                return;
            }
        }
    }

    if !still_current(&op, generation) {
        return;
    }

    if op.transition(OperationState::Completed) {
        delegate.did_finish(&op).await;
    }
}

/// Shared, process-wide session client. Cheap to clone (an `Arc` under
/// the hood in `reqwest`), reused across every operation.
pub struct SessionTransport {
    client: reqwest::Client,
}

impl SessionTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatekeeperError::NoTransport {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for SessionTransport {
    fn build_request(&self, spec: &RequestSpec) -> Result<reqwest::Request> {
        build_request(&self.client, spec)
    }

    async fn execute(
        &self,
        request: reqwest::Request,
        op: Arc<Operation>,
        delegate: Arc<dyn OperationDelegate>,
        generation: Generation,
        response_ready: Option<oneshot::Sender<()>>,
    ) {
        drive(
            "session",
            request,
            self.client.clone(),
            op,
            delegate,
            generation,
            response_ready,
        )
        .await;
    }
}

/// Fallback transport: a fresh client per operation. Used when
/// `use_shared_transport` is disabled, or when `SessionTransport`
/// construction failed at startup.
#[derive(Default)]
pub struct PerConnectionTransport;

#[async_trait]
impl Transport for PerConnectionTransport {
    fn build_request(&self, spec: &RequestSpec) -> Result<reqwest::Request> {
        let client = per_connection_client(spec)?;
        build_request(&client, spec)
    }

    async fn execute(
        &self,
        request: reqwest::Request,
        op: Arc<Operation>,
        delegate: Arc<dyn OperationDelegate>,
        generation: Generation,
        response_ready: Option<oneshot::Sender<()>>,
    ) {
        let client = reqwest::Client::new();
        drive(
            "per-connection",
            request,
            client,
            op,
            delegate,
            generation,
            response_ready,
        )
        .await;
    }
}

fn per_connection_client(spec: &RequestSpec) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| GatekeeperError::NoTransport {
            url: spec.url.to_string(),
            reason: e.to_string(),
        })
}

fn build_request(client: &reqwest::Client, spec: &RequestSpec) -> Result<reqwest::Request> {
    let mut builder = client
        .request(spec.method.clone(), spec.url.clone())
        .headers(spec.headers.clone());

    if let Some(body) = spec.body.clone() {
        builder = builder.body(body);
    }

    builder.build().map_err(|e| GatekeeperError::NoTransport {
        url: spec.url.to_string(),
        reason: e.to_string(),
    })
}

/// Default handling for an authentication challenge when a delegate has
/// no handler registered: deny rather than silently retry with empty
/// credentials.
pub fn default_auth_decision() -> AuthDecision {
    AuthDecision::CancelAuthenticationChallenge
}
