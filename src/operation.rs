//! `Operation`: one logical request tracked by the dispatcher, and the
//! delegate contract a caller implements to observe it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::EndpointKey;
use crate::types::GatekeeperError;

/// Request class. `Short` is the default; `Long` is for streaming or
/// persistent connections and draws from a smaller, separately-tracked
/// quota so it can never starve `Short` traffic out of every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Short,
    Long,
}

impl RequestClass {
    pub const fn index(self) -> usize {
        match self {
            RequestClass::Short => 0,
            RequestClass::Long => 1,
        }
    }
}

/// An operation's lifecycle state. Reaches exactly one terminal state;
/// no delegate callbacks fire for it afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Waiting,
    Running,
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

impl OperationState {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed
                | OperationState::Cancelled
                | OperationState::TimedOut
                | OperationState::Failed
        )
    }
}

/// Minimal transport request descriptor. Declared timeout is enforced by
/// the core (see `dispatcher`); the transport's own timer is disabled.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: reqwest::Method,
    pub url: reqwest::Url,
    pub headers: reqwest::header::HeaderMap,
    pub body: Option<Bytes>,
    pub declared_timeout: Duration,
}

impl RequestSpec {
    pub fn get(url: reqwest::Url) -> Self {
        Self {
            method: reqwest::Method::GET,
            url,
            headers: reqwest::header::HeaderMap::new(),
            body: None,
            declared_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.declared_timeout = timeout;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response metadata delivered once, before any `did_receive_data`.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub url: reqwest::Url,
}

/// An authentication challenge surfaced by the transport. Optional
/// capability: delegates that don't implement
/// `will_send_request_for_authentication_challenge` get default handling.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub url: reqwest::Url,
    pub scheme: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AuthDecision {
    PerformDefaultHandling,
    UseCredential { username: String, password: String },
    CancelAuthenticationChallenge,
}

/// The capability set a caller must satisfy to receive operation
/// callbacks. All callbacks for a single operation are serialized (they
/// run on the operation's leased worker), so an implementation never
/// observes concurrent calls for the same operation. There is no
/// ordering guarantee *between* operations delivered to the same
/// delegate instance.
#[async_trait]
pub trait OperationDelegate: Send + Sync {
    /// Called exactly once, before any `did_receive_data`.
    async fn did_receive_response(&self, op: &Operation, response: &ResponseMeta);

    /// Called zero or more times with incremental body bytes.
    async fn did_receive_data(&self, op: &Operation, chunk: &[u8]);

    /// Exactly one of `did_finish`/`did_fail` fires per operation,
    /// including for cancellation (delivered as `did_finish`, never as
    /// an error — cancellation is a clean terminal, not a failure).
    async fn did_finish(&self, op: &Operation);

    async fn did_fail(&self, op: &Operation, error: &GatekeeperError);

    /// Optional capability, resolved once at operation construction
    /// rather than probed on every callback.
    fn has_auth_challenge_handler(&self) -> bool {
        false
    }

    async fn will_send_request_for_authentication_challenge(
        &self,
        _op: &Operation,
        _challenge: &AuthChallenge,
    ) -> AuthDecision {
        AuthDecision::PerformDefaultHandling
    }
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// A generation token for the operation's current transport handle.
/// Every transport callback captures the generation it was issued under;
/// a callback whose generation no longer matches `Operation::generation`
/// is a late arrival (post-cancel/post-timeout) and is dropped silently.
pub type Generation = u64;

/// One logical request: its identity, accumulated result, and mutable
/// lifecycle state. Created by `UrlDispatcher` factory methods, lives
/// until one terminal transition, released when the delegate's terminal
/// callback returns.
pub struct Operation {
    id: u64,
    correlation_id: uuid::Uuid,
    endpoint: EndpointKey,
    class: RequestClass,
    request: RequestSpec,
    gather_data: bool,
    state: Mutex<OperationState>,
    generation: Mutex<Generation>,
    data: Mutex<Vec<u8>>,
    response: Mutex<Option<ResponseMeta>>,
    error: Mutex<Option<String>>,
}

impl Operation {
    pub fn new(
        endpoint: EndpointKey,
        class: RequestClass,
        request: RequestSpec,
        gather_data: bool,
    ) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            correlation_id: uuid::Uuid::new_v4(),
            endpoint,
            class,
            request,
            gather_data,
            state: Mutex::new(OperationState::Pending),
            generation: Mutex::new(0),
            data: Mutex::new(Vec::new()),
            response: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stable identifier safe to log across process restarts (`id` is
    /// only unique within one process's lifetime).
    pub fn correlation_id(&self) -> uuid::Uuid {
        self.correlation_id
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    pub fn class(&self) -> RequestClass {
        self.class
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn gather_data(&self) -> bool {
        self.gather_data
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock().unwrap()
    }

    /// Attempt a state transition. Returns `false` (a no-op) if the
    /// operation is already terminal, matching the "cancel on an
    /// already-terminal operation is a no-op" / "idempotence of cancel"
    /// invariants.
    pub fn transition(&self, next: OperationState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Bump the transport-handle generation, returning the new value.
    /// Call this when leasing a fresh transport handle for the operation.
    pub fn new_generation(&self) -> Generation {
        let mut gen = self.generation.lock().unwrap();
        *gen += 1;
        *gen
    }

    /// Current transport-handle generation, used by callbacks to detect
    /// late arrivals after cancel/timeout cleared the handle.
    pub fn generation(&self) -> Generation {
        *self.generation.lock().unwrap()
    }

    pub fn append_data(&self, chunk: &[u8]) {
        if self.gather_data {
            self.data.lock().unwrap().extend_from_slice(chunk);
        }
    }

    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.data.lock().unwrap())
    }

    pub fn set_response(&self, response: ResponseMeta) {
        *self.response.lock().unwrap() = Some(response);
    }

    pub fn response(&self) -> Option<ResponseMeta> {
        self.response.lock().unwrap().clone()
    }

    pub fn set_error(&self, error: impl ToString) {
        *self.error.lock().unwrap() = Some(error.to_string());
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_op() -> Operation {
        let url = reqwest::Url::parse("https://example.com").unwrap();
        let endpoint = EndpointKey::from_url(&url).unwrap();
        Operation::new(endpoint, RequestClass::Short, RequestSpec::get(url), true)
    }

    #[test]
    fn terminal_transition_is_sticky() {
        let op = make_op();
        assert!(op.transition(OperationState::Running));
        assert!(op.transition(OperationState::Completed));
        // A second terminal transition (e.g. a racing cancel) is a no-op.
        assert!(!op.transition(OperationState::Cancelled));
        assert_eq!(op.state(), OperationState::Completed);
    }

    #[test]
    fn gather_data_accumulates_and_non_gather_drops() {
        let op = make_op();
        op.append_data(b"hello ");
        op.append_data(b"world");
        assert_eq!(op.take_data(), b"hello world");

        let url = reqwest::Url::parse("https://example.com").unwrap();
        let endpoint = EndpointKey::from_url(&url).unwrap();
        let op2 = Operation::new(endpoint, RequestClass::Short, RequestSpec::get(url), false);
        op2.append_data(b"ignored");
        assert!(op2.take_data().is_empty());
    }

    #[test]
    fn generation_increments_and_is_observable() {
        let op = make_op();
        assert_eq!(op.generation(), 0);
        assert_eq!(op.new_generation(), 1);
        assert_eq!(op.new_generation(), 2);
        assert_eq!(op.generation(), 2);
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = make_op();
        let b = make_op();
        assert!(b.id() > a.id());
    }
}
