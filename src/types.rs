//! Core error type and result alias shared across the crate.

use crate::endpoint::EndpointKey;
use crate::operation::RequestClass;

/// Errors surfaced at the crate's public boundary.
///
/// Three disjoint failure kinds map onto spec: admission failure
/// (`ResourceExhausted`, returned synchronously, never reaches a
/// delegate), transport failure (`Transport`, passed through from the
/// underlying HTTP client), and policy failure (`Timeout`, enforced by
/// this crate rather than the transport).
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    /// `dispatch_long` rejected because the endpoint's long-request quota
    /// is already exhausted. Never reaches an `OperationDelegate`.
    #[error("long-request quota exhausted for {endpoint} ({class:?})")]
    ResourceExhausted {
        endpoint: EndpointKey,
        class: RequestClass,
    },

    /// The core's own timeout fired before the transport completed.
    #[error("request to {url} timed out after {elapsed_ms}ms")]
    Timeout { url: String, elapsed_ms: u64 },

    /// The transport could not be constructed at all (e.g. unparseable
    /// request), surfaced before the operation is ever admitted.
    #[error("no transport available for {url}: {reason}")]
    NoTransport { url: String, reason: String },

    /// A transport-native error, passed through unmodified.
    #[error("transport error: {0}")]
    Transport(String),

    /// A configuration/argument error surfaced synchronously at the call
    /// site (e.g. an unparseable request URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The dispatcher or worker pool is shutting down and can no longer
    /// accept or service work.
    #[error("gatekeeper is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;
