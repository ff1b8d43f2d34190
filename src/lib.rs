//! Per-endpoint admission control for outbound HTTP requests.
//!
//! `UrlDispatcher` is the entry point: it hands out `Operation`s bound
//! by a per-host concurrency quota, runs them on a bounded `WorkerPool`,
//! and enforces their timeouts through a single background `TimerService`.
//! Callers observe an operation's lifecycle through an `OperationDelegate`.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod endpoint_state;
pub mod logging;
pub mod operation;
pub mod timer;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatcherMetrics, UrlDispatcher};
pub use endpoint::EndpointKey;
pub use logging::{Source, SourceFilter};
pub use operation::{
    AuthChallenge, AuthDecision, Generation, Operation, OperationDelegate, OperationState,
    RequestClass, RequestSpec, ResponseMeta,
};
pub use timer::{TimerHandle, TimerService};
pub use transport::{PerConnectionTransport, SessionTransport, Transport};
pub use types::{GatekeeperError, Result};
pub use worker::{PoolConfig, PoolMetrics, WorkerPool};

/// Build provenance, captured by `build.rs` at compile time.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub git_commit_short: &'static str,
    pub git_commit_full: &'static str,
    pub built_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        git_commit_short: env!("GIT_COMMIT_SHORT"),
        git_commit_full: env!("GIT_COMMIT_FULL"),
        built_at: chrono::DateTime::parse_from_rfc3339(env!("BUILD_TIMESTAMP"))
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
    }
}
