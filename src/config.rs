//! Dispatcher configuration.
//!
//! This crate has no CLI or API surface of its own, so there's no
//! `clap::Parser` here. What carries over is the builder pattern
//! (`with_*` methods returning `Self`) and reading overrides from the
//! environment, same shape as a CLI `Args` struct, minus the
//! argument-parsing layer.

use std::time::Duration;

/// Runtime configuration for a `UrlDispatcher`.
///
/// `max_concurrent_per_endpoint`, `max_long_per_endpoint` and
/// `use_shared_transport` are the three knobs named directly; everything
/// else is ambient (timeouts, pool sizing).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Total in-flight requests allowed per endpoint, across both classes.
    pub max_concurrent_per_endpoint: usize,
    /// Of those, how many may be `Long` class at once.
    pub max_long_per_endpoint: usize,
    /// Prefer one shared transport client over one per operation.
    pub use_shared_transport: bool,
    pub short_request_timeout: Duration,
    pub long_request_timeout: Duration,
    pub worker_pool_size: usize,
    pub worker_idle_timeout: Duration,
    pub worker_reuse_grace: Duration,
    pub worker_queue_capacity: usize,
    /// Wake interval for the process-wide `TimerService`. Only takes
    /// effect for the first `UrlDispatcher` constructed in a process —
    /// the timer is a true singleton, not a per-dispatcher instance.
    pub timer_wake_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_endpoint: 4,
            max_long_per_endpoint: 2,
            use_shared_transport: true,
            short_request_timeout: Duration::from_secs(30),
            long_request_timeout: Duration::from_secs(300),
            worker_pool_size: 8,
            worker_idle_timeout: Duration::from_secs(15),
            worker_reuse_grace: Duration::from_secs(10),
            worker_queue_capacity: 1024,
            timer_wake_interval: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_concurrent_per_endpoint(mut self, n: usize) -> Self {
        self.max_concurrent_per_endpoint = n;
        self
    }

    pub fn with_max_long_per_endpoint(mut self, n: usize) -> Self {
        self.max_long_per_endpoint = n;
        self
    }

    pub fn with_use_shared_transport(mut self, enabled: bool) -> Self {
        self.use_shared_transport = enabled;
        self
    }

    pub fn with_short_request_timeout(mut self, timeout: Duration) -> Self {
        self.short_request_timeout = timeout;
        self
    }

    pub fn with_long_request_timeout(mut self, timeout: Duration) -> Self {
        self.long_request_timeout = timeout;
        self
    }

    pub fn with_worker_pool_size(mut self, n: usize) -> Self {
        self.worker_pool_size = n;
        self
    }

    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    /// Overlay any `GATEKEEPER_*` environment variables present on top of
    /// the current values. Unset or unparseable variables are left alone
    /// and logged at `warn`, not treated as fatal.
    pub fn from_env(mut self) -> Self {
        if let Some(v) = parse_env("GATEKEEPER_MAX_CONCURRENT_PER_ENDPOINT") {
            self.max_concurrent_per_endpoint = v;
        }
        if let Some(v) = parse_env("GATEKEEPER_MAX_LONG_PER_ENDPOINT") {
            self.max_long_per_endpoint = v;
        }
        if let Some(v) = std::env::var("GATEKEEPER_USE_SHARED_TRANSPORT")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
        {
            self.use_shared_transport = v;
        }
        if let Some(v) = parse_env::<u64>("GATEKEEPER_SHORT_TIMEOUT_MS") {
            self.short_request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>("GATEKEEPER_LONG_TIMEOUT_MS") {
            self.long_request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env("GATEKEEPER_WORKER_POOL_SIZE") {
            self.worker_pool_size = v;
        }
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
                None
            }
        },
        Err(_) => None,
    }
}
