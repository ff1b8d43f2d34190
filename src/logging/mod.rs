//! Structured logging via `tracing`, plus a lightweight per-source
//! enable/disable toggle for muting one noisy component without losing
//! the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The three components that emit their own log lines. A caller can mute
/// any of them independently of the global `tracing` filter, useful for
/// quieting a noisy timer-wake log without losing dispatcher output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Timer,
    WorkerPool,
    Dispatcher,
}

impl Source {
    fn index(self) -> usize {
        match self {
            Source::Timer => 0,
            Source::WorkerPool => 1,
            Source::Dispatcher => 2,
        }
    }
}

/// Per-source on/off toggle, checked before emitting a log line from
/// that source. All sources are enabled by default.
pub struct SourceFilter {
    enabled: [AtomicBool; 3],
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            enabled: [
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
            ],
        }
    }
}

impl SourceFilter {
    pub fn is_enabled(&self, source: Source) -> bool {
        self.enabled[source.index()].load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, source: Source, enabled: bool) {
        self.enabled[source.index()].store(enabled, Ordering::Relaxed);
    }
}

static FILTER: OnceLock<SourceFilter> = OnceLock::new();

/// The process-wide per-source toggle, shared by the timer, worker pool
/// and dispatcher. Lazily created with every source enabled.
pub fn filter() -> &'static SourceFilter {
    FILTER.get_or_init(SourceFilter::default)
}

/// Initialize the process-wide `tracing` subscriber. Honors `RUST_LOG`;
/// defaults to `info` when unset. Safe to call more than once — later
/// calls are no-ops (`set_global_default` failure is swallowed).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_independent() {
        let filter = SourceFilter::default();
        assert!(filter.is_enabled(Source::Timer));
        filter.set_enabled(Source::Timer, false);
        assert!(!filter.is_enabled(Source::Timer));
        assert!(filter.is_enabled(Source::WorkerPool));
    }

    #[test]
    fn global_filter_starts_with_everything_enabled() {
        assert!(filter().is_enabled(Source::Timer));
        assert!(filter().is_enabled(Source::WorkerPool));
        assert!(filter().is_enabled(Source::Dispatcher));
    }
}
