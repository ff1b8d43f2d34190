//! Bounded pool of lazily-grown tasks used by the dispatcher to run
//! transport work off the caller's path.

pub mod pool;

pub use pool::{PoolConfig, PoolMetrics, WorkerPool};
