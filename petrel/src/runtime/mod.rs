//! Worker pool and shutdown signalling for pipeline dispatch.

mod pool;

pub use pool::{ShutdownToken, WorkerPool};
