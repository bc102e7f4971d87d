use std::time::Duration;

/// Default pause between reconciliation passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed passes after which a container is flagged.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between passes. Also the wait bound for one pass.
    pub interval: Duration,
    /// Upper bound on transactions applied per container per pass.
    pub max_transactions_per_container: usize,
    pub failure_threshold: u32,
    /// How long a purged tombstone is kept before it is reclaimed.
    pub tombstone_retention: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            interval: DEFAULT_INTERVAL,
            max_transactions_per_container: 64,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            tombstone_retention: Duration::from_secs(10 * 60),
        }
    }
}
