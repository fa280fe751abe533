//! Engine tunables

/// Configuration for the core engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum parent-chain depth the grant resolver will walk. The data
    /// model does not forbid cycles a priori, so the walk carries a guard.
    pub max_grant_depth: usize,
    /// Hard row cap for totals/count-only report runs (unbounded limit
    /// requests stop scanning here).
    pub totals_row_cap: usize,
    /// Rows per batch when streaming a dump in or out.
    pub dump_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_grant_depth: 64,
            totals_row_cap: 100_000,
            dump_batch_size: 1024,
        }
    }
}
