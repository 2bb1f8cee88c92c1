//! The ingestion engine: region queues fed from the backlog and drained into
//! batch updates on a per-server tick.
pub mod batch;
pub mod fetcher;
pub mod merge;
pub mod region;
pub mod retry;
pub mod scheduler;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchUpdater, PlayerOutcome};
pub use fetcher::{BacklogFetcher, RefillReport, COOLDOWN_WINDOW};
pub use region::{FetchState, RegionState};
pub use retry::{RetryPolicy, MAX_RETRIES};
pub use scheduler::{RegionScheduler, ServerRunner, TickOutcome};
pub use stats::{StatsReport, StatsTracker};
