pub mod aggregate;
pub mod controller;
pub mod fetcher;
pub mod retry;
pub mod scheduler;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use aggregate::{Aggregator, TraderAggregate};
pub use controller::{FailureClass, RunController, RunOutcome, RunSummary};
pub use fetcher::{PageFetcher, SitePageFetcher};
pub use retry::RetryPolicy;
pub use scheduler::{AdaptiveScheduler, ConcurrencyChange};
pub use task::{FetchError, PageResult, PageTask, PayoutRecord, TraderKey};
