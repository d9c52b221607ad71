use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::browser::FingerprintManager;
use crate::cli::config::RetrySettings;
use crate::crawler::fetcher::{FetchOptions, PageFetcher};
use crate::crawler::task::{PageResult, PageTask};

/// Bounded per-page retries, each attempt under a fresh client identity
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    pause_ms: (u64, u64),
    identities: FingerprintManager,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings, identities: FingerprintManager) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            pause_ms: settings.pause_ms,
            identities,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Options for one attempt with a newly drawn identity
    pub fn options(&self, page_load_timeout: Duration) -> FetchOptions {
        FetchOptions {
            identity: self.identities.random_identity(),
            page_load_timeout,
        }
    }

    /// Fetch `task` until it succeeds or the attempts run out. Any success,
    /// even one with no records, ends the loop; otherwise the last failure
    /// is returned.
    pub async fn attempt(&self, task: &PageTask, fetcher: &dyn PageFetcher, page_load_timeout: Duration) -> PageResult {
        let mut attempt = 1;

        loop {
            let opts = self.options(page_load_timeout);
            let result = fetcher.fetch(task, &opts).await;

            let reason = match &result {
                PageResult::Success { .. } => return result,
                PageResult::Failure { reason, .. } => reason,
            };

            if attempt >= self.max_attempts {
                warn!(page = task.page_id, attempts = attempt, "Giving up on page: {}", reason);
                return result;
            }

            debug!(
                page = task.page_id,
                attempt,
                identity = %opts.identity.name,
                "Attempt failed ({}), retrying",
                reason
            );
            self.pause().await;
            attempt += 1;
        }
    }

    /// Short randomized pause so retries of concurrent pages do not line up
    pub async fn pause(&self) {
        let (min, max) = self.pause_ms;
        let ms = if max > min { thread_rng().gen_range(min..=max) } else { min };
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
    }
}
