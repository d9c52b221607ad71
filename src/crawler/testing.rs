//! Test doubles shared by the scheduler and controller tests.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::crawler::fetcher::{FetchOptions, PageFetcher};
use crate::crawler::task::{FetchError, PageResult, PageTask, PayoutRecord};
use crate::storage::checkpoint::{Checkpoint, CheckpointSink};

/// Fetcher with per-page scripted behaviour
#[derive(Default)]
pub struct ScriptedFetcher {
    pub failing: HashSet<u32>,
    pub hanging: HashSet<u32>,
    /// Page fails on its first `n` calls, then succeeds
    pub flaky: HashMap<u32, u32>,
    pub delay: Duration,
    pub pages: Option<u32>,
    calls: Mutex<HashMap<u32, u32>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, pages: &[u32]) -> Self {
        self.failing.extend(pages);
        self
    }

    pub fn hanging(mut self, pages: &[u32]) -> Self {
        self.hanging.extend(pages);
        self
    }

    pub fn flaky(mut self, page: u32, failures: u32) -> Self {
        self.flaky.insert(page, failures);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_page_count(mut self, pages: u32) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn calls(&self, page: u32) -> u32 {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Two payouts per page, both for the page's own trader
    pub fn records_for(page: u32) -> Vec<PayoutRecord> {
        (0..2)
            .map(|i| PayoutRecord {
                trader_name: format!("trader-{}", page),
                location: format!("City {}, Country", page),
                amount: Decimal::from(100 * page + i),
                source_page: page,
                observed_date: None,
            })
            .collect()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, task: &PageTask, _opts: &FetchOptions) -> PageResult {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(task.page_id).or_insert(0);
            *count += 1;
            *count
        };

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if self.hanging.contains(&task.page_id) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        let flaky = self.flaky.get(&task.page_id).is_some_and(|failures| call <= *failures);
        if self.failing.contains(&task.page_id) || flaky {
            PageResult::failure(task.page_id, FetchError::Blocked)
        } else {
            PageResult::success(task.page_id, Self::records_for(task.page_id))
        }
    }

    async fn page_count(&self, _base: &Url, _opts: &FetchOptions) -> Result<Option<u32>, FetchError> {
        self.pages.map(Some).ok_or_else(|| FetchError::Network("no pagination scripted".to_string()))
    }
}

/// Keeps every checkpoint in memory
#[derive(Default)]
pub struct RecordingSink {
    pub checkpoints: Mutex<Vec<Checkpoint>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.checkpoints.lock().unwrap().len()
    }
}

impl CheckpointSink for RecordingSink {
    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}

pub fn base_url() -> Url {
    Url::parse("https://example.com/payouts").unwrap()
}

pub fn tasks(pages: std::ops::RangeInclusive<u32>) -> Vec<PageTask> {
    let base = base_url();
    pages.map(|page| PageTask::new(&base, page)).collect()
}
