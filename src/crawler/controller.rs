use anyhow::{Result, Context};
use chrono::NaiveDate;
use futures::FutureExt;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::browser::{FingerprintManager, HttpSessionFactory, WebDriverSessionFactory};
use crate::cli::config::{CrawlerConfig, FetchMode, SchedulerSettings};
use crate::crawler::aggregate::{Aggregator, TraderAggregate};
use crate::crawler::fetcher::{PageFetcher, SessionFactory, SitePageFetcher};
use crate::crawler::retry::RetryPolicy;
use crate::crawler::scheduler::{AdaptiveScheduler, ConcurrencyChange};
use crate::crawler::task::{FetchError, PageResult, PageTask, PayoutRecord};
use crate::parser::{PaginationReader, RowExtractor};
use crate::storage::checkpoint::CheckpointEmitter;
use crate::storage::report::ReportContext;
use crate::utils::metrics::{FetchMetrics, RequestTimer};

/// How far a failed page got before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Failed the concurrent pass; the serial pass never reached it
    ExhaustedRetries,
    /// Failed the concurrent pass and the serial retry
    PersistentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    pub class: FailureClass,
    pub reason: FetchError,
}

/// Final account of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_pages: u32,
    pub successful_pages: BTreeSet<u32>,
    pub failed_pages: BTreeMap<u32, PageFailure>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub batch_size_history: Vec<ConcurrencyChange>,
    pub metrics: FetchMetrics,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn report_context(&self) -> ReportContext {
        ReportContext {
            total_pages: self.total_pages,
            successful_pages: self.successful_pages.len(),
            failed_pages: self.failed_pages.keys().copied().collect(),
            date_range: self.date_range,
            batch_size_history: self.batch_size_history.clone(),
            interim: false,
        }
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub traders: Vec<TraderAggregate>,
    pub records: Vec<PayoutRecord>,
}

/// Run state the serial pass updates
struct SerialPass<'a> {
    originals: &'a BTreeMap<u32, PageTask>,
    failed: &'a mut BTreeMap<u32, PageFailure>,
    succeeded: &'a mut BTreeSet<u32>,
    aggregator: &'a mut Aggregator,
    metrics: &'a mut FetchMetrics,
}

/// Drives one crawl from page-count discovery to the final aggregate
pub struct RunController {
    fetcher: Arc<dyn PageFetcher>,
    retry: Arc<RetryPolicy>,
    base_url: Url,
    last_page: Option<u32>,
    scheduler: SchedulerSettings,
    page_load_timeout: Duration,
    serial_page_load_timeout: Duration,
}

impl RunController {
    pub fn new(fetcher: Arc<dyn PageFetcher>, retry: Arc<RetryPolicy>, config: &CrawlerConfig) -> Result<Self> {
        let base_url = Url::parse(&config.crawler.base_url)
            .context(format!("Invalid base URL: {}", config.crawler.base_url))?;

        Ok(Self {
            fetcher,
            retry,
            base_url,
            last_page: config.crawler.last_page,
            scheduler: config.scheduler.clone(),
            page_load_timeout: config.fetch.page_load_timeout(),
            serial_page_load_timeout: config.fetch.serial_page_load_timeout(),
        })
    }

    /// Wire up the fetcher stack named by the configuration
    pub fn from_config(config: &CrawlerConfig) -> Result<Self> {
        let identities = FingerprintManager::new(config.browser.fingerprints.clone())?;
        let retry = RetryPolicy::new(&config.retry, identities);

        let sessions: Arc<dyn SessionFactory> = match config.crawler.fetch_mode {
            FetchMode::Http => Arc::new(HttpSessionFactory::new()),
            FetchMode::Browser => Arc::new(WebDriverSessionFactory::new(
                &config.fetch,
                &config.extract.readiness_selector,
            )),
        };

        let extractor = RowExtractor::new(&config.extract).context("Invalid extraction settings")?;
        let pagination = PaginationReader::new(&config.extract.pagination_selector)
            .context("Invalid pagination selector")?;

        let fetcher = SitePageFetcher::new(sessions, extractor, pagination);
        Self::new(Arc::new(fetcher), Arc::new(retry), config)
    }

    /// Number of pages to crawl. Falls back to a single page when the first
    /// page cannot be read or has no pagination control.
    pub async fn discover_pages(&self) -> u32 {
        if let Some(pages) = self.last_page {
            info!(pages, "Using configured page count");
            return pages.max(1);
        }

        let opts = self.retry.options(self.page_load_timeout);
        match self.fetcher.page_count(&self.base_url, &opts).await {
            Ok(Some(pages)) if pages > 0 => {
                info!(pages, "Discovered page count");
                pages
            }
            Ok(_) => {
                warn!("No pagination found, crawling a single page");
                1
            }
            Err(e) => {
                warn!("Page count discovery failed ({}), crawling a single page", e);
                1
            }
        }
    }

    pub async fn run(&self, checkpoints: &CheckpointEmitter, shutdown: watch::Receiver<bool>) -> RunOutcome {
        let total_pages = self.discover_pages().await;
        let tasks: Vec<PageTask> = (1..=total_pages)
            .map(|page| PageTask::new(&self.base_url, page))
            .collect();

        let originals: BTreeMap<u32, PageTask> = tasks.iter().map(|t| (t.page_id, t.clone())).collect();

        let mut aggregator = Aggregator::new();
        let scheduler = AdaptiveScheduler::new(
            self.fetcher.clone(),
            self.retry.clone(),
            self.page_load_timeout,
            self.scheduler.clone(),
        );
        let report = scheduler.run(tasks, &mut aggregator, checkpoints, shutdown.clone()).await;

        let mut successful_pages = report.succeeded;
        let mut metrics = report.metrics;
        let mut interrupted = report.interrupted;
        let mut failed_pages: BTreeMap<u32, PageFailure> = report.failed.into_iter()
            .map(|(page, reason)| (page, PageFailure { class: FailureClass::ExhaustedRetries, reason }))
            .collect();

        if interrupted {
            warn!(failed = failed_pages.len(), "Run interrupted, skipping the serial retry pass");
        } else if !failed_pages.is_empty() {
            let mut serial = SerialPass {
                originals: &originals,
                failed: &mut failed_pages,
                succeeded: &mut successful_pages,
                aggregator: &mut aggregator,
                metrics: &mut metrics,
            };
            interrupted = !self.serial_pass(&mut serial, &shutdown).await;
        }

        info!(
            total = total_pages,
            succeeded = successful_pages.len(),
            failed = failed_pages.len(),
            traders = aggregator.trader_count(),
            "Run complete"
        );

        RunOutcome {
            summary: RunSummary {
                total_pages,
                successful_pages,
                failed_pages,
                date_range: aggregator.date_range(),
                batch_size_history: report.batch_size_history,
                metrics,
                interrupted,
            },
            traders: aggregator.snapshot(),
            records: aggregator.records().to_vec(),
        }
    }

    /// One more attempt per failed page, one page at a time, with the longer
    /// timeout. Returns false if shutdown cut the pass short.
    async fn serial_pass(&self, serial: &mut SerialPass<'_>, shutdown: &watch::Receiver<bool>) -> bool {
        let pages: Vec<u32> = serial.failed.keys().copied().collect();
        info!(pages = ?pages, concurrent_attempts = self.retry.max_attempts(), "Serial retry pass");

        for (i, page) in pages.iter().copied().enumerate() {
            if *shutdown.borrow() {
                warn!(remaining = pages.len() - i, "Shutdown requested, stopping the serial retry pass");
                return false;
            }
            if i > 0 {
                self.retry.pause().await;
            }

            let task = serial.originals.get(&page)
                .map(PageTask::resubmit)
                .unwrap_or_else(|| PageTask::new(&self.base_url, page));
            let opts = self.retry.options(self.serial_page_load_timeout);
            let timer = RequestTimer::start();
            let result = AssertUnwindSafe(self.fetcher.fetch(&task, &opts))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| PageResult::failure(page, FetchError::Panicked));

            match result {
                PageResult::Success { records, .. } => {
                    info!(page, records = records.len(), "Recovered page in serial pass");
                    serial.metrics.record_page(true, records.len(), timer.elapsed_ms());
                    serial.aggregator.absorb(records);
                    serial.failed.remove(&page);
                    serial.succeeded.insert(page);
                }
                PageResult::Failure { reason, .. } => {
                    warn!(page, "Page failed the serial pass: {}", reason);
                    serial.metrics.record_page(false, 0, timer.elapsed_ms());
                    serial.failed.insert(page, PageFailure { class: FailureClass::PersistentFailure, reason });
                }
            }
        }

        true
    }
}
