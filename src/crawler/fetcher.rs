use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::fingerprint::ClientIdentity;
use crate::crawler::task::{FetchError, PageResult, PageTask};
use crate::parser::{PaginationReader, RowExtractor};

/// Per-attempt fetch parameters
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub identity: ClientIdentity,
    pub page_load_timeout: Duration,
}

/// Retrieves and parses one listing page
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    /// One attempt at one page. Never panics on network trouble; failures
    /// come back as `PageResult::Failure`.
    async fn fetch(&self, task: &PageTask, opts: &FetchOptions) -> PageResult;

    /// Page count advertised by the first page, if it has a pagination control
    async fn page_count(&self, base: &Url, opts: &FetchOptions) -> Result<Option<u32>, FetchError>;
}

/// An isolated browsing context (cookie jar, browser profile) for one fetch
#[async_trait]
pub trait PageSession: Send {
    /// Navigate to `url` and return the document once it is ready
    async fn load(&mut self, url: &Url) -> Result<String, FetchError>;

    /// Reload the current document
    async fn refresh(&mut self) -> Result<String, FetchError>;

    /// Release the context
    async fn close(self: Box<Self>);
}

/// Opens sessions configured for one client identity
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    async fn open(&self, opts: &FetchOptions) -> Result<Box<dyn PageSession>, FetchError>;
}

/// Page fetcher for the payout listing over any session backend
pub struct SitePageFetcher {
    sessions: Arc<dyn SessionFactory>,
    extractor: RowExtractor,
    pagination: PaginationReader,
}

impl SitePageFetcher {
    pub fn new(sessions: Arc<dyn SessionFactory>, extractor: RowExtractor, pagination: PaginationReader) -> Self {
        Self {
            sessions,
            extractor,
            pagination,
        }
    }

    async fn load_records(&self, session: &mut dyn PageSession, task: &PageTask) -> Result<PageResult, FetchError> {
        let html = session.load(&task.url).await?;
        let records = self.extractor.extract(&html, task.page_id);
        if !records.is_empty() {
            return Ok(PageResult::success(task.page_id, records));
        }

        debug!(page = task.page_id, "No rows found, refreshing once");
        let html = session.refresh().await?;
        let records = self.extractor.extract(&html, task.page_id);
        if records.is_empty() {
            info!(page = task.page_id, "Page has no payout rows");
        }

        Ok(PageResult::success(task.page_id, records))
    }
}

#[async_trait]
impl PageFetcher for SitePageFetcher {
    async fn fetch(&self, task: &PageTask, opts: &FetchOptions) -> PageResult {
        let mut session = match self.sessions.open(opts).await {
            Ok(session) => session,
            Err(e) => {
                warn!(page = task.page_id, "Failed to open session: {}", e);
                return PageResult::failure(task.page_id, e);
            }
        };

        let outcome = self.load_records(session.as_mut(), task).await;
        session.close().await;

        outcome.unwrap_or_else(|e| PageResult::failure(task.page_id, e))
    }

    async fn page_count(&self, base: &Url, opts: &FetchOptions) -> Result<Option<u32>, FetchError> {
        let mut session = self.sessions.open(opts).await?;
        let loaded = session.load(base).await;
        session.close().await;

        Ok(self.pagination.last_page(&loaded?))
    }
}
