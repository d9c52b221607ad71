use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// One listing page to be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    /// Identity of this submission; a resubmitted page gets a new one
    pub id: Uuid,

    /// 1-based page number
    pub page_id: u32,

    /// Address of the page
    pub url: Url,
}

impl PageTask {
    /// Build the task for `page_id`. Page 1 is the bare listing URL,
    /// later pages carry the `p` query parameter.
    pub fn new(base: &Url, page_id: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_id,
            url: page_url(base, page_id),
        }
    }

    /// Same page, fresh identity
    pub fn resubmit(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_id: self.page_id,
            url: self.url.clone(),
        }
    }
}

/// URL of a listing page
pub fn page_url(base: &Url, page_id: u32) -> Url {
    let mut url = base.clone();
    if page_id > 1 {
        url.query_pairs_mut().append_pair("p", &page_id.to_string());
    }
    url
}

/// One extracted payout row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub trader_name: String,
    pub location: String,
    pub amount: Decimal,
    pub source_page: u32,
    pub observed_date: Option<NaiveDate>,
}

impl PayoutRecord {
    /// Grouping key for aggregation
    pub fn key(&self) -> TraderKey {
        TraderKey {
            name: self.trader_name.clone(),
            location: self.location.clone(),
        }
    }
}

/// Identity of a trader across pages
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraderKey {
    pub name: String,
    pub location: String,
}

/// Why a page fetch failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    #[error("blocked by the server (HTTP 403)")]
    Blocked,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("stalled past the wait window")]
    Stalled,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("worker panicked")]
    Panicked,
}

impl FetchError {
    /// Map a reqwest failure onto the taxonomy
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Outcome of fetching one page
#[derive(Debug, Clone, PartialEq)]
pub enum PageResult {
    Success {
        page_id: u32,
        records: Vec<PayoutRecord>,
    },
    Failure {
        page_id: u32,
        reason: FetchError,
    },
}

impl PageResult {
    pub fn success(page_id: u32, records: Vec<PayoutRecord>) -> Self {
        PageResult::Success { page_id, records }
    }

    pub fn failure(page_id: u32, reason: FetchError) -> Self {
        PageResult::Failure { page_id, reason }
    }

    pub fn page_id(&self) -> u32 {
        match self {
            PageResult::Success { page_id, .. } | PageResult::Failure { page_id, .. } => *page_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PageResult::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_url_convention() {
        let base = Url::parse("https://example.com/payouts").unwrap();
        assert_eq!(page_url(&base, 1).as_str(), "https://example.com/payouts");
        assert_eq!(page_url(&base, 7).as_str(), "https://example.com/payouts?p=7");
    }

    #[test]
    fn test_resubmit_keeps_page_but_not_identity() {
        let base = Url::parse("https://example.com/payouts").unwrap();
        let task = PageTask::new(&base, 3);
        let again = task.resubmit();
        assert_eq!(again.page_id, 3);
        assert_eq!(again.url, task.url);
        assert_ne!(again.id, task.id);
    }

    #[test]
    fn test_fetch_error_serializes_with_kind() {
        let json = serde_json::to_value(FetchError::Status(502)).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["detail"], 502);
    }
}
