use std::time::Instant;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Page fetch metrics, owned by the scheduler's control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMetrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Pages that reached a terminal state
    pub pages_completed: usize,

    /// Pages fetched successfully
    pub pages_succeeded: usize,

    /// Pages that failed or were cancelled
    pub pages_failed: usize,

    /// Payout rows extracted
    pub records_extracted: usize,

    /// Wall time per completed page, in milliseconds
    pub page_durations_ms: Vec<u64>,

    /// Pages completed per minute
    pub completion_rate: Vec<(DateTime<Utc>, usize)>,

    /// Best minute so far
    pub peak_pages_per_minute: usize,
}

impl Default for FetchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            pages_completed: 0,
            pages_succeeded: 0,
            pages_failed: 0,
            records_extracted: 0,
            page_durations_ms: Vec::new(),
            completion_rate: Vec::new(),
            peak_pages_per_minute: 0,
        }
    }

    /// Record a completed page
    pub fn record_page(&mut self, success: bool, records: usize, duration_ms: u64) {
        self.pages_completed += 1;
        if success {
            self.pages_succeeded += 1;
        } else {
            self.pages_failed += 1;
        }
        self.records_extracted += records;
        self.page_durations_ms.push(duration_ms);

        let now = Utc::now();
        match self.completion_rate.last_mut() {
            Some((minute_start, count)) if (now - *minute_start).num_seconds() < 60 => *count += 1,
            _ => self.completion_rate.push((now, 1)),
        }

        if let Some((_, count)) = self.completion_rate.last() {
            self.peak_pages_per_minute = self.peak_pages_per_minute.max(*count);
        }
    }

    /// Mean page time in milliseconds
    pub fn mean_duration_ms(&self) -> Option<u64> {
        if self.page_durations_ms.is_empty() {
            return None;
        }
        Some(self.page_durations_ms.iter().sum::<u64>() / self.page_durations_ms.len() as u64)
    }
}

/// Request timer for measuring page durations
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_page_counts() {
        let mut metrics = FetchMetrics::new();
        metrics.record_page(true, 3, 100);
        metrics.record_page(false, 0, 300);

        assert_eq!(metrics.pages_completed, 2);
        assert_eq!(metrics.pages_succeeded, 1);
        assert_eq!(metrics.pages_failed, 1);
        assert_eq!(metrics.records_extracted, 3);
        assert_eq!(metrics.mean_duration_ms(), Some(200));
        assert_eq!(metrics.peak_pages_per_minute, 2);
    }

    #[test]
    fn test_empty_metrics_have_no_mean() {
        assert_eq!(FetchMetrics::new().mean_duration_ms(), None);
    }
}
