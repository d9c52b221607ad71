use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::crawler::task::{PayoutRecord, TraderKey};

/// Accumulated payouts for one (name, location) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderAggregate {
    pub key: TraderKey,
    pub total_earnings: Decimal,
    pub pages: Vec<u32>,
}

#[derive(Debug, Default)]
struct Accumulator {
    total: Decimal,
    pages: BTreeSet<u32>,
}

/// Per-trader reduction of every record absorbed so far.
///
/// Absorption is commutative: totals are sums and page lists are set
/// unions, so completion order between pages does not matter. Records
/// are not deduplicated; feeding the same page twice double-counts it.
#[derive(Debug, Default)]
pub struct Aggregator {
    traders: BTreeMap<TraderKey, Accumulator>,
    records: Vec<PayoutRecord>,
    earliest: Option<NaiveDate>,
    latest: Option<NaiveDate>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a page's records into the per-trader totals
    pub fn absorb(&mut self, records: Vec<PayoutRecord>) {
        for record in records {
            let entry = self.traders.entry(record.key()).or_default();
            entry.total += record.amount;
            entry.pages.insert(record.source_page);

            if let Some(date) = record.observed_date {
                self.earliest = Some(self.earliest.map_or(date, |d| d.min(date)));
                self.latest = Some(self.latest.map_or(date, |d| d.max(date)));
            }

            self.records.push(record);
        }
    }

    /// Current aggregate, ordered by key
    pub fn snapshot(&self) -> Vec<TraderAggregate> {
        self.traders
            .iter()
            .map(|(key, acc)| TraderAggregate {
                key: key.clone(),
                total_earnings: acc.total,
                pages: acc.pages.iter().copied().collect(),
            })
            .collect()
    }

    /// Every record absorbed, in absorption order
    pub fn records(&self) -> &[PayoutRecord] {
        &self.records
    }

    /// Earliest and latest observed payout dates
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.earliest.zip(self.latest)
    }

    pub fn trader_count(&self) -> usize {
        self.traders.len()
    }
}
