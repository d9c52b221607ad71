use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;
use tracing::debug;

use crate::cli::config::{ExtractSettings, StrategySettings};
use crate::crawler::task::PayoutRecord;

/// Why a row was left out. Skips are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSkip {
    TooFewCells(usize),
    MissingDate,
    BadDate(String),
    NotAPayout(String),
    BadAmount(String),
}

/// One markup shape the listing may take
#[derive(Debug)]
pub struct ParseStrategy {
    name: String,
    row: Selector,
    cell: Selector,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector '{}': {:?}", css, e))
}

impl ParseStrategy {
    pub fn new(settings: &StrategySettings) -> Result<Self> {
        Ok(Self {
            name: settings.name.clone(),
            row: selector(&settings.row_selector)?,
            cell: selector(&settings.cell_selector)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Text of an element with every text node trimmed
fn cell_text(element: &ElementRef) -> String {
    element.text().map(str::trim).collect::<String>()
}

/// Turns a listing document into payout records
#[derive(Debug)]
pub struct RowExtractor {
    strategies: Vec<ParseStrategy>,
    date_format: String,
    currency_markers: Vec<String>,
}

impl RowExtractor {
    pub fn new(settings: &ExtractSettings) -> Result<Self> {
        let strategies = settings.strategies.iter()
            .map(ParseStrategy::new)
            .collect::<Result<Vec<_>>>()?;

        if strategies.is_empty() {
            anyhow::bail!("At least one parse strategy is required");
        }

        Ok(Self {
            strategies,
            date_format: settings.date_format.clone(),
            currency_markers: settings.currency_markers.clone(),
        })
    }

    /// Records from the first strategy that yields any; empty if none does
    pub fn extract(&self, html: &str, page_id: u32) -> Vec<PayoutRecord> {
        let document = Html::parse_document(html);

        for strategy in &self.strategies {
            let records = self.apply(strategy, &document, page_id);
            if !records.is_empty() {
                debug!(page = page_id, strategy = strategy.name(), rows = records.len(), "Rows extracted");
                return records;
            }
        }

        debug!(page = page_id, "No strategy matched any payout rows");
        Vec::new()
    }

    fn apply(&self, strategy: &ParseStrategy, document: &Html, page_id: u32) -> Vec<PayoutRecord> {
        let mut records = Vec::new();

        for row in document.select(&strategy.row) {
            let cells: Vec<String> = row.select(&strategy.cell).map(|c| cell_text(&c)).collect();

            match self.parse_row(&cells, page_id) {
                Ok(record) => records.push(record),
                Err(skip) => debug!(page = page_id, strategy = strategy.name(), ?skip, "Skipping row"),
            }
        }

        records
    }

    /// Validate one row of cells: date, trader, location, amount
    pub fn parse_row(&self, cells: &[String], page_id: u32) -> Result<PayoutRecord, RowSkip> {
        if cells.len() < 4 {
            return Err(RowSkip::TooFewCells(cells.len()));
        }

        let date_text = cells[0].as_str();
        if date_text.is_empty() {
            return Err(RowSkip::MissingDate);
        }
        let date = NaiveDate::parse_from_str(date_text, &self.date_format)
            .map_err(|_| RowSkip::BadDate(date_text.to_string()))?;

        let amount = self.parse_amount(&cells[3])?;

        Ok(PayoutRecord {
            trader_name: cells[1].clone(),
            location: cells[2].clone(),
            amount,
            source_page: page_id,
            observed_date: Some(date),
        })
    }

    fn parse_amount(&self, raw: &str) -> Result<Decimal, RowSkip> {
        let rest = self.currency_markers.iter()
            .find_map(|marker| raw.strip_prefix(marker.as_str()))
            .ok_or_else(|| RowSkip::NotAPayout(raw.to_string()))?;

        let cleaned: String = rest.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
        match Decimal::from_str(&cleaned) {
            Ok(amount) if !amount.is_sign_negative() => Ok(amount),
            _ => Err(RowSkip::BadAmount(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn extractor() -> RowExtractor {
        RowExtractor::new(&ExtractSettings::default()).unwrap()
    }

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_primary_div_table() {
        let html = r#"
            <div class="divTable">
              <div class="divTableRow">
                <div class="divTableCell">Date</div><div class="divTableCell">Name</div>
                <div class="divTableCell">Location</div><div class="divTableCell">Amount</div>
              </div>
              <div class="divTableRow">
                <div class="divTableCell"> Mar 04, 2024 </div><div class="divTableCell">Jane <b>D.</b></div>
                <div class="divTableCell">Texas, US</div><div class="divTableCell">$1,250.50</div>
              </div>
              <div class="divTableRow">
                <div class="divTableCell">Mar 05, 2024</div><div class="divTableCell">Raj</div>
                <div class="divTableCell">Delhi, IN</div><div class="divTableCell">$300</div>
              </div>
            </div>"#;

        let records = extractor().extract(html, 4);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].trader_name, "JaneD.");
        assert_eq!(records[0].amount, dec!(1250.50));
        assert_eq!(records[0].source_page, 4);
        assert_eq!(records[0].observed_date, NaiveDate::from_ymd_opt(2024, 3, 4));
        assert_eq!(records[1].location, "Delhi, IN");
    }

    #[test]
    fn test_falls_back_to_html_table() {
        let html = r#"
            <table>
              <tr><th>Date</th><th>Name</th><th>Location</th><th>Amount</th></tr>
              <tr><td>Jan 10, 2024</td><td>Kim</td><td>Seoul, KR</td><td>$75.00</td></tr>
            </table>"#;

        let records = extractor().extract(html, 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trader_name, "Kim");
    }

    #[test]
    fn test_no_rows_is_empty_not_error() {
        assert!(extractor().extract("<html><body>maintenance</body></html>", 1).is_empty());
    }

    #[test]
    fn test_row_skips() {
        let ex = extractor();
        assert_eq!(ex.parse_row(&cells(&["a", "b"]), 1), Err(RowSkip::TooFewCells(2)));
        assert_eq!(ex.parse_row(&cells(&["", "A", "B", "$1"]), 1), Err(RowSkip::MissingDate));
        assert!(matches!(ex.parse_row(&cells(&["yesterday", "A", "B", "$1"]), 1), Err(RowSkip::BadDate(_))));
        assert!(matches!(ex.parse_row(&cells(&["Mar 04, 2024", "A", "B", "Pending"]), 1), Err(RowSkip::NotAPayout(_))));
        assert!(matches!(ex.parse_row(&cells(&["Mar 04, 2024", "A", "B", "$-5"]), 1), Err(RowSkip::BadAmount(_))));
        assert!(matches!(ex.parse_row(&cells(&["Mar 04, 2024", "A", "B", "$abc"]), 1), Err(RowSkip::BadAmount(_))));
    }

    #[test]
    fn test_invalid_selector_is_reported() {
        let mut settings = ExtractSettings::default();
        settings.strategies[0].row_selector = "div[".to_string();
        assert!(RowExtractor::new(&settings).is_err());
    }
}
