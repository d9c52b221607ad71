use anyhow::{Result, Context};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::crawler::aggregate::TraderAggregate;
use crate::crawler::scheduler::ConcurrencyChange;

/// Run metadata shown alongside the aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportContext {
    pub total_pages: u32,
    pub successful_pages: usize,
    pub failed_pages: Vec<u32>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub batch_size_history: Vec<ConcurrencyChange>,
    pub interim: bool,
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Country is the last comma-separated part of a location
pub fn country_of(location: &str) -> &str {
    location.rsplit(',').next().unwrap_or(location).trim()
}

/// Per-country breakdown of the aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryTotals {
    pub country: String,
    pub traders: usize,
    pub total: Decimal,
    pub average: Decimal,
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        (total / Decimal::from(count)).round_dp(2)
    }
}

/// Traders, total and average payout per country, largest total first
pub fn country_totals(traders: &[TraderAggregate]) -> Vec<CountryTotals> {
    let mut by_country: BTreeMap<&str, (usize, Decimal)> = BTreeMap::new();
    for trader in traders {
        let entry = by_country.entry(country_of(&trader.key.location)).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += trader.total_earnings;
    }

    let mut totals: Vec<CountryTotals> = by_country.into_iter()
        .map(|(country, (count, total))| CountryTotals {
            country: country.to_string(),
            traders: count,
            total,
            average: average(total, count),
        })
        .collect();
    totals.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.country.cmp(&b.country)));
    totals
}

/// Render the aggregate as a standalone HTML page. Traders are listed by
/// descending total earnings, ties broken by name.
pub fn render_html(traders: &[TraderAggregate], context: &ReportContext) -> String {
    let mut ordered: Vec<&TraderAggregate> = traders.iter().collect();
    ordered.sort_by(|a, b| b.total_earnings.cmp(&a.total_earnings).then_with(|| a.key.cmp(&b.key)));

    let total: Decimal = traders.iter().map(|t| t.total_earnings).sum();
    let average = average(total, traders.len());
    let countries = country_totals(traders);

    let mut html = String::new();
    let title = if context.interim { "Payouts Report (interim)" } else { "Payouts Report" };

    let _ = writeln!(html, "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>", title);
    html.push_str("<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse}td,th{padding:4px 10px;border-bottom:1px solid #ddd}td.num{text-align:right}</style>\n</head>\n<body>\n");
    let _ = writeln!(html, "<h1>{}</h1>", title);

    html.push_str("<div class=\"run-info\">\n");
    if let Some((earliest, latest)) = context.date_range {
        let _ = writeln!(
            html,
            "<p>Report represents data from {} to {}</p>",
            earliest.format("%B %d, %Y"),
            latest.format("%B %d, %Y")
        );
    }
    let _ = writeln!(
        html,
        "<p>Successfully scraped {} out of {} pages</p>",
        context.successful_pages, context.total_pages
    );
    if !context.failed_pages.is_empty() {
        let failed = context.failed_pages.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
        let _ = writeln!(html, "<p>Failed to scrape pages: {}</p>", failed);
    }
    html.push_str("</div>\n");

    let _ = writeln!(
        html,
        "<div class=\"totals\"><p>Total Traders: {}</p><p>Total Payouts: ${}</p><p>Average Payout: ${}</p><p>Countries: {}</p></div>",
        traders.len(),
        total,
        average,
        countries.len()
    );

    if !countries.is_empty() {
        html.push_str("<h2>By country</h2>\n<table id=\"countryTotals\">\n<thead><tr><th>Country</th><th>Traders</th><th>Total Payouts</th><th>Average Payout</th></tr></thead>\n<tbody>\n");
        for country in &countries {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td class=\"num\">{}</td><td class=\"num\">${}</td><td class=\"num\">${}</td></tr>",
                escape(&country.country),
                country.traders,
                country.total,
                country.average
            );
        }
        html.push_str("</tbody>\n</table>\n");
    }

    html.push_str("<table id=\"payoutTable\">\n<thead><tr><th>#</th><th>Name</th><th>Location</th><th>Country</th><th>Total Earnings</th><th>Pages</th></tr></thead>\n<tbody>\n");
    for (rank, trader) in ordered.iter().enumerate() {
        let pages = trader.pages.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td class=\"num\">${}</td><td>{}</td></tr>",
            rank + 1,
            escape(&trader.key.name),
            escape(&trader.key.location),
            escape(country_of(&trader.key.location)),
            trader.total_earnings,
            pages
        );
    }
    html.push_str("</tbody>\n</table>\n");

    if !context.batch_size_history.is_empty() {
        html.push_str("<h2>Concurrency changes</h2>\n<table id=\"batchHistory\">\n<thead><tr><th>Pages completed</th><th>Concurrency</th></tr></thead>\n<tbody>\n");
        for change in &context.batch_size_history {
            let _ = writeln!(
                html,
                "<tr><td class=\"num\">{}</td><td class=\"num\">{}</td></tr>",
                change.pages_completed, change.concurrency
            );
        }
        html.push_str("</tbody>\n</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

/// Render and write the report
pub fn write_report(path: &Path, traders: &[TraderAggregate], context: &ReportContext) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    fs::write(path, render_html(traders, context))
        .context(format!("Failed to write report: {}", path.display()))?;

    debug!("Report written to {}", path.display());
    Ok(())
}
