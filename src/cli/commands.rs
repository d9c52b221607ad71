use anyhow::{Result, Context};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::config::{CrawlerConfig, OutputSettings};
use crate::cli::CrawlOverrides;
use crate::crawler::controller::{RunController, RunOutcome, RunSummary};
use crate::storage::{
    read_aggregate_table, write_aggregate_table, write_raw_table, write_report,
    CheckpointEmitter, FileCheckpointSink, ReportContext,
};

/// Run a full crawl and write every artifact
pub async fn crawl(profile: String, overrides: CrawlOverrides) -> Result<()> {
    let mut config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    apply_overrides(&mut config, overrides);
    config.validate()?;

    let controller = RunController::from_config(&config)?;

    let sink = FileCheckpointSink::new(config.output.interim_path(), config.output.report_path());
    let checkpoints = CheckpointEmitter::spawn(Arc::new(sink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, abandoning outstanding pages");
            let _ = shutdown_tx.send(true);
        }
    });

    let outcome = controller.run(&checkpoints, shutdown_rx).await;
    signal.abort();

    let written = checkpoints.finish().await;
    info!(checkpoints = written, "Checkpoint writer drained");

    write_artifacts(&config.output, &outcome)?;

    let summary = &outcome.summary;
    println!("Pages: {} succeeded, {} failed, {} total", summary.successful_pages.len(), summary.failed_pages.len(), summary.total_pages);
    println!("Traders: {}", outcome.traders.len());
    if !summary.failed_pages.is_empty() {
        println!("Failed pages:");
        for (page, failure) in &summary.failed_pages {
            println!("  - {} ({:?}: {})", page, failure.class, failure.reason);
        }
    }
    if summary.interrupted {
        println!("Run was interrupted; results are partial");
    }
    println!("Report: {}", config.output.report_path().display());

    Ok(())
}

/// Command line values win over the profile
pub fn apply_overrides(config: &mut CrawlerConfig, overrides: CrawlOverrides) {
    if let Some(url) = overrides.url {
        config.crawler.base_url = url;
    }

    if let Some(pages) = overrides.pages {
        config.crawler.last_page = Some(pages);
    }

    if let Some(concurrency) = overrides.concurrency {
        config.scheduler.initial_concurrency = concurrency;
        config.scheduler.max_concurrency = config.scheduler.max_concurrency.max(concurrency);
    }

    if let Some(mode) = overrides.mode {
        config.crawler.fetch_mode = mode;
    }

    if let Some(output) = overrides.output {
        config.output.directory = output;
    }
}

/// Raw and aggregated tables, run summary and the final report
pub fn write_artifacts(output: &OutputSettings, outcome: &RunOutcome) -> Result<()> {
    write_raw_table(&output.raw_path(), &outcome.records)?;
    write_aggregate_table(&output.aggregated_path(), &outcome.traders)?;

    let summary_path = output.summary_path();
    let json = serde_json::to_string_pretty(&outcome.summary)
        .context("Failed to serialize run summary")?;
    fs::write(&summary_path, json)
        .context(format!("Failed to write run summary: {}", summary_path.display()))?;

    write_report(&output.report_path(), &outcome.traders, &outcome.summary.report_context())?;

    info!("Artifacts written to {}", output.directory.display());
    Ok(())
}

/// Re-render the report from a saved aggregated table
pub fn report(input: PathBuf, summary: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let traders = read_aggregate_table(&input)?;

    let context = match summary {
        Some(path) => load_summary(&path)?.report_context(),
        None => {
            // Without a summary all we know is which pages contributed rows
            let pages: BTreeSet<u32> = traders.iter().flat_map(|t| t.pages.iter().copied()).collect();
            ReportContext {
                total_pages: pages.iter().next_back().copied().unwrap_or(0),
                successful_pages: pages.len(),
                ..Default::default()
            }
        }
    };

    let output = output.unwrap_or_else(|| input.with_extension("html"));
    write_report(&output, &traders, &context)?;

    println!("Report written to {} ({} traders)", output.display(), traders.len());
    Ok(())
}

fn load_summary(path: &Path) -> Result<RunSummary> {
    let contents = fs::read_to_string(path)
        .context(format!("Failed to read run summary: {}", path.display()))?;
    serde_json::from_str(&contents)
        .context(format!("Failed to parse run summary: {}", path.display()))
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    println!("  - default");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults if it does not exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::FetchMode;
    use crate::crawler::aggregate::Aggregator;
    use crate::crawler::controller::{FailureClass, PageFailure};
    use crate::crawler::task::{FetchError, PayoutRecord};
    use crate::utils::metrics::FetchMetrics;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn outcome() -> RunOutcome {
        let mut aggregator = Aggregator::new();
        aggregator.absorb(vec![
            PayoutRecord {
                trader_name: "Ann".to_string(),
                location: "Austin, United States".to_string(),
                amount: dec!(1200.50),
                source_page: 1,
                observed_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            },
            PayoutRecord {
                trader_name: "Ann".to_string(),
                location: "Austin, United States".to_string(),
                amount: dec!(99.50),
                source_page: 3,
                observed_date: NaiveDate::from_ymd_opt(2024, 2, 9),
            },
        ]);

        let mut failed_pages = BTreeMap::new();
        failed_pages.insert(2, PageFailure { class: FailureClass::PersistentFailure, reason: FetchError::Blocked });

        RunOutcome {
            summary: RunSummary {
                total_pages: 3,
                successful_pages: BTreeSet::from([1, 3]),
                failed_pages,
                date_range: aggregator.date_range(),
                batch_size_history: Vec::new(),
                metrics: FetchMetrics::new(),
                interrupted: false,
            },
            traders: aggregator.snapshot(),
            records: aggregator.records().to_vec(),
        }
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = CrawlerConfig::default();
        apply_overrides(&mut config, CrawlOverrides {
            url: Some("https://example.com/list".to_string()),
            pages: Some(7),
            concurrency: Some(150),
            mode: Some(FetchMode::Http),
            output: Some(PathBuf::from("/tmp/out")),
        });

        assert_eq!(config.crawler.base_url, "https://example.com/list");
        assert_eq!(config.crawler.last_page, Some(7));
        assert_eq!(config.scheduler.initial_concurrency, 150);
        assert_eq!(config.scheduler.max_concurrency, 150);
        assert_eq!(config.crawler.fetch_mode, FetchMode::Http);
        assert_eq!(config.output.directory, PathBuf::from("/tmp/out"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_artifacts_and_report_from_saved_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = CrawlerConfig::default().output;
        output.directory = dir.path().to_path_buf();

        let outcome = outcome();
        write_artifacts(&output, &outcome).unwrap();

        assert!(output.raw_path().exists());
        assert_eq!(read_aggregate_table(&output.aggregated_path()).unwrap(), outcome.traders);
        assert_eq!(load_summary(&output.summary_path()).unwrap().failed_pages, outcome.summary.failed_pages);

        let rerendered = dir.path().join("again.html");
        report(output.aggregated_path(), Some(output.summary_path()), Some(rerendered.clone())).unwrap();
        let html = fs::read_to_string(&rerendered).unwrap();
        assert!(html.contains("Successfully scraped 2 out of 3 pages"));
        assert!(html.contains("Failed to scrape pages: 2"));
        assert!(html.contains("$1300.00"));

        report(output.aggregated_path(), None, None).unwrap();
        let fallback = fs::read_to_string(output.aggregated_path().with_extension("html")).unwrap();
        assert!(fallback.contains("Successfully scraped 2 out of 3 pages"));
    }
}
