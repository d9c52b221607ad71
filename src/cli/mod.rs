pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::FetchMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every payout page and write the tables and report
    Crawl {
        /// Listing URL, overrides the profile
        #[arg(short, long)]
        url: Option<String>,

        /// Site profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Number of pages, skips discovery
        #[arg(long)]
        pages: Option<u32>,

        /// Starting (and minimum) concurrency
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// How pages are fetched
        #[arg(short, long, value_enum)]
        mode: Option<FetchMode>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render the HTML report from a saved aggregated table
    Report {
        /// Aggregated CSV to read
        #[arg(short, long, required = true)]
        input: PathBuf,

        /// Run summary JSON with the run metadata
        #[arg(short, long)]
        summary: Option<PathBuf>,

        /// Report file to write
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Overrides applied on top of the loaded profile
#[derive(Debug, Default)]
pub struct CrawlOverrides {
    pub url: Option<String>,
    pub pages: Option<u32>,
    pub concurrency: Option<usize>,
    pub mode: Option<FetchMode>,
    pub output: Option<PathBuf>,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { url, profile, pages, concurrency, mode, output } => {
            info!("Starting crawl with profile {}", profile);
            let overrides = CrawlOverrides { url, pages, concurrency, mode, output };
            commands::crawl(profile, overrides).await
        },
        Commands::Report { input, summary, output } => {
            info!("Rendering report from {}", input.display());
            commands::report(input, summary, output)
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_crawl_overrides_parse() {
        let cli = Cli::try_parse_from([
            "payout-crawler", "crawl", "--pages", "12", "--mode", "browser", "-c", "4", "--verbose",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Crawl { pages, mode, concurrency, profile, .. } => {
                assert_eq!(pages, Some(12));
                assert_eq!(mode, Some(FetchMode::Browser));
                assert_eq!(concurrency, Some(4));
                assert_eq!(profile, "default");
            }
            _ => panic!("expected crawl"),
        }
    }

    #[tokio::test]
    async fn test_report_command_renders_saved_table() {
        use crate::crawler::aggregate::TraderAggregate;
        use crate::crawler::task::TraderKey;
        use crate::storage::write_aggregate_table;
        use rust_decimal_macros::dec;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("aggregated.csv");
        let output = dir.path().join("out.html");
        write_aggregate_table(&input, &[TraderAggregate {
            key: TraderKey { name: "Ann".to_string(), location: "Austin, United States".to_string() },
            total_earnings: dec!(75.25),
            pages: vec![1, 2],
        }])
        .unwrap();

        let cli = Cli::try_parse_from([
            "payout-crawler",
            "report",
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Report { summary: None, .. }));

        process_command(cli).await.unwrap();
        let html = std::fs::read_to_string(&output).unwrap();
        assert!(html.contains("Ann"));
        assert!(html.contains("Successfully scraped 2 out of 2 pages"));
    }
}
