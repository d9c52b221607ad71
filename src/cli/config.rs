use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, debug, error};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub fetch: FetchSettings,
    pub extract: ExtractSettings,
    pub browser: BrowserSettings,
    pub output: OutputSettings,
}

/// How pages are retrieved
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Http,
    Browser,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerSettings {
    pub base_url: String,
    pub last_page: Option<u32>,  // None = discover from the pagination control
    pub fetch_mode: FetchMode,
}

/// Adaptive scheduler settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerSettings {
    pub initial_concurrency: usize,  // Also the floor
    pub max_concurrency: usize,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub stall_window_secs: u64,
    pub stall_strikes: u32,
    pub task_deadline_secs: Option<u64>,
    pub checkpoint_every: usize,
}

/// Per-page retry settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub pause_ms: (u64, u64),  // Min and max pause between attempts
}

/// Page loading settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchSettings {
    pub page_load_timeout_secs: u64,
    pub serial_page_load_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
    pub webdriver_url: String,
    pub headless: bool,
}

/// One row-extraction strategy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StrategySettings {
    pub name: String,
    pub row_selector: String,
    pub cell_selector: String,
}

/// Row extraction settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractSettings {
    pub date_format: String,
    pub currency_markers: Vec<String>,
    pub readiness_selector: String,
    pub pagination_selector: String,
    pub strategies: Vec<StrategySettings>,
}

/// Browser identity settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    pub fingerprints: Vec<BrowserFingerprint>,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub extra_headers: HashMap<String, String>,
}

/// Output artifact settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub raw_file: String,
    pub aggregated_file: String,
    pub interim_file: String,
    pub summary_file: String,
    pub report_file: String,
}

impl SchedulerSettings {
    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_window_secs)
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_secs.map(Duration::from_secs)
    }
}

impl FetchSettings {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn serial_page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.serial_page_load_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

impl OutputSettings {
    pub fn raw_path(&self) -> PathBuf {
        self.directory.join(&self.raw_file)
    }

    pub fn aggregated_path(&self) -> PathBuf {
        self.directory.join(&self.aggregated_file)
    }

    pub fn interim_path(&self) -> PathBuf {
        self.directory.join(&self.interim_file)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.directory.join(&self.summary_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.directory.join(&self.report_file)
    }
}

fn fingerprint(name: &str, user_agent: &str, platform: &str) -> BrowserFingerprint {
    BrowserFingerprint {
        name: name.to_string(),
        user_agent: user_agent.to_string(),
        accept_language: "en-US,en;q=0.5".to_string(),
        platform: platform.to_string(),
        extra_headers: HashMap::new(),
    }
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            date_format: "%b %d, %Y".to_string(),
            currency_markers: vec!["$".to_string()],
            readiness_selector: "div.divTableRow".to_string(),
            pagination_selector: "div.pagination a".to_string(),
            strategies: vec![
                StrategySettings {
                    name: "div-table".to_string(),
                    row_selector: "div.divTableRow".to_string(),
                    cell_selector: "div.divTableCell".to_string(),
                },
                StrategySettings {
                    name: "html-table".to_string(),
                    row_selector: "table tr".to_string(),
                    cell_selector: "td".to_string(),
                },
                StrategySettings {
                    name: "aria-rows".to_string(),
                    row_selector: "[role=row]".to_string(),
                    cell_selector: "[role=cell]".to_string(),
                },
            ],
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings {
                base_url: "https://apextraderfunding.com/payouts".to_string(),
                last_page: None,
                fetch_mode: FetchMode::Http,
            },
            scheduler: SchedulerSettings {
                initial_concurrency: 10,
                max_concurrency: 100,
                success_streak: 5,
                failure_streak: 2,
                stall_window_secs: 60,
                stall_strikes: 3,
                task_deadline_secs: Some(300),
                checkpoint_every: 10,
            },
            retry: RetrySettings {
                max_attempts: 3,
                pause_ms: (500, 1500),
            },
            fetch: FetchSettings {
                page_load_timeout_secs: 30,
                serial_page_load_timeout_secs: 90,
                readiness_timeout_secs: 10,
                webdriver_url: "http://localhost:4444".to_string(),
                headless: true,
            },
            extract: ExtractSettings::default(),
            browser: BrowserSettings {
                fingerprints: vec![
                    fingerprint(
                        "windows_chrome",
                        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0 Safari/537.36",
                        "Win32",
                    ),
                    fingerprint(
                        "mac_safari",
                        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15",
                        "MacIntel",
                    ),
                    fingerprint(
                        "iphone_safari",
                        "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15A372 Safari/604.1",
                        "iPhone",
                    ),
                    fingerprint(
                        "linux_chrome",
                        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0 Safari/537.36",
                        "Linux x86_64",
                    ),
                    fingerprint(
                        "windows_firefox",
                        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
                        "Win32",
                    ),
                ],
            },
            output: OutputSettings {
                directory: PathBuf::from("./output"),
                raw_file: "payouts.csv".to_string(),
                aggregated_file: "aggregated_payouts.csv".to_string(),
                interim_file: "interim_aggregated_payouts.csv".to_string(),
                summary_file: "run_summary.json".to_string(),
                report_file: "payout_report.html".to_string(),
            },
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "payout-crawler", "payout-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile, falling back to the default one
    pub fn load_profile(profile: &str) -> Result<Self> {
        if profile == "default" {
            return Self::load_default();
        }

        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.initial_concurrency == 0 {
            anyhow::bail!("scheduler.initial_concurrency must be at least 1");
        }
        if s.max_concurrency < s.initial_concurrency {
            anyhow::bail!(
                "scheduler.max_concurrency ({}) is below initial_concurrency ({})",
                s.max_concurrency, s.initial_concurrency
            );
        }
        if s.success_streak == 0 || s.failure_streak == 0 || s.stall_strikes == 0 {
            anyhow::bail!("scheduler streak and strike thresholds must be at least 1");
        }
        if s.stall_window_secs == 0 {
            anyhow::bail!("scheduler.stall_window_secs must be at least 1");
        }
        if s.checkpoint_every == 0 {
            anyhow::bail!("scheduler.checkpoint_every must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.pause_ms.0 > self.retry.pause_ms.1 {
            anyhow::bail!("retry.pause_ms minimum exceeds maximum");
        }
        if self.browser.fingerprints.is_empty() {
            anyhow::bail!("browser.fingerprints must not be empty");
        }
        if self.extract.strategies.is_empty() {
            anyhow::bail!("extract.strategies must not be empty");
        }
        Ok(())
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrawlerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.initial_concurrency, 10);
        assert_eq!(config.scheduler.max_concurrency, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.browser.fingerprints.len(), 5);
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("site.yaml");

        let mut config = CrawlerConfig::default();
        config.crawler.last_page = Some(42);
        config.crawler.fetch_mode = FetchMode::Browser;
        config.save_to_file(&path).unwrap();

        let loaded = CrawlerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.crawler.last_page, Some(42));
        assert_eq!(loaded.crawler.fetch_mode, FetchMode::Browser);
        assert_eq!(loaded.extract.strategies.len(), 3);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = CrawlerConfig::default();
        config.scheduler.max_concurrency = 5;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.retry.pause_ms = (10, 1);
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.scheduler.stall_window_secs = 0;
        assert!(config.validate().is_err());
    }
}
