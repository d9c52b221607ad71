use async_trait::async_trait;
use thirtyfour::prelude::*;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

use crate::cli::config::FetchSettings;
use crate::crawler::fetcher::{FetchOptions, PageSession, SessionFactory};
use crate::crawler::task::FetchError;

fn browser_error(err: WebDriverError) -> FetchError {
    let message = err.to_string();
    if message.to_lowercase().contains("timeout") {
        FetchError::Timeout(message)
    } else {
        FetchError::Browser(message)
    }
}

/// Opens a fresh headless browser per fetch through a WebDriver server
pub struct WebDriverSessionFactory {
    webdriver_url: String,
    headless: bool,
    readiness_selector: String,
    readiness_timeout: Duration,
}

impl WebDriverSessionFactory {
    pub fn new(settings: &FetchSettings, readiness_selector: &str) -> Self {
        Self {
            webdriver_url: settings.webdriver_url.clone(),
            headless: settings.headless,
            readiness_selector: readiness_selector.to_string(),
            readiness_timeout: settings.readiness_timeout(),
        }
    }
}

#[async_trait]
impl SessionFactory for WebDriverSessionFactory {
    async fn open(&self, opts: &FetchOptions) -> Result<Box<dyn PageSession>, FetchError> {
        let identity = &opts.identity;
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", identity.user_agent)).map_err(browser_error)?;
        caps.add_chrome_arg(&format!("--lang={}", identity.accept_language.split(',').next().unwrap_or("en-US")))
            .map_err(browser_error)?;
        caps.add_chrome_arg(&format!("--window-size={},{}", identity.viewport.width, identity.viewport.height))
            .map_err(browser_error)?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled").map_err(browser_error)?;
        caps.add_chrome_arg("--disable-dev-shm-usage").map_err(browser_error)?;
        // Every session gets its own throwaway profile
        caps.add_chrome_arg("--incognito").map_err(browser_error)?;

        if self.headless {
            caps.set_headless().map_err(browser_error)?;
        }

        let driver = WebDriver::new(&self.webdriver_url, caps).await.map_err(browser_error)?;
        let session = BrowserSession {
            driver: Some(driver),
            readiness_selector: self.readiness_selector.clone(),
            readiness_timeout: self.readiness_timeout,
        };

        let timeout_set = session.driver()?.set_page_load_timeout(opts.page_load_timeout).await;
        if let Err(e) = timeout_set {
            Box::new(session).close().await;
            return Err(browser_error(e));
        }

        debug!("Browser session opened with identity: {}", identity.name);
        Ok(Box::new(session))
    }
}

/// One browser instance, quit when the fetch ends
pub struct BrowserSession {
    /// WebDriver instance
    driver: Option<WebDriver>,

    readiness_selector: String,
    readiness_timeout: Duration,
}

impl BrowserSession {
    fn driver(&self) -> Result<&WebDriver, FetchError> {
        self.driver.as_ref()
            .ok_or_else(|| FetchError::Browser("Browser session not initialized".to_string()))
    }

    /// Wait for rows to render, then take the page source. A page that never
    /// becomes ready is still returned; the extractor decides what it holds.
    async fn ready_source(&self) -> Result<String, FetchError> {
        let driver = self.driver()?;

        let ready = driver.query(By::Css(self.readiness_selector.as_str()))
            .wait(self.readiness_timeout, Duration::from_millis(250))
            .exists()
            .await
            .unwrap_or(false);
        if !ready {
            debug!("Readiness selector '{}' not found before timeout", self.readiness_selector);
        }

        driver.source().await.map_err(browser_error)
    }
}

#[async_trait]
impl PageSession for BrowserSession {
    async fn load(&mut self, url: &Url) -> Result<String, FetchError> {
        debug!("Navigating to: {}", url);
        self.driver()?.goto(url.as_str()).await.map_err(browser_error)?;
        self.ready_source().await
    }

    async fn refresh(&mut self) -> Result<String, FetchError> {
        self.driver()?.refresh().await.map_err(browser_error)?;
        self.ready_source().await
    }

    async fn close(self: Box<Self>) {
        let mut session = self;
        if let Some(driver) = session.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // Reached when the owning task is aborted mid-fetch
        if let Some(driver) = self.driver.take() {
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}
