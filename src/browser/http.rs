use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::crawler::fetcher::{FetchOptions, PageSession, SessionFactory};
use crate::crawler::task::FetchError;

/// Plain HTTP sessions: one client and cookie jar per fetch
#[derive(Debug, Default)]
pub struct HttpSessionFactory;

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, opts: &FetchOptions) -> Result<Box<dyn PageSession>, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &opts.identity.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!("Dropping invalid header {}", name),
            }
        }

        let client = Client::builder()
            .cookie_store(true)
            .timeout(opts.page_load_timeout)
            .user_agent(opts.identity.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Box::new(HttpSession { client, current: None }))
    }
}

pub struct HttpSession {
    client: Client,
    current: Option<Url>,
}

impl HttpSession {
    async fn get(&self, url: &Url) -> Result<String, FetchError> {
        debug!("GET {}", url);
        let response = self.client.get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        match response.status() {
            StatusCode::OK => response.text().await.map_err(|e| FetchError::from_reqwest(&e)),
            StatusCode::FORBIDDEN => Err(FetchError::Blocked),
            status => Err(FetchError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl PageSession for HttpSession {
    async fn load(&mut self, url: &Url) -> Result<String, FetchError> {
        self.current = Some(url.clone());
        self.get(url).await
    }

    async fn refresh(&mut self) -> Result<String, FetchError> {
        let url = self.current.clone()
            .ok_or_else(|| FetchError::Network("Refresh before any page was loaded".to_string()))?;
        self.get(&url).await
    }

    async fn close(self: Box<Self>) {}
}
