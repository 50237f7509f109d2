use crate::config::HttpConfig;
use crate::error::FetchError;
use log::debug;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Trait for retrieving a response body from a source URL
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send + 'a>>;
}

/// Parse a fetched body into a JSON tree
///
/// # Errors
///
/// Returns `FetchError::Parse` if the body is not valid JSON.
pub fn parse_body(body: &str) -> Result<Value, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::Parse(e.to_string()))
}

/// HTTP fetcher backed by a shared reqwest client
///
/// Status codes are not checked: an error page that is not JSON surfaces as a
/// parse failure, while a JSON error body is extracted like any other.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher using the configured timeout and user agent
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Transport` if the client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            debug!("GET {}", url);
            let response = self.client.get(url).send().await?;
            let body = response.text().await?;
            Ok(body)
        })
    }
}

/// Mock fetcher for testing
///
/// Serves canned bodies or errors per URL and counts requests. URLs without a
/// configured response fail with a transport error.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, Result<String, FetchError>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, to keep a fetch in flight
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serve `body` for `url`
    pub fn respond(&self, url: &str, body: impl Into<String>) {
        self.lock_responses()
            .insert(url.to_string(), Ok(body.into()));
    }

    /// Fail every request for `url` with `error`
    pub fn fail(&self, url: &str, error: FetchError) {
        self.lock_responses().insert(url.to_string(), Err(error));
    }

    /// Total number of requests made
    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// Number of requests made for `url`
    pub fn calls_for(&self, url: &str) -> usize {
        self.lock_calls().iter().filter(|u| u.as_str() == url).count()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, HashMap<String, Result<String, FetchError>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            self.lock_calls().push(url.to_string());
            let response = self
                .lock_responses()
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::Transport(format!("no route to {}", url))));

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }
}
