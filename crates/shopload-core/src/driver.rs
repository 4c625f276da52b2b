use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

use crate::config::TargetConfig;
use crate::oracle::{self, Item};
use crate::stats::{RunStats, Sample};

/// Form field carrying the request payload.
pub const PAYLOAD_FIELD: &str = "json";
/// Query parameter carrying the user name on listing requests.
pub const NAME_PARAM: &str = "name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Listing,
    Purchase,
}

impl Endpoint {
    pub const ALL: [Endpoint; 2] = [Endpoint::Listing, Endpoint::Purchase];

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Listing => "/",
            Endpoint::Purchase => "/buy",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Listing => f.write_str("get_items"),
            Endpoint::Purchase => f.write_str("buy_items"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Form,
    Multipart,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Form => "application/x-www-form-urlencoded",
            ContentType::Multipart => "multipart/form-data",
        }
    }
}

/// One request to the shop API. An empty body makes it a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub endpoint: Endpoint,
    pub query: Vec<(String, String)>,
    pub content_type: ContentType,
    pub body: String,
}

impl Request {
    pub fn get(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            query: Vec::new(),
            content_type: ContentType::default(),
            body: String::new(),
        }
    }

    pub fn post(endpoint: Endpoint, content_type: ContentType, body: impl Into<String>) -> Self {
        Self {
            endpoint,
            query: Vec::new(),
            content_type,
            body: body.into(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn is_get(&self) -> bool {
        self.body.is_empty()
    }
}

/// Status and body as returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// A completed request, timed by the driver.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
    pub sent_at: DateTime<Utc>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    /// The request could not be built (bad URL, bad body)
    Request,
    /// The response body could not be read
    Body,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_connect() {
            TransportErrorKind::Connect
        } else if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_builder() || e.is_request() {
            TransportErrorKind::Request
        } else if e.is_body() || e.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

/// Either a server response or a transport failure; never both.
pub type Outcome = std::result::Result<Response, TransportError>;

/// Trait for the wire layer under the driver
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<RawResponse, TransportError>> + Send + 'a>>;
}

/// Mock transport for testing: answers every request with the oracle's own
/// body after a configurable delay.
pub struct MockTransport {
    delay_ms: u64,
}

impl MockTransport {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }

    fn answer(request: &Request) -> String {
        match request.endpoint {
            Endpoint::Listing => oracle::expected_listing(&requested_name(request)),
            Endpoint::Purchase => {
                let name = serde_json::from_str::<Item>(&request.body)
                    .map(|item| item.name)
                    .unwrap_or_default();
                oracle::expected_purchase(&name)
            }
        }
    }
}

#[derive(Deserialize)]
struct NamePayload {
    name: String,
}

/// User name a listing request asks for, by query parameter or payload.
pub fn requested_name(request: &Request) -> String {
    if let Some((_, value)) = request.query.iter().find(|(k, _)| k == NAME_PARAM) {
        return value.clone();
    }
    match serde_json::from_str::<NamePayload>(&request.body) {
        Ok(payload) => payload.name,
        Err(_) => request.body.clone(),
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<RawResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(RawResponse {
                status: 200,
                body: Self::answer(request),
            })
        })
    }
}

/// HTTP transport over a single shared, pooled reqwest client
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        let base_url = Url::parse(&target.base_url)
            .with_context(|| format!("Invalid target base_url: {}", target.base_url))?;

        // No overall request timeout: stalls are bounded by the connect and
        // idle settings only.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(target.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_millis(target.pool_idle_timeout_ms))
            .connect_timeout(Duration::from_millis(target.connect_timeout_ms))
            .tcp_keepalive(Duration::from_millis(target.tcp_keepalive_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn url_for(&self, request: &Request) -> std::result::Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(request.endpoint.path().trim_start_matches('/'))
            .map_err(|e| TransportError::new(TransportErrorKind::Request, e.to_string()))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<RawResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let url = self.url_for(request)?;

            let builder = if request.is_get() {
                self.client.get(url)
            } else {
                match request.content_type {
                    ContentType::Form => self
                        .client
                        .post(url)
                        .form(&[(PAYLOAD_FIELD, request.body.as_str())]),
                    ContentType::Multipart => {
                        let form = reqwest::multipart::Form::new()
                            .text(PAYLOAD_FIELD, request.body.clone());
                        self.client.post(url).multipart(form)
                    }
                }
            };

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;

            Ok(RawResponse { status, body })
        })
    }
}

/// Decrements the live client count when dropped.
pub struct ClientGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared request driver: times every request, stamps it with the current
/// client count and folds it into the run statistics.
pub struct RequestDriver {
    transport: Arc<dyn Transport>,
    stats: Arc<RunStats>,
    active: Arc<AtomicUsize>,
}

impl RequestDriver {
    pub fn new(transport: Arc<dyn Transport>, stats: Arc<RunStats>) -> Self {
        Self {
            transport,
            stats,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of simulated clients currently running.
    pub fn active_clients(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Register a running client for the lifetime of the returned guard.
    pub fn enter_client(&self) -> ClientGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ClientGuard {
            active: self.active.clone(),
        }
    }

    /// Send one request. Transport failures are counted but leave no
    /// timing sample behind.
    pub async fn send(&self, request: &Request) -> Outcome {
        let concurrency = self.active_clients();
        let sent_at = Utc::now();
        let start = Instant::now();
        self.stats.record_request();

        match self.transport.send(request).await {
            Ok(raw) => {
                let elapsed = start.elapsed();
                self.stats.record_sample(
                    request.endpoint,
                    Sample {
                        sent_at,
                        elapsed,
                        concurrency,
                    },
                );
                debug!(
                    "{} {} -> {} ({}us, {} clients)",
                    if request.is_get() { "GET" } else { "POST" },
                    request.endpoint.path(),
                    raw.status,
                    elapsed.as_micros(),
                    concurrency
                );
                Ok(Response {
                    status: raw.status,
                    body: raw.body,
                    elapsed,
                    sent_at,
                    concurrency,
                })
            }
            Err(e) => {
                self.stats.record_transport_failure(request.endpoint);
                debug!("{} transport failure: {}", request.endpoint.path(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn send<'a>(
            &'a self,
            _request: &'a Request,
        ) -> Pin<
            Box<dyn Future<Output = std::result::Result<RawResponse, TransportError>> + Send + 'a>,
        > {
            Box::pin(async move {
                Err(TransportError::new(
                    TransportErrorKind::Connect,
                    "connection refused",
                ))
            })
        }
    }

    #[test]
    fn test_requested_name() {
        assert_eq!(requested_name(&Request::get(Endpoint::Listing)), "");
        assert_eq!(
            requested_name(&Request::get(Endpoint::Listing).with_query(NAME_PARAM, "bob")),
            "bob"
        );
        assert_eq!(
            requested_name(&Request::post(Endpoint::Listing, ContentType::Form, "bob")),
            "bob"
        );
        assert_eq!(
            requested_name(&Request::post(
                Endpoint::Listing,
                ContentType::Multipart,
                r#"{"name":"bob"}"#
            )),
            "bob"
        );
    }

    #[tokio::test]
    async fn test_mock_transport_answers_with_oracle() {
        let mock = MockTransport::new(0);

        let listing = mock
            .send(&Request::get(Endpoint::Listing).with_query(NAME_PARAM, "eve"))
            .await
            .unwrap();
        assert_eq!(listing.status, 200);
        assert_eq!(listing.body, oracle::expected_listing("eve"));

        let purchase = mock
            .send(&Request::post(
                Endpoint::Purchase,
                ContentType::Form,
                r#"{"name":"eve0","price":"320"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(purchase.body, r#"{"result":"success"}"#);
    }

    #[tokio::test]
    async fn test_driver_records_sample_on_response() {
        let stats = Arc::new(RunStats::new());
        let driver = RequestDriver::new(Arc::new(MockTransport::new(0)), stats.clone());
        let _guard = driver.enter_client();

        let response = driver.send(&Request::get(Endpoint::Listing)).await.unwrap();
        assert_eq!(response.concurrency, 1);
        assert_eq!(stats.total_requests(), 1);
        assert_eq!(stats.samples(Endpoint::Listing).len(), 1);
        assert_eq!(stats.samples(Endpoint::Purchase).len(), 0);
    }

    #[tokio::test]
    async fn test_driver_skips_sample_on_transport_failure() {
        let stats = Arc::new(RunStats::new());
        let driver = RequestDriver::new(Arc::new(FailingTransport), stats.clone());

        let outcome = driver.send(&Request::get(Endpoint::Listing)).await;
        assert!(matches!(
            outcome,
            Err(TransportError {
                kind: TransportErrorKind::Connect,
                ..
            })
        ));
        assert_eq!(stats.total_requests(), 1);
        assert_eq!(stats.transport_failures(Endpoint::Listing), 1);
        assert!(stats.samples(Endpoint::Listing).is_empty());
    }

    #[test]
    fn test_client_guard_tracks_active_clients() {
        let driver = RequestDriver::new(Arc::new(MockTransport::new(0)), Arc::new(RunStats::new()));
        let a = driver.enter_client();
        let b = driver.enter_client();
        assert_eq!(driver.active_clients(), 2);
        drop(a);
        assert_eq!(driver.active_clients(), 1);
        drop(b);
        assert_eq!(driver.active_clients(), 0);
    }
}
