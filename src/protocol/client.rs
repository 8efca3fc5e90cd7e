use std::future::Future;

use anyhow::{Context, Result};
use reqwest::Url;
use tracing::{debug, warn};

use crate::config::{Config, ServerFlavor, TrustMode};

use super::response::{StatusResponse, TimeSyncResponse, TOO_MANY_REQUESTS};
use super::{AGENT_TECHNOLOGY_TYPE, AGENT_VERSION};

/// Fallback cooldown when a 429 response carries no `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_MS: i64 = 10 * 60 * 1000;

/// The three request types the cluster understands.
///
/// Implementations return `None` on transport-level failure (connect error,
/// timeout, unreadable body); the caller treats that as transient.
pub trait ApiClient: Send + Sync {
    /// Status check: capture flags, send interval, beacon size limit.
    fn send_status_request(&self) -> impl Future<Output = Option<StatusResponse>> + Send;

    /// Deliver one beacon chunk for a session.
    fn send_beacon_request(
        &self,
        client_ip: &str,
        data: &[u8],
    ) -> impl Future<Output = Option<StatusResponse>> + Send;

    /// Sample the cluster clock.
    fn send_time_sync_request(&self) -> impl Future<Output = Option<TimeSyncResponse>> + Send;
}

/// Factory for request-capable clients, bound to the current server id.
pub trait HttpClientProvider: Send + Sync {
    type Client: ApiClient + 'static;

    fn create_client(&self, server_id: i32) -> Self::Client;
}

/// reqwest-backed cluster client.
pub struct HttpClient {
    http: reqwest::Client,
    monitor_url: String,
    time_sync_url: String,
}

impl HttpClient {
    /// Issue a request and hand back (status, retry-after ms, body).
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Option<(u16, Option<i64>, String)> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "cluster request failed");
                return None;
            }
        };

        let status = response.status().as_u16();
        let retry_after = if status == TOO_MANY_REQUESTS {
            Some(retry_after_ms(response.headers()))
        } else {
            None
        };

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "reading cluster response failed");
                return None;
            }
        };

        Some((status, retry_after, body))
    }
}

impl ApiClient for HttpClient {
    async fn send_status_request(&self) -> Option<StatusResponse> {
        debug!("sending status request");

        let (status, retry_after, body) = self.execute(self.http.get(&self.monitor_url)).await?;
        Some(StatusResponse::parse(&body, status, retry_after))
    }

    async fn send_beacon_request(&self, client_ip: &str, data: &[u8]) -> Option<StatusResponse> {
        debug!(bytes = data.len(), "sending beacon request");

        let mut request = self
            .http
            .post(&self.monitor_url)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec());

        if !client_ip.is_empty() {
            request = request.header("X-Client-IP", client_ip);
        }

        let (status, retry_after, body) = self.execute(request).await?;
        Some(StatusResponse::parse(&body, status, retry_after))
    }

    async fn send_time_sync_request(&self) -> Option<TimeSyncResponse> {
        debug!("sending time sync request");

        let (status, retry_after, body) = self.execute(self.http.get(&self.time_sync_url)).await?;
        Some(TimeSyncResponse::parse(&body, status, retry_after))
    }
}

/// Default provider holding one pooled reqwest client; per-call clients are
/// cheap handle clones stamped with the current server id.
pub struct DefaultHttpClientProvider {
    http: reqwest::Client,
    base_url: Url,
    application_id: String,
    server_flavor: ServerFlavor,
}

impl DefaultHttpClientProvider {
    pub fn new(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.endpoint_url)
            .with_context(|| format!("invalid endpoint URL {:?}", cfg.endpoint_url))?;

        let mut builder = reqwest::Client::builder().timeout(cfg.request_timeout);

        if cfg.trust == TrustMode::Insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("building HTTP client")?;

        Ok(Self {
            http,
            base_url,
            application_id: cfg.application_id.clone(),
            server_flavor: cfg.server_flavor,
        })
    }
}

impl HttpClientProvider for DefaultHttpClientProvider {
    type Client = HttpClient;

    fn create_client(&self, server_id: i32) -> HttpClient {
        HttpClient {
            http: self.http.clone(),
            monitor_url: build_monitor_url(
                &self.base_url,
                &self.application_id,
                server_id,
                self.server_flavor,
            ),
            time_sync_url: build_time_sync_url(&self.base_url),
        }
    }
}

/// Monitor URL for status checks and beacon delivery. AppMon clusters route
/// by application alone and take no `srvid` parameter.
fn build_monitor_url(
    base: &Url,
    application_id: &str,
    server_id: i32,
    server_flavor: ServerFlavor,
) -> String {
    let mut url = base.clone();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("type", "m");

        if server_flavor != ServerFlavor::AppMon {
            pairs.append_pair("srvid", &server_id.to_string());
        }

        pairs
            .append_pair("app", application_id)
            .append_pair("va", AGENT_VERSION)
            .append_pair("pt", "1")
            .append_pair("tt", AGENT_TECHNOLOGY_TYPE);
    }

    url.into()
}

/// Time-sync URL; the cluster answers with its receive/send timestamps.
fn build_time_sync_url(base: &Url) -> String {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("type", "mts");
    url.into()
}

/// `Retry-After` header in milliseconds, falling back to the default
/// cooldown when absent or unparseable.
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> i64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|seconds| seconds.saturating_mul(1000))
        .unwrap_or(DEFAULT_RETRY_AFTER_MS)
}
