use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use scout_core::error::AppError;
use scout_core::traits::Fetcher;
use url::Url;

/// Listing pages often refuse non-browser agents.
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Event listing fetcher built on reqwest.
///
/// Follows redirects, sends a browser-like User-Agent and gives up after
/// 30 seconds by default. Requests to private/reserved addresses are
/// refused unless [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Self::build(timeout, DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(self, user_agent: &str) -> Result<Self, AppError> {
        let ssrf_protection = self.ssrf_protection;
        let mut fetcher = Self::build(Duration::from_secs(self.timeout_secs), user_agent)?;
        fetcher.ssrf_protection = ssrf_protection;
        Ok(fetcher)
    }

    fn build(timeout: Duration, user_agent: &str) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.8"));

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Disable the private-address guard.
    ///
    /// For the CLI, where the operator controls the machine, and for tests
    /// against a local mock server.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if self.ssrf_protection {
            ensure_public(url).await?;
        }

        tracing::debug!(%url, "Fetching page");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {url}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
        tracing::debug!(%url, bytes = body.len(), "Fetched page");
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Private-address guard
// ---------------------------------------------------------------------------

/// Refuse URLs that are not http(s) or whose host resolves to a
/// private/reserved address.
async fn ensure_public(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::invalid_url(url, e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::invalid_url(
            url,
            format!("scheme '{}' is not allowed (only http/https)", parsed.scheme()),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::invalid_url(url, "URL has no host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return check_address(host, ip);
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    addrs
        .iter()
        .try_for_each(|addr| check_address(host, addr.ip()))
}

fn check_address(host: &str, ip: IpAddr) -> Result<(), AppError> {
    if is_reserved(ip) {
        return Err(AppError::HttpError(format!(
            "Blocked request to {host}: resolves to private/reserved address {ip}"
        )));
    }
    Ok(())
}

/// Loopback, private, link-local, CGN, unspecified and similar ranges.
fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_reserved(IpAddr::V4(v4)))
        }
    }
}
