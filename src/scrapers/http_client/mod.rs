//! HTTP fetch path, always routed through the politeness gate.

mod response;

pub use response::HttpResponse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::HarvestError;
use crate::scrapers::politeness::{
    BlockedDecision, FetchAttempt, FetchOutcome, PolitenessGate, UrlAttempts,
};

/// HTTP client wrapping reqwest with pacing, identity rotation, and
/// blocked-outcome retry/failover. One inner client per proxy, cached.
#[derive(Clone)]
pub struct HttpClient {
    gate: PolitenessGate,
    timeout: Duration,
    referer: Option<String>,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl HttpClient {
    pub fn new(gate: PolitenessGate, timeout: Duration, referer: Option<String>) -> Self {
        Self {
            gate,
            timeout,
            referer,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn gate(&self) -> &PolitenessGate {
        &self.gate
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<Client, HarvestError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true)
            .cookie_store(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        builder.build().map_err(HarvestError::Http)
    }

    async fn client_for(&self, proxy: Option<String>) -> Result<Client, HarvestError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&proxy) {
            return Ok(client.clone());
        }
        let client = self.build_client(proxy.as_deref())?;
        clients.insert(proxy, client.clone());
        Ok(client)
    }

    /// Headers a real browser would send alongside a navigation.
    fn navigation_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
        if let Some(ref referer) = self.referer {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
        }
        headers
    }

    /// Fetch a URL. Blocked responses (403/429/503) and connection failures
    /// go through the gate's escalate/rotate/give-up cycle; other statuses
    /// are returned for the caller to classify.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, HarvestError> {
        let mut tracker = UrlAttempts::new();

        loop {
            let permit = self.gate.acquire(url).await;
            let client = self.client_for(permit.proxy.clone()).await?;

            let request = client
                .get(url)
                .header(USER_AGENT, permit.user_agent.clone())
                .headers(self.navigation_headers());

            let sent = request.send().await;
            let domain = permit.domain.clone();
            let user_agent = permit.user_agent.clone();
            drop(permit);

            match sent {
                Ok(response) => {
                    let status = response.status().as_u16();

                    if matches!(status, 403 | 429 | 503) {
                        let attempt = FetchAttempt::new(url, &user_agent, FetchOutcome::Blocked);
                        self.gate.record(&attempt).await;
                        let Some(domain) = domain else {
                            return Err(self.blocked(url, &tracker, Some(status)));
                        };
                        match self.gate.on_blocked(&domain, &mut tracker, Some(status)).await {
                            BlockedDecision::Escalated | BlockedDecision::RotatedProxy(_) => {
                                continue;
                            }
                            BlockedDecision::GiveUp => {
                                return Err(self.blocked(url, &tracker, Some(status)));
                            }
                        }
                    }

                    let outcome = if response.status().is_success() {
                        FetchOutcome::Success
                    } else if status >= 500 {
                        FetchOutcome::Error
                    } else {
                        // 4xx other than the blocked set; no delay change.
                        FetchOutcome::Error
                    };
                    if status < 500 && !response.status().is_success() {
                        debug!("Client error {} for {}", status, url);
                    } else {
                        let attempt = FetchAttempt::new(url, &user_agent, outcome);
                        self.gate.record(&attempt).await;
                    }

                    let mut headers = HashMap::new();
                    for (name, value) in response.headers() {
                        if let Ok(v) = value.to_str() {
                            headers.insert(name.to_string(), v.to_string());
                        }
                    }

                    return Ok(HttpResponse {
                        status: response.status(),
                        headers,
                        response,
                    });
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    let outcome = if e.is_timeout() {
                        FetchOutcome::Timeout
                    } else {
                        FetchOutcome::Error
                    };
                    let attempt = FetchAttempt::new(url, &user_agent, outcome);
                    self.gate.record(&attempt).await;

                    if retryable {
                        if let Some(domain) = domain {
                            match self.gate.on_blocked(&domain, &mut tracker, None).await {
                                BlockedDecision::Escalated | BlockedDecision::RotatedProxy(_) => {
                                    debug!("Retrying {} after connection failure: {}", url, e);
                                    continue;
                                }
                                BlockedDecision::GiveUp => {
                                    return Err(self.blocked(url, &tracker, None));
                                }
                            }
                        }
                    }
                    return Err(HarvestError::Http(e));
                }
            }
        }
    }

    /// Fetch a URL and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, HarvestError> {
        let response = self.get(url).await?;
        Ok(response.text().await?)
    }

    fn blocked(&self, url: &str, tracker: &UrlAttempts, status: Option<u16>) -> HarvestError {
        HarvestError::Blocked {
            url: url.to_string(),
            attempts: tracker.attempts,
            last_status: tracker.last_status.or(status),
        }
    }
}
