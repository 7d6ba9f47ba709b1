//! Shared politeness gate for all outbound fetches.
//!
//! Every fetch in both stages passes through here: pacing per domain,
//! identity rotation, bounded concurrency, escalating backoff on blocked
//! outcomes, and proxy failover before a URL is declared terminally blocked.

mod state;
mod user_agent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchSettings;
use state::DomainState;
pub use user_agent::{pick_identity, DEFAULT_USER_AGENTS};

/// Gate configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    /// Minimum delay between request starts per domain (default 45s).
    pub base_delay: Duration,
    /// Floor the recovery path never goes below.
    pub min_delay: Duration,
    /// Cap for escalated delays.
    pub max_delay: Duration,
    /// Multiplier applied on each escalation.
    pub backoff_multiplier: f64,
    /// Consecutive successes before the delay starts recovering.
    pub recovery_threshold: u32,
    /// Multiplier applied while recovering.
    pub recovery_multiplier: f64,
    /// Maximum in-flight requests (default 1).
    pub concurrency: usize,
    /// Maximum blocked outcomes per URL before giving up.
    pub retry_budget: u32,
    /// Proxy failover pool, tried in order. Empty = direct only.
    pub proxies: Vec<String>,
    /// Identity rotation pool. Empty = built-in browser pool.
    pub user_agents: Vec<String>,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(45),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(480),
            backoff_multiplier: 2.0,
            recovery_threshold: 3,
            recovery_multiplier: 0.5,
            concurrency: 1,
            retry_budget: 3,
            proxies: Vec::new(),
            user_agents: Vec::new(),
        }
    }
}

impl PolitenessConfig {
    pub fn from_settings(fetch: &FetchSettings) -> Self {
        Self {
            base_delay: fetch.delay(),
            max_delay: fetch.max_delay(),
            backoff_multiplier: fetch.backoff_multiplier,
            concurrency: fetch.concurrency.max(1),
            retry_budget: fetch.retry_budget,
            proxies: fetch.proxies.clone(),
            user_agents: fetch.user_agents.clone(),
            ..Default::default()
        }
    }
}

/// Outcome of one fetch attempt, reported back to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Blocked,
    Timeout,
    Error,
}

/// Ephemeral record of one attempt. Not persisted; its aggregates drive
/// backoff and failover decisions.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub user_agent: String,
    pub outcome: FetchOutcome,
}

impl FetchAttempt {
    pub fn new(url: &str, user_agent: &str, outcome: FetchOutcome) -> Self {
        Self {
            url: url.to_string(),
            timestamp: Utc::now(),
            user_agent: user_agent.to_string(),
            outcome,
        }
    }
}

/// Per-URL retry bookkeeping across blocked outcomes.
#[derive(Debug, Default)]
pub struct UrlAttempts {
    pub attempts: u32,
    pub escalations: u32,
    pub rotations: usize,
    pub last_status: Option<u16>,
}

impl UrlAttempts {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decision after a blocked outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedDecision {
    /// Delay was escalated; retry the same URL.
    Escalated,
    /// Switched to the next proxy; retry the same URL.
    RotatedProxy(String),
    /// Backoff and proxy pool exhausted; the URL is terminally blocked.
    GiveUp,
}

/// Permission to issue one request. Holding it occupies one concurrency
/// slot; the slot is released on drop, on every exit path.
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
    pub domain: Option<String>,
    pub user_agent: String,
    pub proxy: Option<String>,
}

/// Aggregate gate statistics for one domain.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub current_delay: Duration,
    pub in_backoff: bool,
    pub total_requests: u64,
    pub blocked_hits: u64,
}

/// The shared pacing/backoff/failover gate.
#[derive(Clone)]
pub struct PolitenessGate {
    config: Arc<PolitenessConfig>,
    domains: Arc<RwLock<HashMap<String, DomainState>>>,
    permits: Arc<Semaphore>,
    proxy_index: Arc<AtomicUsize>,
}

impl PolitenessGate {
    pub fn new(config: PolitenessConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config: Arc::new(config),
            domains: Arc::new(RwLock::new(HashMap::new())),
            permits,
            proxy_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Extract the pacing key (domain) from a URL.
    pub fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }

    /// The proxy requests currently go through, if any.
    pub fn active_proxy(&self) -> Option<String> {
        if self.config.proxies.is_empty() {
            return None;
        }
        let idx = self.proxy_index.load(Ordering::Relaxed) % self.config.proxies.len();
        Some(self.config.proxies[idx].clone())
    }

    /// Advance to the next proxy in the pool. Returns the new proxy, or
    /// None when there is nothing to rotate to.
    fn rotate_proxy(&self) -> Option<String> {
        if self.config.proxies.len() < 2 {
            return None;
        }
        self.proxy_index.fetch_add(1, Ordering::Relaxed);
        self.active_proxy()
    }

    /// Wait for a concurrency slot and for the domain's pacing delay, then
    /// mark the request as started and hand back a permit carrying the
    /// rotated identity and active proxy.
    pub async fn acquire(&self, url: &str) -> FetchPermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("politeness gate semaphore closed");

        let domain = Self::extract_domain(url);

        if let Some(ref domain) = domain {
            let wait = {
                let domains = self.domains.read().await;
                domains
                    .get(domain)
                    .map(|s| s.time_until_ready())
                    .unwrap_or(Duration::ZERO)
            };
            if wait > Duration::ZERO {
                debug!("Pacing {}: waiting {:?}", domain, wait);
                tokio::time::sleep(wait).await;
            }

            let mut domains = self.domains.write().await;
            let state = domains
                .entry(domain.clone())
                .or_insert_with(|| DomainState::new(self.config.base_delay));
            state.last_request = Some(Instant::now());
            state.total_requests += 1;
        }

        FetchPermit {
            _permit: permit,
            domain,
            user_agent: pick_identity(&self.config.user_agents),
            proxy: self.active_proxy(),
        }
    }

    /// Report a successful attempt. May walk the delay back toward base.
    pub async fn report_success(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.consecutive_successes += 1;

            if state.in_backoff && state.consecutive_successes >= self.config.recovery_threshold {
                let new_delay = Duration::from_secs_f64(
                    state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
                );
                state.current_delay = new_delay.max(self.config.min_delay);

                if state.current_delay <= self.config.base_delay {
                    state.in_backoff = false;
                    state.current_delay = self.config.base_delay;
                    info!("Domain {} recovered from backoff", domain);
                } else {
                    debug!("Domain {} delay reduced to {:?}", domain, state.current_delay);
                }

                state.consecutive_successes = 0;
            }
        }
    }

    /// Report a non-blocking server error (5xx other than 503). Mild backoff.
    pub async fn report_server_error(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            let new_delay = Duration::from_secs_f64(state.current_delay.as_secs_f64() * 1.5);
            state.current_delay = new_delay.min(self.config.max_delay);
            debug!(
                "Server error for {}, delay increased to {:?}",
                domain, state.current_delay
            );
        }
    }

    /// Escalate the domain's delay after a blocked outcome. Returns the new
    /// delay; monotonically non-decreasing and capped at `max_delay`.
    pub async fn escalate(&self, domain: &str, status: Option<u16>) -> Duration {
        let mut domains = self.domains.write().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(self.config.base_delay));

        state.blocked_hits += 1;
        state.consecutive_successes = 0;
        state.in_backoff = true;

        let new_delay = Duration::from_secs_f64(
            state.current_delay.as_secs_f64() * self.config.backoff_multiplier,
        );
        state.current_delay = new_delay.min(self.config.max_delay);

        warn!(
            "Blocked by {} (status {:?}), backing off to {:?}",
            domain, status, state.current_delay
        );
        state.current_delay
    }

    /// Decide how to proceed after a blocked outcome on one URL: escalate
    /// the delay on the first hit, rotate to the next untried proxy on
    /// subsequent hits, and give up once both the proxy pool and the retry
    /// budget are exhausted.
    pub async fn on_blocked(
        &self,
        domain: &str,
        tracker: &mut UrlAttempts,
        status: Option<u16>,
    ) -> BlockedDecision {
        tracker.attempts += 1;
        tracker.last_status = status;

        if tracker.escalations == 0 {
            self.escalate(domain, status).await;
            tracker.escalations += 1;
            return BlockedDecision::Escalated;
        }

        let alternates = self.config.proxies.len().saturating_sub(1);
        if tracker.rotations < alternates {
            if let Some(proxy) = self.rotate_proxy() {
                tracker.rotations += 1;
                info!("Failing over to proxy {} for {}", proxy, domain);
                return BlockedDecision::RotatedProxy(proxy);
            }
        }

        if tracker.attempts < self.config.retry_budget {
            self.escalate(domain, status).await;
            tracker.escalations += 1;
            return BlockedDecision::Escalated;
        }

        BlockedDecision::GiveUp
    }

    /// Fold one attempt's outcome into the domain state.
    pub async fn record(&self, attempt: &FetchAttempt) {
        let Some(domain) = Self::extract_domain(&attempt.url) else {
            return;
        };
        match attempt.outcome {
            FetchOutcome::Success => self.report_success(&domain).await,
            FetchOutcome::Blocked | FetchOutcome::Timeout => {
                // Escalation happens through on_blocked; nothing extra here.
            }
            FetchOutcome::Error => self.report_server_error(&domain).await,
        }
    }

    /// Snapshot of per-domain statistics.
    pub async fn stats(&self) -> HashMap<String, DomainStats> {
        let domains = self.domains.read().await;
        domains
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    DomainStats {
                        current_delay: v.current_delay,
                        in_backoff: v.in_backoff,
                        total_requests: v.total_requests,
                        blocked_hits: v.blocked_hits,
                    },
                )
            })
            .collect()
    }
}
