//! Per-domain pacing state.

use std::time::{Duration, Instant};

/// Pacing state for a single domain.
#[derive(Debug, Clone)]
pub struct DomainState {
    /// Current minimum delay between request starts.
    pub current_delay: Duration,
    /// Start of the most recent request.
    pub last_request: Option<Instant>,
    /// Consecutive successes since the last blocked outcome.
    pub consecutive_successes: u32,
    /// Whether currently in escalated backoff.
    pub in_backoff: bool,
    /// Total requests gated for this domain.
    pub total_requests: u64,
    /// Total blocked outcomes (403/429/503 or connection-blocked).
    pub blocked_hits: u64,
}

impl DomainState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            current_delay: base_delay,
            last_request: None,
            consecutive_successes: 0,
            in_backoff: false,
            total_requests: 0,
            blocked_hits: 0,
        }
    }

    /// Time until this domain is ready for another request start.
    pub fn time_until_ready(&self) -> Duration {
        match self.last_request {
            Some(last) => {
                let elapsed = last.elapsed();
                if elapsed >= self.current_delay {
                    Duration::ZERO
                } else {
                    self.current_delay - elapsed
                }
            }
            None => Duration::ZERO,
        }
    }

    /// Check if this domain is ready for a request now.
    pub fn is_ready(&self) -> bool {
        self.time_until_ready() == Duration::ZERO
    }
}
