//! Error taxonomy for the harvest pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while harvesting the catalog.
///
/// Only `Configuration` aborts a run; everything else is scoped to a single
/// listing page or detail URL and recorded rather than propagated.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Invalid or missing configuration. Fatal, raised before any fetch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Browser navigation did not finish within the timeout. Retryable.
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),

    /// Browser-side failure that is not a timeout.
    #[error("render failed: {0}")]
    Render(String),

    /// Backoff and proxy rotation exhausted for one URL. Terminal per URL.
    #[error("blocked fetching {url} after {attempts} attempts (last status {last_status:?})")]
    Blocked {
        url: String,
        attempts: u32,
        last_status: Option<u16>,
    },

    /// Listing page has no results container. Signals end of pagination
    /// for the current year, never aborts the run.
    #[error("results container not found in listing page")]
    NoResults,

    /// Detail response was neither a PDF nor HTML.
    #[error("unrecognized content type: {0}")]
    UnrecognizedContentType(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl HarvestError {
    /// True for failures the caller may retry on the same URL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RenderTimeout(_))
    }

    /// True for failures that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HarvestError::RenderTimeout(Duration::from_secs(60)).is_retryable());
        assert!(!HarvestError::NoResults.is_retryable());
        assert!(!HarvestError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(HarvestError::Configuration("empty year feed".into()).is_fatal());
        assert!(!HarvestError::Blocked {
            url: "https://example.com".into(),
            attempts: 3,
            last_status: Some(429),
        }
        .is_fatal());
    }
}
