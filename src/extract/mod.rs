//! Listing-link and detail-content extraction.

pub mod detail;
pub mod links;

pub use detail::{ContentExtractor, ContentKind, ExtractionRecord, ExtractionStatus};
pub use links::{LinkExtractor, LinkRecord};

/// Some block pages come back with HTTP 200 and an error body.
pub fn looks_blocked(text: &str) -> bool {
    text.to_lowercase().contains("forbidden")
}
