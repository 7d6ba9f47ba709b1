//! Agreement link extraction from rendered listing pages.

use std::collections::HashSet;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::catalog::CatalogYear;
use crate::error::HarvestError;

/// One discovered agreement link, terminal once written to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub url: String,
    pub source_year: CatalogYear,
    pub discovered_at_page: u32,
}

/// Extracts detail-page URLs from a listing page's DOM.
pub struct LinkExtractor {
    container: Selector,
    anchor: Selector,
    markdown_link: Regex,
    agreement_shape: Regex,
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor {
    pub fn new() -> Self {
        Self {
            container: Selector::parse("ul.collection-results")
                .expect("static container selector"),
            anchor: Selector::parse("a.collection-result__link").expect("static anchor selector"),
            markdown_link: Regex::new(r"\((https://www\.state\.gov/[^)]+)\)")
                .expect("static markdown link regex"),
            agreement_shape: Regex::new(r"^https://www\.state\.gov/\d{2}-\d{3,4}/?$")
                .expect("static agreement shape regex"),
        }
    }

    /// Pull every detail-page URL out of the listing HTML, normalized to
    /// absolute form and unique within the page.
    ///
    /// Returns `NoResults` when the results container is absent, which the
    /// caller treats as "zero new links, stop paginating this year".
    pub fn extract(&self, html: &str, base_url: &str) -> Result<Vec<String>, HarvestError> {
        let document = Html::parse_document(html);
        let base = Url::parse(base_url).ok();

        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        let mut container_found = false;

        for container in document.select(&self.container) {
            container_found = true;
            for anchor in container.select(&self.anchor) {
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                let Some(absolute) = resolve(base.as_ref(), href) else {
                    continue;
                };
                // Year navigation links live in the same container shape.
                if absolute.to_lowercase().contains("treaties-and-agreements") {
                    continue;
                }
                if seen.insert(absolute.clone()) {
                    urls.push(absolute);
                }
            }
        }

        if !container_found {
            return Err(HarvestError::NoResults);
        }

        // Fallback for markdown-style dumps of the same listing, filtered
        // to the agreement URL shape.
        for capture in self.markdown_link.captures_iter(html) {
            let candidate = capture[1].to_string();
            if self.agreement_shape.is_match(&candidate) && seen.insert(candidate.clone()) {
                urls.push(candidate);
            }
        }

        debug!("Extracted {} candidate links", urls.len());
        Ok(urls)
    }
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    base.and_then(|b| b.join(href).ok()).map(|u| u.to_string())
}
