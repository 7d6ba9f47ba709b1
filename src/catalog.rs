//! Catalog year enumeration and listing-page URL construction.
//!
//! The set of valid catalog years is maintained externally as a CSV feed
//! with a single year column. Enumeration is most-recent-first and never
//! touches the network.

use std::io::Read;
use std::path::Path;

use crate::error::HarvestError;

/// One yearly partition of the document listing site.
pub type CatalogYear = u16;

/// A single listing page within a year's pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub year: CatalogYear,
    pub page_index: u32,
    pub url: String,
}

/// Build the listing page URL for a year/page slice.
///
/// Page 1 is the canonical form without a page parameter.
pub fn listing_page(
    base_url: &str,
    year: CatalogYear,
    page_index: u32,
    results_per_page: u32,
) -> ListingPage {
    let base = base_url.trim_end_matches('/');
    let url = if page_index <= 1 {
        format!("{}/{}-TIAS/?results={}", base, year, results_per_page)
    } else {
        format!(
            "{}/{}-TIAS/?results={}&page={}",
            base, year, results_per_page, page_index
        )
    };
    ListingPage {
        year,
        page_index: page_index.max(1),
        url,
    }
}

/// Parsed year feed, ordered most-recent-first.
#[derive(Debug, Clone)]
pub struct YearFeed {
    years: Vec<CatalogYear>,
}

impl YearFeed {
    /// Read the feed from a CSV file on disk.
    pub fn from_csv_path(path: &Path) -> Result<Self, HarvestError> {
        let file = std::fs::File::open(path).map_err(|e| {
            HarvestError::Configuration(format!("cannot open year feed {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }

    /// Parse the feed from any reader. The year column is matched
    /// case-insensitively ("year" or "years").
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, HarvestError> {
        let mut csv_reader = csv::Reader::from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| HarvestError::Configuration(format!("unreadable year feed: {}", e)))?;
        let year_col = headers
            .iter()
            .position(|h| {
                let h = h.trim().to_ascii_lowercase();
                h == "year" || h == "years"
            })
            .ok_or_else(|| {
                HarvestError::Configuration("year feed is missing a year column".to_string())
            })?;

        let mut years = Vec::new();
        for record in csv_reader.records() {
            let record = record
                .map_err(|e| HarvestError::Configuration(format!("bad year feed row: {}", e)))?;
            let raw = record.get(year_col).unwrap_or("").trim();
            if raw.is_empty() {
                continue;
            }
            let year: CatalogYear = raw.parse().map_err(|_| {
                HarvestError::Configuration(format!("invalid year in feed: {:?}", raw))
            })?;
            years.push(year);
        }

        if years.is_empty() {
            return Err(HarvestError::Configuration(
                "year feed contains no years".to_string(),
            ));
        }

        years.sort_unstable_by(|a, b| b.cmp(a));
        years.dedup();
        Ok(Self { years })
    }

    /// Total number of distinct years in the feed.
    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    /// Enumerate years most-recent-first, bounded by `max_years`
    /// (0 = unbounded). Restartable: each call yields a fresh sequence.
    pub fn years(&self, max_years: usize) -> impl Iterator<Item = CatalogYear> + '_ {
        let bound = if max_years == 0 {
            self.years.len()
        } else {
            max_years.min(self.years.len())
        };
        self.years.iter().copied().take(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_page_first_page_omits_page_param() {
        let page = listing_page("https://www.state.gov", 2016, 1, 200);
        assert_eq!(page.url, "https://www.state.gov/2016-TIAS/?results=200");
        assert_eq!(page.page_index, 1);
    }

    #[test]
    fn test_listing_page_later_pages_carry_page_param() {
        let page = listing_page("https://www.state.gov/", 2016, 3, 200);
        assert_eq!(
            page.url,
            "https://www.state.gov/2016-TIAS/?results=200&page=3"
        );
    }

    #[test]
    fn test_feed_orders_most_recent_first() {
        let feed = YearFeed::from_reader("Years\n1997\n2016\n2010\n".as_bytes()).unwrap();
        let years: Vec<_> = feed.years(0).collect();
        assert_eq!(years, vec![2016, 2010, 1997]);
    }

    #[test]
    fn test_feed_bounded_by_max_years() {
        let feed = YearFeed::from_reader("year\n2016\n2015\n2014\n".as_bytes()).unwrap();
        let years: Vec<_> = feed.years(2).collect();
        assert_eq!(years, vec![2016, 2015]);
    }

    #[test]
    fn test_feed_is_restartable() {
        let feed = YearFeed::from_reader("year\n2016\n2015\n".as_bytes()).unwrap();
        let first: Vec<_> = feed.years(0).collect();
        let second: Vec<_> = feed.years(0).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_feed_dedups_years() {
        let feed = YearFeed::from_reader("year\n2016\n2016\n2015\n".as_bytes()).unwrap();
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_empty_feed_is_configuration_error() {
        let err = YearFeed::from_reader("year\n".as_bytes()).unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }

    #[test]
    fn test_missing_year_column_is_configuration_error() {
        let err = YearFeed::from_reader("treaty,count\nx,1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }

    #[test]
    fn test_malformed_year_is_configuration_error() {
        let err = YearFeed::from_reader("year\ntwenty-sixteen\n".as_bytes()).unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }
}
