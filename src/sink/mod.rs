//! Append-only CSV sinks and debug snapshots.
//!
//! Both output files are append-only across runs. Dedup state is not
//! persisted separately, it is rebuilt from the URL column of whatever
//! already sits on disk, so re-running against the same files never
//! produces duplicate rows.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::HarvestError;
use crate::extract::{ExtractionRecord, LinkRecord};

const LINK_HEADERS: [&str; 3] = ["url", "source_year", "discovered_at_page"];
const EXTRACTION_HEADERS: [&str; 5] =
    ["url", "content_type", "status", "payload_ref", "error_detail"];

/// URL set seeded from a CSV's `url` column.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashSet<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from an existing output file. A missing file is an empty set.
    pub fn from_csv(path: &Path) -> Result<Self, HarvestError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let url_column = reader
            .headers()?
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("url"))
            .ok_or_else(|| {
                HarvestError::Configuration(format!(
                    "existing output {} has no url column",
                    path.display()
                ))
            })?;

        let mut seen = HashSet::new();
        for record in reader.records() {
            let record = record?;
            if let Some(url) = record.get(url_column) {
                seen.insert(url.to_string());
            }
        }
        debug!("Rebuilt {} known URLs from {}", seen.len(), path.display());
        Ok(Self { seen })
    }

    /// Returns true if the URL was not seen before.
    pub fn insert(&mut self, url: &str) -> bool {
        self.seen.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn open_append(path: &Path, headers: &[&str]) -> Result<csv::Writer<File>, HarvestError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(headers)?;
        writer.flush()?;
    }
    Ok(writer)
}

/// Discovered-link output. One row per unique detail-page URL.
pub struct LinkSink {
    writer: csv::Writer<File>,
    dedup: DedupSet,
    path: PathBuf,
}

impl LinkSink {
    pub fn open(path: &Path) -> Result<Self, HarvestError> {
        let dedup = DedupSet::from_csv(path)?;
        let writer = open_append(path, &LINK_HEADERS)?;
        if !dedup.is_empty() {
            info!(
                "Resuming link output at {} with {} existing URLs",
                path.display(),
                dedup.len()
            );
        }
        Ok(Self {
            writer,
            dedup,
            path: path.to_path_buf(),
        })
    }

    /// Append a link unless its URL was already written, now or in a prior
    /// run. Returns whether a row was written.
    pub fn append(&mut self, record: &LinkRecord) -> Result<bool, HarvestError> {
        if !self.dedup.insert(&record.url) {
            return Ok(false);
        }
        self.writer.write_record([
            record.url.clone(),
            record.source_year.to_string(),
            record.discovered_at_page.to_string(),
        ])?;
        self.writer.flush()?;
        Ok(true)
    }

    pub fn known(&self, url: &str) -> bool {
        self.dedup.contains(url)
    }
}

impl std::fmt::Debug for LinkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSink")
            .field("path", &self.path)
            .field("known", &self.dedup.len())
            .finish()
    }
}

/// Extraction output. One row per processed URL, success or failure.
pub struct ExtractionSink {
    writer: csv::Writer<File>,
    dedup: DedupSet,
}

impl ExtractionSink {
    pub fn open(path: &Path) -> Result<Self, HarvestError> {
        let dedup = DedupSet::from_csv(path)?;
        let writer = open_append(path, &EXTRACTION_HEADERS)?;
        if !dedup.is_empty() {
            info!(
                "Resuming extraction output at {} with {} processed URLs",
                path.display(),
                dedup.len()
            );
        }
        Ok(Self { writer, dedup })
    }

    pub fn append(&mut self, record: &ExtractionRecord) -> Result<bool, HarvestError> {
        if !self.dedup.insert(&record.url) {
            return Ok(false);
        }
        self.writer.write_record([
            record.url.as_str(),
            record.content_type.as_str(),
            record.status.as_str(),
            record.payload_ref.as_str(),
            record.error_detail.as_str(),
        ])?;
        self.writer.flush()?;
        Ok(true)
    }

    /// URLs already processed in earlier runs are skipped entirely.
    pub fn already_processed(&self, url: &str) -> bool {
        self.dedup.contains(url)
    }
}

/// Save a page's HTML for offline inspection of selector misses.
pub fn write_snapshot(debug_dir: &Path, label: &str, html: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(debug_dir)?;
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let path = debug_dir.join(format!("{}.html", safe));
    std::fs::write(&path, html)?;
    Ok(path)
}
