//! Configuration for the harvest pipeline.
//!
//! All knobs the crawl core consumes are injected through [`Settings`],
//! loaded from an optional TOML file with documented defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::scrapers::browser::RenderConfig;

/// Top-level settings, one section per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub browser: RenderConfig,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw).map_err(|e| {
            HarvestError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }
}

/// Which catalog to walk and how far back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Site root the year listing URLs hang off.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Results requested per listing page.
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,

    /// Maximum number of years to process, most recent first (0 = all).
    #[serde(default)]
    pub max_years: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            results_per_page: default_results_per_page(),
            max_years: 0,
        }
    }
}

fn default_base_url() -> String {
    "https://www.state.gov".to_string()
}

fn default_results_per_page() -> u32 {
    200
}

/// Pacing, identity rotation and failover for all outbound fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Minimum delay between request starts to the same domain, in seconds.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,

    /// Ceiling for the escalated delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Delay multiplier applied on each blocked outcome.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum in-flight requests across the whole run.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry budget per URL before a blocked outcome becomes terminal.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Proxy pool for failover (e.g. "socks5://127.0.0.1:1080").
    /// Empty means direct connections only.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Identity rotation pool. Empty means the built-in browser pool.
    #[serde(default)]
    pub user_agents: Vec<String>,

    /// Referer header sent with plain HTTP fetches.
    #[serde(default = "default_referer")]
    pub referer: Option<String>,
}

impl FetchSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            delay_secs: default_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            concurrency: default_concurrency(),
            retry_budget: default_retry_budget(),
            timeout_secs: default_timeout_secs(),
            proxies: Vec::new(),
            user_agents: Vec::new(),
            referer: default_referer(),
        }
    }
}

fn default_delay_secs() -> u64 {
    45
}

fn default_max_delay_secs() -> u64 {
    480
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_concurrency() -> usize {
    1
}

fn default_retry_budget() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_referer() -> Option<String> {
    Some("https://www.state.gov/".to_string())
}

/// Where durable outputs land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Link table (stage 1).
    #[serde(default = "default_links_csv")]
    pub links_csv: PathBuf,

    /// Extraction table (stage 2).
    #[serde(default = "default_extractions_csv")]
    pub extractions_csv: PathBuf,

    /// Raw-HTML snapshots of rendered listing pages.
    #[serde(default = "default_debug_dir")]
    pub debug_dir: PathBuf,

    /// Content-addressed storage for downloaded documents.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            links_csv: default_links_csv(),
            extractions_csv: default_extractions_csv(),
            debug_dir: default_debug_dir(),
            documents_dir: default_documents_dir(),
        }
    }
}

fn default_links_csv() -> PathBuf {
    PathBuf::from("all_extracted_links.csv")
}

fn default_extractions_csv() -> PathBuf {
    PathBuf::from("tias_extractions.csv")
}

fn default_debug_dir() -> PathBuf {
    PathBuf::from("debug_html")
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("documents")
}
