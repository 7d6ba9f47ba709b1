//! Browser-backed render gateway.
//!
//! Uses chromiumoxide (CDP) to fetch JavaScript-rendered listing and detail
//! pages, applying a configurable sequence of wait/scroll triggers so lazily
//! loaded content materializes before the DOM is captured.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "browser")]
use std::sync::Arc;

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, ResourceType, SetUserAgentOverrideParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tokio::sync::Mutex;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

use crate::error::HarvestError;
#[cfg(feature = "browser")]
use crate::scrapers::politeness::pick_identity;

/// Render gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Run in headless mode (default: true).
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Navigation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Wait for this CSS selector before considering the page loaded.
    #[serde(default = "default_wait_for_selector")]
    pub wait_for_selector: Option<String>,

    /// Number of scroll-to-bottom passes to trigger lazy content.
    #[serde(default = "default_scroll_passes")]
    pub scroll_passes: u32,

    /// Pause after each scroll pass, in milliseconds.
    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,

    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Proxy server URL passed to the browser.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            timeout_secs: default_timeout(),
            wait_for_selector: default_wait_for_selector(),
            scroll_passes: default_scroll_passes(),
            scroll_pause_ms: default_scroll_pause_ms(),
            chrome_args: Vec::new(),
            remote_url: None,
            proxy: None,
        }
    }
}

fn default_headless() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_wait_for_selector() -> Option<String> {
    Some("ul.collection-results li".to_string())
}

fn default_scroll_passes() -> u32 {
    3
}

fn default_scroll_pause_ms() -> u64 {
    2000
}

/// One step in the post-navigation wait sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTrigger {
    /// Wait until the selector matches (or the timeout passes).
    Selector(String),
    /// Scroll to the bottom of the document.
    ScrollToBottom,
    /// Pause for the given number of milliseconds.
    Sleep(u64),
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The trigger sequence applied after navigation: optional selector
    /// wait, then scroll/pause passes to force lazy content to load.
    pub fn triggers(&self) -> Vec<WaitTrigger> {
        let mut triggers = Vec::new();
        if let Some(ref selector) = self.wait_for_selector {
            triggers.push(WaitTrigger::Selector(selector.clone()));
        }
        for _ in 0..self.scroll_passes {
            triggers.push(WaitTrigger::ScrollToBottom);
            triggers.push(WaitTrigger::Sleep(self.scroll_pause_ms));
        }
        triggers
    }
}

/// A rendered page as captured from the browser.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub html: String,
}

/// Render gateway abstraction, implemented by the browser fetcher and by
/// test fakes.
#[async_trait]
pub trait PageRenderer: Send {
    async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError>;
}

/// Browser-backed renderer.
#[cfg(feature = "browser")]
pub struct BrowserRenderer {
    config: RenderConfig,
    identity_pool: Vec<String>,
    browser: Option<Arc<Mutex<Browser>>>,
}

#[cfg(feature = "browser")]
impl BrowserRenderer {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        // Common install locations
        "/opt/google/chrome/google-chrome",
    ];

    pub fn new(config: RenderConfig, identity_pool: Vec<String>) -> Self {
        Self {
            config,
            identity_pool,
            browser: None,
        }
    }

    fn find_chrome() -> Result<std::path::PathBuf, HarvestError> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        info!("Found Chrome in PATH: {}", path);
                        return Ok(std::path::PathBuf::from(path));
                    }
                }
            }
        }

        Err(HarvestError::Configuration(
            "Chrome/Chromium not found; install it or set browser.remote_url".to_string(),
        ))
    }

    /// Launch or connect to the browser if not already running.
    async fn ensure_browser(&mut self) -> Result<(), HarvestError> {
        if self.browser.is_some() {
            return Ok(());
        }

        if let Some(remote_url) = self.config.remote_url.clone() {
            return self.connect_remote(&remote_url).await;
        }

        info!("Launching browser (headless={})", self.config.headless);

        let chrome_path = Self::find_chrome()?;
        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);

        // with_head means NOT headless, confusingly
        if !self.config.headless {
            builder = builder.with_head();
        }

        if let Some(ref proxy) = self.config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        for arg in &self.config.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| HarvestError::Render(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::Render(format!("browser launch: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        self.browser = Some(Arc::new(Mutex::new(browser)));
        Ok(())
    }

    /// Connect to a remote Chrome instance.
    async fn connect_remote(&mut self, url: &str) -> Result<(), HarvestError> {
        info!("Connecting to remote browser at {}", url);

        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .map_err(|e| HarvestError::Render(format!("remote browser: {}", e)))?
            .json()
            .await
            .map_err(|e| HarvestError::Render(format!("remote browser version: {}", e)))?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HarvestError::Render("no webSocketDebuggerUrl in version response".to_string())
            })?;

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| HarvestError::Render(format!("remote browser connect: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        self.browser = Some(Arc::new(Mutex::new(browser)));
        Ok(())
    }

    async fn apply_trigger(&self, page: &Page, trigger: &WaitTrigger) {
        match trigger {
            WaitTrigger::Selector(selector) => {
                debug!("Waiting for selector: {}", selector);
                match tokio::time::timeout(self.config.timeout(), page.find_element(selector))
                    .await
                {
                    Ok(Ok(_)) => debug!("Selector found"),
                    Ok(Err(e)) => warn!("Selector not found: {}", e),
                    Err(_) => warn!("Timeout waiting for selector {}", selector),
                }
            }
            WaitTrigger::ScrollToBottom => {
                if let Err(e) = page
                    .evaluate("window.scrollTo(0, document.body.scrollHeight)".to_string())
                    .await
                {
                    debug!("Scroll trigger skipped: {}", e);
                }
            }
            WaitTrigger::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
        }
    }

    /// Close the browser.
    pub async fn close(&mut self) {
        self.browser = None;
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageRenderer for BrowserRenderer {
    async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError> {
        self.ensure_browser().await?;

        let browser = self
            .browser
            .as_ref()
            .expect("browser just ensured")
            .lock()
            .await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarvestError::Render(format!("new page: {}", e)))?;

        let user_agent = pick_identity(&self.identity_pool);
        page.execute(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map_err(|e| HarvestError::Render(format!("user agent override: {}", e)))?;

        // Subscribe before navigating so the document response is buffered.
        page.execute(EnableParams::default())
            .await
            .map_err(|e| HarvestError::Render(format!("network enable: {}", e)))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| HarvestError::Render(format!("response listener: {}", e)))?;

        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| HarvestError::Render(format!("invalid URL: {}", e)))?;

        let nav_timeout = self.config.timeout();
        match tokio::time::timeout(nav_timeout, page.execute(nav_params)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = page.close().await;
                return Err(HarvestError::Render(format!("navigation: {}", e)));
            }
            Err(_) => {
                let _ = page.close().await;
                return Err(HarvestError::RenderTimeout(nav_timeout));
            }
        }

        // Wait for the document to be ready before applying triggers.
        let ready_script = r#"
            new Promise((resolve) => {
                if (document.readyState === 'complete' || document.readyState === 'interactive') {
                    resolve(document.readyState);
                } else {
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), 10000);
                }
            })
        "#;
        match tokio::time::timeout(nav_timeout, page.evaluate(ready_script.to_string())).await {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => {
                // Can fail on non-HTML pages (PDFs) - not critical.
                debug!("Could not check ready state: {}", e);
            }
            Err(_) => {
                let _ = page.close().await;
                return Err(HarvestError::RenderTimeout(nav_timeout));
            }
        }

        // Pull the main document's HTTP status out of the buffered
        // network events. Subresource responses are skipped.
        let mut status: u16 = 200;
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(250), responses.next()).await {
                Ok(Some(event)) => {
                    if event.r#type == ResourceType::Document {
                        status = event.response.status as u16;
                        break;
                    }
                }
                _ => break,
            }
        }
        drop(responses);

        for trigger in self.config.triggers() {
            self.apply_trigger(&page, &trigger).await;
        }

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let html = page
            .content()
            .await
            .map_err(|e| HarvestError::Render(format!("content: {}", e)))?;

        // Close the page to prevent tab accumulation.
        let _ = page.close().await;

        Ok(RenderedPage {
            url: url.to_string(),
            final_url,
            // 200 when no document response event was observed; callers
            // also apply blocked-body detection.
            status,
            html,
        })
    }
}

// Stub for when browser feature is disabled.
#[cfg(not(feature = "browser"))]
pub struct BrowserRenderer {
    #[allow(dead_code)]
    config: RenderConfig,
}

#[cfg(not(feature = "browser"))]
impl BrowserRenderer {
    pub fn new(config: RenderConfig, _identity_pool: Vec<String>) -> Self {
        Self { config }
    }

    pub async fn close(&mut self) {}
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl PageRenderer for BrowserRenderer {
    async fn render(&mut self, _url: &str) -> Result<RenderedPage, HarvestError> {
        Err(HarvestError::Render(
            "browser support not compiled; rebuild with: cargo build --features browser"
                .to_string(),
        ))
    }
}
