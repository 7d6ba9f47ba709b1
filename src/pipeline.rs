//! Two-stage harvest pipeline: listing discovery, then content extraction.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::catalog::{listing_page, YearFeed};
use crate::config::Settings;
use crate::error::HarvestError;
use crate::extract::{looks_blocked, ContentExtractor, LinkExtractor, LinkRecord};
use crate::scrapers::politeness::{BlockedDecision, FetchAttempt, FetchOutcome, UrlAttempts};
use crate::scrapers::{PageRenderer, PolitenessGate, RenderedPage};
use crate::sink::{write_snapshot, ExtractionSink, LinkSink};

/// Aggregate counters for one run. Drives the process exit code.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub years_visited: u32,
    pub pages_rendered: u32,
    pub links_discovered: u32,
    pub links_duplicate: u32,
    pub items_ok: u32,
    pub items_failed: u32,
    pub items_skipped: u32,
    pub errors: u32,
}

impl RunStats {
    /// Zero when the run produced output or had nothing to do; nonzero when
    /// it only accumulated errors.
    pub fn exit_code(&self) -> i32 {
        let produced = self.links_discovered + self.items_ok + self.items_skipped;
        if self.errors > 0 && produced == 0 {
            1
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "years={} pages={} links={} (dup {}) items ok={} failed={} skipped={} errors={}",
            self.years_visited,
            self.pages_rendered,
            self.links_discovered,
            self.links_duplicate,
            self.items_ok,
            self.items_failed,
            self.items_skipped,
            self.errors
        )
    }
}

/// Render one page through the politeness gate, retrying timeouts and
/// routing blocked responses through the escalate/rotate/give-up cycle.
/// Both stages use this for every browser navigation.
pub(crate) async fn render_paced(
    renderer: &mut (dyn PageRenderer + '_),
    gate: &PolitenessGate,
    url: &str,
) -> Result<RenderedPage, HarvestError> {
    let mut tracker = UrlAttempts::new();

    loop {
        let permit = gate.acquire(url).await;
        let user_agent = permit.user_agent.clone();
        let domain = permit.domain.clone();

        let rendered = renderer.render(url).await;
        drop(permit);

        match rendered {
            Ok(page) => {
                if matches!(page.status, 403 | 429 | 503) || looks_blocked(&page.html) {
                    let attempt = FetchAttempt::new(url, &user_agent, FetchOutcome::Blocked);
                    gate.record(&attempt).await;
                    let Some(domain) = domain else {
                        return Err(HarvestError::Blocked {
                            url: url.to_string(),
                            attempts: tracker.attempts,
                            last_status: None,
                        });
                    };
                    match gate.on_blocked(&domain, &mut tracker, Some(page.status)).await {
                        BlockedDecision::Escalated | BlockedDecision::RotatedProxy(_) => continue,
                        BlockedDecision::GiveUp => {
                            return Err(HarvestError::Blocked {
                                url: url.to_string(),
                                attempts: tracker.attempts,
                                last_status: tracker.last_status,
                            });
                        }
                    }
                }
                let attempt = FetchAttempt::new(url, &user_agent, FetchOutcome::Success);
                gate.record(&attempt).await;
                return Ok(page);
            }
            Err(e) if e.is_retryable() => {
                let attempt = FetchAttempt::new(url, &user_agent, FetchOutcome::Timeout);
                gate.record(&attempt).await;
                let Some(domain) = domain else {
                    return Err(e);
                };
                match gate.on_blocked(&domain, &mut tracker, None).await {
                    BlockedDecision::Escalated | BlockedDecision::RotatedProxy(_) => {
                        debug!("Retrying {} after render timeout", url);
                        continue;
                    }
                    BlockedDecision::GiveUp => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stage 1: walk the year feed most-recent-first, render each listing page,
/// and append every newly discovered detail link to the sink.
pub async fn discover_links(
    feed: &YearFeed,
    settings: &Settings,
    renderer: &mut (dyn PageRenderer + '_),
    gate: &PolitenessGate,
    sink: &mut LinkSink,
) -> Result<RunStats, HarvestError> {
    let extractor = LinkExtractor::new();
    let mut stats = RunStats::default();
    let debug_dir = settings.output.debug_dir.as_path();

    for year in feed.years(settings.catalog.max_years) {
        stats.years_visited += 1;
        info!("Enumerating year {}", year);

        let mut page_index = 1u32;
        loop {
            let page = listing_page(
                &settings.catalog.base_url,
                year,
                page_index,
                settings.catalog.results_per_page,
            );

            let html = match render_paced(renderer, gate, &page.url).await {
                Ok(rendered) => rendered.html,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Listing page {} failed: {}", page.url, e);
                    stats.errors += 1;
                    break;
                }
            };
            stats.pages_rendered += 1;

            // Best-effort snapshot; a write failure never stops the walk.
            if let Err(e) =
                write_snapshot(debug_dir, &format!("{}-page-{}", year, page_index), &html)
            {
                debug!("Snapshot write failed: {}", e);
            }

            let urls = match extractor.extract(&html, &page.url) {
                Ok(urls) => urls,
                Err(HarvestError::NoResults) => {
                    if page_index == 1 {
                        warn!("Year {} listing has no results container", year);
                    } else {
                        debug!("Year {} pagination ended at page {}", year, page_index);
                    }
                    break;
                }
                Err(e) => return Err(e),
            };

            let mut new_on_page = 0u32;
            for url in urls {
                let record = LinkRecord {
                    url,
                    source_year: year,
                    discovered_at_page: page_index,
                };
                if sink.append(&record)? {
                    stats.links_discovered += 1;
                    new_on_page += 1;
                } else {
                    stats.links_duplicate += 1;
                }
            }

            // A page of nothing but already-known links means the rest of
            // the year was covered by an earlier run.
            if new_on_page == 0 {
                debug!("Year {} page {} yielded no new links", year, page_index);
                break;
            }

            page_index += 1;
        }
    }

    info!("Discovery done: {}", stats.summary());
    Ok(stats)
}

/// Stage 2: process each URL to exactly one extraction row. URLs already
/// present in the output are skipped, so reruns only touch new work.
pub async fn extract_documents(
    urls: &[String],
    extractor: &ContentExtractor,
    sink: &mut ExtractionSink,
    mut renderer: Option<&mut (dyn PageRenderer + '_)>,
) -> Result<RunStats, HarvestError> {
    let mut stats = RunStats::default();

    for url in urls {
        if sink.already_processed(url) {
            debug!("Skipping already processed {}", url);
            stats.items_skipped += 1;
            continue;
        }

        let record = extractor.process(url, renderer.as_deref_mut()).await;
        let is_ok = matches!(record.status, crate::extract::ExtractionStatus::Ok);
        sink.append(&record)?;
        if is_ok {
            stats.items_ok += 1;
        } else {
            stats.items_failed += 1;
            stats.errors += 1;
        }
    }

    info!("Extraction done: {}", stats.summary());
    Ok(stats)
}

/// Read the URL list for stage 2. Accepts the stage-1 CSV (url column) or
/// a plain newline-separated file.
pub fn load_url_list(path: &Path) -> Result<Vec<String>, HarvestError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HarvestError::Configuration(format!("cannot read url list {}: {}", path.display(), e))
    })?;

    let first_line = content.lines().next().unwrap_or("");
    let mut urls = Vec::new();

    if first_line.split(',').any(|h| h.trim().eq_ignore_ascii_case("url")) && first_line.contains(',')
        || first_line.trim().eq_ignore_ascii_case("url")
    {
        let mut reader = csv::Reader::from_reader(content.as_bytes());
        let url_column = reader
            .headers()
            .map_err(|e| HarvestError::Configuration(format!("bad url list header: {}", e)))?
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("url"))
            .ok_or_else(|| HarvestError::Configuration("url list has no url column".to_string()))?;
        for record in reader.records() {
            let record = record
                .map_err(|e| HarvestError::Configuration(format!("bad url list row: {}", e)))?;
            if let Some(url) = record.get(url_column) {
                if !url.trim().is_empty() {
                    urls.push(url.trim().to_string());
                }
            }
        }
    } else {
        for line in content.lines() {
            let line = line.trim();
            if !line.is_empty() {
                urls.push(line.to_string());
            }
        }
    }

    if urls.is_empty() {
        return Err(HarvestError::Configuration(format!(
            "url list {} is empty",
            path.display()
        )));
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::config::Settings;
    use crate::scrapers::politeness::PolitenessConfig;
    use crate::scrapers::RenderedPage;

    /// In-memory renderer serving canned HTML per URL.
    struct FakeRenderer {
        pages: HashMap<String, String>,
        requests: Vec<String>,
    }

    impl FakeRenderer {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                requests: Vec::new(),
            }
        }

        fn serve(&mut self, url: &str, html: &str) {
            self.pages.insert(url.to_string(), html.to_string());
        }
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError> {
            self.requests.push(url.to_string());
            match self.pages.get(url) {
                Some(html) => Ok(RenderedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    html: html.clone(),
                }),
                None => Ok(RenderedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    html: "<html><body>empty</body></html>".to_string(),
                }),
            }
        }
    }

    fn fast_gate() -> PolitenessGate {
        PolitenessGate::new(PolitenessConfig {
            base_delay: Duration::from_millis(1),
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..Default::default()
        })
    }

    fn test_settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.output.debug_dir = dir.join("debug_html");
        settings
    }

    fn listing_html(hrefs: &[&str]) -> String {
        let items: String = hrefs
            .iter()
            .map(|h| format!(r#"<li><a class="collection-result__link" href="{}">x</a></li>"#, h))
            .collect();
        format!(r#"<html><body><ul class="collection-results">{}</ul></body></html>"#, items)
    }

    #[tokio::test]
    async fn test_discovery_walks_pagination_and_writes_links() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let gate = fast_gate();
        let feed = YearFeed::from_reader("year\n2016\n".as_bytes()).unwrap();

        let mut renderer = FakeRenderer::new();
        renderer.serve(
            "https://www.state.gov/2016-TIAS/?results=200",
            &listing_html(&["/16-629/", "/16-630/", "/16-631/"]),
        );
        // Page 2 has no results container: pagination stops there.

        let mut sink = LinkSink::open(&dir.path().join("links.csv")).unwrap();
        let stats = discover_links(&feed, &settings, &mut renderer, &gate, &mut sink)
            .await
            .unwrap();

        assert_eq!(stats.links_discovered, 3);
        assert_eq!(stats.links_duplicate, 0);
        assert_eq!(stats.pages_rendered, 2);
        assert_eq!(stats.years_visited, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.exit_code(), 0);
        assert_eq!(
            renderer.requests,
            vec![
                "https://www.state.gov/2016-TIAS/?results=200",
                "https://www.state.gov/2016-TIAS/?results=200&page=2",
            ]
        );
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent_across_runs() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let gate = fast_gate();
        let feed = YearFeed::from_reader("year\n2016\n".as_bytes()).unwrap();
        let links_path = dir.path().join("links.csv");

        let html = listing_html(&["/16-629/", "/16-630/"]);

        for run in 0..2 {
            let mut renderer = FakeRenderer::new();
            renderer.serve("https://www.state.gov/2016-TIAS/?results=200", &html);
            let mut sink = LinkSink::open(&links_path).unwrap();
            let stats = discover_links(&feed, &settings, &mut renderer, &gate, &mut sink)
                .await
                .unwrap();
            if run == 0 {
                assert_eq!(stats.links_discovered, 2);
            } else {
                assert_eq!(stats.links_discovered, 0);
                assert_eq!(stats.links_duplicate, 2);
            }
        }

        let content = std::fs::read_to_string(&links_path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_discovery_respects_max_years() {
        let dir = tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.catalog.max_years = 1;
        let gate = fast_gate();
        let feed = YearFeed::from_reader("year\n2014\n2016\n2015\n".as_bytes()).unwrap();

        let mut renderer = FakeRenderer::new();
        let mut sink = LinkSink::open(&dir.path().join("links.csv")).unwrap();
        let stats = discover_links(&feed, &settings, &mut renderer, &gate, &mut sink)
            .await
            .unwrap();

        assert_eq!(stats.years_visited, 1);
        // Most recent year goes first.
        assert!(renderer.requests[0].contains("2016-TIAS"));
        assert!(renderer.requests.iter().all(|u| u.contains("2016-TIAS")));
    }

    #[tokio::test]
    async fn test_empty_first_page_snapshots_and_continues() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let gate = fast_gate();
        let feed = YearFeed::from_reader("year\n2016\n".as_bytes()).unwrap();

        // Default fake body has no results container.
        let mut renderer = FakeRenderer::new();
        let mut sink = LinkSink::open(&dir.path().join("links.csv")).unwrap();
        let stats = discover_links(&feed, &settings, &mut renderer, &gate, &mut sink)
            .await
            .unwrap();

        assert_eq!(stats.links_discovered, 0);
        assert_eq!(stats.errors, 0);
        let snapshot = settings.output.debug_dir.join("2016_page_1.html");
        assert!(snapshot.exists());
    }

    #[tokio::test]
    async fn test_resumed_run_stops_paginating_on_known_links() {
        // Every page of the year repeats the same links. The first run
        // writes them from page 1 and stops at page 2; a resumed run sees
        // nothing new on page 1 and stops immediately.
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let gate = fast_gate();
        let feed = YearFeed::from_reader("year\n2016\n".as_bytes()).unwrap();
        let links_path = dir.path().join("links.csv");
        let html = listing_html(&["/16-629/", "/16-630/"]);

        let mut first = FakeRenderer::new();
        first.serve("https://www.state.gov/2016-TIAS/?results=200", &html);
        first.serve("https://www.state.gov/2016-TIAS/?results=200&page=2", &html);
        first.serve("https://www.state.gov/2016-TIAS/?results=200&page=3", &html);
        {
            let mut sink = LinkSink::open(&links_path).unwrap();
            let stats = discover_links(&feed, &settings, &mut first, &gate, &mut sink)
                .await
                .unwrap();
            assert_eq!(stats.links_discovered, 2);
        }
        assert_eq!(first.requests.len(), 2);

        let mut second = FakeRenderer::new();
        second.serve("https://www.state.gov/2016-TIAS/?results=200", &html);
        second.serve("https://www.state.gov/2016-TIAS/?results=200&page=2", &html);
        let mut sink = LinkSink::open(&links_path).unwrap();
        let stats = discover_links(&feed, &settings, &mut second, &gate, &mut sink)
            .await
            .unwrap();

        assert_eq!(stats.links_discovered, 0);
        assert_eq!(stats.links_duplicate, 2);
        assert_eq!(second.requests.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_render_status_counts_as_blocked() {
        // A renderer surfacing a 429 document status is treated like a
        // blocked body even when the HTML itself looks harmless.
        struct RateLimitedRenderer;

        #[async_trait]
        impl PageRenderer for RateLimitedRenderer {
            async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError> {
                Ok(RenderedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 429,
                    html: "<html><body>please slow down</body></html>".to_string(),
                })
            }
        }

        let gate = fast_gate();
        let mut renderer = RateLimitedRenderer;
        let err = render_paced(&mut renderer, &gate, "https://www.state.gov/2016-TIAS/")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarvestError::Blocked {
                last_status: Some(429),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_extraction_skips_processed_urls_without_fetching() {
        use crate::extract::ContentExtractor;
        use crate::scrapers::HttpClient;
        use crate::sink::ExtractionSink;

        let dir = tempdir().unwrap();
        let out = dir.path().join("extractions.csv");
        std::fs::write(
            &out,
            "url,content_type,status,payload_ref,error_detail\nhttps://www.state.gov/16-629/,pdf,ok,x,\n",
        )
        .unwrap();

        let gate = fast_gate();
        let client = HttpClient::new(gate, Duration::from_secs(1), None);
        let extractor = ContentExtractor::new(client, dir.path().join("documents"));
        let mut sink = ExtractionSink::open(&out).unwrap();
        let mut renderer = FakeRenderer::new();

        let urls = vec!["https://www.state.gov/16-629/".to_string()];
        let stats = extract_documents(
            &urls,
            &extractor,
            &mut sink,
            Some(&mut renderer as &mut dyn PageRenderer),
        )
        .await
        .unwrap();

        assert_eq!(stats.items_skipped, 1);
        assert_eq!(stats.items_ok, 0);
        assert_eq!(stats.items_failed, 0);
        assert!(renderer.requests.is_empty());
    }

    #[tokio::test]
    async fn test_render_paced_gives_up_on_persistent_block() {
        struct BlockedRenderer;

        #[async_trait]
        impl PageRenderer for BlockedRenderer {
            async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError> {
                Ok(RenderedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    html: "<html>403 Forbidden</html>".to_string(),
                })
            }
        }

        let gate = fast_gate();
        let mut renderer = BlockedRenderer;
        let err = render_paced(&mut renderer, &gate, "https://www.state.gov/2016-TIAS/")
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Blocked { .. }));
    }

    #[test]
    fn test_load_url_list_from_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.csv");
        std::fs::write(
            &path,
            "url,source_year,discovered_at_page\nhttps://www.state.gov/16-629/,2016,1\n",
        )
        .unwrap();
        let urls = load_url_list(&path).unwrap();
        assert_eq!(urls, vec!["https://www.state.gov/16-629/".to_string()]);
    }

    #[test]
    fn test_load_url_list_from_plain_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "https://www.state.gov/16-629/\n\nhttps://www.state.gov/10-413\n")
            .unwrap();
        let urls = load_url_list(&path).unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_load_url_list_empty_is_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(
            load_url_list(&path).unwrap_err(),
            HarvestError::Configuration(_)
        ));
    }

    #[test]
    fn test_exit_code_rules() {
        let mut stats = RunStats::default();
        assert_eq!(stats.exit_code(), 0);

        stats.errors = 2;
        assert_eq!(stats.exit_code(), 1);

        stats.links_discovered = 1;
        assert_eq!(stats.exit_code(), 0);
    }
}
