//! Detail-page classification and content extraction.

use std::path::PathBuf;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::error::HarvestError;
use crate::scrapers::{HttpClient, PageRenderer};
use crate::storage;

/// What a fetched payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Pdf,
    Html,
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Pdf => "pdf",
            ContentKind::Html => "html",
            ContentKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    Ok,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Ok => "ok",
            ExtractionStatus::Error => "error",
        }
    }
}

/// One row of extraction output. Error rows always carry a detail string.
#[derive(Debug, Clone)]
pub struct ExtractionRecord {
    pub url: String,
    pub content_type: ContentKind,
    pub status: ExtractionStatus,
    pub payload_ref: String,
    pub error_detail: String,
}

impl ExtractionRecord {
    pub fn ok(url: &str, kind: ContentKind, payload: String) -> Self {
        Self {
            url: url.to_string(),
            content_type: kind,
            status: ExtractionStatus::Ok,
            payload_ref: payload,
            error_detail: String::new(),
        }
    }

    pub fn failed(url: &str, kind: ContentKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            url: url.to_string(),
            content_type: kind,
            status: ExtractionStatus::Error,
            payload_ref: String::new(),
            error_detail: if detail.is_empty() {
                "unspecified failure".to_string()
            } else {
                detail
            },
        }
    }
}

/// Decide what a payload is from the Content-Type header, falling back to
/// byte sniffing when the header is absent or unhelpful.
pub fn classify(content_type: Option<&str>, body: &[u8]) -> ContentKind {
    if let Some(ct) = content_type {
        let ct = ct.to_lowercase();
        if ct.contains("application/pdf") {
            return ContentKind::Pdf;
        }
        if ct.contains("text/html") {
            return ContentKind::Html;
        }
    }
    if let Some(kind) = infer::get(body) {
        if kind.mime_type() == "application/pdf" {
            return ContentKind::Pdf;
        }
    }
    let trimmed = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &body[i..])
        .unwrap_or(body);
    if trimmed.starts_with(b"<") {
        return ContentKind::Html;
    }
    ContentKind::Unknown
}

/// Structured fields pulled out of an agreement detail page.
#[derive(Debug, Default)]
pub struct DetailPage {
    pub title: String,
    pub paragraphs: Vec<String>,
    pub agreement_codes: Vec<String>,
    pub primary_pdf: Option<String>,
    pub other_pdfs: Vec<String>,
}

impl DetailPage {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.paragraphs.is_empty()
    }

    /// Flattened text payload for the extraction row.
    pub fn payload(&self) -> String {
        let mut parts = Vec::new();
        if !self.title.is_empty() {
            parts.push(self.title.clone());
        }
        parts.extend(self.paragraphs.iter().cloned());
        parts.join(" | ")
    }
}

/// Parse an agreement detail page into its title, body text, document
/// codes, and download links.
pub fn parse_detail(html: &str, base_url: &str) -> DetailPage {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let title_sel = Selector::parse("h1.featured-content__headline.stars-above")
        .expect("static title selector");
    let para_sel = Selector::parse("p").expect("static paragraph selector");
    let download_sel = Selector::parse("a.button--download").expect("static download selector");
    let pdf_sel = Selector::parse(r#"a[href$=".pdf"]"#).expect("static pdf selector");
    let code_re = Regex::new(r"\b\d{2}[-\s]?\d{3,4}\b").expect("static code regex");

    let mut page = DetailPage::default();

    if let Some(h1) = document.select(&title_sel).next() {
        page.title = h1.text().collect::<String>().trim().to_string();
    }

    for p in document.select(&para_sel) {
        let text = p.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            page.paragraphs.push(text);
        }
    }

    let haystack = format!("{} {}", page.title, page.paragraphs.join(" "));
    for m in code_re.find_iter(&haystack) {
        let code = m.as_str().to_string();
        if !page.agreement_codes.contains(&code) {
            page.agreement_codes.push(code);
        }
    }

    let resolve = |href: &str| -> Option<String> {
        if href.starts_with("http://") || href.starts_with("https://") {
            return Some(href.to_string());
        }
        base.as_ref().and_then(|b| b.join(href).ok()).map(|u| u.to_string())
    };

    if let Some(a) = document.select(&download_sel).next() {
        page.primary_pdf = a.value().attr("href").and_then(resolve);
    }
    for a in document.select(&pdf_sel) {
        if let Some(url) = a.value().attr("href").and_then(resolve) {
            if page.primary_pdf.as_deref() != Some(url.as_str())
                && !page.other_pdfs.contains(&url)
            {
                page.other_pdfs.push(url);
            }
        }
    }

    page
}

/// Fetches each discovered link, classifies it, and turns it into exactly
/// one extraction row. Failures never escape a single item.
pub struct ContentExtractor {
    client: HttpClient,
    documents_dir: PathBuf,
}

impl ContentExtractor {
    pub fn new(client: HttpClient, documents_dir: PathBuf) -> Self {
        Self {
            client,
            documents_dir,
        }
    }

    /// Process one URL to completion. Every error becomes an error row so
    /// one bad item cannot take down the run.
    pub async fn process(
        &self,
        url: &str,
        renderer: Option<&mut (dyn PageRenderer + '_)>,
    ) -> ExtractionRecord {
        match self.try_process(url, renderer).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Extraction failed for {}: {}", url, e);
                ExtractionRecord::failed(url, ContentKind::Unknown, e.to_string())
            }
        }
    }

    async fn try_process(
        &self,
        url: &str,
        renderer: Option<&mut (dyn PageRenderer + '_)>,
    ) -> Result<ExtractionRecord, HarvestError> {
        let response = self.client.get(url).await?;
        let status = response.status.as_u16();
        if !response.is_success() {
            return Ok(ExtractionRecord::failed(
                url,
                ContentKind::Unknown,
                format!("http status {}", status),
            ));
        }

        let content_type = response.content_type().map(str::to_string);
        let body = response.bytes().await?;

        match classify(content_type.as_deref(), &body) {
            ContentKind::Pdf => {
                let path = storage::save_document(&self.documents_dir, url, &body, "pdf")?;
                debug!("Saved PDF for {} at {}", url, path.display());
                Ok(ExtractionRecord::ok(
                    url,
                    ContentKind::Pdf,
                    path.display().to_string(),
                ))
            }
            ContentKind::Html => {
                let text = String::from_utf8_lossy(&body);
                if super::looks_blocked(&text) {
                    return Ok(ExtractionRecord::failed(
                        url,
                        ContentKind::Html,
                        "block page returned with success status",
                    ));
                }

                let mut page = parse_detail(&text, url);
                if page.is_empty() {
                    if let Some(renderer) = renderer {
                        debug!("Static fetch was empty, rendering {}", url);
                        // The render is its own fetch and pays the same
                        // pacing toll as the HTTP request before it.
                        let rendered =
                            crate::pipeline::render_paced(renderer, self.client.gate(), url)
                                .await?;
                        page = parse_detail(&rendered.html, &rendered.final_url);
                    }
                }

                if let Some(pdf_url) = page.primary_pdf.clone() {
                    match self.fetch_linked_pdf(url, &pdf_url).await {
                        Ok(Some(record)) => return Ok(record),
                        Ok(None) => {}
                        Err(e) => debug!("Linked PDF fetch failed for {}: {}", pdf_url, e),
                    }
                }

                let payload = page.payload();
                if payload.is_empty() {
                    Ok(ExtractionRecord::failed(
                        url,
                        ContentKind::Html,
                        "page yielded no extractable text",
                    ))
                } else {
                    Ok(ExtractionRecord::ok(url, ContentKind::Html, payload))
                }
            }
            ContentKind::Unknown => Ok(ExtractionRecord::failed(
                url,
                ContentKind::Unknown,
                HarvestError::UnrecognizedContentType(
                    content_type.unwrap_or_else(|| "none".to_string()),
                )
                .to_string(),
            )),
        }
    }

    /// Follow a detail page's download link. Returns a PDF row keyed by the
    /// detail URL when the linked payload really is a PDF.
    async fn fetch_linked_pdf(
        &self,
        detail_url: &str,
        pdf_url: &str,
    ) -> Result<Option<ExtractionRecord>, HarvestError> {
        let response = self.client.get(pdf_url).await?;
        if !response.is_success() {
            return Ok(None);
        }
        let content_type = response.content_type().map(str::to_string);
        let body = response.bytes().await?;
        if classify(content_type.as_deref(), &body) != ContentKind::Pdf {
            return Ok(None);
        }
        let path = storage::save_document(&self.documents_dir, detail_url, &body, "pdf")?;
        Ok(Some(ExtractionRecord::ok(
            detail_url,
            ContentKind::Pdf,
            path.display().to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::scrapers::politeness::PolitenessConfig;
    use crate::scrapers::{PolitenessGate, RenderedPage};

    fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn canned(status_line: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            content_type,
            body.len(),
            body
        )
    }

    fn extractor_with_delay(docs_dir: std::path::PathBuf, delay: Duration) -> ContentExtractor {
        let gate = PolitenessGate::new(PolitenessConfig {
            base_delay: delay,
            min_delay: Duration::from_millis(1),
            max_delay: delay * 4,
            ..Default::default()
        });
        let client = HttpClient::new(gate, Duration::from_secs(5), None);
        ContentExtractor::new(client, docs_dir)
    }

    struct FakeRenderer {
        html: String,
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn render(&mut self, url: &str) -> Result<RenderedPage, HarvestError> {
            Ok(RenderedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                html: self.html.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_process_persists_pdf_payload() {
        // A detail URL answering with a PDF body yields one ok row whose
        // payload points at the stored file.
        let base = serve(vec![canned("200 OK", "application/pdf", "%PDF-1.4 test")]);
        let dir = tempdir().unwrap();
        let extractor = extractor_with_delay(dir.path().join("documents"), Duration::from_millis(1));

        let url = format!("{}/16-629.pdf", base);
        let record = extractor.process(&url, None).await;

        assert_eq!(record.status, ExtractionStatus::Ok);
        assert_eq!(record.content_type, ContentKind::Pdf);
        assert!(record.error_detail.is_empty());
        let saved = std::fs::read(&record.payload_ref).unwrap();
        assert_eq!(saved, b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn test_render_fallback_waits_for_the_gate() {
        // An empty static body triggers the browser fallback; that second
        // fetch must pay the same per-domain delay as the first.
        let base = serve(vec![canned(
            "200 OK",
            "text/html",
            "<html><body></body></html>",
        )]);
        let dir = tempdir().unwrap();
        let extractor =
            extractor_with_delay(dir.path().join("documents"), Duration::from_millis(300));
        let mut renderer = FakeRenderer {
            html: r#"<html><body>
                <h1 class="featured-content__headline stars-above">Agreement 16-629</h1>
                <p>Signed at Buenos Aires.</p>
            </body></html>"#
                .to_string(),
        };

        let url = format!("{}/16-629/", base);
        let started = Instant::now();
        let record = extractor.process(&url, Some(&mut renderer)).await;

        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(record.status, ExtractionStatus::Ok);
        assert_eq!(record.content_type, ContentKind::Html);
        assert!(record.payload_ref.contains("Buenos Aires"));
    }

    #[tokio::test]
    async fn test_unknown_payload_becomes_error_row() {
        let base = serve(vec![canned("200 OK", "application/zip", "PKx")]);
        let dir = tempdir().unwrap();
        let extractor = extractor_with_delay(dir.path().join("documents"), Duration::from_millis(1));

        let record = extractor.process(&format!("{}/blob", base), None).await;

        assert_eq!(record.status, ExtractionStatus::Error);
        assert_eq!(record.content_type, ContentKind::Unknown);
        assert!(!record.error_detail.is_empty());
    }

    #[test]
    fn test_classify_pdf_by_header() {
        assert_eq!(
            classify(Some("application/pdf"), b"%PDF-1.7 junk"),
            ContentKind::Pdf
        );
        assert_eq!(
            classify(Some("application/pdf; qs=0.001"), b""),
            ContentKind::Pdf
        );
    }

    #[test]
    fn test_classify_pdf_by_signature() {
        assert_eq!(
            classify(Some("application/octet-stream"), b"%PDF-1.4\n..."),
            ContentKind::Pdf
        );
        assert_eq!(classify(None, b"%PDF-1.4\n..."), ContentKind::Pdf);
    }

    #[test]
    fn test_classify_html() {
        assert_eq!(
            classify(Some("text/html; charset=utf-8"), b"<html></html>"),
            ContentKind::Html
        );
        assert_eq!(classify(None, b"  <!DOCTYPE html><html>"), ContentKind::Html);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify(None, b"\x00\x01\x02binary"), ContentKind::Unknown);
        assert_eq!(
            classify(Some("application/zip"), b"PKx"),
            ContentKind::Unknown
        );
    }

    #[test]
    fn test_parse_detail_page() {
        let html = r#"
            <html><body>
            <h1 class="featured-content__headline stars-above">
                Agreement with Argentina 16-629
            </h1>
            <p>Signed at Buenos Aires.</p>
            <p>Entered into force June 29, 2016.</p>
            <a class="button--download" href="/wp-content/uploads/16-629.pdf">Download</a>
            <a href="/wp-content/uploads/16-629-annex.pdf">Annex</a>
            </body></html>
        "#;
        let page = parse_detail(html, "https://www.state.gov/16-629/");
        assert_eq!(page.title, "Agreement with Argentina 16-629");
        assert_eq!(page.paragraphs.len(), 2);
        assert_eq!(page.agreement_codes, vec!["16-629".to_string()]);
        assert_eq!(
            page.primary_pdf.as_deref(),
            Some("https://www.state.gov/wp-content/uploads/16-629.pdf")
        );
        assert_eq!(page.other_pdfs.len(), 1);
        assert!(!page.is_empty());
        assert!(page.payload().contains("Buenos Aires"));
    }

    #[test]
    fn test_parse_detail_empty_page() {
        let page = parse_detail("<html><body></body></html>", "https://www.state.gov/x/");
        assert!(page.is_empty());
        assert!(page.payload().is_empty());
    }

    #[test]
    fn test_failed_record_always_has_detail() {
        let record = ExtractionRecord::failed("https://example.com", ContentKind::Html, "");
        assert_eq!(record.status, ExtractionStatus::Error);
        assert!(!record.error_detail.is_empty());
        assert!(record.payload_ref.is_empty());
    }

    #[test]
    fn test_ok_record_shape() {
        let record = ExtractionRecord::ok(
            "https://www.state.gov/16-629/",
            ContentKind::Pdf,
            "documents/ab/abcd.pdf".to_string(),
        );
        assert_eq!(record.status, ExtractionStatus::Ok);
        assert_eq!(record.content_type, ContentKind::Pdf);
        assert!(record.error_detail.is_empty());
        assert!(!record.payload_ref.is_empty());
    }
}
