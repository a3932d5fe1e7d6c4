//! Landing-page resolution
//!
//! Many file hosts answer a download link with an HTML page that redirects,
//! or offers a button, instead of the file itself. The [`Resolver`] follows
//! such pages for a bounded number of hops until the server hands out
//! something that is not HTML.
//!
//! Link extraction is an ordered list of [`LinkMatcher`] strategies. The first
//! one that produces a candidate wins.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, REFERER};
use reqwest::{Client, Response};
use std::time::Duration;
use url::Url;

use crate::core::config::TransferConfig;
use crate::core::error::{Error, Result};
use crate::core::source::{filename_from_content_disposition, filename_from_url};
use crate::core::stream::send_with_timeout;

/// A direct, streamable resource plus what we learned about it on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub url: String,
    pub name_hint: Option<String>,
    pub mime_hint: Option<String>,
    /// Size announced by the server, 0 when unknown
    pub declared_total: u64,
    /// Landing pages traversed to get here
    pub hops: usize,
}

impl ResolvedTarget {
    /// A target that needs no resolution (e.g. a chat attachment URL)
    pub fn direct(url: impl Into<String>, name_hint: Option<String>) -> Self {
        Self {
            url: url.into(),
            name_hint,
            mime_hint: None,
            declared_total: 0,
            hops: 0,
        }
    }

    /// Filename to use locally: the announced one, else the URL basename
    pub fn file_name(&self) -> String {
        self.name_hint
            .clone()
            .unwrap_or_else(|| filename_from_url(&self.url))
    }
}

/// An HTML document fetched while resolving
pub struct LandingPage<'a> {
    /// Final URL of the response carrying the document, after redirects
    pub base: &'a Url,
    pub html: &'a str,
}

/// One heuristic for locating the next URL inside a landing page
pub trait LinkMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn find(&self, page: &LandingPage<'_>) -> Option<Url>;
}

static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<meta[^>]*?(?:http-equiv\s*=\s*["']?refresh["']?[^>]*?content\s*=\s*["']([^"']+)["']|content\s*=\s*["']([^"']+)["'][^>]*?http-equiv\s*=\s*["']?refresh["']?)[^>]*?>"#,
    )
    .expect("valid meta refresh regex")
});

static REFRESH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)url\s*=\s*([^;,\s]+)").expect("valid refresh url regex"));

static SCRIPT_REDIRECTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)window\.location(?:\.href)?\s*=\s*['"]([^'"]+)['"]"#,
        r#"(?i)(?:document\.)?location\.href\s*=\s*['"]([^'"]+)['"]"#,
        r#"(?i)location\.(?:replace|assign)\(\s*['"]([^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid script redirect regex"))
    .collect()
});

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*['"]?(https?://[^)'"\s]+)['"]?\s*\)"#).expect("valid css url regex")
});

static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
        .expect("valid anchor regex")
});

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static FILE_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(mp4|mkv|webm|mov|avi|mp3|flac|wav|m4a|zip|rar|7z|tar|gz|pdf|epub|apk|iso|srt|ass)(\?|#|$)")
        .expect("valid extension regex")
});

static ABSOLUTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s"'<>]+"#).expect("valid absolute url regex"));

static ASSET_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(blogger|themes)\.googleusercontent\.com").expect("valid asset host regex")
});

/// Visible anchor texts that mean "this is the file"
const DOWNLOAD_WORDS: [&str; 4] = ["download", "click here", "continue", "get file"];

/// Substrings of URLs that usually point straight at a file
const DIRECT_MARKERS: [&str; 8] = [
    "googlevideo.com",
    "export=download",
    "/download",
    "/get",
    "/api/dl",
    "/file/",
    "/dl?",
    "/d/",
];

/// Undo the escaping markup and scripts apply to URLs
fn unescape_url(raw: &str) -> String {
    raw.trim()
        .replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("\\u0026", "&")
        .replace("\\/", "/")
}

/// Turn a raw extracted value into an absolute http(s) URL.
///
/// Trailing punctuation that leaks from the surrounding markup (`)`, `]`,
/// `>`, `;`, `,`, `.`) is trimmed before resolving against `base`.
pub fn normalize_candidate(base: &Url, raw: &str) -> Option<Url> {
    let unescaped = unescape_url(raw);
    let cleaned = unescaped
        .trim()
        .trim_end_matches([')', ']', '>', ';', ',', '.']);

    if cleaned.is_empty() || cleaned.starts_with('#') {
        return None;
    }
    let lowered = cleaned.to_ascii_lowercase();
    if lowered.starts_with("javascript:") || lowered.starts_with("data:") || lowered.starts_with("blob:") {
        return None;
    }

    let url = base.join(cleaned).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// `<meta http-equiv="refresh" content="0; url=...">`, attributes in any order
pub struct MetaRefresh;

impl LinkMatcher for MetaRefresh {
    fn name(&self) -> &'static str {
        "meta-refresh"
    }

    fn find(&self, page: &LandingPage<'_>) -> Option<Url> {
        let caps = META_REFRESH.captures(page.html)?;
        let content = caps.get(1).or_else(|| caps.get(2))?.as_str();
        let target = REFRESH_URL.captures(content)?.get(1)?.as_str();
        normalize_candidate(page.base, target)
    }
}

/// `window.location = ...`, `location.href = ...`, `location.replace(...)`
pub struct ScriptRedirect;

impl LinkMatcher for ScriptRedirect {
    fn name(&self) -> &'static str {
        "script-redirect"
    }

    fn find(&self, page: &LandingPage<'_>) -> Option<Url> {
        SCRIPT_REDIRECTS.iter().find_map(|re| {
            let target = re.captures(page.html)?.get(1)?.as_str();
            normalize_candidate(page.base, target)
        })
    }
}

/// Absolute `url(...)` references in inline CSS or scripts
pub struct CssUrl;

impl LinkMatcher for CssUrl {
    fn name(&self) -> &'static str {
        "css-url"
    }

    fn find(&self, page: &LandingPage<'_>) -> Option<Url> {
        CSS_URL.captures_iter(page.html).find_map(|caps| {
            normalize_candidate(page.base, caps.get(1)?.as_str())
        })
    }
}

/// Anchors whose text reads like a download button or whose target is a file
pub struct DownloadAnchor;

impl LinkMatcher for DownloadAnchor {
    fn name(&self) -> &'static str {
        "download-anchor"
    }

    fn find(&self, page: &LandingPage<'_>) -> Option<Url> {
        ANCHOR.captures_iter(page.html).find_map(|caps| {
            let href = caps.get(1)?.as_str();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let text = TAG.replace_all(inner, " ");
            let text = WHITESPACE.replace_all(text.trim(), " ").to_lowercase();

            let looks_like_button = DOWNLOAD_WORDS.iter().any(|w| text.contains(w));
            let looks_like_file = FILE_EXTENSION.is_match(&unescape_url(href));
            if looks_like_button || looks_like_file {
                normalize_candidate(page.base, href)
            } else {
                None
            }
        })
    }
}

/// Any absolute URL carrying a well-known "direct file" marker
pub struct DirectMarker;

impl LinkMatcher for DirectMarker {
    fn name(&self) -> &'static str {
        "direct-marker"
    }

    fn find(&self, page: &LandingPage<'_>) -> Option<Url> {
        let unescaped = page.html.replace("\\/", "/");
        ABSOLUTE_URL.find_iter(&unescaped).find_map(|m| {
            let url = normalize_candidate(page.base, m.as_str())?;
            let text = url.as_str();
            if ASSET_HOST.is_match(text) {
                return None;
            }
            DIRECT_MARKERS
                .iter()
                .any(|marker| text.contains(marker))
                .then_some(url)
        })
    }
}

/// The matcher battery in priority order
pub fn default_matchers() -> Vec<Box<dyn LinkMatcher>> {
    vec![
        Box::new(MetaRefresh),
        Box::new(ScriptRedirect),
        Box::new(CssUrl),
        Box::new(DownloadAnchor),
        Box::new(DirectMarker),
    ]
}

/// Run `matchers` in order over a landing page and return the first hit
pub fn extract_direct_link(
    matchers: &[Box<dyn LinkMatcher>],
    base: &Url,
    html: &str,
) -> Option<Url> {
    let page = LandingPage { base, html };
    matchers.iter().find_map(|matcher| {
        let found = matcher.find(&page)?;
        log::debug!("🔎 {} matched {found}", matcher.name());
        Some(found)
    })
}

/// Transient bookkeeping while walking landing pages
#[derive(Debug)]
struct ResolutionState {
    current_url: Url,
    hops_taken: usize,
    hop_limit: usize,
    name_hint: Option<String>,
    mime_hint: Option<String>,
    declared_total: u64,
}

impl ResolutionState {
    /// Absorb the file-describing headers of a non-HTML response
    fn record_headers(&mut self, response: &Response) {
        let headers = response.headers();
        if self.mime_hint.is_none() {
            self.mime_hint = header_str(response, CONTENT_TYPE).map(str::to_string);
        }
        if let Some(len) = header_str(response, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok()) {
            if len > 0 {
                self.declared_total = len;
            }
        }
        if self.name_hint.is_none() {
            self.name_hint = headers
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(filename_from_content_disposition);
        }
    }

    fn follow(&mut self, next: Url) -> Result<()> {
        if next == self.current_url {
            return Err(Error::not_a_file(
                "This URL opens a web page that only links back to itself",
            ));
        }
        self.hops_taken += 1;
        if self.hops_taken > self.hop_limit {
            return Err(Error::not_a_file(format!(
                "Gave up after {} landing pages without reaching a file",
                self.hop_limit
            )));
        }
        log::debug!("↪️  Landing page hop {} -> {next}", self.hops_taken);
        self.current_url = next;
        Ok(())
    }

    fn finish(self) -> ResolvedTarget {
        ResolvedTarget {
            url: self.current_url.to_string(),
            name_hint: self.name_hint,
            mime_hint: self.mime_hint,
            declared_total: self.declared_total,
            hops: self.hops_taken,
        }
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn is_html(response: &Response) -> bool {
    header_str(response, CONTENT_TYPE)
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Resolves arbitrary URLs into direct, streamable resources
pub struct Resolver {
    client: Client,
    hop_limit: usize,
    read_timeout: Duration,
    matchers: Vec<Box<dyn LinkMatcher>>,
}

impl Resolver {
    pub fn new(client: Client, config: &TransferConfig) -> Self {
        Self {
            client,
            hop_limit: config.hop_limit,
            read_timeout: config.read_timeout(),
            matchers: default_matchers(),
        }
    }

    /// Replace the matcher battery
    pub fn with_matchers(mut self, matchers: Vec<Box<dyn LinkMatcher>>) -> Self {
        self.matchers = matchers;
        self
    }

    /// Follow landing pages from `url` until a non-HTML response is found.
    ///
    /// `referer` is sent on every request; hosts that gate downloads on it
    /// expect the page the user originally shared.
    pub async fn resolve(&self, url: &str) -> Result<ResolvedTarget> {
        let referer = url;
        let mut state = ResolutionState {
            current_url: Url::parse(url)?,
            hops_taken: 0,
            hop_limit: self.hop_limit,
            name_hint: None,
            mime_hint: None,
            declared_total: 0,
        };

        loop {
            self.inspect_head(&mut state, referer).await;

            let request = self
                .client
                .get(state.current_url.clone())
                .header(REFERER, referer);
            let response = send_with_timeout(request, self.read_timeout).await?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpError(format!(
                    "{} answered {status}",
                    state.current_url
                )));
            }

            if !is_html(&response) {
                // the body is the file itself; dropping the response closes it
                state.record_headers(&response);
                return Ok(state.finish());
            }

            let base = response.url().clone();
            let html = response.text().await?;
            match extract_direct_link(&self.matchers, &base, &html) {
                Some(next) => state.follow(next)?,
                None => {
                    return Err(Error::not_a_file(
                        "This URL opens a web page, not a direct file",
                    ))
                }
            }
        }
    }

    /// HEAD the current URL for size/type/name hints; failures are ignored
    async fn inspect_head(&self, state: &mut ResolutionState, referer: &str) {
        let request = self
            .client
            .head(state.current_url.clone())
            .header(REFERER, referer);
        match send_with_timeout(request, self.read_timeout).await {
            Ok(response) if response.status().is_success() && !is_html(&response) => {
                state.record_headers(&response);
            }
            Ok(_) => {}
            Err(e) => log::debug!("HEAD request to {} failed: {e}", state.current_url),
        }
    }
}
