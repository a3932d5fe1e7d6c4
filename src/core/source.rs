//! Source handling for linkferry
//!
//! Turns user requests into transfer sources and derives safe local
//! filenames from response headers or URLs.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use crate::core::error::{Error, Result};

/// Longest filename (in characters) we ever write to disk
pub const MAX_FILENAME_CHARS: usize = 240;

static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(https?://\S+)").expect("valid url regex"));

static ILLEGAL_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/*?:"<>|]+"#).expect("valid filename regex"));

/// Where the bytes of a job come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Direct link or a landing page hiding one
    Url(String),
    /// Opaque reference to a file hosted by the chat service
    Attachment(String),
}

impl Source {
    /// Build a URL source from a request text, using its first link.
    pub fn from_text(text: &str) -> Result<Self> {
        extract_urls(text)
            .into_iter()
            .next()
            .map(Source::Url)
            .ok_or_else(|| {
                Error::InvalidInput(
                    "No URL found. Send a direct link or upload a file.".to_string(),
                )
            })
    }

    /// Human readable description used in logs and queue listings
    pub fn describe(&self) -> &str {
        match self {
            Source::Url(url) => url,
            Source::Attachment(_) => "chat attachment",
        }
    }
}

/// All `http(s)://` links appearing in a free-form text, in order
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_IN_TEXT
        .find_iter(text.trim())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Make an arbitrary (possibly percent-encoded) name safe to use as a filename.
///
/// Newlines become spaces, runs of characters that are illegal on common
/// filesystems become `_`, and the result is capped at
/// [`MAX_FILENAME_CHARS`] characters.
pub fn sanitize_filename(name: &str) -> String {
    let decoded = percent_decode_str(name).decode_utf8_lossy();
    let flattened = decoded.trim().replace(['\n', '\r'], " ");
    let cleaned = ILLEGAL_FILENAME_CHARS.replace_all(&flattened, "_");
    let truncated: String = cleaned.chars().take(MAX_FILENAME_CHARS).collect();

    match truncated.trim() {
        "" | "." | ".." => "file".to_string(),
        name => name.to_string(),
    }
}

/// Extract the filename announced by a `Content-Disposition` header.
///
/// The RFC 5987 extended form (`filename*=UTF-8''na%C3%AFve.txt`) wins over the
/// plain `filename=` parameter when both are present.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in split_parameters(header) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');

        match key.as_str() {
            "filename*" => {
                // charset'language'value, we only care about the value
                let encoded = value.rsplit('\'').next().unwrap_or(value);
                extended = Some(encoded.to_string());
            }
            "filename" => plain = Some(value.to_string()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .filter(|v| !v.is_empty())
        .map(|v| sanitize_filename(&v))
}

/// Split a header value on `;`, leaving quoted strings intact
fn split_parameters(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(header[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(header[start..].trim());
    params
}

/// Basename of the URL path, or `file` when the path has none
pub fn filename_from_url(url: &str) -> String {
    let basename = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty());

    match basename {
        Some(name) => sanitize_filename(&name),
        None => "file".to_string(),
    }
}

/// Pick the destination filename the way a browser would: header first, URL second.
pub fn pick_filename(url: &str, content_disposition: Option<&str>) -> String {
    content_disposition
        .and_then(filename_from_content_disposition)
        .unwrap_or_else(|| filename_from_url(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_urls_from_message_text() {
        let urls = extract_urls("grab this https://example.com/a.zip and http://x.org/b please");
        assert_eq!(urls, vec!["https://example.com/a.zip", "http://x.org/b"]);
        assert!(extract_urls("nothing here").is_empty());
    }

    #[test]
    fn test_source_from_text_uses_first_url() {
        let source = Source::from_text("  https://one.example/f.mp4 https://two.example ").unwrap();
        assert_eq!(source, Source::Url("https://one.example/f.mp4".to_string()));
        assert!(matches!(Source::from_text("hello"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My%20Movie.mp4"), "My Movie.mp4");
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("what??.txt"), "what_.txt");
        assert_eq!(sanitize_filename("line\nbreak"), "line break");
        assert_eq!(sanitize_filename("   "), "file");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn test_sanitize_filename_truncates_by_characters() {
        let long = "é".repeat(300);
        let name = sanitize_filename(&long);
        assert_eq!(name.chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn test_content_disposition_plain_and_extended() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition(
                r#"attachment; filename="fallback.txt"; filename*=UTF-8''na%C3%AFve%20file.txt"#
            ),
            Some("naïve file.txt".to_string())
        );
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn test_content_disposition_semicolon_inside_quotes() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="a;b.mp4"; size=10"#),
            Some("a;b.mp4".to_string())
        );
        assert_eq!(
            split_parameters(r#"attachment; filename="x\";y.txt""#),
            vec!["attachment", r#"filename="x\";y.txt""#]
        );
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://cdn.example/videos/clip%201.mp4?x=1"), "clip 1.mp4");
        assert_eq!(filename_from_url("https://cdn.example/"), "file");
        assert_eq!(filename_from_url("not a url"), "file");
    }

    #[test]
    fn test_pick_filename_prefers_header() {
        assert_eq!(
            pick_filename("https://e.x/dl?id=3", Some("attachment; filename=movie.mkv")),
            "movie.mkv"
        );
        assert_eq!(pick_filename("https://e.x/files/song.mp3", None), "song.mp3");
    }
}
