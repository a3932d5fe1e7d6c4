//! Utilities related to parsing responses to partial requests.

use reqwest::header;
use reqwest::StatusCode;

use crate::core::error::{Error, Result};

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server answers `/*`
    pub total: Option<u64>,
}

/// How the server answered a (possibly ranged) GET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeReply {
    /// Complete representation, starting at byte 0
    Full,
    /// Partial content starting at the given range
    Partial(ContentRange),
}

/// Parses the value of a `Content-Range` header.
pub fn parse_content_range(value: &str) -> Result<ContentRange> {
    let invalid = |reason: &str| {
        Error::InvalidResponse(format!("Content-Range {value:?}: {reason}"))
    };

    let (unit, spec) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| invalid("missing unit"))?;
    if unit != "bytes" {
        return Err(invalid("unknown unit"));
    }

    let (range, total) = spec.split_once('/').ok_or_else(|| invalid("missing total"))?;
    let (start, end) = range.split_once('-').ok_or_else(|| invalid("invalid range"))?;

    let start = start.trim().parse().map_err(|_| invalid("failed to parse start"))?;
    let end = end.trim().parse().map_err(|_| invalid("failed to parse end"))?;
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().map_err(|_| invalid("failed to parse total"))?),
    };

    if end < start {
        return Err(invalid("range end before start"));
    }
    Ok(ContentRange { start, end, total })
}

/// Total size announced by a `416 Range Not Satisfiable` answer (`bytes */total`)
pub fn unsatisfied_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .trim()
        .strip_prefix("bytes */")?
        .parse()
        .ok()
}

/// Classifies a successful response to a request that may carry a `Range`.
///
/// A server could return a different range than the one we asked for, or
/// ignore the header and answer 200 OK, in which case the whole resource
/// comes again.
pub fn classify_response(response: &reqwest::Response) -> Result<RangeReply> {
    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            // We only request a single open-ended range, so multipart/byteranges
            // cannot happen.
            let value = response
                .headers()
                .get(header::CONTENT_RANGE)
                .ok_or_else(|| {
                    Error::InvalidResponse(
                        "Partial Content without a Content-Range header".to_string(),
                    )
                })?
                .to_str()
                .map_err(|_| Error::InvalidResponse("Content-Range is not valid utf-8".to_string()))?;
            Ok(RangeReply::Partial(parse_content_range(value)?))
        }
        // any other 2xx is treated as a complete response
        status if status.is_success() => Ok(RangeReply::Full),
        status => Err(Error::HttpError(format!(
            "Received unexpected status code: {status}"
        ))),
    }
}
