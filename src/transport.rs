//! Transport adapter
//!
//! Thin surface over the shared HTTP client: a HEAD probe for the payload
//! length and ranged GETs for the chunk fetchers. Cancellation of in-flight
//! calls is handled by the callers' cancellation token; dropping the
//! response future aborts the underlying request.

use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};

/// Result of the length probe
#[derive(Debug, Clone)]
pub struct HeadProbe {
    pub status: u16,
    /// Payload length, when the origin reported one
    pub total_bytes: Option<u64>,
    /// Whether `Accept-Ranges: bytes` was advertised
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
}

/// Shared HTTP transport for all sessions of one engine
pub struct Transport {
    client: Client,
    user_agent: String,
}

impl Transport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    /// Probe the origin for the payload length.
    ///
    /// 405 and 501 mean the origin does not implement HEAD; that is an
    /// "unknown length" answer, not an error. Connect failures are network
    /// errors.
    pub async fn head(&self, url: &str, headers: &HashMap<String, String>) -> Result<HeadProbe> {
        let mut request = self.client.head(url).header("User-Agent", &self.user_agent);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            return Ok(HeadProbe {
                status: status.as_u16(),
                total_bytes: None,
                accepts_ranges: false,
                content_type: None,
            });
        }

        let response_headers = response.headers();
        let total_bytes = if status.is_success() {
            response_headers
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        } else {
            None
        };

        let accepts_ranges = response_headers
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        let content_type = response_headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(HeadProbe {
            status: status.as_u16(),
            total_bytes,
            accepts_ranges,
            content_type,
        })
    }

    /// Open a GET, optionally ranged. The response is returned unread;
    /// status handling belongs to the caller.
    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<Response> {
        let mut request = self.client.get(url).header("User-Agent", &self.user_agent);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((start, end)) = range {
            request = request.header("Range", format_range(start, end));
        }

        Ok(request.send().await?)
    }
}

/// RFC 7233 byte-range header value
pub fn format_range(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

/// Parse a `Content-Range` header: "bytes start-end/total" or
/// "bytes start-end/*". Returns (start, end, total).
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    let total = if total.trim() == "*" {
        None
    } else {
        Some(total.trim().parse::<u64>().ok()?)
    };

    Some((start, end, total))
}

/// The media type before any parameters, lowercased and trimmed
pub fn primary_media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
