use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_RANGE, RANGE};
use tracing::debug;

/// Pre-download probe
///
/// One round-trip before any payload bytes: discover the total size and
/// whether the server honors byte ranges. HEAD first; servers that
/// reject HEAD get a zero-range GET instead.
use crate::core::error::EngineError;

/// What the probe learned about the remote file
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
    /// Name the server suggests, already sanitized
    pub filename: Option<String>,
}

/// Probe `url` for size and range support
pub async fn probe(client: &reqwest::Client, url: &str) -> Result<ProbeResult, EngineError> {
    // 1. Try HEAD first
    let head = client.head(url).send().await;
    if let Ok(response) = head {
        if response.status().is_success() {
            return Ok(read_probe(&response, url));
        }
        debug!(status = %response.status(), "HEAD rejected, falling back to ranged GET");
    } else {
        debug!("HEAD failed, falling back to ranged GET");
    }

    // 2. Fallback: zero-range GET
    let response = client.get(url).header(RANGE, "bytes=0-0").send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::server(
            status.as_u16(),
            format!("probe rejected: {status}"),
        ));
    }

    // a 206 answer is itself proof of range support; total size comes
    // from Content-Range ("bytes 0-0/12345")
    if status == reqwest::StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok());
        return Ok(ProbeResult {
            total_bytes: total,
            accepts_ranges: true,
            filename: extract_filename(&response, url),
        });
    }

    Ok(read_probe(&response, url))
}

fn read_probe(response: &reqwest::Response, url: &str) -> ProbeResult {
    let accepts_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let total_bytes = response.content_length().filter(|len| *len > 0);

    ProbeResult {
        total_bytes,
        accepts_ranges,
        filename: extract_filename(response, url),
    }
}

/// Extracts a filename from Content-Disposition or the URL path
fn extract_filename(response: &reqwest::Response, url: &str) -> Option<String> {
    if let Some(disp) = response.headers().get(CONTENT_DISPOSITION) {
        if let Ok(disp_str) = disp.to_str() {
            if let Some(name_part) = disp_str.split("filename=").nth(1) {
                let name = name_part
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'');
                if !name.is_empty() {
                    return Some(sanitize_filename::sanitize(name));
                }
            }
        }
    }

    let parsed = url::Url::parse(url).ok()?;
    let last = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())?;
    let name = sanitize_filename::sanitize(last);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Hostname of a validated URL
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
