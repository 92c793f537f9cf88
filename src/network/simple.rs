use futures_util::StreamExt;
use reqwest::header::RANGE;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, info, warn};

/// Simple downloader
///
/// One streamed GET into `<name>.part`, renamed over the final path on
/// clean completion. An existing part resumes through a Range header; a
/// server that answers 200 to the range gets the part truncated and the
/// body written from scratch. Every await is a suspension point: the
/// session token is rechecked before any further write.
use crate::core::breaker::CircuitBreaker;
use crate::core::error::EngineError;
use crate::core::session::{SessionManager, SessionToken};
use crate::utils::filesystem;

/// One simple transfer, as a value type
pub struct SimpleJob {
    pub download_id: i64,
    pub url: String,
    pub save_path: PathBuf,
    pub idle_timeout: std::time::Duration,
}

/// Run one transfer attempt; returns the final byte count on disk
///
/// The caller owns retry policy and attempt logging; a failed attempt
/// leaves the part file in place for the next one.
pub async fn run_simple<F>(
    client: &reqwest::Client,
    job: &SimpleJob,
    sessions: &SessionManager,
    token: &SessionToken,
    breaker: Option<&Arc<CircuitBreaker>>,
    progress: F,
) -> Result<u64, EngineError>
where
    F: Fn(u64) + Send + Sync,
{
    match breaker {
        Some(b) => {
            b.execute(|| transfer(client, job, sessions, token, &progress))
                .await
        }
        None => transfer(client, job, sessions, token, &progress).await,
    }
}

async fn transfer<F>(
    client: &reqwest::Client,
    job: &SimpleJob,
    sessions: &SessionManager,
    token: &SessionToken,
    progress: &F,
) -> Result<u64, EngineError>
where
    F: Fn(u64) + Send + Sync,
{
    let part_path = filesystem::simple_part_path(&job.save_path);
    let resume_from = tokio::fs::metadata(&part_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut request = client.get(&job.url);
    if resume_from > 0 {
        request = request.header(RANGE, format!("bytes={resume_from}-"));
        debug!(download_id = job.download_id, resume_from, "Resuming simple download");
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::server(
            status.as_u16(),
            format!("GET {}", job.url),
        ));
    }

    if !sessions.is_current(job.download_id, token) {
        return Err(EngineError::Cancelled);
    }

    // 206 appends at the resume offset; 200 means the server ignored the
    // range and is sending the whole body again
    let mut written = if resume_from > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT {
        resume_from
    } else {
        if resume_from > 0 {
            warn!(download_id = job.download_id, "Server ignored range, restarting part");
        }
        0
    };

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&part_path)
        .await?;
    file.set_len(written).await?;
    let mut writer = BufWriter::with_capacity(128 * 1024, file);
    writer.seek(SeekFrom::Start(written)).await?;

    let mut stream = response.bytes_stream();
    loop {
        let item = match tokio::time::timeout(job.idle_timeout, stream.next()).await {
            Ok(item) => item,
            Err(_) => {
                return Err(EngineError::Network(format!(
                    "stalled: no bytes for {}s",
                    job.idle_timeout.as_secs()
                )));
            }
        };
        if !sessions.is_current(job.download_id, token) {
            return Err(EngineError::Cancelled);
        }
        let Some(item) = item else {
            break; // clean EOF
        };
        let bytes = item.map_err(|e| EngineError::Network(e.to_string()))?;
        writer.write_all(&bytes).await?;
        written += bytes.len() as u64;
        progress(written);
    }

    writer.flush().await?;
    drop(writer);

    if !sessions.is_current(job.download_id, token) {
        return Err(EngineError::Cancelled);
    }

    filesystem::finalize(&part_path, &job.save_path)?;
    info!(download_id = job.download_id, bytes = written, "Simple download complete");
    Ok(written)
}
