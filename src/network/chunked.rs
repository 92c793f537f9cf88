use rand::Rng;
use reqwest::header::RANGE;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, info, warn};

/// Chunk downloader
///
/// One worker per chunk: acquires a per-download slot, resumes from the
/// tail-hash checkpoint when it matches, issues a ranged GET, and
/// streams into the chunk part file. Retryable failures back off
/// exponentially with jitter until the attempt budget is spent; a 200
/// answer to a ranged request aborts the whole chunked plan so the
/// engine can fall back to simple mode.
use crate::core::breaker::CircuitBreaker;
use crate::core::concurrency::DownloadSlots;
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventBus};
use crate::core::integrity;
use crate::core::session::{SessionManager, SessionToken};
use crate::core::state::ChunkState;
use crate::core::store::StateStore;
use crate::core::types::{Chunk, PROGRESS_FLUSH_MS};
use crate::utils::filesystem;

/// Backoff: min(max, base * 2^attempts) + jitter
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;
const BACKOFF_JITTER_MS: u64 = 250;

/// A chunk counts as stalled when it moves fewer than this many bytes
/// over a stall window
const STALL_MIN_BYTES: u64 = 16 * 1024;
const STALL_WINDOW: Duration = Duration::from_secs(10);

/// How a chunk worker run ended, short of an error
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRun {
    /// Full range written and recorded
    Completed,
    /// Server ignored the Range header; caller must fall back to simple
    RangeIgnored,
}

/// Per-download context shared by all chunk workers
#[derive(Clone)]
pub struct ChunkContext {
    pub download_id: i64,
    pub url: String,
    pub save_path: PathBuf,
    pub idle_timeout: Duration,
    pub chunk_timeout: Duration,
    pub max_retries: u32,
}

/// Cloned Arc dependencies handed to each worker
#[derive(Clone)]
pub struct ChunkDeps {
    pub client: reqwest::Client,
    pub store: Arc<StateStore>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
    pub slots: Arc<DownloadSlots>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Aggregate confirmed bytes of the download, fed by every worker
    pub bytes_counter: Arc<AtomicU64>,
}

pub fn backoff_delay(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempts.min(16));
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    Duration::from_millis(exp.min(BACKOFF_MAX_MS) + jitter)
}

/// Drive one chunk to completion
pub async fn run_chunk(
    deps: &ChunkDeps,
    ctx: &ChunkContext,
    chunk: &Chunk,
    token: &SessionToken,
) -> Result<ChunkRun, EngineError> {
    let _permit = deps
        .slots
        .acquire()
        .await
        .map_err(|_| EngineError::Cancelled)?;
    if !deps.sessions.is_current(ctx.download_id, token) {
        return Err(EngineError::Cancelled);
    }

    let part_path = filesystem::chunk_part_path(&ctx.save_path, chunk.chunk_index);
    let mut written = resume_offset(&part_path, chunk)?;
    if written != chunk.written_bytes {
        deps.store
            .set_chunk_progress(ctx.download_id, chunk.chunk_index, written, None)?;
    }
    if written > 0 {
        // resumed bytes count toward the aggregate immediately
        deps.bytes_counter.fetch_add(written, Ordering::Relaxed);
    }
    deps.store
        .set_chunk_state(ctx.download_id, chunk.chunk_index, ChunkState::Downloading)?;

    loop {
        if !deps.sessions.is_current(ctx.download_id, token) {
            return Err(EngineError::Cancelled);
        }

        let attempt_result = match &deps.breaker {
            Some(b) => {
                b.execute(|| attempt(deps, ctx, chunk, token, &part_path, &mut written))
                    .await
            }
            None => attempt(deps, ctx, chunk, token, &part_path, &mut written).await,
        };

        match attempt_result {
            Ok(ChunkRun::RangeIgnored) => return Ok(ChunkRun::RangeIgnored),
            Ok(ChunkRun::Completed) => {
                let tail = integrity::tail_hash(&part_path)?;
                deps.store.set_chunk_progress(
                    ctx.download_id,
                    chunk.chunk_index,
                    written,
                    tail.as_deref(),
                )?;
                deps.store.set_chunk_state(
                    ctx.download_id,
                    chunk.chunk_index,
                    ChunkState::Completed,
                )?;
                deps.bus.emit(EngineEvent::ChunkCompleted {
                    id: ctx.download_id,
                    chunk_index: chunk.chunk_index,
                });
                info!(
                    download_id = ctx.download_id,
                    chunk = chunk.chunk_index,
                    bytes = written,
                    "Chunk complete"
                );
                return Ok(ChunkRun::Completed);
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                let attempts =
                    deps.store.bump_chunk_attempts(ctx.download_id, chunk.chunk_index)?;
                deps.store.record_attempt(
                    ctx.download_id,
                    Some(chunk.chunk_index),
                    attempts,
                    &err,
                    written,
                )?;

                let will_retry = err.is_retryable() && attempts <= ctx.max_retries;
                deps.bus.emit(EngineEvent::ChunkFailed {
                    id: ctx.download_id,
                    chunk_index: chunk.chunk_index,
                    error: err.to_string(),
                    will_retry,
                });
                if !will_retry {
                    warn!(
                        download_id = ctx.download_id,
                        chunk = chunk.chunk_index,
                        attempts,
                        error = %err,
                        "Chunk failed for good"
                    );
                    deps.store.set_chunk_state(
                        ctx.download_id,
                        chunk.chunk_index,
                        ChunkState::Failed,
                    )?;
                    return Err(err);
                }

                let delay = backoff_delay(attempts);
                debug!(
                    download_id = ctx.download_id,
                    chunk = chunk.chunk_index,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Chunk retry scheduled"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Work out where the part file lets us resume
///
/// A valid checkpoint resumes at the recorded byte count (the file is
/// truncated to it first, discarding any torn tail). Everything else
/// restarts the chunk from zero.
fn resume_offset(part_path: &std::path::Path, chunk: &Chunk) -> Result<u64, EngineError> {
    let on_disk = std::fs::metadata(part_path).map(|m| m.len()).unwrap_or(0);
    if on_disk == 0 {
        return Ok(0);
    }
    let recorded = chunk.written_bytes.min(chunk.range_len());
    if recorded > 0
        && integrity::checkpoint_matches(part_path, recorded, chunk.tail_hash.as_deref())?
    {
        if on_disk > recorded {
            let file = std::fs::OpenOptions::new().write(true).open(part_path)?;
            file.set_len(recorded)?;
        }
        debug!(path = ?part_path, resume_from = recorded, "Checkpoint matched, resuming chunk");
        Ok(recorded)
    } else {
        warn!(path = ?part_path, "Checkpoint mismatch, restarting chunk from zero");
        let file = std::fs::OpenOptions::new().write(true).open(part_path)?;
        file.set_len(0)?;
        Ok(0)
    }
}

/// One network attempt over the remaining range
async fn attempt(
    deps: &ChunkDeps,
    ctx: &ChunkContext,
    chunk: &Chunk,
    token: &SessionToken,
    part_path: &std::path::Path,
    written: &mut u64,
) -> Result<ChunkRun, EngineError> {
    let deadline = tokio::time::sleep(ctx.chunk_timeout);
    tokio::pin!(deadline);

    let run = stream_range(deps, ctx, chunk, token, part_path, written);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = &mut deadline => Err(EngineError::Network(format!(
            "chunk timed out after {}s",
            ctx.chunk_timeout.as_secs()
        ))),
    }
}

async fn stream_range(
    deps: &ChunkDeps,
    ctx: &ChunkContext,
    chunk: &Chunk,
    token: &SessionToken,
    part_path: &std::path::Path,
    written: &mut u64,
) -> Result<ChunkRun, EngineError> {
    use futures_util::StreamExt;

    // a previous attempt may have died with unflushed buffer contents;
    // only bytes on disk count
    let on_disk = tokio::fs::metadata(part_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if *written > on_disk {
        deps.bytes_counter
            .fetch_sub(*written - on_disk, Ordering::Relaxed);
        *written = on_disk;
    }

    let range_len = chunk.range_len();
    let from = chunk.start_byte + *written;
    let response = deps
        .client
        .get(&ctx.url)
        .header(RANGE, format!("bytes={from}-{}", chunk.end_byte))
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::OK {
        // server ignored the range; chunked mode is off the table
        warn!(download_id = ctx.download_id, "Server answered 200 to a ranged request");
        return Ok(ChunkRun::RangeIgnored);
    }
    if status != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(EngineError::server(
            status.as_u16(),
            format!("ranged GET {}", ctx.url),
        ));
    }
    if !deps.sessions.is_current(ctx.download_id, token) {
        return Err(EngineError::Cancelled);
    }

    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(part_path)
        .await?;
    let mut writer = BufWriter::with_capacity(128 * 1024, file);
    writer.seek(SeekFrom::Start(*written)).await?;

    let mut stream = response.bytes_stream();
    let mut last_flush = Instant::now();
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        let item = match tokio::time::timeout(ctx.idle_timeout, stream.next()).await {
            Ok(item) => item,
            Err(_) => {
                writer.flush().await?;
                return Err(EngineError::Network(format!(
                    "stalled: no bytes for {}s",
                    ctx.idle_timeout.as_secs()
                )));
            }
        };
        if !deps.sessions.is_current(ctx.download_id, token) {
            writer.flush().await?;
            return Err(EngineError::Cancelled);
        }
        let Some(item) = item else {
            break;
        };
        let bytes = item.map_err(|e| EngineError::Network(e.to_string()))?;
        if *written + bytes.len() as u64 > range_len {
            writer.flush().await?;
            return Err(EngineError::Integrity(format!(
                "server sent more than the requested range ({} > {range_len})",
                *written + bytes.len() as u64
            )));
        }
        writer.write_all(&bytes).await?;
        *written += bytes.len() as u64;
        window_bytes += bytes.len() as u64;
        deps.bytes_counter
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if window_start.elapsed() >= STALL_WINDOW {
            if window_bytes < STALL_MIN_BYTES {
                deps.slots.note_stall();
            }
            window_start = Instant::now();
            window_bytes = 0;
        }

        if last_flush.elapsed() >= Duration::from_millis(PROGRESS_FLUSH_MS) {
            writer.flush().await?;
            deps.store.set_chunk_progress(
                ctx.download_id,
                chunk.chunk_index,
                *written,
                None,
            )?;
            last_flush = Instant::now();
        }
    }

    writer.flush().await?;
    if *written == range_len {
        Ok(ChunkRun::Completed)
    } else {
        Err(EngineError::Network(format!(
            "short range body: {written} of {range_len} bytes"
        )))
    }
}
