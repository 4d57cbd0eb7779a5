use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::store::ChunkStore;
use crate::types::DownloadId;

/// Counts carried in a mux request; `Hls` for master-mode runs, `Media` for
/// a single fragment stream (media-mode and live recordings).
pub enum MuxCounts {
    Hls { video_len: usize, audio_len: usize },
    Media { fragment_count: usize },
}

pub struct MuxRequest {
    pub download_id: DownloadId,
    pub filename: String,
    pub counts: MuxCounts,
}

pub struct MuxSuccess {
    pub blob_ref: PathBuf,
    pub warning: Option<String>,
}

/// Request/response channel to an out-of-process muxer, correlated by
/// `downloadId`. The core never depends on how the other end is
/// implemented.
#[async_trait]
pub trait MuxBridge: Send + Sync {
    async fn run(
        &self,
        request: MuxRequest,
        chunk_store: &ChunkStore,
        timeout: Duration,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<MuxSuccess, DownloadError>;
}

/// Invokes `ffmpeg` as the out-of-process muxer, reassembling chunks from
/// the chunk store into a concat list and parsing `-progress pipe:1` for
/// progress events.
pub struct FfmpegMuxBridge {
    ffmpeg_path: String,
    work_dir: PathBuf,
}

impl FfmpegMuxBridge {
    pub fn new(ffmpeg_path: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            work_dir: work_dir.into(),
        }
    }

    fn total_count(counts: &MuxCounts) -> usize {
        match counts {
            MuxCounts::Hls { video_len, audio_len } => video_len + audio_len,
            MuxCounts::Media { fragment_count } => *fragment_count,
        }
    }

    async fn materialize_chunks(
        &self,
        chunk_store: &ChunkStore,
        download_id: &DownloadId,
        expected: usize,
    ) -> Result<(PathBuf, usize), DownloadError> {
        let staging_dir = self.work_dir.join(download_id.as_str());
        tokio::fs::create_dir_all(&staging_dir).await?;

        let stored = chunk_store.count(download_id.as_str())?;
        let chunks = chunk_store.get_range(download_id.as_str(), 0, expected.max(stored))?;

        let list_path = staging_dir.join("concat.txt");
        let mut list_contents = String::new();
        for (index, bytes) in &chunks {
            let segment_path = staging_dir.join(format!("seg-{index:08}.bin"));
            tokio::fs::write(&segment_path, bytes).await?;
            list_contents.push_str(&format!("file '{}'\n", segment_path.display()));
        }
        tokio::fs::write(&list_path, list_contents).await?;
        Ok((list_path, chunks.len()))
    }
}

#[async_trait]
impl MuxBridge for FfmpegMuxBridge {
    async fn run(
        &self,
        request: MuxRequest,
        chunk_store: &ChunkStore,
        timeout: Duration,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<MuxSuccess, DownloadError> {
        let expected = Self::total_count(&request.counts);
        let (list_path, stored_count) = self
            .materialize_chunks(chunk_store, &request.download_id, expected)
            .await?;
        if stored_count < expected {
            warn!(
                download_id = %request.download_id,
                stored_count,
                expected,
                "mux proceeding with fewer chunks than expected (partial)"
            );
        }

        let output_path = self.work_dir.join(&request.filename);
        let mut child = Command::new(&self.ffmpeg_path)
            .args([
                "-y",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
            ])
            .arg(&list_path)
            .args(["-c", "copy", "-progress", "pipe:1", "-nostats"])
            .arg(&output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| DownloadError::MuxError(err.to_string()))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let run_to_completion = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(ratio) = parse_progress_ratio(&line) {
                    on_progress(ratio, "muxing");
                }
                if line.starts_with("progress=end") {
                    break;
                }
            }
            child.wait().await
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DownloadError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                return Err(DownloadError::MuxTimeout(timeout));
            }
            status = run_to_completion => status,
        };

        let status = status.map_err(|err| DownloadError::MuxError(err.to_string()))?;
        if !status.success() {
            return Err(DownloadError::MuxError(format!(
                "ffmpeg exited with status {status}"
            )));
        }

        let warning = if stored_count < expected {
            Some(format!(
                "muxed {stored_count} of {expected} expected fragments (partial)"
            ))
        } else {
            None
        };

        debug!(download_id = %request.download_id, ?output_path, "mux completed");
        Ok(MuxSuccess {
            blob_ref: output_path,
            warning,
        })
    }
}

fn parse_progress_ratio(line: &str) -> Option<f64> {
    // ffmpeg's -progress stream reports `out_time_ms=<us>`; without the
    // source duration we cannot compute a true ratio here, so callers that
    // need a bounded ratio should estimate it from wall-clock elapsed vs.
    // an expected duration. We surface 0.0 on any progress line to signal
    // liveness to the notification hook.
    if line.starts_with("out_time_ms=") {
        Some(0.0)
    } else {
        None
    }
}
