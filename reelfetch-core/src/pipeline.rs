use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::cancel_if_cancelled;
use crate::crypto::FragmentCryptor;
use crate::drm::assert_downloadable;
use crate::error::DownloadError;
use crate::headers::HeaderRuleFacility;
use crate::filetransfer::FileTransferFacility;
use crate::live;
use crate::mux::{MuxBridge, MuxCounts, MuxRequest};
use crate::playlist::{self, PlaylistKind};
use crate::progress::ProgressTracker;
use crate::scheduler::{self, SchedulerContext};
use crate::store::{ChunkStore, StateStore};
use crate::types::{DownloadId, DownloadState, Fragment, Level, LevelKind, Progress, Stage};

/// Caller-provided variant choice for master playlists; `Auto` follows the
/// §4.G sort-by-bitrate-then-height policy.
pub enum QualitySelection {
    Auto,
    Explicit {
        video_uri: String,
        audio_uri: Option<String>,
    },
}

pub struct PipelineRequest {
    pub url: String,
    pub filename: String,
    pub download_id: DownloadId,
    pub page_url: Option<String>,
    pub quality: QualitySelection,
    pub max_concurrent: usize,
    pub retries_per_fragment: u32,
    pub mux_timeout: Duration,
    pub save_on_cancel: bool,
    pub record_live: bool,
}

pub struct PipelineOutcome {
    pub file_path: PathBuf,
}

/// Diffs between master/media/live runs the template-method split in the
/// source encodes via inheritance: variant-selection and indexing already
/// happened by the time this is built; it only carries what MERGING and
/// partial-save recount need.
#[derive(Clone)]
enum PlaylistStrategy {
    MasterHls { video_len: usize, audio_len: usize },
    MediaHls { fragment_count: usize },
    LiveHls { segment_index: usize },
}

impl PlaylistStrategy {
    fn mux_counts(&self) -> MuxCounts {
        match self {
            PlaylistStrategy::MasterHls { video_len, audio_len } => MuxCounts::Hls {
                video_len: *video_len,
                audio_len: *audio_len,
            },
            PlaylistStrategy::MediaHls { fragment_count } => MuxCounts::Media {
                fragment_count: *fragment_count,
            },
            PlaylistStrategy::LiveHls { segment_index } => MuxCounts::Media {
                fragment_count: *segment_index,
            },
        }
    }

    /// Recompute counts against a partial-save `count` of actually-stored
    /// chunks, per §4.G's cancellation path.
    fn recount_for_partial_save(&self, count: usize) -> PlaylistStrategy {
        match self {
            PlaylistStrategy::MasterHls { video_len, .. } => {
                let effective_video = count.min(*video_len);
                let effective_audio = count.saturating_sub(*video_len);
                PlaylistStrategy::MasterHls {
                    video_len: effective_video,
                    audio_len: effective_audio,
                }
            }
            PlaylistStrategy::MediaHls { .. } => PlaylistStrategy::MediaHls { fragment_count: count },
            PlaylistStrategy::LiveHls { .. } => PlaylistStrategy::LiveHls { segment_index: count },
        }
    }
}

/// Dependencies are injected, never ambient singletons (§9 design note).
pub struct Pipeline {
    pub chunk_store: Arc<ChunkStore>,
    pub state_store: Arc<StateStore>,
    pub header_rules: Arc<dyn HeaderRuleFacility>,
    pub mux_bridge: Arc<dyn MuxBridge>,
    pub file_transfer: Arc<dyn FileTransferFacility>,
    pub http_client: Client,
}

impl Pipeline {
    /// Top-level `run(url, filename, downloadId, cancel, pageUrl?)` of §4.G.
    pub async fn run(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, DownloadError> {
        let download_id = request.download_id.clone();
        let mut rule_ids = Vec::new();
        if let Some(page_url) = &request.page_url {
            rule_ids = self.header_rules.add(download_id.as_str(), &request.url, page_url);
        }

        let result = self.run_inner(&request, &cancel, &mut rule_ids).await;

        self.header_rules.remove(&rule_ids);
        if let Err(err) = self.chunk_store.delete_all(download_id.as_str()) {
            warn!(%download_id, %err, "failed to clean up chunk store after pipeline run");
        }

        result
    }

    async fn run_inner(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
        _rule_ids: &mut [i32],
    ) -> Result<PipelineOutcome, DownloadError> {
        let mut state = DownloadState::new(request.download_id.clone(), request.url.clone());
        state.stage = Stage::Detecting;
        self.state_store.upsert(&state)?;

        let notify_state = self.state_store.clone();
        let notify_state_stage = self.state_store.clone();
        let notify_id = request.download_id.clone();
        let persist_id = request.download_id.clone();
        let progress = Arc::new(ProgressTracker::new(
            move |_: &Progress| {
                let _ = notify_id;
            },
            move |snapshot: &Progress| {
                if let Ok(Some(mut current)) = notify_state.get(&persist_id) {
                    current.progress = snapshot.clone();
                    current.updated_at = Some(chrono::Utc::now());
                    let _ = notify_state.upsert(&current);
                }
            },
        ));
        let _ = notify_state_stage;

        let outcome = self
            .run_playlist_driven(request, cancel, &mut state, &progress)
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err((DownloadError::Cancelled, strategy)) if request.save_on_cancel => {
                self.attempt_partial_save(request, strategy, &mut state).await
            }
            Err((err, _)) => {
                state.stage = Stage::Failed;
                state.progress.error = Some(err.to_string());
                let _ = self.state_store.upsert(&state);
                Err(err)
            }
        }
    }

    /// Returns the strategy alongside any error so a cancellation can be
    /// retried as a partial save with the right recount policy (§4.G).
    async fn run_playlist_driven(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
        state: &mut DownloadState,
        progress: &Arc<ProgressTracker>,
    ) -> Result<PipelineOutcome, (DownloadError, Option<PlaylistStrategy>)> {
        let text = cancel_if_cancelled(fetch_text(&self.http_client, &request.url), cancel)
            .await
            .map_err(|err| (err, None))?;
        assert_downloadable(&text).map_err(|err| (err, None))?;

        if request.record_live {
            let outcome = live::run(
                &self.http_client,
                &request.url,
                &text,
                live::LiveContext {
                    download_id: request.download_id.clone(),
                    chunk_store: self.chunk_store.clone(),
                    cryptor: Arc::new(FragmentCryptor::new(self.http_client.clone())),
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                    retries_per_fragment: request.retries_per_fragment,
                    max_concurrent: request.max_concurrent,
                },
            )
            .await
            .map_err(|err| (err, None))?;
            let strategy = PlaylistStrategy::LiveHls {
                segment_index: outcome.segment_index,
            };
            state.stage = Stage::Recording;
            progress.invalidate_on_stage_transition();
            self.persist_stage(state).map_err(|err| (err, None))?;
            return self
                .finish(request, strategy, state, cancel)
                .await
                .map_err(|err| (err, None));
        }

        let (fragments, strategy) = match playlist::classify(&text).map_err(|err| (err, None))? {
            PlaylistKind::Master => self
                .build_master_fragments(&text, &request.url, &request.quality, cancel)
                .await
                .map_err(|err| (err, None))?,
            PlaylistKind::Media => {
                let fragments = playlist::parse_media(&text, &request.url).map_err(|err| (err, None))?;
                let fragment_count = fragments.len();
                (fragments, PlaylistStrategy::MediaHls { fragment_count })
            }
        };

        if fragments.is_empty() {
            return Err((DownloadError::EmptyPlaylist, None));
        }

        state.stage = Stage::Downloading;
        progress.invalidate_on_stage_transition();
        self.persist_stage(state)
            .map_err(|err| (err, Some(strategy.clone())))?;

        let scheduler_ctx = SchedulerContext {
            download_id: request.download_id.clone(),
            chunk_store: self.chunk_store.clone(),
            cryptor: Arc::new(FragmentCryptor::new(self.http_client.clone())),
            http_client: self.http_client.clone(),
            cancel: cancel.clone(),
            progress: progress.clone(),
            max_concurrent: request.max_concurrent,
            retries_per_fragment: request.retries_per_fragment,
        };
        if let Err(err) = scheduler::run(&fragments, &scheduler_ctx).await {
            return Err((err, Some(strategy)));
        }

        self.finish(request, strategy, state, cancel)
            .await
            .map_err(|err| (err, None))
    }

    async fn build_master_fragments(
        &self,
        master_text: &str,
        master_url: &str,
        quality: &QualitySelection,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Fragment>, PlaylistStrategy), DownloadError> {
        let levels = playlist::parse_master(master_text, master_url)?;

        let (video_uri, audio_uri) = match quality {
            QualitySelection::Explicit { video_uri, audio_uri } => {
                (Some(video_uri.clone()), audio_uri.clone())
            }
            QualitySelection::Auto => {
                let video = select_best_stream(&levels).map(|l| l.uri.clone());
                let audio = levels
                    .iter()
                    .find(|l| l.kind == LevelKind::Audio)
                    .map(|l| l.uri.clone());
                (video, audio)
            }
        };
        let video_uri = video_uri.ok_or(DownloadError::EmptyPlaylist)?;

        let video_text = cancel_if_cancelled(fetch_text(&self.http_client, &video_uri), cancel).await?;
        assert_downloadable(&video_text)?;
        let mut fragments = playlist::parse_media(&video_text, &video_uri)?;
        let video_len = fragments.len();

        let mut audio_len = 0;
        if let Some(audio_uri) = audio_uri {
            let audio_text = cancel_if_cancelled(fetch_text(&self.http_client, &audio_uri), cancel).await?;
            assert_downloadable(&audio_text)?;
            let audio_fragments = playlist::parse_media(&audio_text, &audio_uri)?;
            audio_len = audio_fragments.len();
            for (offset, mut fragment) in audio_fragments.into_iter().enumerate() {
                fragment.index = video_len + offset;
                fragments.push(fragment);
            }
        }

        Ok((fragments, PlaylistStrategy::MasterHls { video_len, audio_len }))
    }

    async fn finish(
        &self,
        request: &PipelineRequest,
        strategy: PlaylistStrategy,
        state: &mut DownloadState,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, DownloadError> {
        state.stage = Stage::Merging;
        self.persist_stage(state)?;

        let download_id = request.download_id.clone();
        let mux_request = MuxRequest {
            download_id: download_id.clone(),
            filename: request.filename.clone(),
            counts: strategy.mux_counts(),
        };
        let success = self
            .mux_bridge
            .run(
                mux_request,
                &self.chunk_store,
                request.mux_timeout,
                cancel,
                &|_ratio, _message| {},
            )
            .await?;
        if let Some(warning) = &success.warning {
            warn!(%download_id, warning, "mux reported a warning");
        }

        state.stage = Stage::Saving;
        self.persist_stage(state)?;
        let file_id = self
            .file_transfer
            .save(&success.blob_ref, &request.filename)
            .await?;

        state.stage = Stage::Completed;
        state.local_path = Some(success.blob_ref.display().to_string());
        state.chrome_download_id = Some(file_id);
        state.progress.percentage = 100.0;
        self.state_store.upsert(state)?;

        info!(%download_id, "download completed");
        Ok(PipelineOutcome {
            file_path: success.blob_ref,
        })
    }

    /// `chunkStore.count(downloadId)` of 0 re-raises `Cancelled`; otherwise
    /// proceeds through MERGING → SAVING with a `"(partial)"` message.
    async fn attempt_partial_save(
        &self,
        request: &PipelineRequest,
        strategy: Option<PlaylistStrategy>,
        state: &mut DownloadState,
    ) -> Result<PipelineOutcome, DownloadError> {
        let count = self.chunk_store.count(request.download_id.as_str())?;
        if count == 0 {
            state.stage = Stage::Cancelled;
            let _ = self.state_store.upsert(state);
            return Err(DownloadError::Cancelled);
        }

        let recounted = strategy
            .unwrap_or(PlaylistStrategy::MediaHls { fragment_count: count })
            .recount_for_partial_save(count);

        // The original cancel fired to get here; partial-save runs the mux
        // and save steps to conclusion on a fresh, uncancelled token.
        let uncancelled = CancellationToken::new();
        let outcome = self.finish(request, recounted, state, &uncancelled).await?;

        state.progress.message = Some("(partial)".to_string());
        state.stage = Stage::Completed;
        self.state_store.upsert(state)?;
        Ok(outcome)
    }

    fn persist_stage(&self, state: &DownloadState) -> Result<(), DownloadError> {
        self.state_store.upsert(state).map_err(DownloadError::from)
    }
}

/// Among `type=stream` levels, sort by `bitrate desc` then `height desc`,
/// pick first.
fn select_best_stream(levels: &[Level]) -> Option<&Level> {
    levels
        .iter()
        .filter(|l| l.kind == LevelKind::Stream)
        .max_by(|a, b| {
            a.bitrate
                .unwrap_or(0)
                .cmp(&b.bitrate.unwrap_or(0))
                .then(a.height.unwrap_or(0).cmp(&b.height.unwrap_or(0)))
        })
}

async fn fetch_text(client: &Client, url: &str) -> Result<String, DownloadError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| DownloadError::Fetch {
            uri: url.to_string(),
            cause: err.to_string(),
        })?
        .error_for_status()
        .map_err(|err| DownloadError::Fetch {
            uri: url.to_string(),
            cause: err.to_string(),
        })?;
    response.text().await.map_err(|err| DownloadError::Fetch {
        uri: url.to_string(),
        cause: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_best_stream_prefers_higher_bitrate() {
        let levels = vec![
            Level {
                kind: LevelKind::Stream,
                uri: "low".to_string(),
                bitrate: Some(800_000),
                width: None,
                height: Some(360),
                fps: None,
                codecs: None,
            },
            Level {
                kind: LevelKind::Stream,
                uri: "high".to_string(),
                bitrate: Some(1_500_000),
                width: None,
                height: Some(720),
                fps: None,
                codecs: None,
            },
        ];
        let chosen = select_best_stream(&levels).unwrap();
        assert_eq!(chosen.uri, "high");
    }

    #[test]
    fn recount_for_partial_save_splits_master_counts() {
        let strategy = PlaylistStrategy::MasterHls {
            video_len: 10,
            audio_len: 10,
        };
        let recount = strategy.recount_for_partial_save(13);
        match recount {
            PlaylistStrategy::MasterHls { video_len, audio_len } => {
                assert_eq!(video_len, 10);
                assert_eq!(audio_len, 3);
            }
            _ => panic!("expected MasterHls"),
        }
    }
}
