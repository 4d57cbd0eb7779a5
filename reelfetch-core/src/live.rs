use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::crypto::FragmentCryptor;
use crate::drm::assert_downloadable;
use crate::error::DownloadError;
use crate::playlist::{self, PlaylistKind};
use crate::progress::ProgressTracker;
use crate::scheduler::{self, SchedulerContext};
use crate::store::ChunkStore;
use crate::types::{DownloadId, Fragment, LevelKind};

const POLL_INTERVAL: Duration = Duration::from_millis(3000);

pub struct LiveContext {
    pub download_id: DownloadId,
    pub chunk_store: Arc<ChunkStore>,
    pub cryptor: Arc<FragmentCryptor>,
    pub cancel: CancellationToken,
    pub progress: Arc<ProgressTracker>,
    pub retries_per_fragment: u32,
    pub max_concurrent: usize,
}

pub struct LiveOutcome {
    pub segment_index: usize,
}

/// §4.H live recorder: resolve a media playlist URL, poll it until
/// `#EXT-X-ENDLIST` or cancellation, assigning unseen fragments monotonic
/// global indices so chunk order matches arrival order.
pub async fn run(http_client: &Client, url: &str, initial_text: &str, ctx: LiveContext) -> Result<LiveOutcome, DownloadError> {
    let media_url = resolve_media_url(http_client, url, initial_text).await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut segment_index = 0usize;
    let mut text = if media_url == url {
        initial_text.to_string()
    } else {
        fetch_with_retry(http_client, &media_url, ctx.retries_per_fragment, &ctx.cancel).await?
    };

    loop {
        crate::cancel::throw_if_cancelled(&ctx.cancel)?;

        // §4.B requires this on every fetched playlist text; a live stream
        // can rotate in a DRM or unsupported-encryption key mid-poll.
        assert_downloadable(&text)?;
        let all_fragments = playlist::parse_media(&text, &media_url)?;
        let fresh: Vec<Fragment> = all_fragments
            .into_iter()
            .filter(|f| seen.insert(f.uri.clone()))
            .map(|f| {
                let fragment = Fragment {
                    index: segment_index,
                    ..f
                };
                segment_index += 1;
                fragment
            })
            .collect();

        if !fresh.is_empty() {
            let scheduler_ctx = SchedulerContext {
                download_id: ctx.download_id.clone(),
                chunk_store: ctx.chunk_store.clone(),
                cryptor: ctx.cryptor.clone(),
                http_client: http_client.clone(),
                cancel: ctx.cancel.clone(),
                progress: ctx.progress.clone(),
                max_concurrent: ctx.max_concurrent.max(1),
                retries_per_fragment: ctx.retries_per_fragment,
            };
            let results: Vec<Result<usize, DownloadError>> = stream::iter(fresh.iter())
                .map(|fragment| {
                    let scheduler_ctx = &scheduler_ctx;
                    async move { scheduler::download_fragment(fragment, scheduler_ctx).await }
                })
                .buffer_unordered(ctx.max_concurrent.max(1))
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(size) => ctx.progress.record(size as u64),
                    Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                    Err(err) => {
                        debug!(download_id = %ctx.download_id, %err, "live fragment fetch failed, continuing");
                    }
                }
            }
            ctx.progress.set_segments_collected(segment_index as u64);
        }

        if text.contains("#EXT-X-ENDLIST") {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
        }

        text = fetch_with_retry(http_client, &media_url, ctx.retries_per_fragment, &ctx.cancel).await?;
    }

    if segment_index == 0 {
        return Err(DownloadError::NoSegmentsRecorded);
    }

    Ok(LiveOutcome { segment_index })
}

/// A live URL may itself be a master playlist; select the highest-bitrate
/// variant the same way §4.G's auto-select does.
async fn resolve_media_url(http_client: &Client, url: &str, initial_text: &str) -> Result<String, DownloadError> {
    match playlist::classify(initial_text)? {
        PlaylistKind::Media => Ok(url.to_string()),
        PlaylistKind::Master => {
            let levels = playlist::parse_master(initial_text, url)?;
            levels
                .iter()
                .filter(|l| l.kind == LevelKind::Stream)
                .max_by(|a, b| {
                    a.bitrate
                        .unwrap_or(0)
                        .cmp(&b.bitrate.unwrap_or(0))
                        .then(a.height.unwrap_or(0).cmp(&b.height.unwrap_or(0)))
                })
                .map(|l| l.uri.clone())
                .ok_or(DownloadError::EmptyPlaylist)
        }
    }
}

async fn fetch_with_retry(
    client: &Client,
    url: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<String, DownloadError> {
    let attempts = retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match client.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => match response.text().await {
                Ok(text) => return Ok(text),
                Err(err) => last_error = Some(err.to_string()),
            },
            Err(err) => last_error = Some(err.to_string()),
        }
        if attempt + 1 < attempts {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }
    }
    Err(DownloadError::Fetch {
        uri: url.to_string(),
        cause: last_error.unwrap_or_default(),
    })
}
