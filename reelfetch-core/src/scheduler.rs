use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::crypto::FragmentCryptor;
use crate::error::DownloadError;
use crate::progress::ProgressTracker;
use crate::store::ChunkStore;
use crate::types::{DownloadId, Fragment};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 1.15;
const FAILURE_RATE_THRESHOLD: f64 = 0.10;

/// Shared collaborators and tuning knobs a scheduler run needs; one instance
/// per download, never shared across downloads.
pub struct SchedulerContext {
    pub download_id: DownloadId,
    pub chunk_store: Arc<ChunkStore>,
    pub cryptor: Arc<FragmentCryptor>,
    pub http_client: Client,
    pub cancel: CancellationToken,
    pub progress: Arc<ProgressTracker>,
    pub max_concurrent: usize,
    pub retries_per_fragment: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOutcome {
    pub downloaded_count: usize,
    pub failed_count: usize,
}

/// Drive fragments through fetch → decrypt → store with bounded concurrency
/// and retries, per §4.E.
pub async fn run(fragments: &[Fragment], ctx: &SchedulerContext) -> Result<SchedulerOutcome, DownloadError> {
    if fragments.is_empty() {
        return Ok(SchedulerOutcome::default());
    }

    crate::cancel::throw_if_cancelled(&ctx.cancel)?;

    let downloaded_count = Arc::new(AtomicUsize::new(0));
    let errors: Arc<AsyncMutex<Vec<DownloadError>>> = Arc::new(AsyncMutex::new(Vec::new()));

    // Step 2-3: seed the fragment count so every `record` call recomputes
    // totalBytes from the running average, bumping the estimate further as
    // later fragments land rather than freezing it at the first sample.
    ctx.progress.set_fragment_total(fragments.len() as u64);
    match download_fragment(&fragments[0], ctx).await {
        Ok(size) => {
            ctx.progress.record(size as u64);
            downloaded_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
        Err(err) => {
            errors.lock().await.push(err);
        }
    }

    if fragments.len() == 1 {
        return finalize(downloaded_count.load(Ordering::Relaxed), errors, fragments.len()).await;
    }

    let worker_count = ctx.max_concurrent.min(fragments.len() - 1).max(1);
    let cursor = Arc::new(AtomicUsize::new(1));
    let cancelled_by_worker = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let fragments = fragments.to_vec();
        let cursor = cursor.clone();
        let downloaded_count = downloaded_count.clone();
        let errors = errors.clone();
        let cancelled_by_worker = cancelled_by_worker.clone();
        let cancel = ctx.cancel.clone();
        let progress = ctx.progress.clone();
        let chunk_store = ctx.chunk_store.clone();
        let cryptor = ctx.cryptor.clone();
        let http_client = ctx.http_client.clone();
        let download_id = ctx.download_id.clone();
        let retries_per_fragment = ctx.retries_per_fragment;

        handles.push(tokio::spawn(async move {
            let worker_ctx = SchedulerContext {
                download_id,
                chunk_store,
                cryptor,
                http_client,
                cancel: cancel.clone(),
                progress: progress.clone(),
                max_concurrent: 1,
                retries_per_fragment,
            };
            loop {
                if cancel.is_cancelled() {
                    cancelled_by_worker.store(true, Ordering::Relaxed);
                    return;
                }
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                if i >= fragments.len() {
                    return;
                }
                match download_fragment(&fragments[i], &worker_ctx).await {
                    Ok(size) => {
                        progress.record(size as u64);
                        downloaded_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(DownloadError::Cancelled) => {
                        cancelled_by_worker.store(true, Ordering::Relaxed);
                        return;
                    }
                    Err(err) => {
                        errors.lock().await.push(err);
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    if cancelled_by_worker.load(Ordering::Relaxed) || ctx.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    finalize(downloaded_count.load(Ordering::Relaxed), errors, fragments.len()).await
}

async fn finalize(
    downloaded_count: usize,
    errors: Arc<AsyncMutex<Vec<DownloadError>>>,
    total: usize,
) -> Result<SchedulerOutcome, DownloadError> {
    let errors = errors.lock().await;
    let failed_count = errors.len();

    if downloaded_count == 0 && !errors.is_empty() {
        return Err(DownloadError::NoFragmentsDownloaded);
    }

    let rate = failed_count as f64 / total as f64;
    if rate > FAILURE_RATE_THRESHOLD {
        return Err(DownloadError::ExcessiveFragmentFailures {
            failed: failed_count,
            total,
            threshold: FAILURE_RATE_THRESHOLD * 100.0,
        });
    }

    Ok(SchedulerOutcome {
        downloaded_count,
        failed_count,
    })
}

/// `fetchBytes → decrypt → chunkStore.put`, returning the plaintext length.
pub async fn download_fragment(fragment: &Fragment, ctx: &SchedulerContext) -> Result<usize, DownloadError> {
    crate::cancel::throw_if_cancelled(&ctx.cancel)?;
    let bytes = fetch_with_retry(
        &ctx.http_client,
        &fragment.uri,
        ctx.retries_per_fragment,
        &ctx.cancel,
    )
    .await?;
    crate::cancel::throw_if_cancelled(&ctx.cancel)?;
    let plain = ctx
        .cryptor
        .decrypt(&fragment.key, bytes, ctx.retries_per_fragment, &ctx.cancel)
        .await?;
    crate::cancel::throw_if_cancelled(&ctx.cancel)?;
    ctx.chunk_store
        .put(ctx.download_id.as_str(), fragment.index, &plain)?;
    Ok(plain.len())
}

/// Exponential backoff (100ms × 1.15^attempt) fetch, abortable via `cancel`.
pub async fn fetch_with_retry(
    client: &Client,
    uri: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<bytes::Bytes, DownloadError> {
    let attempts = retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match client.get(uri).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => match response.bytes().await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => last_error = Some(err.to_string()),
            },
            Err(err) => last_error = Some(err.to_string()),
        }
        if attempt + 1 < attempts {
            let delay = INITIAL_BACKOFF.mul_f64(BACKOFF_FACTOR.powi(attempt as i32));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }
    }
    Err(DownloadError::Fetch {
        uri: uri.to_string(),
        cause: last_error.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tracker() -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(|_| {}, |_| {}))
    }

    #[tokio::test]
    async fn empty_fragment_list_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_store = Arc::new(ChunkStore::open(dir.path().join("chunks.sqlite3")).unwrap());
        let ctx = SchedulerContext {
            download_id: DownloadId::new("dl1"),
            chunk_store,
            cryptor: Arc::new(FragmentCryptor::new(Client::new())),
            http_client: Client::new(),
            cancel: CancellationToken::new(),
            progress: empty_tracker(),
            max_concurrent: 3,
            retries_per_fragment: 3,
        };
        let outcome = run(&[], &ctx).await.unwrap();
        assert_eq!(outcome.downloaded_count, 0);
        assert_eq!(outcome.failed_count, 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_raises_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_store = Arc::new(ChunkStore::open(dir.path().join("chunks.sqlite3")).unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = SchedulerContext {
            download_id: DownloadId::new("dl1"),
            chunk_store,
            cryptor: Arc::new(FragmentCryptor::new(Client::new())),
            http_client: Client::new(),
            cancel,
            progress: empty_tracker(),
            max_concurrent: 3,
            retries_per_fragment: 3,
        };
        let fragments = vec![Fragment {
            index: 0,
            uri: "https://example.invalid/seg0.ts".to_string(),
            key: None,
        }];
        let result = run(&fragments, &ctx).await;
        assert!(matches!(result.unwrap_err(), DownloadError::Cancelled));
    }
}
