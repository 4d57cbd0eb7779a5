use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

/// Raise `Cancelled` immediately if `handle` is signaled.
pub fn throw_if_cancelled(handle: &CancellationToken) -> Result<(), DownloadError> {
    if handle.is_cancelled() {
        Err(DownloadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Execute `op`; if `handle` fires while `op` is running, the result is
/// `Cancelled` regardless of what `op` itself returned.
pub async fn cancel_if_cancelled<F, T>(
    op: F,
    handle: &CancellationToken,
) -> Result<T, DownloadError>
where
    F: Future<Output = Result<T, DownloadError>>,
{
    tokio::select! {
        biased;
        _ = handle.cancelled() => Err(DownloadError::Cancelled),
        result = op => {
            if handle.is_cancelled() {
                Err(DownloadError::Cancelled)
            } else {
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throw_if_cancelled_passes_when_not_signaled() {
        let handle = CancellationToken::new();
        assert!(throw_if_cancelled(&handle).is_ok());
    }

    #[test]
    fn throw_if_cancelled_raises_when_signaled() {
        let handle = CancellationToken::new();
        handle.cancel();
        assert!(matches!(
            throw_if_cancelled(&handle).unwrap_err(),
            DownloadError::Cancelled
        ));
    }

    #[tokio::test]
    async fn cancel_if_cancelled_overrides_a_successful_op() {
        let handle = CancellationToken::new();
        let child = handle.clone();
        let op = async move {
            child.cancel();
            Ok::<_, DownloadError>(42)
        };
        let result = cancel_if_cancelled(op, &handle).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_if_cancelled_passes_through_when_not_signaled() {
        let handle = CancellationToken::new();
        let op = async { Ok::<_, DownloadError>(7) };
        let result = cancel_if_cancelled(op, &handle).await;
        assert_eq!(result.unwrap(), 7);
    }
}
