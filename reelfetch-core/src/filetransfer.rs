use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::DownloadError;

/// Terminal state of a save, matching the host facility's state stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    InProgress,
    Complete { filename: String },
    Interrupted { reason: String },
}

/// `save(blobRef, filename) -> fileId`; the out-of-core collaborator that
/// persists the muxed output to its final destination.
#[async_trait]
pub trait FileTransferFacility: Send + Sync {
    async fn save(&self, blob_ref: &Path, filename: &str) -> Result<String, DownloadError>;
}

/// Local filesystem implementation: copies `blob_ref` into `out_dir` under
/// `filename` and returns the destination path as the file id.
pub struct LocalFileTransfer {
    out_dir: PathBuf,
}

impl LocalFileTransfer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl FileTransferFacility for LocalFileTransfer {
    async fn save(&self, blob_ref: &Path, filename: &str) -> Result<String, DownloadError> {
        fs::create_dir_all(&self.out_dir).await?;
        let destination = self.out_dir.join(filename);
        match fs::copy(blob_ref, &destination).await {
            Ok(_) => Ok(destination.display().to_string()),
            Err(source) => {
                let _ = fs::remove_file(&destination).await;
                tracing::warn!(%source, blob_ref = %blob_ref.display(), "file transfer interrupted");
                Err(DownloadError::FileSaveInterrupted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_copies_blob_into_out_dir() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let blob_path = src_dir.path().join("blob.mp4");
        tokio::fs::write(&blob_path, b"movie bytes").await.unwrap();

        let transfer = LocalFileTransfer::new(out_dir.path());
        let file_id = transfer.save(&blob_path, "output.mp4").await.unwrap();

        let saved = tokio::fs::read(out_dir.path().join("output.mp4"))
            .await
            .unwrap();
        assert_eq!(saved, b"movie bytes");
        assert!(file_id.ends_with("output.mp4"));
    }

    #[tokio::test]
    async fn save_fails_when_blob_missing() {
        let out_dir = tempfile::tempdir().unwrap();
        let transfer = LocalFileTransfer::new(out_dir.path());
        let result = transfer
            .save(Path::new("/nonexistent/blob.mp4"), "output.mp4")
            .await;
        assert!(result.is_err());
    }
}
