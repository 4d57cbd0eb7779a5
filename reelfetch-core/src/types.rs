use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for one active download; also the partition key for
/// chunk storage and header rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub String);

impl DownloadId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key material referenced by an `#EXT-X-KEY` tag, normalized lazily by the
/// fragment cryptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentKey {
    pub iv: Option<String>,
    pub uri: Option<String>,
}

impl FragmentKey {
    pub fn is_plaintext(&self) -> bool {
        self.uri.is_none() || self.iv.is_none()
    }
}

/// One downloadable media segment; `index` defines concatenation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: usize,
    pub uri: String,
    pub key: Option<FragmentKey>,
}

/// A variant stream or alternate-audio entry in a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub kind: LevelKind,
    pub uri: String,
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub codecs: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    Stream,
    Audio,
}

/// Lifecycle stage of a `DownloadState`; totally ordered within one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detecting,
    Downloading,
    Recording,
    Merging,
    Saving,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detecting => "detecting",
            Stage::Downloading => "downloading",
            Stage::Recording => "recording",
            Stage::Merging => "merging",
            Stage::Saving => "saving",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Cancelled)
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detecting" => Ok(Stage::Detecting),
            "downloading" => Ok(Stage::Downloading),
            "recording" => Ok(Stage::Recording),
            "merging" => Ok(Stage::Merging),
            "saving" => Ok(Stage::Saving),
            "completed" => Ok(Stage::Completed),
            "failed" => Ok(Stage::Failed),
            "cancelled" => Ok(Stage::Cancelled),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Per-download progress snapshot, persisted to the state store and emitted
/// to the notification hook on every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub speed: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub segments_collected: Option<u64>,
}

/// Metadata hints attached to a download (title, format, resolution, DRM).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub title: Option<String>,
    pub format: Option<String>,
    pub resolution: Option<String>,
    pub drm_detected: bool,
}

/// Progress record persisted per-download; mutated only by the pipeline that
/// owns `id`.
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub id: DownloadId,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: DownloadMetadata,
    pub stage: Stage,
    pub progress: Progress,
    pub local_path: Option<String>,
    pub chrome_download_id: Option<String>,
}

impl DownloadState {
    pub fn new(id: DownloadId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            created_at: Utc::now(),
            updated_at: None,
            metadata: DownloadMetadata::default(),
            stage: Stage::Detecting,
            progress: Progress::default(),
            local_path: None,
            chrome_download_id: None,
        }
    }
}
