use thiserror::Error;

/// Errors raised while loading or validating [`crate::config::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Errors raised by the chunk store and state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("download {0} not found")]
    NotFound(String),

    #[error("chunk {index} for download {download_id} not found")]
    ChunkNotFound { download_id: String, index: usize },
}

/// Errors raised while decrypting a fragment.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key material has unexpected length {0}, expected 16 bytes")]
    InvalidKeyLength(usize),

    #[error("invalid IV hex string: {0}")]
    InvalidIv(String),

    #[error("block cipher rejected ciphertext: {0}")]
    Cipher(String),
}

/// Top-level error taxonomy shared by every pipeline stage. The CLI maps
/// each variant to a process exit code via [`DownloadError::exit_code`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download was cancelled")]
    Cancelled,

    #[error("content is DRM-protected and cannot be decrypted by this engine")]
    DrmProtected,

    #[error("encryption method {0} is not supported, only NONE and AES-128")]
    UnsupportedEncryption(String),

    #[error("playlist is neither a master nor a media playlist")]
    UnclassifiedPlaylist,

    #[error("playlist contained no fragments")]
    EmptyPlaylist,

    #[error("fetch of {uri} failed: {cause}")]
    Fetch { uri: String, cause: String },

    #[error("decryption failed: {0}")]
    DecryptionFailed(#[from] CryptoError),

    #[error("all fragments failed to download")]
    NoFragmentsDownloaded,

    #[error("{failed} of {total} fragments failed, exceeding the {threshold:.0}% threshold")]
    ExcessiveFragmentFailures {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("mux process reported an error: {0}")]
    MuxError(String),

    #[error("mux process timed out after {0:?}")]
    MuxTimeout(std::time::Duration),

    #[error("file-transfer facility reported the save was interrupted")]
    FileSaveInterrupted,

    #[error("live recorder ended with no fragments recorded")]
    NoSegmentsRecorded,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl DownloadError {
    /// Process exit code: `0` success, `10` cancelled, `20` DRM/unsupported,
    /// `30` excessive fragment failures, `40` mux error/timeout, `50` no
    /// fragments, `1` anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            DownloadError::Cancelled => 10,
            DownloadError::DrmProtected | DownloadError::UnsupportedEncryption(_) => 20,
            DownloadError::ExcessiveFragmentFailures { .. } => 30,
            DownloadError::MuxError(_) | DownloadError::MuxTimeout(_) => 40,
            DownloadError::NoFragmentsDownloaded | DownloadError::NoSegmentsRecorded => 50,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
