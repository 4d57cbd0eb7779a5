use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

type Result<T> = std::result::Result<T, ConfigError>;

const DEFAULT_MAX_CONCURRENT: u32 = 3;
const DEFAULT_RETRIES_PER_FRAGMENT: u32 = 3;
const DEFAULT_MUX_TIMEOUT_SECS: u64 = 900;

/// Top-level configuration, loaded from an optional `reelfetch.toml` and
/// layered with environment knobs / CLI flags (file < env < flag).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub limits: LimitsSection,
    pub network: NetworkSection,
    pub paths: PathsSection,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limits: LimitsSection::default(),
            network: NetworkSection::default(),
            paths: PathsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent: u32,
    pub retries_per_fragment: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retries_per_fragment: DEFAULT_RETRIES_PER_FRAGMENT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub mux_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            mux_timeout_secs: DEFAULT_MUX_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub chunk_db: String,
    pub state_db: String,
    pub out_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            chunk_db: "reelfetch-chunks.sqlite3".to_string(),
            state_db: "reelfetch-state.sqlite3".to_string(),
            out_dir: ".".to_string(),
        }
    }
}

impl Settings {
    /// Load from `path` if it exists, falling back to defaults; then apply
    /// the `MEDIA_MAX_CONCURRENT` / `MEDIA_MUX_TIMEOUT_MS` env overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            load_toml(path)?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load defaults and apply only the environment overrides, used when no
    /// config file path was supplied at all.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("MEDIA_MAX_CONCURRENT") {
            if let Ok(value) = raw.parse() {
                self.limits.max_concurrent = value;
            }
        }
        if let Ok(raw) = std::env::var("MEDIA_MUX_TIMEOUT_MS") {
            if let Ok(millis) = raw.parse::<u64>() {
                self.network.mux_timeout_secs = millis / 1000;
            }
        }
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.out_dir).join(path)
        }
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
