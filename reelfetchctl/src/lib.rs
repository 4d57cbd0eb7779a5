use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use reelfetch_core::filetransfer::{FileTransferFacility, LocalFileTransfer};
use reelfetch_core::headers::{HeaderRuleFacility, InMemoryHeaderRules};
use reelfetch_core::mux::{FfmpegMuxBridge, MuxBridge};
use reelfetch_core::store::{ChunkStoreBuilder, StateStoreBuilder};
use reelfetch_core::{
    DownloadError, DownloadId, Pipeline, PipelineRequest, QualitySelection, Settings,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "reelfetch media-acquisition engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to an optional reelfetch.toml; absence falls back to defaults.
    #[arg(long, default_value = "reelfetch.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download (or record, with --record-live) a playlist-driven media asset.
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Playlist or direct media URL.
    pub url: String,

    /// Destination filename for the final muxed file.
    #[arg(long)]
    pub out: String,

    /// `auto`, a single video URI, or `videoUri,audioUri`.
    #[arg(long, default_value = "auto")]
    pub quality: String,

    /// Overrides `[limits].max_concurrent` and `MEDIA_MAX_CONCURRENT`.
    #[arg(long)]
    pub max_concurrent: Option<u32>,

    /// Overrides `[network].mux_timeout_secs` and `MEDIA_MUX_TIMEOUT_MS`.
    #[arg(long)]
    pub mux_timeout_secs: Option<u64>,

    /// On cancellation, mux and save whatever fragments were already stored.
    #[arg(long)]
    pub save_on_cancel: bool,

    /// Treat the playlist as a live stream: poll until `#EXT-X-ENDLIST`.
    #[arg(long)]
    pub record_live: bool,

    /// Originating page URL; installs CDN header rules when set.
    #[arg(long)]
    pub page_url: Option<String>,
}

/// Parses `cli`, runs the requested subcommand, and returns the process exit
/// code per spec.md §6 (`0` success, `10` cancelled, `20` DRM/unsupported,
/// `30` excessive fragment failures, `40` mux error/timeout, `50` no
/// fragments, `1` anything else).
pub fn run(cli: Cli) -> i32 {
    init_tracing();

    match &cli.command {
        Commands::Fetch(args) => run_fetch(&cli, args),
    }
}

fn run_fetch(cli: &Cli, args: &FetchArgs) -> i32 {
    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start async runtime");
            return 1;
        }
    };

    match runtime.block_on(fetch(settings, args)) {
        Ok(outcome_path) => {
            info!(path = %outcome_path.display(), "fetch completed");
            0
        }
        Err(err) => {
            error!(%err, "fetch failed");
            err.exit_code()
        }
    }
}

async fn fetch(settings: Settings, args: &FetchArgs) -> Result<PathBuf, DownloadError> {
    let out_dir = PathBuf::from(&settings.paths.out_dir);
    std::fs::create_dir_all(&out_dir)?;

    let chunk_db = settings.resolve_path(&settings.paths.chunk_db);
    let state_db = settings.resolve_path(&settings.paths.state_db);
    let chunk_store = Arc::new(ChunkStoreBuilder::new().path(chunk_db).build()?);
    let state_store = Arc::new(StateStoreBuilder::new().path(state_db).build()?);

    let header_rules: Arc<dyn HeaderRuleFacility> = Arc::new(InMemoryHeaderRules::new());
    let mux_bridge: Arc<dyn MuxBridge> = Arc::new(FfmpegMuxBridge::new(
        "ffmpeg",
        out_dir.join(".reelfetch-work"),
    ));
    let file_transfer: Arc<dyn FileTransferFacility> = Arc::new(LocalFileTransfer::new(&out_dir));
    let http_client = reqwest::Client::new();

    let pipeline = Pipeline {
        chunk_store,
        state_store,
        header_rules,
        mux_bridge,
        file_transfer,
        http_client,
    };

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let request = PipelineRequest {
        url: args.url.clone(),
        filename: args.out.clone(),
        download_id: DownloadId::new(Uuid::new_v4().to_string()),
        page_url: args.page_url.clone(),
        quality: parse_quality(&args.quality),
        max_concurrent: args
            .max_concurrent
            .unwrap_or(settings.limits.max_concurrent) as usize,
        retries_per_fragment: settings.limits.retries_per_fragment,
        mux_timeout: Duration::from_secs(
            args.mux_timeout_secs.unwrap_or(settings.network.mux_timeout_secs),
        ),
        save_on_cancel: args.save_on_cancel,
        record_live: args.record_live,
    };

    let outcome = pipeline.run(request, cancel).await?;
    Ok(outcome.file_path)
}

fn parse_quality(raw: &str) -> QualitySelection {
    if raw.eq_ignore_ascii_case("auto") {
        return QualitySelection::Auto;
    }
    match raw.split_once(',') {
        Some((video, audio)) => QualitySelection::Explicit {
            video_uri: video.to_string(),
            audio_uri: Some(audio.to_string()),
        },
        None => QualitySelection::Explicit {
            video_uri: raw.to_string(),
            audio_uri: None,
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
