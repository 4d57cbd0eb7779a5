mod common;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use reelfetch_core::error::DownloadError;
use reelfetch_core::filetransfer::LocalFileTransfer;
use reelfetch_core::headers::InMemoryHeaderRules;
use reelfetch_core::mux::{MuxBridge, MuxCounts, MuxRequest, MuxSuccess};
use reelfetch_core::pipeline::{Pipeline, PipelineRequest, QualitySelection};
use reelfetch_core::store::{ChunkStore, ChunkStoreBuilder, StateStoreBuilder};
use reelfetch_core::types::DownloadId;

use common::TestServer;

struct RecordingMuxBridge {
    work_dir: PathBuf,
    stored_at_mux_time: Mutex<Option<usize>>,
    seen_counts: Mutex<Option<MuxCounts>>,
}

#[async_trait]
impl MuxBridge for RecordingMuxBridge {
    async fn run(
        &self,
        request: MuxRequest,
        chunk_store: &ChunkStore,
        _timeout: Duration,
        _cancel: &CancellationToken,
        _on_progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<MuxSuccess, DownloadError> {
        *self.stored_at_mux_time.lock().unwrap() =
            Some(chunk_store.count(request.download_id.as_str())?);
        *self.seen_counts.lock().unwrap() = Some(request.counts);
        std::fs::create_dir_all(&self.work_dir)?;
        let output = self.work_dir.join(&request.filename);
        std::fs::write(&output, b"muxed")?;
        Ok(MuxSuccess {
            blob_ref: output,
            warning: None,
        })
    }
}

fn playlist_with_segments(names: &[&str], endlist: bool) -> String {
    let mut text = String::from("#EXTM3U\n");
    for name in names {
        text.push_str("#EXTINF:6.0,\n");
        text.push_str(name);
        text.push('\n');
    }
    if endlist {
        text.push_str("#EXT-X-ENDLIST\n");
    }
    text
}

#[tokio::test]
async fn s5_live_recorder_dedups_across_polls_and_stops_at_endlist() {
    let server = TestServer::start();

    for name in ["a", "b", "c", "d", "e", "f"] {
        server.route(&format!("/{name}.ts"), 200, vec![b'x'; 20]);
    }

    let seg_url = |name: &str| server.url(&format!("/{name}.ts"));
    let round1 = playlist_with_segments(&[&seg_url("a"), &seg_url("b"), &seg_url("c")], false);
    let round2 = playlist_with_segments(
        &[&seg_url("a"), &seg_url("b"), &seg_url("c"), &seg_url("d"), &seg_url("e")],
        false,
    );
    let round3 = playlist_with_segments(
        &[
            &seg_url("a"),
            &seg_url("b"),
            &seg_url("c"),
            &seg_url("d"),
            &seg_url("e"),
            &seg_url("f"),
        ],
        true,
    );
    server.route_sequence(
        "/live.m3u8",
        vec![
            (200, round1.into_bytes()),
            (200, round2.into_bytes()),
            (200, round3.into_bytes()),
        ],
    );

    let dir = tempfile::tempdir().unwrap();
    let chunk_store = Arc::new(
        ChunkStoreBuilder::new()
            .path(dir.path().join("chunks.sqlite3"))
            .build()
            .unwrap(),
    );
    let state_store = Arc::new(
        StateStoreBuilder::new()
            .path(dir.path().join("state.sqlite3"))
            .build()
            .unwrap(),
    );
    let mux_bridge = Arc::new(RecordingMuxBridge {
        work_dir: dir.path().join("work"),
        stored_at_mux_time: Mutex::new(None),
        seen_counts: Mutex::new(None),
    });
    let out_dir = dir.path().join("out");
    let pipeline = Pipeline {
        chunk_store: chunk_store.clone(),
        state_store,
        header_rules: Arc::new(InMemoryHeaderRules::new()),
        mux_bridge: mux_bridge.clone(),
        file_transfer: Arc::new(LocalFileTransfer::new(&out_dir)),
        http_client: reqwest::Client::new(),
    };

    let request = PipelineRequest {
        url: server.url("/live.m3u8"),
        filename: "live.mp4".to_string(),
        download_id: DownloadId::new("s5-download"),
        page_url: None,
        quality: QualitySelection::Auto,
        max_concurrent: 3,
        retries_per_fragment: 1,
        mux_timeout: Duration::from_secs(30),
        save_on_cancel: false,
        record_live: true,
    };

    let outcome = pipeline.run(request, CancellationToken::new()).await.unwrap();
    assert!(outcome.file_path.exists());

    assert_eq!(mux_bridge.stored_at_mux_time.lock().unwrap().take(), Some(6));
    match mux_bridge.seen_counts.lock().unwrap().take().unwrap() {
        MuxCounts::Media { fragment_count } => assert_eq!(fragment_count, 6),
        MuxCounts::Hls { .. } => panic!("expected Media counts"),
    }
}
