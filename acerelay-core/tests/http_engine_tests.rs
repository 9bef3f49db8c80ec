//! Integration tests for the HTTP engine adapter.
//!
//! Runs the adapter against an in-process fake engine that implements the
//! getstream, stat, command, playback and version endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use acerelay_core::config::{EngineConfig, RelayConfig};
use acerelay_core::engine::{Engine, EngineError, HttpEngine, StreamRequest};
use acerelay_core::streaming::ProxyService;
use acerelay_core::{ContentId, Pid};
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const PLAYBACK: &[u8] = b"\x47fake transport stream payload";

#[derive(Clone, Default)]
struct FakeEngine {
    base_url: Arc<Mutex<String>>,
    stopped: Arc<Mutex<Vec<String>>>,
    started: Arc<Mutex<Vec<String>>>,
}

async fn getstream(
    State(fake): State<FakeEngine>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let id = params.get("id").cloned().unwrap_or_default();
    let pid = params.get("pid").cloned().unwrap_or_default();
    if params.get("format").map(String::as_str) != Some("json") || id == "missing" {
        return Json(json!({"response": null, "error": "no sources found"}));
    }

    fake.started.lock().push(pid.clone());
    let base = fake.base_url.lock().clone();
    Json(json!({
        "response": {
            "playback_url": format!("{base}/play/{pid}"),
            "stat_url": format!("{base}/stat/{pid}"),
            "command_url": format!("{base}/cmd/{pid}"),
            "infohash": id,
        },
        "error": null
    }))
}

async fn stat(Path(_pid): Path<String>) -> Json<Value> {
    Json(json!({
        "response": {"peers": 17, "speed_down": 250, "status": "dl", "speed_up": 3},
        "error": null
    }))
}

async fn command(
    State(fake): State<FakeEngine>,
    Path(pid): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    if params.get("method").map(String::as_str) == Some("stop") {
        fake.stopped.lock().push(pid);
    }
    Json(json!({"response": "ok", "error": null}))
}

async fn play(Path(_pid): Path<String>) -> &'static [u8] {
    PLAYBACK
}

async fn version() -> Json<Value> {
    Json(json!({"result": {"version": "3.2.3"}, "error": null}))
}

/// Test fixture owning the fake engine server.
struct EngineFixture {
    fake: FakeEngine,
    config: EngineConfig,
}

impl EngineFixture {
    async fn start() -> Self {
        let fake = FakeEngine::default();
        let app = Router::new()
            .route("/ace/getstream", get(getstream))
            .route("/stat/{pid}", get(stat))
            .route("/cmd/{pid}", get(command))
            .route("/play/{pid}", get(play))
            .route("/webui/api/service", get(version))
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        *fake.base_url.lock() = base_url.clone();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let config = EngineConfig {
            base_url,
            ..RelayConfig::for_testing().engine
        };
        Self { fake, config }
    }

    fn engine(&self) -> HttpEngine {
        HttpEngine::new(&self.config).unwrap()
    }
}

#[tokio::test]
async fn test_start_stats_stream_stop_against_engine_api() {
    let fixture = EngineFixture::start().await;
    let engine = fixture.engine();
    let id = ContentId::parse("a1b2c3").unwrap();
    let pid = Pid::new(4242);

    let playback_url = engine.start_stream(&id, pid).await.unwrap();
    assert!(playback_url.ends_with("/play/4242"));
    assert_eq!(*fixture.fake.started.lock(), vec!["4242".to_string()]);

    let stats = engine.stats(pid).await.unwrap();
    assert_eq!(stats.peers, 17);
    assert_eq!(stats.speed_down, 250 * 1024);

    let mut output = Vec::new();
    let request = StreamRequest {
        stream_url: &playback_url,
        content_id: &id,
        pid,
        write_timeout: fixture.config.request_timeout,
    };
    let copied = engine
        .stream_content(request, &mut output, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(copied, PLAYBACK.len() as u64);
    assert_eq!(output, PLAYBACK);

    engine.stop_stream(pid).await.unwrap();
    assert_eq!(*fixture.fake.stopped.lock(), vec!["4242".to_string()]);
    assert!(engine.player(pid).is_none());
}

#[tokio::test]
async fn test_engine_error_payload_is_rejection() {
    let fixture = EngineFixture::start().await;
    let engine = fixture.engine();

    let result = engine
        .start_stream(&ContentId::parse("missing").unwrap(), Pid::new(1))
        .await;

    assert!(matches!(result, Err(EngineError::Rejected { reason }) if reason.contains("no sources")));
}

#[tokio::test]
async fn test_ping_reaches_version_endpoint() {
    let fixture = EngineFixture::start().await;
    assert!(fixture.engine().ping().await.is_ok());

    let unreachable = HttpEngine::new(&EngineConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        ..RelayConfig::for_testing().engine
    })
    .unwrap();
    assert!(unreachable.ping().await.is_err());
}

#[tokio::test]
async fn test_proxy_relays_engine_playback_to_client() {
    let fixture = EngineFixture::start().await;
    let engine: Arc<dyn Engine> = Arc::new(fixture.engine());
    let proxy = ProxyService::new(engine, RelayConfig::for_testing().proxy);
    let mut output = Vec::new();

    let delivered = proxy
        .stream_to_client(&CancellationToken::new(), "a1b2c3", &mut output)
        .await
        .unwrap();

    assert_eq!(delivered, PLAYBACK.len() as u64);
    assert_eq!(output, PLAYBACK);
    assert_eq!(fixture.fake.started.lock().len(), 1);
    assert_eq!(fixture.fake.stopped.lock().len(), 1);
    assert!(proxy.sessions().is_empty());
}
