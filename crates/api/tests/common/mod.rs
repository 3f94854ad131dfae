#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use audionorm_api::app::build_app;
use audionorm_api::config::{LogFormat, ServerConfig};
use audionorm_api::state::AppState;
use audionorm_core::ffmpeg::{NormalizeSettings, ToolCommand};
use audionorm_core::supervisor::ProcessSupervisor;
use audionorm_pipeline::gateway::JobGateway;
use audionorm_pipeline::{PipelineConfig, PipelineContext};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Fake normalization tool: copies its input to its output, or sleeps/fails
/// when the input carries `mode=sleep` / `mode=fail`.
pub const FAKE_TOOL: &str = r#"#!/bin/sh
input=""
prev=""
out=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then input="$arg"; fi
  prev="$arg"
  out="$arg"
done
if grep -a -q "mode=sleep" "$input"; then sleep 30; fi
if grep -a -q "mode=fail" "$input"; then exit 1; fi
cp "$input" "$out"
"#;

/// A running test application over a temporary storage root.
pub struct TestApp {
    pub root: tempfile::TempDir,
    pub ctx: PipelineContext,
    pub app: Router,
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config(storage_root: PathBuf) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        log_format: LogFormat::Text,
        ffmpeg_path: PathBuf::from("sh"),
        normalize: NormalizeSettings::default(),
        pipeline: PipelineConfig {
            storage_root,
            max_workers: 1,
            per_job_timeout: Duration::from_secs(10),
            max_retries: 3,
            lease_duration: Duration::from_secs(6),
            sweep_interval: Duration::from_secs(1),
            max_queue_depth: 8,
            max_upload_bytes: 4096,
            poll_interval_min: Duration::from_millis(10),
            poll_interval_max: Duration::from_millis(50),
            worker_prefix: "api-test".to_string(),
        },
    }
}

/// Build the full application router over a fresh store.
///
/// Uses the same middleware stack as `main.rs`. Workers are not started;
/// spawn a `WorkerPool` over `ctx` when a test needs them.
pub async fn build_test_app() -> TestApp {
    build_test_app_with(|_| {}).await
}

pub async fn build_test_app_with(configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let root = tempfile::tempdir().unwrap();
    let script = root.path().join("fake-ffmpeg.sh");
    std::fs::write(&script, FAKE_TOOL).unwrap();

    let mut config = test_config(root.path().to_path_buf());
    configure(&mut config);

    let db = audionorm_db::create_pool(&root.path().join(audionorm_db::DATABASE_FILE))
        .await
        .unwrap();
    audionorm_db::run_migrations(&db).await.unwrap();

    let tool = ToolCommand::new(&config.ffmpeg_path)
        .with_base_args([script.to_string_lossy().into_owned()]);
    let supervisor = ProcessSupervisor::new(root.path(), tool, config.normalize.clone());
    let ctx = PipelineContext::new(db, supervisor, config.pipeline.clone());

    let state = AppState {
        gateway: JobGateway::new(ctx.clone()),
        config: Arc::new(config),
    };
    let app = build_app(state).unwrap();

    TestApp { root, ctx, app }
}

/// A minimal WAV payload carrying a behaviour marker for the fake tool.
pub fn wav_payload(mode: &str) -> Vec<u8> {
    let mut bytes = b"RIFF".to_vec();
    bytes.extend_from_slice(&36u32.to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(format!("mode={mode}").as_bytes());
    bytes
}

/// Send a request and return status plus raw body bytes.
pub async fn send(app: &Router, method: Method, uri: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

/// Send a request and parse the JSON body.
pub async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Vec<u8>,
) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send_json(app, Method::GET, uri, Vec::new()).await
}

pub async fn post_audio(app: &Router, body: Vec<u8>) -> (StatusCode, serde_json::Value) {
    send_json(app, Method::POST, "/jobs", body).await
}

pub async fn delete(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send_json(app, Method::DELETE, uri, Vec::new()).await
}
