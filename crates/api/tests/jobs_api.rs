//! HTTP-level tests for the `/jobs` resource and `/health`.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use audionorm_pipeline::pool::WorkerPool;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use common::{build_test_app, build_test_app_with, delete, get, post_audio, send, wav_payload};

async fn wait_for_status(app: &axum::Router, id: i64, wanted: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let (status, json) = get(app, &format!("/jobs/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        if json["status"] == wanted {
            return json;
        }
        assert!(Instant::now() < deadline, "job {id} never reached {wanted}: {json}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_accepted_with_job_id() {
    let t = build_test_app().await;

    let (status, json) = post_audio(&t.app, wav_payload("copy")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = json["job_id"].as_i64().unwrap();

    let (status, job) = get(&t.app, &format!("/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["id"], id);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["retry_count"], 0);
    assert_eq!(job["max_retries"], 3);
    assert!(job.get("output_reference").is_none());
    assert!(job.get("worker_id").is_none());
    assert!(job["created_at"].is_string());
}

#[tokio::test]
async fn empty_body_is_rejected() {
    let t = build_test_app().await;

    let (status, json) = post_audio(&t.app, Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");

    let (_, list) = get(&t.app, "/jobs").await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn non_audio_body_is_rejected() {
    let t = build_test_app().await;

    let (status, json) = post_audio(&t.app, b"<html>nope</html>".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn oversized_body_is_a_validation_error() {
    let t = build_test_app().await;
    let mut body = wav_payload("copy");
    body.resize(8192, 0);

    let (status, json) = post_audio(&t.app, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn saturated_pipeline_returns_503() {
    let t = build_test_app_with(|c| c.pipeline.max_queue_depth = 1).await;
    let _busy = t.ctx.capacity.acquire();

    let (status, _) = post_audio(&t.app, wav_payload("copy")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = post_audio(&t.app, wav_payload("copy")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "RESOURCE_EXHAUSTED");
}

// ---------------------------------------------------------------------------
// Status and listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_returns_404() {
    let t = build_test_app().await;

    let (status, json) = get(&t.app, "/jobs/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, _) = delete(&t.app, "/jobs/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_by_status() {
    let t = build_test_app().await;
    let (_, a) = post_audio(&t.app, wav_payload("copy")).await;
    let (_, b) = post_audio(&t.app, wav_payload("copy")).await;
    let b_id = b["job_id"].as_i64().unwrap();
    delete(&t.app, &format!("/jobs/{}", a["job_id"])).await;

    let (status, pending) = get(&t.app, "/jobs?status=pending").await;
    assert_eq!(status, StatusCode::OK);
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], b_id);

    let (_, all) = get(&t.app, "/jobs?limit=10").await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_pending_then_conflict() {
    let t = build_test_app().await;
    let (_, json) = post_audio(&t.app, wav_payload("copy")).await;
    let id = json["job_id"].as_i64().unwrap();

    let (status, json) = delete(&t.app, &format!("/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);
    assert_eq!(json["status"], "cancelled");

    let (status, json) = delete(&t.app, &format!("/jobs/{id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn cancel_running_job_over_http() {
    let t = build_test_app().await;
    let (_, json) = post_audio(&t.app, wav_payload("sleep")).await;
    let id = json["job_id"].as_i64().unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(t.ctx.clone(), shutdown.clone());
    wait_for_status(&t.app, id, "running").await;

    let (status, json) = delete(&t.app, &format!("/jobs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "running");

    wait_for_status(&t.app, id, "cancelled").await;

    shutdown.cancel();
    pool.join().await;
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_job_is_normalized_and_downloadable() {
    let t = build_test_app().await;
    let payload = wav_payload("copy");
    let (_, json) = post_audio(&t.app, payload.clone()).await;
    let id = json["job_id"].as_i64().unwrap();

    let (status, json) = get(&t.app, &format!("/jobs/{id}/output")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "INVALID_TRANSITION");

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(t.ctx.clone(), shutdown.clone());

    let job = wait_for_status(&t.app, id, "succeeded").await;
    assert_eq!(job["output_reference"], format!("outputs/job-{id}.mp3"));
    assert!(job.get("error_detail").is_none());

    // The fake tool copies its input, so the artifact equals the upload.
    let (status, bytes) = send(&t.app, Method::GET, &format!("/jobs/{id}/output"), Vec::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, payload);

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{id}/output"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(headers[header::CONTENT_LENGTH], payload.len().to_string().as_str());
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"job-{id}.mp3\"").as_str()
    );

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test]
async fn failing_job_reports_sanitized_detail() {
    let t = build_test_app_with(|c| c.pipeline.max_retries = 0).await;
    let (_, json) = post_audio(&t.app, wav_payload("fail")).await;
    let id = json["job_id"].as_i64().unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(t.ctx.clone(), shutdown.clone());

    let job = wait_for_status(&t.app, id, "failed").await;
    assert_eq!(job["error_detail"], "tool_exit_nonzero");
    assert_eq!(job["retry_count"], 0);
    assert!(job.get("output_reference").is_none());

    shutdown.cancel();
    pool.join().await;
}

// ---------------------------------------------------------------------------
// Health and middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok() {
    let t = build_test_app().await;

    let (status, json) = get(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["db_healthy"], true);
    assert_eq!(json["max_workers"], 1);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn responses_carry_request_id() {
    let t = build_test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}
