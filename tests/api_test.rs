//! Integration tests for the daemon's HTTP API.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use runnerd::accel::SystemProbe;
use runnerd::api;
use runnerd::config::DaemonConfig;
use runnerd::model::GgufIntrospector;
use runnerd::payload::PayloadStore;
use runnerd::scheduler::Scheduler;
use runnerd::state::AppState;

fn test_app(models_dir: &std::path::Path, work_dir: &std::path::Path) -> Router {
    let config = DaemonConfig {
        api: Default::default(),
        models: runnerd::config::ModelsConfig {
            dir: models_dir.display().to_string(),
        },
        runner: Default::default(),
    };

    let payloads = Arc::new(PayloadStore::new(work_dir.to_path_buf()));
    let scheduler = Scheduler::new(
        &config,
        payloads,
        Arc::new(GgufIntrospector),
        Arc::new(SystemProbe::new()),
    );
    let state = Arc::new(AppState::new(config, scheduler));

    Router::new()
        .nest("/api", api::router())
        .route("/health", axum::routing::get(api::health::health))
        .with_state(state)
}

async fn post_json(app: &Router, uri: &str, body: &str) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn health_answers_ok() {
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let app = test_app(models.path(), work.path());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn generate_unknown_model_is_404() {
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let app = test_app(models.path(), work.path());

    let status = post_json(
        &app,
        "/api/generate",
        r#"{"model": "no-such-model", "prompt": "hello"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn embeddings_unknown_model_is_404() {
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let app = test_app(models.path(), work.path());

    let status = post_json(
        &app,
        "/api/embeddings",
        r#"{"model": "no-such-model", "prompt": "hello"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tokenize_unknown_model_is_404() {
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let app = test_app(models.path(), work.path());

    let status = post_json(
        &app,
        "/api/tokenize",
        r#"{"model": "no-such-model", "content": "hello"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let status = post_json(
        &app,
        "/api/detokenize",
        r#"{"model": "no-such-model", "tokens": [1, 2, 3]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_generate_body_is_rejected() {
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let app = test_app(models.path(), work.path());

    let status = post_json(&app, "/api/generate", r#"{"prompt": "missing model"}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}
