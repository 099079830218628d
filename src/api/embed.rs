//! Embedding and tokenization endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::runner::options::RuntimeOptions;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/embeddings", post(embeddings))
        .route("/tokenize", post(tokenize))
        .route("/detokenize", post(detokenize))
}

#[derive(Debug, Deserialize)]
struct EmbeddingsRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    options: RuntimeOptions,
}

#[derive(Debug, Serialize)]
struct EmbeddingsResponse {
    embedding: Vec<f64>,
}

/// POST /api/embeddings
async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>> {
    let embedding = state
        .scheduler
        .embedding(&request.model, request.options, &request.prompt)
        .await?;
    Ok(Json(EmbeddingsResponse { embedding }))
}

#[derive(Debug, Deserialize)]
struct TokenizeRequest {
    model: String,
    content: String,
    #[serde(default)]
    options: RuntimeOptions,
}

#[derive(Debug, Serialize)]
struct TokenizeResponse {
    tokens: Vec<i32>,
}

/// POST /api/tokenize
async fn tokenize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenizeRequest>,
) -> Result<Json<TokenizeResponse>> {
    let tokens = state
        .scheduler
        .tokenize(&request.model, request.options, &request.content)
        .await?;
    Ok(Json(TokenizeResponse { tokens }))
}

#[derive(Debug, Deserialize)]
struct DetokenizeRequest {
    model: String,
    tokens: Vec<i32>,
    #[serde(default)]
    options: RuntimeOptions,
}

#[derive(Debug, Serialize)]
struct DetokenizeResponse {
    content: String,
}

/// POST /api/detokenize
async fn detokenize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DetokenizeRequest>,
) -> Result<Json<DetokenizeResponse>> {
    let content = state
        .scheduler
        .detokenize(&request.model, request.options, &request.tokens)
        .await?;
    Ok(Json(DetokenizeResponse { content }))
}
