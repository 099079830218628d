//! Text generation endpoint.
//!
//! Streams newline-delimited JSON back to the client: one line per token,
//! then a terminal line carrying the runner's timing statistics. Client
//! disconnects cancel the in-flight completion.

use std::convert::Infallible;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::runner::options::RuntimeOptions;
use crate::runner::process::ImageData;
use crate::runner::stream::TokenEvent;
use crate::scheduler::CompletionJob;
use crate::state::AppState;

/// Build the generation router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/generate", post(generate))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub images: Vec<ImageData>,
    /// `"json"` constrains the output to valid JSON.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub options: RuntimeOptions,
    #[serde(default)]
    pub adapter: Option<PathBuf>,
    #[serde(default)]
    pub projector: Option<PathBuf>,
}

/// POST /api/generate - stream a completion as NDJSON.
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response> {
    // Resolve up front so a missing model fails with a status code instead
    // of mid-stream.
    state.scheduler.resolve_model(&request.model).await?;

    let cancel = CancellationToken::new();
    let (lines_tx, lines_rx) = mpsc::channel::<Bytes>(32);

    let scheduler = state.scheduler.clone();
    let worker_cancel = cancel.clone();
    tokio::spawn(async move {
        let model = request.model;
        let job = CompletionJob {
            prompt: request.prompt,
            format: request.format,
            images: request.images,
            options: request.options,
            adapters: request.adapter.into_iter().collect(),
            projectors: request.projector.into_iter().collect(),
        };

        let (events_tx, mut events_rx) = mpsc::channel::<TokenEvent>(32);
        let mut job_fut = pin!(scheduler.completion(&model, job, worker_cancel.clone(), events_tx));
        let mut job_result: Option<Result<()>> = None;

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => {
                        if lines_tx.send(event_line(&event)).await.is_err() {
                            // client went away
                            worker_cancel.cancel();
                        }
                    }
                    None => break,
                },
                result = &mut job_fut, if job_result.is_none() => job_result = Some(result),
            }
        }

        if let Some(Err(e)) = job_result {
            if !matches!(e, Error::Cancelled) {
                tracing::error!(model = %model, error = %e, "completion failed");
                let _ = lines_tx.send(error_line(&e)).await;
            }
        }
    });

    // Dropping the body drops the guard, which cancels the worker.
    let guard = cancel.drop_guard();
    let stream = futures_util::stream::unfold((lines_rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), (rx, guard)))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

fn event_line(event: &TokenEvent) -> Bytes {
    let value = if event.done {
        json!({
            "response": "",
            "done": true,
            "prompt_eval_count": event.prompt_eval_count,
            "prompt_eval_duration": event.prompt_eval_duration.as_nanos() as u64,
            "eval_count": event.eval_count,
            "eval_duration": event.eval_duration.as_nanos() as u64,
        })
    } else {
        json!({"response": event.content, "done": false})
    };
    to_line(&value)
}

fn error_line(error: &Error) -> Bytes {
    to_line(&json!({"error": error.to_string(), "done": true}))
}

fn to_line(value: &serde_json::Value) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_line_shape() {
        let line = event_line(&TokenEvent {
            content: "hi".to_string(),
            ..Default::default()
        });
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["response"], json!("hi"));
        assert_eq!(value["done"], json!(false));
        assert!(line.ends_with(b"\n"));
    }

    #[test]
    fn terminal_line_carries_timings() {
        let line = event_line(&TokenEvent {
            done: true,
            prompt_eval_count: 7,
            prompt_eval_duration: Duration::from_millis(30),
            eval_count: 3,
            eval_duration: Duration::from_millis(120),
            ..Default::default()
        });
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["done"], json!(true));
        assert_eq!(value["prompt_eval_count"], json!(7));
        assert_eq!(value["eval_count"], json!(3));
        assert_eq!(value["eval_duration"], json!(120_000_000u64));
    }
}
