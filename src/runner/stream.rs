//! Completion stream adaptation.
//!
//! The runner answers `/completion` with newline-delimited `data: {json}`
//! events. This module turns that into an ordered sequence of [`TokenEvent`]s
//! on a channel, absorbing slot-busy retries and mapping transport failures
//! onto the daemon's error kinds.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Single completion lines can carry a token plus large context; the framer
/// refuses anything longer than this.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

const MAX_ATTEMPTS: u32 = 3;
/// Unusually small on purpose: the slot frees up within microseconds when the
/// previous request has just finished. Doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_micros(100);

const SLOT_BUSY_MARKER: &[u8] = b"slot unavailable";
const DATA_PREFIX: &[u8] = b"data: ";

pub(crate) const OOM_HINT: &str =
    "you may not have enough available memory to run this model";

/// One event delivered to the caller. Either a token (`content` non-empty,
/// `done` false) or the terminal statistics event (`done` true, last event).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEvent {
    pub content: String,
    pub done: bool,
    pub prompt_eval_count: u64,
    pub prompt_eval_duration: Duration,
    pub eval_count: u64,
    pub eval_duration: Duration,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    timings: Timings,
}

#[derive(Debug, Default, Deserialize)]
struct Timings {
    #[serde(default)]
    predicted_n: u64,
    #[serde(default)]
    predicted_ms: f64,
    #[serde(default)]
    prompt_n: u64,
    #[serde(default)]
    prompt_ms: f64,
}

enum Outcome {
    Done,
    SlotBusy,
}

enum LineAction {
    Continue,
    SlotBusy,
    Done,
}

/// Stream one completion request, delivering events on `events` in arrival
/// order. Retries slot-busy rejections with exponential backoff; everything
/// else is surfaced to the caller.
pub async fn stream_completion(
    client: &Client,
    port: u16,
    body: &serde_json::Value,
    cancel: &CancellationToken,
    events: &mpsc::Sender<TokenEvent>,
) -> Result<()> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        match stream_once(client, port, body, cancel, events).await? {
            Outcome::Done => return Ok(()),
            Outcome::SlotBusy => {
                tracing::debug!(attempt, "runner slot unavailable, retrying");
            }
        }
    }
    Err(Error::SlotBusyExhausted)
}

async fn stream_once(
    client: &Client,
    port: u16,
    body: &serde_json::Value,
    cancel: &CancellationToken,
    events: &mpsc::Sender<TokenEvent>,
) -> Result<Outcome> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let url = format!("http://127.0.0.1:{port}/completion");

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = client.post(&url).json(body).send() => {
            r.map_err(|e| Error::RunnerCrashed(format!("completion request failed: {e}")))?
        }
    };

    let status = response.status();
    if status.as_u16() >= 400 {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = status.as_u16(), %body, "runner rejected completion");
        return Err(Error::TransportHttp {
            status: status.as_u16(),
            body,
        });
    }

    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            c = stream.next() => c,
        };

        let bytes = match chunk {
            None => break,
            Some(Err(e)) => {
                return Err(Error::RunnerCrashed(format!(
                    "connection to runner lost: {e}; {OOM_HINT}"
                )))
            }
            Some(Ok(bytes)) => bytes,
        };

        buf.extend_from_slice(&bytes);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line = buf[..pos].to_vec();
            buf.drain(..=pos);
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match handle_line(&line, events).await? {
                LineAction::Continue => {}
                LineAction::SlotBusy => return Ok(Outcome::SlotBusy),
                LineAction::Done => return Ok(Outcome::Done),
            }
        }

        if buf.len() > MAX_LINE_BYTES {
            return Err(Error::StreamMalformed(format!(
                "completion event exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
    }

    // A final line without a trailing newline still counts.
    if !buf.is_empty() {
        match handle_line(&buf, events).await? {
            LineAction::Continue => {}
            LineAction::SlotBusy => return Ok(Outcome::SlotBusy),
            LineAction::Done => return Ok(Outcome::Done),
        }
    }

    // The runner never sent its terminal event; it is gone.
    Err(Error::RunnerCrashed(format!(
        "runner stream ended before completion; {OOM_HINT}"
    )))
}

async fn handle_line(line: &[u8], events: &mpsc::Sender<TokenEvent>) -> Result<LineAction> {
    if line.is_empty() {
        return Ok(LineAction::Continue);
    }

    if line
        .windows(SLOT_BUSY_MARKER.len())
        .any(|w| w == SLOT_BUSY_MARKER)
    {
        return Ok(LineAction::SlotBusy);
    }

    let Some(event) = line.strip_prefix(DATA_PREFIX) else {
        return Err(Error::StreamMalformed(
            String::from_utf8_lossy(line).into_owned(),
        ));
    };

    let chunk: CompletionChunk = serde_json::from_slice(event).map_err(|e| {
        Error::StreamMalformed(format!("{e}: {}", String::from_utf8_lossy(event)))
    })?;

    if !chunk.content.is_empty() {
        let sent = events
            .send(TokenEvent {
                content: chunk.content,
                ..Default::default()
            })
            .await;
        if sent.is_err() {
            // Receiver is gone; stop reading.
            return Err(Error::Cancelled);
        }
    }

    if chunk.stop {
        let sent = events
            .send(TokenEvent {
                done: true,
                prompt_eval_count: chunk.timings.prompt_n,
                prompt_eval_duration: millis(chunk.timings.prompt_ms),
                eval_count: chunk.timings.predicted_n,
                eval_duration: millis(chunk.timings.predicted_ms),
                ..Default::default()
            })
            .await;
        if sent.is_err() {
            return Err(Error::Cancelled);
        }
        return Ok(LineAction::Done);
    }

    Ok(LineAction::Continue)
}

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}
