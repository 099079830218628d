//! Runner process lifecycle.
//!
//! Each loaded model runs in its own native runner process on an ephemeral
//! loopback port. The daemon owns the child: it builds the argument list from
//! the resolved plan, points the dynamic loader at the variant directory,
//! watches for exit, and refuses to hand out the process until the health
//! endpoint answers.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::payload::RUNNER_BINARY;
use crate::runner::options::RuntimeOptions;
use crate::runner::planner::LayerPlan;
use crate::runner::stream::{self, TokenEvent, OOM_HINT};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grammar constraining output to strict JSON, injected when the caller asks
/// for `format: "json"`.
pub const JSON_GRAMMAR: &str = r#"
root   ::= object
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]) # escapes
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? ws

# Optional space: by convention, applied in this grammar after literal chars when allowed
ws ::= ([ \t\n] ws)?
"#;

/// Runner lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Starting,
    Ready,
    Closing,
    Closed,
    /// Health wait timed out or the process exited during startup.
    Failed,
    /// The process exited while accepting requests.
    Crashed,
}

/// An image attached to a completion request, base64-encoded for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub data: String,
    pub id: i32,
}

/// One completion call against a running runner.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// `Some("json")` constrains output with [`JSON_GRAMMAR`].
    pub format: Option<String>,
    pub images: Vec<ImageData>,
    pub options: RuntimeOptions,
}

/// Everything needed to start one runner.
pub struct SpawnConfig<'a> {
    pub model: &'a Path,
    pub adapters: &'a [PathBuf],
    pub projectors: &'a [PathBuf],
    pub plan: &'a LayerPlan,
    pub opts: &'a RuntimeOptions,
    /// Directory holding this variant's binary and shared libraries.
    pub variant_dir: &'a Path,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// A live runner process and the loopback client speaking to it.
#[derive(Debug)]
pub struct RunnerProcess {
    port: u16,
    pid: Option<u32>,
    client: Client,
    state: RwLock<RunnerState>,
    exit: watch::Receiver<Option<String>>,
    kill: CancellationToken,
    shutdown_timeout: Duration,
}

impl RunnerProcess {
    /// Start a runner and wait for it to become healthy. On any failure the
    /// child is torn down before the error is returned.
    pub async fn spawn(cfg: SpawnConfig<'_>) -> Result<RunnerProcess> {
        let port: u16 = rand::thread_rng().gen_range(49152..65535);
        let args = build_args(cfg.model, cfg.plan, cfg.opts, cfg.adapters, cfg.projectors, port);
        let binary = cfg.variant_dir.join(binary_name());

        tracing::info!(binary = %binary.display(), port, "starting inference runner");
        tracing::debug!(?args, "runner arguments");

        let mut child = Command::new(&binary)
            .args(&args)
            .env(loader_path_var(), loader_path_value(cfg.variant_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", binary.display())))?;

        let pid = child.id();
        if let Some(out) = child.stdout.take() {
            forward_logs(out, port);
        }
        if let Some(err) = child.stderr.take() {
            forward_logs(err, port);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let watcher_kill = kill.clone();
        tokio::spawn(async move {
            let cause = tokio::select! {
                status = child.wait() => exit_cause(status),
                _ = watcher_kill.cancelled() => {
                    let _ = child.start_kill();
                    exit_cause(child.wait().await)
                }
            };
            tracing::debug!(%cause, "runner process reaped");
            let _ = exit_tx.send(Some(cause));
        });

        let runner = RunnerProcess {
            port,
            pid,
            client: Client::new(),
            state: RwLock::new(RunnerState::Starting),
            exit: exit_rx,
            kill,
            shutdown_timeout: cfg.shutdown_timeout,
        };

        if let Err(e) = runner.wait_until_ready(cfg.startup_timeout).await {
            *runner.state.write().await = RunnerState::Failed;
            runner.close().await;
            return Err(e);
        }
        Ok(runner)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn state(&self) -> RunnerState {
        *self.state.read().await
    }

    /// Poll the health endpoint until it answers, the process exits, or the
    /// deadline passes.
    async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticker = interval(HEALTH_POLL_INTERVAL);
        let mut exit = self.exit.clone();

        tracing::info!(port = self.port, "waiting for runner to start responding");
        loop {
            tokio::select! {
                _ = exit.changed() => {
                    let cause = exit
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "runner exited".to_string());
                    return Err(Error::Spawn(format!("runner process terminated: {cause}")));
                }
                _ = ticker.tick() => {
                    if Instant::now() > deadline {
                        return Err(Error::Spawn(
                            "timed out waiting for runner to start".to_string(),
                        ));
                    }
                    if self.ping().await.is_ok() {
                        *self.state.write().await = RunnerState::Ready;
                        tracing::info!(
                            port = self.port,
                            elapsed = ?started.elapsed(),
                            "runner is ready"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/", self.port);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("ping: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "unexpected ping status: {}",
                response.status()
            )))
        }
    }

    /// Run one completion, streaming events to `events` in arrival order.
    pub async fn completion(
        &self,
        req: &CompletionRequest,
        cancel: &CancellationToken,
        events: &mpsc::Sender<TokenEvent>,
    ) -> Result<()> {
        let body = build_completion_body(req);
        let result = stream::stream_completion(&self.client, self.port, &body, cancel, events).await;
        if matches!(result, Err(Error::RunnerCrashed(_))) {
            *self.state.write().await = RunnerState::Crashed;
        }
        result
    }

    pub async fn embedding(&self, prompt: &str) -> Result<Vec<f64>> {
        #[derive(Serialize)]
        struct Request<'a> {
            content: &'a str,
        }
        #[derive(Deserialize)]
        struct Response {
            embedding: Vec<f64>,
        }
        let response: Response = self.post_json("embedding", &Request { content: prompt }).await?;
        Ok(response.embedding)
    }

    pub async fn tokenize(&self, content: &str) -> Result<Vec<i32>> {
        #[derive(Serialize)]
        struct Request<'a> {
            content: &'a str,
        }
        #[derive(Deserialize)]
        struct Response {
            tokens: Vec<i32>,
        }
        let response: Response = self.post_json("tokenize", &Request { content }).await?;
        Ok(response.tokens)
    }

    pub async fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        #[derive(Serialize)]
        struct Request<'a> {
            tokens: &'a [i32],
        }
        #[derive(Deserialize)]
        struct Response {
            content: String,
        }
        let response: Response = self.post_json("detokenize", &Request { tokens }).await?;
        Ok(response.content)
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("http://127.0.0.1:{}/{endpoint}", self.port);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), %body, endpoint, "runner request failed");
            return Err(Error::TransportHttp {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::StreamMalformed(format!("decode {endpoint} response: {e}")))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if let Some(cause) = self.exit.borrow().clone() {
            Error::RunnerCrashed(format!("{cause}; {OOM_HINT}"))
        } else {
            Error::Internal(format!("runner request failed: {e}"))
        }
    }

    /// Stop the runner: SIGTERM, a grace period, then SIGKILL. When this
    /// returns the process has been signalled and no further requests may be
    /// submitted.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, RunnerState::Closing | RunnerState::Closed) {
                return;
            }
            *state = RunnerState::Closing;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        self.kill.cancel();

        let mut exit = self.exit.clone();
        let timed_out = tokio::time::timeout(self.shutdown_timeout, exit.wait_for(|v| v.is_some()))
            .await
            .is_err();
        if timed_out {
            tracing::warn!(port = self.port, "runner did not stop gracefully, killing");
            self.kill.cancel();
            let _ = exit.wait_for(|v| v.is_some()).await;
        }

        *self.state.write().await = RunnerState::Closed;
        tracing::debug!(port = self.port, "runner closed");
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        // The exit watcher owns the child; make sure it reaps it.
        self.kill.cancel();
    }
}

fn exit_cause(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(s) => format!("runner exited with {s}"),
        Err(e) => format!("failed to reap runner: {e}"),
    }
}

fn forward_logs(stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, port: u16) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(port, "{line}");
        }
    });
}

fn binary_name() -> String {
    if cfg!(target_os = "windows") {
        format!("{RUNNER_BINARY}.exe")
    } else {
        RUNNER_BINARY.to_string()
    }
}

fn loader_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(target_os = "windows") {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// The variant directory goes in front so its libraries shadow anything the
/// host already has.
fn loader_path_value(variant_dir: &Path) -> String {
    let sep = if cfg!(target_os = "windows") { ';' } else { ':' };
    match std::env::var(loader_path_var()) {
        Ok(existing) if !existing.is_empty() => {
            format!("{}{sep}{existing}", variant_dir.display())
        }
        _ => variant_dir.display().to_string(),
    }
}

fn debug_enabled() -> bool {
    std::env::var("RUNNERD_DEBUG").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Format the runner's command line from the resolved plan and options.
pub(crate) fn build_args(
    model: &Path,
    plan: &LayerPlan,
    opts: &RuntimeOptions,
    adapters: &[PathBuf],
    projectors: &[PathBuf],
    port: u16,
) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        model.display().to_string(),
        "--ctx-size".to_string(),
        plan.num_ctx.to_string(),
        "--batch-size".to_string(),
        opts.num_batch.to_string(),
        "--embedding".to_string(),
    ];

    if debug_enabled() {
        args.push("--verbose".to_string());
    } else {
        args.push("--log-disable".to_string());
    }

    if plan.num_gpu > 0 {
        args.push("--n-gpu-layers".to_string());
        args.push(plan.num_gpu.to_string());
    }

    if opts.main_gpu > 0 {
        args.push("--main-gpu".to_string());
        args.push(opts.main_gpu.to_string());
    }

    if opts.rope_frequency_base > 0.0 {
        args.push("--rope-freq-base".to_string());
        args.push(opts.rope_frequency_base.to_string());
    }

    if opts.rope_frequency_scale > 0.0 {
        args.push("--rope-freq-scale".to_string());
        args.push(opts.rope_frequency_scale.to_string());
    }

    // The runner applies at most one of each.
    if let Some(adapter) = adapters.first() {
        args.push("--lora".to_string());
        args.push(adapter.display().to_string());
    }
    if let Some(projector) = projectors.first() {
        args.push("--mmproj".to_string());
        args.push(projector.display().to_string());
    }

    if opts.num_thread > 0 {
        args.push("--threads".to_string());
        args.push(opts.num_thread.to_string());
    }

    if !opts.f16_kv {
        args.push("--memory-f32".to_string());
    }
    if opts.use_mlock {
        args.push("--mlock".to_string());
    }
    if !opts.use_mmap {
        args.push("--no-mmap".to_string());
    }
    if opts.use_numa {
        args.push("--numa".to_string());
    }

    args.push("--port".to_string());
    args.push(port.to_string());

    args
}

/// Assemble the `/completion` request body. Sampling parameters pass through
/// unchanged; `format: "json"` adds the grammar constraint.
pub(crate) fn build_completion_body(req: &CompletionRequest) -> serde_json::Value {
    let opts = &req.options;
    let mut body = json!({
        "prompt": req.prompt,
        "stream": true,
        "n_predict": opts.num_predict,
        "n_keep": opts.num_keep,
        "main_gpu": opts.main_gpu,
        "temperature": opts.temperature,
        "top_k": opts.top_k,
        "top_p": opts.top_p,
        "tfs_z": opts.tfs_z,
        "typical_p": opts.typical_p,
        "repeat_last_n": opts.repeat_last_n,
        "repeat_penalty": opts.repeat_penalty,
        "presence_penalty": opts.presence_penalty,
        "frequency_penalty": opts.frequency_penalty,
        "mirostat": opts.mirostat,
        "mirostat_tau": opts.mirostat_tau,
        "mirostat_eta": opts.mirostat_eta,
        "penalize_nl": opts.penalize_newline,
        "seed": opts.seed,
        "stop": opts.stop,
        "image_data": req.images,
    });

    if req.format.as_deref() == Some("json") {
        body["grammar"] = serde_json::Value::String(JSON_GRAMMAR.to_string());
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::planner::LayerPlan;

    fn plan(num_ctx: i32, num_gpu: i32) -> LayerPlan {
        LayerPlan {
            num_ctx,
            num_gpu,
            library: "cuda".to_string(),
            variant: "v12".to_string(),
        }
    }

    fn request(format: Option<&str>) -> CompletionRequest {
        CompletionRequest {
            prompt: "why is the sky <blue> & not \"green\"?".to_string(),
            format: format.map(str::to_string),
            images: vec![],
            options: RuntimeOptions::default(),
        }
    }

    #[test]
    fn args_carry_resolved_context_and_port() {
        let opts = RuntimeOptions::default();
        let args = build_args(Path::new("/models/m.gguf"), &plan(2048, 0), &opts, &[], &[], 50123);

        let joined = args.join(" ");
        assert!(joined.contains("--model /models/m.gguf"));
        assert!(joined.contains("--ctx-size 2048"));
        assert!(joined.contains("--batch-size 512"));
        assert!(joined.contains("--embedding"));
        assert!(joined.contains("--log-disable"));
        assert!(joined.ends_with("--port 50123"));
        // cpu plan: no offload flag
        assert!(!joined.contains("--n-gpu-layers"));
    }

    #[test]
    fn args_include_offload_and_memory_flags() {
        let opts = RuntimeOptions {
            f16_kv: false,
            use_mmap: false,
            use_mlock: true,
            use_numa: true,
            num_thread: 8,
            main_gpu: 1,
            ..Default::default()
        };
        let args = build_args(Path::new("/m.gguf"), &plan(4096, 22), &opts, &[], &[], 50000);

        let joined = args.join(" ");
        assert!(joined.contains("--n-gpu-layers 22"));
        assert!(joined.contains("--main-gpu 1"));
        assert!(joined.contains("--threads 8"));
        assert!(joined.contains("--memory-f32"));
        assert!(joined.contains("--mlock"));
        assert!(joined.contains("--no-mmap"));
        assert!(joined.contains("--numa"));
    }

    #[test]
    fn rope_overrides_only_when_set() {
        let mut opts = RuntimeOptions::default();
        let args = build_args(Path::new("/m.gguf"), &plan(2048, 0), &opts, &[], &[], 50000);
        assert!(!args.join(" ").contains("--rope-freq"));

        opts.rope_frequency_base = 1000000.0;
        opts.rope_frequency_scale = 0.5;
        let args = build_args(Path::new("/m.gguf"), &plan(2048, 0), &opts, &[], &[], 50000);
        let joined = args.join(" ");
        assert!(joined.contains("--rope-freq-base 1000000"));
        assert!(joined.contains("--rope-freq-scale 0.5"));
    }

    #[test]
    fn only_first_adapter_and_projector_forwarded() {
        let opts = RuntimeOptions::default();
        let adapters = vec![PathBuf::from("/a/one.bin"), PathBuf::from("/a/two.bin")];
        let projectors = vec![PathBuf::from("/p/proj.bin")];
        let args =
            build_args(Path::new("/m.gguf"), &plan(2048, 0), &opts, &adapters, &projectors, 50000);

        let joined = args.join(" ");
        assert!(joined.contains("--lora /a/one.bin"));
        assert!(!joined.contains("two.bin"));
        assert!(joined.contains("--mmproj /p/proj.bin"));
    }

    #[test]
    fn completion_body_passes_prompt_verbatim() {
        let body = build_completion_body(&request(None));
        assert_eq!(
            body["prompt"],
            json!("why is the sky <blue> & not \"green\"?")
        );
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["n_predict"], json!(128));
        assert_eq!(body["temperature"], json!(0.8f32));
        assert!(body.get("grammar").is_none());
        // angle brackets and ampersands must survive serialization verbatim
        let encoded = serde_json::to_string(&body).unwrap();
        assert!(encoded.contains("<blue>"));
        assert!(encoded.contains("&"));
    }

    #[test]
    fn json_format_injects_grammar_and_nothing_else() {
        let plain = build_completion_body(&request(None));
        let mut constrained = build_completion_body(&request(Some("json")));

        assert_eq!(constrained["grammar"], json!(JSON_GRAMMAR));
        constrained.as_object_mut().unwrap().remove("grammar");
        assert_eq!(plain, constrained);
    }

    #[test]
    fn loader_path_starts_with_variant_dir() {
        let value = loader_path_value(Path::new("/work/cuda_v12"));
        assert!(value.starts_with("/work/cuda_v12"));
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RuntimeOptions::default();
        let cfg = SpawnConfig {
            model: Path::new("/m.gguf"),
            adapters: &[],
            projectors: &[],
            plan: &plan(2048, 0),
            opts: &opts,
            variant_dir: dir.path(),
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(100),
        };

        let err = RunnerProcess::spawn(cfg).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_reported_as_spawn_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(RUNNER_BINARY);
        std::fs::write(&binary, "#!/bin/sh\nexit 7\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let opts = RuntimeOptions::default();
        let cfg = SpawnConfig {
            model: Path::new("/m.gguf"),
            adapters: &[],
            projectors: &[],
            plan: &plan(2048, 0),
            opts: &opts,
            variant_dir: dir.path(),
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_millis(100),
        };

        let err = RunnerProcess::spawn(cfg).await.unwrap_err();
        match err {
            Error::Spawn(msg) => assert!(msg.contains("terminated"), "{msg}"),
            other => panic!("expected Spawn, got {other:?}"),
        }
    }
}
