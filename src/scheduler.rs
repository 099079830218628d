//! Request scheduling.
//!
//! Single entry point used by the HTTP layer: resolve the model reference,
//! make sure a healthy runner exists for it, and forward the request under
//! the runner's one-slot concurrency contract. The scheduler is the only
//! component that creates and destroys runner processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::accel::AcceleratorProbe;
use crate::config::{DaemonConfig, RunnerSettings};
use crate::error::{Error, Result};
use crate::model::ModelIntrospector;
use crate::payload::PayloadStore;
use crate::runner::options::RuntimeOptions;
use crate::runner::planner;
use crate::runner::process::{
    CompletionRequest, ImageData, RunnerProcess, RunnerState, SpawnConfig,
};
use crate::runner::stream::TokenEvent;
use crate::runner::variant::select_variants;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A completion forwarded by the HTTP layer.
#[derive(Debug, Clone)]
pub struct CompletionJob {
    pub prompt: String,
    pub format: Option<String>,
    pub images: Vec<ImageData>,
    pub options: RuntimeOptions,
    pub adapters: Vec<PathBuf>,
    pub projectors: Vec<PathBuf>,
}

/// One live runner keyed by model path.
struct ActiveRunner {
    process: RunnerProcess,
    /// One request in flight per runner; waiters queue in FIFO order.
    slot: Mutex<()>,
    last_used: RwLock<Instant>,
    /// Load-time configuration the runner was spawned with. A request with a
    /// different load configuration replaces the runner.
    fingerprint: String,
}

impl ActiveRunner {
    async fn touch(&self) {
        *self.last_used.write().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_used.read().await.elapsed()
    }
}

pub struct Scheduler {
    payloads: Arc<PayloadStore>,
    introspector: Arc<dyn ModelIntrospector>,
    probe: Arc<dyn AcceleratorProbe>,
    settings: RunnerSettings,
    models_dir: PathBuf,
    runners: RwLock<HashMap<PathBuf, Arc<ActiveRunner>>>,
    /// Loading two models at once would fight for host memory; spawns are
    /// serialized.
    startup: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        config: &DaemonConfig,
        payloads: Arc<PayloadStore>,
        introspector: Arc<dyn ModelIntrospector>,
        probe: Arc<dyn AcceleratorProbe>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            payloads,
            introspector,
            probe,
            settings: config.runner.clone(),
            models_dir: PathBuf::from(&config.models.dir),
            runners: RwLock::new(HashMap::new()),
            startup: Mutex::new(()),
        });
        scheduler.start_idle_sweeper();
        scheduler
    }

    /// Resolve a model reference to a file on disk. Bare names resolve under
    /// the configured models directory; explicit `.gguf` paths are used as
    /// given.
    pub async fn resolve_model(&self, model_ref: &str) -> Result<PathBuf> {
        let candidate = if model_ref.ends_with(".gguf") {
            PathBuf::from(model_ref)
        } else {
            self.models_dir.join(format!("{model_ref}.gguf"))
        };

        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Ok(candidate),
            _ => Err(Error::NotFound(model_ref.to_string())),
        }
    }

    /// Run one completion, streaming events to `events` in arrival order.
    pub async fn completion(
        &self,
        model_ref: &str,
        job: CompletionJob,
        cancel: CancellationToken,
        events: mpsc::Sender<TokenEvent>,
    ) -> Result<()> {
        if let Some(format) = job.format.as_deref() {
            if !format.is_empty() && format != "json" {
                return Err(Error::Config(format!("unsupported output format {format:?}")));
            }
        }

        let path = self.resolve_model(model_ref).await?;
        let runner = self
            .ensure_runner(&path, &job.options, &job.adapters, &job.projectors)
            .await?;

        let _slot = runner.slot.lock().await;
        runner.touch().await;

        let request = CompletionRequest {
            prompt: job.prompt,
            format: job.format,
            images: job.images,
            options: job.options,
        };
        let result = runner.process.completion(&request, &cancel, &events).await;
        if matches!(result, Err(Error::RunnerCrashed(_))) {
            self.discard(&path, &runner).await;
        } else {
            runner.touch().await;
        }
        result
    }

    pub async fn embedding(
        &self,
        model_ref: &str,
        options: RuntimeOptions,
        prompt: &str,
    ) -> Result<Vec<f64>> {
        let path = self.resolve_model(model_ref).await?;
        let runner = self.ensure_runner(&path, &options, &[], &[]).await?;

        let _slot = runner.slot.lock().await;
        runner.touch().await;
        let result = runner.process.embedding(prompt).await;
        if matches!(result, Err(Error::RunnerCrashed(_))) {
            self.discard(&path, &runner).await;
        }
        result
    }

    pub async fn tokenize(
        &self,
        model_ref: &str,
        options: RuntimeOptions,
        content: &str,
    ) -> Result<Vec<i32>> {
        let path = self.resolve_model(model_ref).await?;
        let runner = self.ensure_runner(&path, &options, &[], &[]).await?;

        let _slot = runner.slot.lock().await;
        runner.touch().await;
        let result = runner.process.tokenize(content).await;
        if matches!(result, Err(Error::RunnerCrashed(_))) {
            self.discard(&path, &runner).await;
        }
        result
    }

    pub async fn detokenize(
        &self,
        model_ref: &str,
        options: RuntimeOptions,
        tokens: &[i32],
    ) -> Result<String> {
        let path = self.resolve_model(model_ref).await?;
        let runner = self.ensure_runner(&path, &options, &[], &[]).await?;

        let _slot = runner.slot.lock().await;
        runner.touch().await;
        let result = runner.process.detokenize(tokens).await;
        if matches!(result, Err(Error::RunnerCrashed(_))) {
            self.discard(&path, &runner).await;
        }
        result
    }

    /// Close every live runner. Called at daemon shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.runners.write().await.drain().collect();
        for (path, runner) in drained {
            tracing::info!(model = %path.display(), "closing runner");
            runner.process.close().await;
        }
    }

    /// Get the live runner for this model, spawning one if needed.
    async fn ensure_runner(
        &self,
        path: &Path,
        opts: &RuntimeOptions,
        adapters: &[PathBuf],
        projectors: &[PathBuf],
    ) -> Result<Arc<ActiveRunner>> {
        let fingerprint = load_fingerprint(opts, adapters, projectors);

        if let Some(existing) = self.runners.read().await.get(path) {
            if existing.fingerprint == fingerprint
                && existing.process.state().await == RunnerState::Ready
            {
                existing.touch().await;
                return Ok(existing.clone());
            }
        }

        let _startup = self.startup.lock().await;

        // Another request may have spawned it while this one waited.
        if let Some(existing) = self.runners.read().await.get(path) {
            if existing.fingerprint == fingerprint
                && existing.process.state().await == RunnerState::Ready
            {
                existing.touch().await;
                return Ok(existing.clone());
            }
        }
        if let Some(stale) = self.runners.write().await.remove(path) {
            tracing::info!(model = %path.display(), "replacing runner");
            stale.process.close().await;
        }

        let descriptor = self.introspector.introspect(path).await?;
        let accel = self.probe.probe().await;
        let plan = planner::plan(&descriptor, opts, &accel, adapters, projectors)?;

        // Selection runs against the planned library: a CPU downgrade must
        // not pick a GPU build.
        let mut selection = accel.clone();
        selection.library = plan.library.clone();
        selection.variant = plan.variant.clone();

        let available = self.payloads.available();
        let candidates: Vec<String> = select_variants(&selection, &available)
            .into_iter()
            .filter(|tag| available.contains_key(tag))
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoBackend(format!(
                "no runner build for {} on this host",
                selection.requested_tag()
            )));
        }

        let mut last_err = None;
        for tag in &candidates {
            tracing::info!(variant = %tag, model = %path.display(), "spawning runner");
            let spawned = RunnerProcess::spawn(SpawnConfig {
                model: path,
                adapters,
                projectors,
                plan: &plan,
                opts,
                variant_dir: &available[tag],
                startup_timeout: Duration::from_secs(self.settings.startup_timeout_secs),
                shutdown_timeout: Duration::from_secs(self.settings.shutdown_timeout_secs),
            })
            .await;

            match spawned {
                Ok(process) => {
                    let runner = Arc::new(ActiveRunner {
                        process,
                        slot: Mutex::new(()),
                        last_used: RwLock::new(Instant::now()),
                        fingerprint,
                    });
                    self.runners
                        .write()
                        .await
                        .insert(path.to_path_buf(), runner.clone());
                    return Ok(runner);
                }
                Err(e) => {
                    tracing::warn!(variant = %tag, error = %e, "runner variant failed to start");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::NoBackend(format!(
                "no runner build for {} on this host",
                selection.requested_tag()
            ))
        }))
    }

    /// Drop a runner after a crash so the next request spawns afresh.
    async fn discard(&self, path: &Path, runner: &Arc<ActiveRunner>) {
        let removed = {
            let mut runners = self.runners.write().await;
            match runners.get(path) {
                Some(current) if Arc::ptr_eq(current, runner) => runners.remove(path),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            tracing::warn!(model = %path.display(), "discarding crashed runner");
            removed.process.close().await;
        }
    }

    fn start_idle_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else { break };
                scheduler.sweep_idle().await;
            }
        });
    }

    async fn sweep_idle(&self) {
        let idle_after = Duration::from_secs(self.settings.idle_timeout_secs);
        let mut expired = Vec::new();
        {
            let runners = self.runners.read().await;
            for (path, runner) in runners.iter() {
                if runner.idle_for().await >= idle_after {
                    expired.push((path.clone(), runner.clone()));
                }
            }
        }
        for (path, runner) in expired {
            tracing::info!(model = %path.display(), "closing idle runner");
            self.discard(&path, &runner).await;
        }
    }
}

/// The load-time parameters a runner is spawned with. Sampling fields are
/// excluded; they travel with each request.
fn load_fingerprint(opts: &RuntimeOptions, adapters: &[PathBuf], projectors: &[PathBuf]) -> String {
    format!(
        "ctx={} batch={} gpu={} main={} threads={} f16kv={} mmap={} mlock={} numa={} \
         rope={}:{} adapters={adapters:?} projectors={projectors:?}",
        opts.num_ctx,
        opts.num_batch,
        opts.num_gpu,
        opts.main_gpu,
        opts.num_thread,
        opts.f16_kv,
        opts.use_mmap,
        opts.use_mlock,
        opts.use_numa,
        opts.rope_frequency_base,
        opts.rope_frequency_scale,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AcceleratorInfo;
    use crate::config::DaemonConfig;
    use crate::model::ModelDescriptor;
    use async_trait::async_trait;

    struct FixedIntrospector(ModelDescriptor);

    #[async_trait]
    impl ModelIntrospector for FixedIntrospector {
        async fn introspect(&self, _path: &Path) -> Result<ModelDescriptor> {
            Ok(self.0.clone())
        }
    }

    struct FixedProbe(AcceleratorInfo);

    #[async_trait]
    impl AcceleratorProbe for FixedProbe {
        async fn probe(&self) -> AcceleratorInfo {
            self.0.clone()
        }
    }

    fn descriptor(path: &Path) -> ModelDescriptor {
        ModelDescriptor {
            path: path.to_path_buf(),
            size_bytes: 1 << 30,
            layer_count: 26,
            embedding_dim: 3200,
            head_count: 32,
            kv_head_count: 32,
            max_context: 2048,
        }
    }

    fn cpu_probe() -> FixedProbe {
        FixedProbe(AcceleratorInfo {
            library: "cpu".to_string(),
            variant: String::new(),
            cpu_flag: String::new(),
            device_count: 0,
            vram_bytes: 0,
            os: "linux".to_string(),
        })
    }

    fn test_config(models_dir: &Path) -> DaemonConfig {
        let mut config = DaemonConfig {
            api: Default::default(),
            models: Default::default(),
            runner: Default::default(),
        };
        config.models.dir = models_dir.display().to_string();
        config.runner.startup_timeout_secs = 1;
        config.runner.shutdown_timeout_secs = 1;
        config
    }

    fn scheduler_with(
        models_dir: &Path,
        work_dir: &Path,
        descriptor: ModelDescriptor,
        probe: FixedProbe,
    ) -> Arc<Scheduler> {
        Scheduler::new(
            &test_config(models_dir),
            Arc::new(PayloadStore::new(work_dir.to_path_buf())),
            Arc::new(FixedIntrospector(descriptor)),
            Arc::new(probe),
        )
    }

    #[test]
    fn fingerprint_tracks_load_options_only() {
        let base = RuntimeOptions::default();
        let same = RuntimeOptions {
            temperature: 0.1,
            top_k: 5,
            ..RuntimeOptions::default()
        };
        let different = RuntimeOptions {
            num_ctx: 8192,
            ..RuntimeOptions::default()
        };

        let a = load_fingerprint(&base, &[], &[]);
        assert_eq!(a, load_fingerprint(&same, &[], &[]));
        assert_ne!(a, load_fingerprint(&different, &[], &[]));
        assert_ne!(
            a,
            load_fingerprint(&base, &[PathBuf::from("adapter.bin")], &[])
        );
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let model_path = models.path().join("missing.gguf");
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        let err = scheduler.resolve_model("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn bare_names_resolve_under_models_dir() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let model_path = models.path().join("tiny.gguf");
        std::fs::write(&model_path, b"stub").unwrap();
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        assert_eq!(scheduler.resolve_model("tiny").await.unwrap(), model_path);
        assert_eq!(
            scheduler
                .resolve_model(model_path.to_str().unwrap())
                .await
                .unwrap(),
            model_path
        );
    }

    #[tokio::test]
    async fn no_extracted_variants_is_no_backend() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let model_path = models.path().join("tiny.gguf");
        std::fs::write(&model_path, b"stub").unwrap();
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        let err = scheduler
            .embedding("tiny", RuntimeOptions::default(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackend(_)), "{err:?}");
    }

    #[tokio::test]
    async fn variant_without_binary_surfaces_spawn_error() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(work.path().join("cpu")).unwrap();
        let model_path = models.path().join("tiny.gguf");
        std::fs::write(&model_path, b"stub").unwrap();
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        let err = scheduler
            .embedding("tiny", RuntimeOptions::default(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)), "{err:?}");
    }

    #[tokio::test]
    async fn adapter_multiplicity_is_rejected_before_spawn() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let model_path = models.path().join("tiny.gguf");
        std::fs::write(&model_path, b"stub").unwrap();
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        let (events, _rx) = mpsc::channel(8);
        let job = CompletionJob {
            prompt: "hi".to_string(),
            format: None,
            images: vec![],
            options: RuntimeOptions::default(),
            adapters: vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")],
            projectors: vec![],
        };
        let err = scheduler
            .completion("tiny", job, CancellationToken::new(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let models = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let model_path = models.path().join("tiny.gguf");
        std::fs::write(&model_path, b"stub").unwrap();
        let scheduler = scheduler_with(
            models.path(),
            work.path(),
            descriptor(&model_path),
            cpu_probe(),
        );

        let (events, _rx) = mpsc::channel(8);
        let job = CompletionJob {
            prompt: "hi".to_string(),
            format: Some("xml".to_string()),
            images: vec![],
            options: RuntimeOptions::default(),
            adapters: vec![],
            projectors: vec![],
        };
        let err = scheduler
            .completion("tiny", job, CancellationToken::new(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }
}
