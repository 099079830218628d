//! Configuration for the daemon.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory against which bare model names resolve (`<dir>/<name>.gguf`).
    #[serde(default = "default_models_dir")]
    pub dir: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
        }
    }
}

/// Settings governing runner process lifecycle.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    /// How long to wait for a freshly spawned runner to answer its health
    /// check. Large models can take minutes to load.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Idle runners are closed after this long without a request.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on close.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Override for the payload extraction directory. Defaults to a
    /// per-process directory under the system temp dir.
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            work_dir: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    11435
}
fn default_models_dir() -> String {
    "./models".to_string()
}
fn default_startup_timeout() -> u64 {
    180
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_shutdown_timeout() -> u64 {
    10
}

impl DaemonConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Sources, in order of precedence:
    /// 1. Environment variables (`RUNNERD__SECTION__KEY` format)
    /// 2. `config.toml` (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default("models.dir", default_models_dir())?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("RUNNERD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
