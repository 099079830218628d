//! Per-request runtime options.

use serde::{Deserialize, Serialize};

/// Offload-count sentinel meaning "put every layer on the accelerator".
pub const ALL_LAYERS: i32 = 999;

/// Options controlling how a model is loaded and sampled.
///
/// Load-time fields (`num_ctx`, `num_batch`, `num_gpu`, memory flags) are
/// fixed when the runner is spawned; sampling fields travel with each
/// completion request. Absent fields in a request body fall back to these
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Requested context window. Clamped into `[4, model max]` by the planner.
    pub num_ctx: i32,
    /// Prompt batch size.
    pub num_batch: i32,
    /// Layer offload count: -1 auto, 0 CPU only, >0 exact, 999 all layers.
    pub num_gpu: i32,
    pub main_gpu: i32,
    /// 0 lets the runner pick.
    pub num_thread: i32,
    pub num_predict: i32,
    pub num_keep: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub use_numa: bool,
    /// KV cache dtype: true = f16, false = f32.
    pub f16_kv: bool,
    /// 0.0 keeps the model's own RoPE base frequency.
    pub rope_frequency_base: f32,
    /// 0.0 keeps the model's own RoPE frequency scale.
    pub rope_frequency_scale: f32,

    // Sampling parameters, passed through to the runner unchanged.
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_newline: bool,
    pub seed: i32,
    pub stop: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: -1,
            main_gpu: 0,
            num_thread: 0,
            num_predict: 128,
            num_keep: 0,
            use_mmap: true,
            use_mlock: false,
            use_numa: false,
            f16_kv: true,
            rope_frequency_base: 0.0,
            rope_frequency_scale: 0.0,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
            seed: -1,
            stop: vec![],
        }
    }
}
