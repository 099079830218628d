//! Layer offload planning.
//!
//! Before a runner is spawned the planner has to answer: how many transformer
//! layers fit on the accelerator, or should this model run on CPU entirely.
//! The estimates are deliberately coarse; the constants are named so they can
//! be tuned against real runner allocations.

use std::path::PathBuf;

use crate::accel::AcceleratorInfo;
use crate::error::{Error, Result};
use crate::model::ModelDescriptor;
use crate::runner::options::{RuntimeOptions, ALL_LAYERS};

/// Smallest context window the runner accepts.
pub const MIN_CONTEXT: i32 = 4;

/// Scratch allocations beyond weights and KV cache, as a fraction of the
/// GQA-scaled KV cache. Empirical.
const GRAPH_OVERHEAD_DIVISOR: i64 = 6;

/// Resolved load parameters for one runner spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    /// Effective context window, clamped into `[MIN_CONTEXT, model max]`.
    pub num_ctx: i32,
    /// Layer offload count: 0 CPU only, `ALL_LAYERS` everything, else exact.
    pub num_gpu: i32,
    /// Library after planning; downgraded to `cpu` when the model cannot fit.
    pub library: String,
    pub variant: String,
}

/// KV cache footprint in bytes for one request at `num_ctx`.
///
/// Two matrices (K and V) of two bytes per f16 element. The same coefficient
/// is used when the caller selects f32 KV, matching the historical estimator;
/// real f32 usage is double this.
pub fn kv_cache_bytes(desc: &ModelDescriptor, num_ctx: i32) -> i64 {
    2 * 2
        * num_ctx as i64
        * desc.layer_count as i64
        * desc.embedding_dim as i64
        * desc.kv_head_count as i64
        / desc.head_count.max(1) as i64
}

/// Compute-graph scratch estimate in bytes.
pub fn graph_overhead_bytes(desc: &ModelDescriptor, kv: i64) -> i64 {
    desc.gqa() as i64 * kv / GRAPH_OVERHEAD_DIVISOR
}

/// Clamp the requested context window into what the model supports.
pub fn clamp_context(requested: i32, desc: &ModelDescriptor) -> i32 {
    let max = desc.max_context as i32;
    if requested > max {
        tracing::warn!(
            requested,
            max,
            "requested context length exceeds model maximum, using the maximum"
        );
        return max;
    }
    if requested < MIN_CONTEXT {
        return MIN_CONTEXT;
    }
    requested
}

/// Decide the offload count and effective library for this model on this
/// host. Honors an explicit caller choice, otherwise splits layers to fit
/// the estimated footprint, falling back to CPU when nothing fits.
pub fn plan(
    desc: &ModelDescriptor,
    opts: &RuntimeOptions,
    accel: &AcceleratorInfo,
    adapters: &[PathBuf],
    projectors: &[PathBuf],
) -> Result<LayerPlan> {
    if adapters.len() > 1 {
        return Err(Error::Config(
            "only one LoRA adapter is supported, but multiple were provided".to_string(),
        ));
    }
    if projectors.len() > 1 {
        return Err(Error::Config(
            "only one vision projector is supported, but multiple were provided".to_string(),
        ));
    }

    let num_ctx = clamp_context(opts.num_ctx, desc);
    let kv = kv_cache_bytes(desc, num_ctx);
    let graph = graph_overhead_bytes(desc, kv);
    let size = desc.size_bytes as i64;
    let vram = accel.vram_bytes as i64;
    let max_layers = desc.layer_count as i64 + 1;

    let mut plan = LayerPlan {
        num_ctx,
        num_gpu: 0,
        library: accel.library.clone(),
        variant: accel.variant.clone(),
    };

    if accel.os == "macos" {
        if opts.num_gpu == 0 {
            return Ok(plan);
        }
        if size + kv + graph > vram {
            tracing::info!("not enough unified memory available, falling back to CPU only");
            plan.library = "cpu".to_string();
            plan.variant = accel.cpu_flag.clone();
            return Ok(plan);
        }
        // Layer splitting is not attempted on macOS; unified memory either
        // takes the whole model or none of it.
        plan.num_gpu = ALL_LAYERS;
        return Ok(plan);
    }

    if accel.library == "cpu" {
        tracing::info!("no accelerator available, running on CPU");
        return Ok(plan);
    }

    if opts.num_gpu == 0 {
        plan.library = "cpu".to_string();
        plan.variant = accel.cpu_flag.clone();
        return Ok(plan);
    }

    if opts.num_gpu > 0 {
        if opts.num_gpu == ALL_LAYERS {
            // An explicit everything-on-GPU request is rejected rather than
            // silently downgraded when it cannot fit.
            if size + kv + graph > vram {
                return Err(Error::Capacity(format!(
                    "full offload needs an estimated {} bytes but {} are available",
                    size + kv + graph,
                    vram
                )));
            }
            plan.num_gpu = ALL_LAYERS;
        } else {
            plan.num_gpu = opts.num_gpu.min(max_layers as i32);
        }
        return Ok(plan);
    }

    // Auto mode. The main device needs the full graph allocation plus the
    // proportional KV cache for the layers it hosts; the weights spread
    // across devices.
    let devices = accel.device_count.max(1) as i64;
    let avg = vram / devices;
    let per_layer_cost = kv + size / devices;
    if per_layer_cost <= 0 {
        plan.library = "cpu".to_string();
        plan.variant = accel.cpu_flag.clone();
        return Ok(plan);
    }

    let mut layers = max_layers * (avg - graph) / per_layer_cost;
    if layers > max_layers {
        layers = max_layers;
    }

    let main_device_need = graph + kv * layers / max_layers;
    if layers <= 0 || main_device_need > avg {
        tracing::info!("not enough vram available, falling back to CPU only");
        plan.library = "cpu".to_string();
        plan.variant = accel.cpu_flag.clone();
        return Ok(plan);
    }

    plan.num_gpu = layers as i32;
    Ok(plan)
}
