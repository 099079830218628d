//! Model introspection.
//!
//! The planner needs a handful of numbers out of a model file before any
//! runner is spawned: layer count, embedding width, head counts, and the
//! maximum context the model was trained for. `GgufIntrospector` pulls them
//! from the GGUF key-value header without touching tensor data.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable facts about a model file, fixed after introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub layer_count: u64,
    pub embedding_dim: u64,
    pub head_count: u64,
    pub kv_head_count: u64,
    pub max_context: u64,
}

impl ModelDescriptor {
    /// Grouped-query-attention factor (heads per KV head).
    pub fn gqa(&self) -> u64 {
        self.head_count / self.kv_head_count.max(1)
    }
}

/// Seam for model file decoding so tests can pin a descriptor.
#[async_trait]
pub trait ModelIntrospector: Send + Sync {
    async fn introspect(&self, path: &Path) -> Result<ModelDescriptor>;
}

/// Reads the GGUF v2/v3 metadata header.
pub struct GgufIntrospector;

#[async_trait]
impl ModelIntrospector for GgufIntrospector {
    async fn introspect(&self, path: &Path) -> Result<ModelDescriptor> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_descriptor(&path))
            .await
            .map_err(|e| Error::Internal(format!("introspection task failed: {e}")))?
    }
}

const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" little-endian
/// Keys larger than this are consumed but not retained (tokenizer vocab etc).
const MAX_RETAINED_STRING: u64 = 64 * 1024;

#[derive(Debug, Clone)]
enum MetaValue {
    Int(u64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl MetaValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Float(v) if *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }
}

fn read_descriptor(path: &Path) -> Result<ModelDescriptor> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Internal(format!("open {}: {e}", path.display())),
    })?;
    let size_bytes = file
        .metadata()
        .map_err(|e| Error::Internal(format!("stat {}: {e}", path.display())))?
        .len();

    let mut r = BufReader::new(file);

    let magic = read_u32(&mut r)?;
    if magic != GGUF_MAGIC {
        return Err(Error::Internal(format!(
            "{} is not a gguf file (magic {magic:#x})",
            path.display()
        )));
    }
    let version = read_u32(&mut r)?;
    if !(2..=3).contains(&version) {
        return Err(Error::Internal(format!(
            "unsupported gguf version {version} in {}",
            path.display()
        )));
    }

    let _tensor_count = read_u64(&mut r)?;
    let kv_count = read_u64(&mut r)?;

    let mut meta: HashMap<String, MetaValue> = HashMap::new();
    for _ in 0..kv_count {
        let key = read_string(&mut r)?;
        let vtype = read_u32(&mut r)?;
        if let Some(value) = read_value(&mut r, vtype)? {
            meta.insert(key, value);
        }
    }

    let arch = match meta.get("general.architecture") {
        Some(MetaValue::Str(a)) => a.clone(),
        _ => {
            return Err(Error::Internal(format!(
                "gguf header in {} lacks general.architecture",
                path.display()
            )))
        }
    };

    let required = |key: String| -> Result<u64> {
        meta.get(&key).and_then(MetaValue::as_u64).ok_or_else(|| {
            Error::Internal(format!("gguf header in {} lacks {key}", path.display()))
        })
    };

    let layer_count = required(format!("{arch}.block_count"))?;
    let embedding_dim = required(format!("{arch}.embedding_length"))?;
    let head_count = required(format!("{arch}.attention.head_count"))?;
    let max_context = required(format!("{arch}.context_length"))?;
    // Models without grouped-query attention omit the KV head count.
    let kv_head_count = meta
        .get(&format!("{arch}.attention.head_count_kv"))
        .and_then(MetaValue::as_u64)
        .unwrap_or(head_count);

    Ok(ModelDescriptor {
        path: path.to_path_buf(),
        size_bytes,
        layer_count,
        embedding_dim,
        head_count,
        kv_head_count,
        max_context,
    })
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> Result<String> {
    let len = read_u64(r)?;
    if len > MAX_RETAINED_STRING {
        skip(r, len)?;
        return Ok(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Decode one metadata value. Arrays are consumed but not retained; the
/// descriptor only needs scalars.
fn read_value(r: &mut impl Read, vtype: u32) -> Result<Option<MetaValue>> {
    let value = match vtype {
        0 | 1 | 7 => {
            let mut b = [0u8; 1];
            r.read_exact(&mut b).map_err(truncated)?;
            if vtype == 7 {
                MetaValue::Bool(b[0] != 0)
            } else {
                MetaValue::Int(b[0] as u64)
            }
        }
        2 | 3 => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b).map_err(truncated)?;
            MetaValue::Int(u16::from_le_bytes(b) as u64)
        }
        4 | 5 => MetaValue::Int(read_u32(r)? as u64),
        6 => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b).map_err(truncated)?;
            MetaValue::Float(f32::from_le_bytes(b) as f64)
        }
        8 => MetaValue::Str(read_string(r)?),
        9 => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            for _ in 0..count {
                read_value(r, elem_type)?;
            }
            return Ok(None);
        }
        10 | 11 => MetaValue::Int(read_u64(r)?),
        12 => {
            let mut b = [0u8; 8];
            r.read_exact(&mut b).map_err(truncated)?;
            MetaValue::Float(f64::from_le_bytes(b))
        }
        other => {
            return Err(Error::Internal(format!(
                "unknown gguf metadata value type {other}"
            )))
        }
    };
    Ok(Some(value))
}

fn skip(r: &mut impl Read, len: u64) -> Result<()> {
    let copied = std::io::copy(&mut r.take(len), &mut std::io::sink()).map_err(truncated)?;
    if copied != len {
        return Err(truncated(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

fn truncated(e: std::io::Error) -> Error {
    Error::Internal(format!("truncated gguf header: {e}"))
}
