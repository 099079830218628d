//! Embedded runner payload extraction.
//!
//! Every supported accelerator variant of the native inference runner is
//! shipped inside the daemon binary under `payloads/build/...`. At startup
//! the store unpacks them into a work directory shaped
//! `<work_dir>/<variant>/<file>`, which `available()` then indexes by variant
//! tag. The variant directory doubles as the dynamic-loader search path for
//! the spawned runner.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use rust_embed::RustEmbed;

use crate::error::{Error, Result};

/// Daemon-local name the generic `server` binary is renamed to.
pub const RUNNER_BINARY: &str = "inference_server";

const METAL_SHADER: &str = "ggml-metal.metal.gz";

#[derive(RustEmbed)]
#[folder = "payloads/"]
struct EmbeddedPayloads;

/// Extracts and indexes the embedded runner binaries.
///
/// Explicit store object rather than ambient state: tests instantiate fresh
/// stores against temp directories.
pub struct PayloadStore {
    work_dir: PathBuf,
}

impl PayloadStore {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    /// A store rooted in a per-process directory under the system temp dir.
    pub fn for_process() -> Self {
        let work_dir = std::env::temp_dir().join(format!("runnerd-{}", std::process::id()));
        Self::new(work_dir)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Unpack every embedded payload for this platform. Idempotent:
    /// already-present files are left untouched. Must complete before
    /// `available()` is consulted.
    pub async fn init(&self) -> Result<()> {
        tracing::info!(work_dir = %self.work_dir.display(), "extracting embedded runner payloads");

        if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            self.extract_matching(is_metal_shader).await?;
            std::env::set_var("GGML_METAL_PATH_RESOURCES", self.work_dir.join("metal"));
        }

        self.extract_matching(is_runner_payload).await
    }

    /// Map of variant tag to the directory holding that variant's binaries.
    pub fn available(&self) -> BTreeMap<String, PathBuf> {
        let mut variants = BTreeMap::new();
        let Ok(entries) = std::fs::read_dir(&self.work_dir) else {
            return variants;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                variants.insert(name.to_string(), path);
            }
        }
        variants
    }

    /// Remove the extraction directory. Called at daemon shutdown.
    pub fn cleanup(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!(
                "remove {}: {e}",
                self.work_dir.display()
            ))),
        }
    }

    /// Extract all embedded entries whose path matches `matches`, one
    /// blocking task per file, joining them all before returning.
    async fn extract_matching(&self, matches: fn(&[&str]) -> bool) -> Result<()> {
        let entries: Vec<(String, Vec<u8>)> = EmbeddedPayloads::iter()
            .filter(|name| {
                let segments: Vec<&str> = name.split('/').collect();
                matches(&segments)
            })
            .filter_map(|name| {
                EmbeddedPayloads::get(name.as_ref())
                    .map(|file| (name.into_owned(), file.data.into_owned()))
            })
            .collect();

        if entries.is_empty() {
            return Err(Error::Internal(
                "expected runner payloads are not included in this build".to_string(),
            ));
        }

        let mut tasks = Vec::with_capacity(entries.len());
        for (name, data) in entries {
            let work_dir = self.work_dir.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                extract_entry(&work_dir, &name, &data).map(|_| ())
            }));
        }
        for task in tasks {
            task.await
                .map_err(|e| Error::Internal(format!("payload extraction task failed: {e}")))??;
        }
        Ok(())
    }
}

/// Payload binaries live at `build/<os>/<arch>/<variant>/bin/<file>`, with an
/// extra build-configuration directory under `bin` on windows.
fn is_runner_payload(segments: &[&str]) -> bool {
    shaped_for_windows(segments, cfg!(target_os = "windows"))
}

fn shaped_for_windows(segments: &[&str], windows: bool) -> bool {
    if windows {
        segments.len() == 7
            && segments[0] == "build"
            && segments[1] == "windows"
            && segments[4] == "bin"
    } else {
        segments.len() == 6 && segments[0] == "build" && segments[4] == "bin"
    }
}

fn is_metal_shader(segments: &[&str]) -> bool {
    segments.len() == 6
        && segments[0] == "build"
        && segments[4] == "bin"
        && segments[5] == METAL_SHADER
}

/// The variant tag is the directory immediately above `bin`, on every
/// platform shape.
fn variant_of<'a>(segments: &[&'a str]) -> Option<&'a str> {
    let bin = segments.iter().position(|s| *s == "bin")?;
    if bin == 0 {
        return None;
    }
    Some(segments[bin - 1])
}

/// Write one embedded entry under `<work_dir>/<variant>/`, decompressing
/// `.gz` entries and renaming the generic `server` binary. Existing targets
/// are skipped, which makes re-extraction a no-op.
fn extract_entry(work_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let segments: Vec<&str> = name.split('/').collect();
    let variant = variant_of(&segments).ok_or_else(|| {
        Error::Internal(format!("payload path {name} has no variant directory"))
    })?;
    let mut filename = segments
        .last()
        .copied()
        .ok_or_else(|| Error::Internal(format!("empty payload path {name}")))?
        .to_string();

    let decompressed;
    let bytes: &[u8] = if let Some(stem) = filename.strip_suffix(".gz").map(str::to_string) {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::Internal(format!("decompress payload {name}: {e}")))?;
        filename = stem;
        decompressed = out;
        &decompressed
    } else {
        data
    };

    filename = filename.replacen("server", RUNNER_BINARY, 1);

    let variant_dir = work_dir.join(variant);
    std::fs::create_dir_all(&variant_dir)
        .map_err(|e| Error::Internal(format!("mkdir {}: {e}", variant_dir.display())))?;

    let dest = variant_dir.join(&filename);
    if dest.exists() {
        return Ok(dest);
    }

    std::fs::write(&dest, bytes)
        .map_err(|e| Error::Internal(format!("write payload {}: {e}", dest.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::Internal(format!("chmod {}: {e}", dest.display())))?;
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn segments(path: &str) -> Vec<&str> {
        path.split('/').collect()
    }

    #[test]
    fn payload_shapes() {
        assert!(shaped_for_windows(
            &segments("build/linux/x86_64/cpu_avx2/bin/server"),
            false
        ));
        assert!(shaped_for_windows(
            &segments("build/windows/amd64/cuda_v12/bin/Release/server.exe"),
            true
        ));
        // library files next to the binary match too
        assert!(shaped_for_windows(
            &segments("build/linux/x86_64/cuda_v12/bin/libggml.so.gz"),
            false
        ));
        // wrong depth
        assert!(!shaped_for_windows(
            &segments("build/linux/x86_64/cpu/server"),
            false
        ));
        assert!(!shaped_for_windows(&segments("README.md"), false));
    }

    #[test]
    fn metal_shader_shape() {
        assert!(is_metal_shader(&segments(
            "build/darwin/arm64/metal/bin/ggml-metal.metal.gz"
        )));
        assert!(!is_metal_shader(&segments(
            "build/darwin/arm64/metal/bin/server"
        )));
    }

    #[test]
    fn variant_is_directory_above_bin() {
        assert_eq!(
            variant_of(&segments("build/linux/x86_64/cpu_avx2/bin/server")),
            Some("cpu_avx2")
        );
        assert_eq!(
            variant_of(&segments(
                "build/windows/amd64/cuda_v12/bin/Release/server.exe"
            )),
            Some("cuda_v12")
        );
        assert_eq!(variant_of(&segments("no/bin/here")), Some("no"));
        assert_eq!(variant_of(&segments("bin/top-level")), None);
    }

    #[test]
    fn extracts_and_renames_server() {
        let dir = tempfile::tempdir().unwrap();
        let dest = extract_entry(
            dir.path(),
            "build/linux/x86_64/cpu/bin/server",
            b"#!runner",
        )
        .unwrap();

        assert_eq!(dest, dir.path().join("cpu").join(RUNNER_BINARY));
        assert_eq!(std::fs::read(&dest).unwrap(), b"#!runner");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn decompresses_gz_and_strips_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let dest = extract_entry(
            dir.path(),
            "build/linux/x86_64/cuda_v12/bin/server.gz",
            &gzip(b"compressed runner"),
        )
        .unwrap();

        assert_eq!(dest, dir.path().join("cuda_v12").join(RUNNER_BINARY));
        assert_eq!(std::fs::read(&dest).unwrap(), b"compressed runner");
    }

    #[test]
    fn shared_libraries_keep_their_names() {
        let dir = tempfile::tempdir().unwrap();
        let dest = extract_entry(
            dir.path(),
            "build/linux/x86_64/cuda_v12/bin/libggml.so",
            b"elf",
        )
        .unwrap();
        assert_eq!(dest, dir.path().join("cuda_v12").join("libggml.so"));
    }

    #[test]
    fn extraction_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let name = "build/linux/x86_64/cpu/bin/server";
        let dest = extract_entry(dir.path(), name, b"first").unwrap();

        // second pass must not rewrite the existing file
        let again = extract_entry(dir.path(), name, b"second").unwrap();
        assert_eq!(dest, again);
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");
    }

    #[test]
    fn available_indexes_variant_directories() {
        let dir = tempfile::tempdir().unwrap();
        extract_entry(dir.path(), "build/linux/x86_64/cpu/bin/server", b"a").unwrap();
        extract_entry(dir.path(), "build/linux/x86_64/cpu_avx2/bin/server", b"b").unwrap();
        extract_entry(dir.path(), "build/linux/x86_64/cuda_v12/bin/server", b"c").unwrap();

        let store = PayloadStore::new(dir.path().to_path_buf());
        let available = store.available();
        assert_eq!(
            available.keys().cloned().collect::<Vec<_>>(),
            vec!["cpu", "cpu_avx2", "cuda_v12"]
        );
        assert_eq!(available["cpu_avx2"], dir.path().join("cpu_avx2"));
    }

    #[test]
    fn available_is_empty_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path().join("never-created"));
        assert!(store.available().is_empty());
    }

    #[test]
    fn cleanup_removes_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        extract_entry(&work, "build/linux/x86_64/cpu/bin/server", b"a").unwrap();

        let store = PayloadStore::new(work.clone());
        store.cleanup().unwrap();
        assert!(!work.exists());
        // cleaning an absent directory is fine
        store.cleanup().unwrap();
    }
}
