// Filesystem layout and host-environment settings

use std::env;
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout under the pipe root (`~/.pipe` by default,
/// `PIPE_HOME` overrides it).
///
/// A `Paths` value is built once at startup and threaded to the stores;
/// nothing in the engine reads the root lazily.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    /// Pipeline YAML definitions: `<base>/files/<name>.yaml`.
    pub files: PathBuf,
    /// Run state: `<base>/state/<pipeline>/<run-id>.json`.
    pub state: PathBuf,
    /// Per-run log files.
    pub logs: PathBuf,
    /// Step cache: `<base>/cache/<step-id>.json`.
    pub cache: PathBuf,
}

impl Paths {
    /// Resolve the default layout: `PIPE_HOME` if set, otherwise `~/.pipe`.
    pub fn resolve() -> Self {
        let base = match env::var_os("PIPE_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pipe"),
        };
        Self::with_base(base)
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            files: base.join("files"),
            state: base.join("state"),
            logs: base.join("logs"),
            cache: base.join("cache"),
            base,
        }
    }

    /// Create the directories a run needs up front. The state directory is
    /// per-pipeline; hub-style `owner/name` pipelines nest naturally.
    pub fn ensure_dirs(&self, pipeline_name: &str) -> io::Result<()> {
        for dir in [
            self.files.clone(),
            self.state.join(pipeline_name),
            log_dir_for(&self.logs, pipeline_name),
            self.cache.clone(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Log directory for a pipeline name. `owner/name` pipelines log under
/// `logs/owner/` with the base name in the filename.
pub(crate) fn log_dir_for(logs: &Path, pipeline_name: &str) -> PathBuf {
    match Path::new(pipeline_name).parent() {
        Some(parent) if parent != Path::new("") => logs.join(parent),
        _ => logs.to_path_buf(),
    }
}

/// Parse a rotation limit from the environment. Missing or malformed values
/// fall back to the default; `0` disables rotation.
pub fn rotate_limit(var: &str, default: usize) -> usize {
    match env::var(var) {
        Ok(v) => parse_rotate_value(&v, default),
        Err(_) => default,
    }
}

fn parse_rotate_value(value: &str, default: usize) -> usize {
    match value.trim().parse::<usize>() {
        Ok(n) => n,
        Err(_) => default,
    }
}

/// Cap on in-flight child processes: `PIPE_MAX_PARALLEL` when it parses as a
/// positive integer, otherwise the host CPU count.
pub fn max_parallel() -> usize {
    if let Ok(v) = env::var("PIPE_MAX_PARALLEL") {
        if let Ok(n) = v.trim().parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Whether the declared-variable contract is disabled
/// (`PIPE_EXPERIMENTAL_UNSAFE_VARS` present in the environment).
pub fn unsafe_vars_enabled() -> bool {
    env::var_os("PIPE_EXPERIMENTAL_UNSAFE_VARS").is_some()
}
