// Error types for the execution engine

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the engine and its stores.
///
/// Cache and rotation problems intentionally do not appear here: they are
/// degraded to warnings at the call site and never abort a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing pipeline {name:?}: {source}")]
    Yaml {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Structural problem in the pipeline definition: missing/duplicate ids,
    /// self-dependencies, dependency cycles.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("{op} run state: {source}")]
    StateIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} cache for {step:?}: {source}")]
    CacheIo {
        step: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("run {run_id:?} not found for pipeline {pipeline:?}")]
    RunNotFound { pipeline: String, run_id: String },

    #[error("step {step:?}: {source}")]
    Spawn {
        step: String,
        #[source]
        source: io::Error,
    },

    /// Non-zero exit after all retry attempts were exhausted.
    #[error("step {step:?} failed with exit code {exit_code}")]
    StepFailure { step: String, exit_code: i32 },

    /// Signal-induced termination, surfaced as a pipeline failure.
    #[error("interrupted")]
    Interrupted,

    /// At least one step failed. Per-step detail has already been written to
    /// the run log and the status display, so callers can suppress the
    /// message and just exit non-zero.
    #[error("pipeline failed")]
    PipelineFailed,
}

pub type Result<T> = std::result::Result<T, Error>;
