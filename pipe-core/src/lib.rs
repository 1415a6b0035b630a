// pipe execution engine
// DAG scheduling, step execution with retries and caching, durable
// resumable run state, and the variable pipeline feeding child processes

pub mod cache;
pub mod config;
pub mod dotfile;
pub mod error;
pub mod graph;
pub mod logging;
pub mod parser;
pub mod runner;
pub mod state;
pub mod status;
pub mod vars;

// Re-export the types most callers need
pub use cache::CacheStore;
pub use config::Paths;
pub use error::{Error, Result};
pub use graph::Graph;
pub use logging::Logger;
pub use parser::{
    lint_warnings, list_pipelines, load_pipeline, load_pipeline_from_path, validate, Pipeline,
    PipelineInfo, RunField, Step, SubRun,
};
pub use runner::Runner;
pub use state::{RunState, StateStore};
pub use status::{format_duration, Status, StatusSink};
