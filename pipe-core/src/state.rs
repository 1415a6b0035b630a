// Run-state store
// Per-run JSON files with atomic tmp+rename writes and rotation

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{self, Paths};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

/// Durable record of one pipeline run, persisted eagerly on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub pipeline_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
}

impl RunState {
    /// A fresh run with a random UUIDv4 id.
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            pipeline_name: pipeline_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            steps: BTreeMap::new(),
        }
    }

    /// Current state of a step, `pending` if the step has not run yet.
    pub fn step(&self, id: &str) -> StepState {
        self.steps.get(id).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub exit_code: i32,
    /// Captured stdout; empty for sensitive steps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Echo of the step setting so resume honors it without re-reading the
    /// pipeline definition.
    #[serde(default)]
    pub sensitive: bool,
    /// Timestamp of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    /// Execution attempts: 1 + retries used.
    #[serde(default, skip_serializing_if = "attempts_is_zero")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_steps: BTreeMap<String, StepState>,
}

fn attempts_is_zero(n: &u32) -> bool {
    *n == 0
}

/// Load/save access to `<state-root>/<pipeline>/<run-id>.json`. Concurrency
/// discipline lives in the runner: one mutex serializes both the in-memory
/// mutation and the save.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.state.clone(),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, pipeline_name: &str, run_id: &str) -> PathBuf {
        self.dir.join(pipeline_name).join(format!("{run_id}.json"))
    }

    /// Write atomically: serialize to `<path>.tmp`, then rename. A reader
    /// never observes a partial file.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let path = self.path(&state.pipeline_name, &state.run_id);
        let data = serde_json::to_string_pretty(state).map_err(|e| Error::StateIo {
            op: "serializing",
            source: std::io::Error::other(e),
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|source| Error::StateIo {
            op: "writing",
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| Error::StateIo {
            op: "renaming",
            source,
        })
    }

    pub fn load(&self, pipeline_name: &str, run_id: &str) -> Result<RunState> {
        let path = self.path(pipeline_name, run_id);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RunNotFound {
                    pipeline: pipeline_name.to_string(),
                    run_id: run_id.to_string(),
                })
            }
            Err(source) => {
                return Err(Error::StateIo {
                    op: "reading",
                    source,
                })
            }
        };
        serde_json::from_str(&data).map_err(|e| Error::StateIo {
            op: "parsing",
            source: std::io::Error::other(e),
        })
    }

    /// Bound retained state files for a pipeline to the newest N
    /// (`PIPE_STATE_ROTATE`, default 10, 0 disables). The current run's file
    /// is never deleted and occupies one slot of the limit. Removal problems
    /// come back as warnings.
    pub fn rotate(&self, pipeline_name: &str, current_run_id: &str) -> Result<Vec<String>> {
        let limit = config::rotate_limit("PIPE_STATE_ROTATE", 10);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let dir = self.dir.join(pipeline_name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::StateIo {
                    op: "listing",
                    source,
                })
            }
        };

        let current_file = format!("{current_run_id}.json");
        let mut candidates: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name == current_file {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            candidates.push((path, modified));
        }

        let keep_others = limit.saturating_sub(1);
        if candidates.len() <= keep_others {
            return Ok(Vec::new());
        }

        // newest first
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut warnings = Vec::new();
        for (path, _) in candidates.drain(keep_others..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warnings.push(format!(
                    "failed to remove old state file {}: {e}",
                    path.display()
                ));
            }
        }
        Ok(warnings)
    }
}
