// Run logging
// One timestamped log file per run, serialized under a single mutex, with
// optional ANSI-decorated duplication to the terminal

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use regex::Regex;

use crate::config::{self, log_dir_for, Paths};
use crate::error::{Error, Result};

const ANSI_DIM: &str = "\x1b[2m";
const ANSI_CYAN: &str = "\x1b[36m";
const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

/// Terminal timestamp format; the file always gets RFC3339 UTC.
const TTY_TIME_FORMAT: &str = "%H:%M:%S %m/%d/%Y";

struct Sink {
    file: File,
    /// Duplicate lines to stderr with color when set.
    tty: bool,
}

/// Writes timestamped lines to the run's log file and, unless file-only,
/// to the terminal. All writes are serialized under one mutex.
pub struct Logger {
    sink: Mutex<Sink>,
    path: PathBuf,
}

impl Logger {
    /// Create the per-run log file
    /// `<logs>/<pipeline>-<runid8>-<YYYYMMDD>-<HHMMSS>.log`. Hub-style
    /// `owner/name` pipelines log under `<logs>/owner/`.
    pub fn new(paths: &Paths, pipeline_name: &str, run_id: &str, file_only: bool) -> Result<Arc<Logger>> {
        let dir = log_dir_for(&paths.logs, pipeline_name);
        std::fs::create_dir_all(&dir).map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;

        let base = Path::new(pipeline_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(pipeline_name);
        let rid: String = run_id.chars().take(8).collect();
        let ts = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{base}-{rid}-{ts}.log"));

        let file = File::create(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;

        Ok(Arc::new(Logger {
            sink: Mutex::new(Sink {
                file,
                tty: !file_only,
            }),
            path,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a run-scoped line.
    pub fn log(&self, msg: &str) {
        let now = Utc::now();
        let mut sink = self.sink.lock().expect("log sink poisoned");
        let _ = writeln!(
            sink.file,
            "[{}] {msg}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if sink.tty {
            let _ = writeln!(
                std::io::stderr(),
                "{ANSI_DIM}[{}]{ANSI_RESET} {msg}",
                now.format(TTY_TIME_FORMAT)
            );
        }
    }

    /// A logger scoped to one step (or sub-run row).
    pub fn step(self: &Arc<Self>, id: &str, sensitive: bool) -> StepLogger {
        StepLogger {
            logger: Arc::clone(self),
            id: id.to_string(),
            sensitive,
        }
    }
}

/// Step-scoped logger. Ordinary lines are dropped for sensitive steps;
/// `exit` lines are always written.
#[derive(Clone)]
pub struct StepLogger {
    logger: Arc<Logger>,
    id: String,
    sensitive: bool,
}

impl StepLogger {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    /// Write a step-scoped line. No-op for sensitive steps: the discard
    /// sink for child output is this same check applied per line.
    pub fn log(&self, msg: &str) {
        if self.sensitive {
            return;
        }
        let now = Utc::now();
        let mut sink = self.logger.sink.lock().expect("log sink poisoned");
        let _ = writeln!(
            sink.file,
            "[{}] [{}] {msg}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.id
        );
        if sink.tty {
            let _ = writeln!(
                std::io::stderr(),
                "{ANSI_DIM}[{}]{ANSI_RESET} {ANSI_CYAN}[{}]{ANSI_RESET} {msg}",
                now.format(TTY_TIME_FORMAT),
                self.id
            );
        }
    }

    /// Announce that output is being withheld for a sensitive step.
    pub fn redacted(&self) {
        let now = Utc::now();
        let mut sink = self.logger.sink.lock().expect("log sink poisoned");
        let _ = writeln!(
            sink.file,
            "[{}] [{}] [SENSITIVE - output redacted]",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.id
        );
        if sink.tty {
            let _ = writeln!(
                std::io::stderr(),
                "{ANSI_DIM}[{}]{ANSI_RESET} {ANSI_CYAN}[{}]{ANSI_RESET} {ANSI_DIM}[SENSITIVE - output redacted]{ANSI_RESET}",
                now.format(TTY_TIME_FORMAT),
                self.id
            );
        }
    }

    /// Write an `exit N` line. Always logged, even for sensitive steps.
    pub fn exit(&self, code: i32) {
        let now = Utc::now();
        let mut sink = self.logger.sink.lock().expect("log sink poisoned");
        let _ = writeln!(
            sink.file,
            "[{}] [{}] exit {code}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.id
        );
        if sink.tty {
            let color = if code == 0 { ANSI_GREEN } else { ANSI_RED };
            let _ = writeln!(
                std::io::stderr(),
                "{ANSI_DIM}[{}]{ANSI_RESET} {ANSI_CYAN}[{}]{ANSI_RESET} {color}exit {code}{ANSI_RESET}",
                now.format(TTY_TIME_FORMAT),
                self.id
            );
        }
    }
}

/// Bound retained log files for a pipeline to the newest N
/// (`PIPE_LOG_ROTATE`, default 10, 0 disables). Only files matching this
/// pipeline's exact naming pattern are considered. Removal problems come
/// back as warnings.
pub fn rotate_logs(paths: &Paths, pipeline_name: &str) -> Result<Vec<String>> {
    let limit = config::rotate_limit("PIPE_LOG_ROTATE", 10);
    if limit == 0 {
        return Ok(Vec::new());
    }

    let dir = log_dir_for(&paths.logs, pipeline_name);
    let base = Path::new(pipeline_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(pipeline_name);

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(Error::Io { path: dir, source }),
    };

    // {base}-{8 hex}-{YYYYMMDD}-{HHMMSS}.log
    let pattern = log_file_pattern(base);

    let mut matched: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !pattern.is_match(name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        matched.push((path, modified));
    }

    if matched.len() <= limit {
        return Ok(Vec::new());
    }

    matched.sort_by(|a, b| b.1.cmp(&a.1));

    let mut warnings = Vec::new();
    for (path, _) in matched.drain(limit..) {
        if let Err(e) = std::fs::remove_file(&path) {
            warnings.push(format!(
                "failed to remove old log file {}: {e}",
                path.display()
            ));
        }
    }
    Ok(warnings)
}

fn log_file_pattern(base: &str) -> Regex {
    Regex::new(&format!(
        "^{}-[a-f0-9]{{8}}-\\d{{8}}-\\d{{6}}\\.log$",
        regex::escape(base)
    ))
    .expect("log pattern is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        (tmp, paths)
    }

    #[test]
    fn log_file_lines_are_timestamped_and_scoped() {
        let (_tmp, paths) = paths();
        let logger = Logger::new(&paths, "demo", "abcd1234-rest", true).unwrap();
        logger.log("pipeline starting");
        let sl = logger.step("build", false);
        sl.log("make all");
        sl.exit(0);

        let content = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("pipeline starting"));
        assert!(lines[1].contains("[build] make all"));
        assert!(lines[2].contains("[build] exit 0"));
        // RFC3339 UTC prefix
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains('T') && lines[0].contains('Z'));
    }

    #[test]
    fn sensitive_step_lines_dropped_but_exit_kept() {
        let (_tmp, paths) = paths();
        let logger = Logger::new(&paths, "demo", "abcd1234", true).unwrap();
        let sl = logger.step("token", true);
        sl.redacted();
        sl.log("secret-value-never-appears");
        sl.exit(0);

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("[SENSITIVE - output redacted]"));
        assert!(!content.contains("secret-value-never-appears"));
        assert!(content.contains("exit 0"));
    }

    #[test]
    fn log_file_name_shape() {
        let (_tmp, paths) = paths();
        let logger = Logger::new(&paths, "demo", "0123456789abcdef", true).unwrap();
        let name = logger.path().file_name().unwrap().to_str().unwrap();
        assert!(log_file_pattern("demo").is_match(name), "unexpected name {name}");
    }

    #[test]
    fn hub_style_pipeline_logs_under_owner_dir() {
        let (_tmp, paths) = paths();
        let logger = Logger::new(&paths, "acme/deploy", "abcdef12", true).unwrap();
        assert!(logger.path().starts_with(paths.logs.join("acme")));
        let name = logger.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("deploy-"));
    }

    #[test]
    fn rotation_ignores_other_pipelines() {
        let (_tmp, paths) = paths();
        std::fs::create_dir_all(&paths.logs).unwrap();
        // 12 logs for "noisy", 1 for "quiet"
        for i in 0..12 {
            let name = format!("noisy-{:08x}-20240101-{:06}.log", i, i);
            std::fs::write(paths.logs.join(name), "x").unwrap();
        }
        std::fs::write(paths.logs.join("quiet-00000000-20240101-000000.log"), "x").unwrap();

        std::env::remove_var("PIPE_LOG_ROTATE");
        rotate_logs(&paths, "noisy").unwrap();

        let names: Vec<String> = std::fs::read_dir(&paths.logs)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let noisy = names.iter().filter(|n| n.starts_with("noisy-")).count();
        assert_eq!(noisy, 10);
        assert!(names.iter().any(|n| n.starts_with("quiet-")));
    }
}
