// Step execution
// Cache consult, the three run variants (single, parallel strings, parallel
// sub-runs), retry, output capture and redaction, and the interactive step

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{retry, trim_newlines, Retryable, Runner};
use crate::cache::{self, Entry, RunType, SubEntry};
use crate::error::{Error, Result};
use crate::logging::StepLogger;
use crate::parser::{RunField, Step, SubRun};
use crate::state::{StepState, StepStatus};
use crate::status::{format_duration, Status};
use crate::vars::env_key;

/// Why a child execution failed.
#[derive(Debug)]
pub(crate) enum ExecError {
    /// The child could not be launched.
    Spawn(std::io::Error),
    /// The child exited non-zero (or was killed; no code normalizes to 1).
    Exit(i32),
    /// Cancellation arrived before or during the child's run.
    Interrupted,
}

impl ExecError {
    fn exit_code(&self) -> i32 {
        match self {
            ExecError::Exit(code) => *code,
            _ => 1,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Spawn(e) => write!(f, "spawn failed: {e}"),
            ExecError::Exit(code) => write!(f, "exit status {code}"),
            ExecError::Interrupted => write!(f, "interrupted"),
        }
    }
}

pub(crate) struct ExecFailure {
    kind: ExecError,
    /// Stderr collected for display under the failed row; empty unless a
    /// status display is attached.
    stderr: String,
}

impl Retryable for ExecFailure {
    fn retryable(&self) -> bool {
        !matches!(self.kind, ExecError::Interrupted)
    }
}

/// Whether a child's stdout is streamed in real time.
///
///   | verbosity       | output: true | output: false |
///   |-----------------|--------------|---------------|
///   | 0 (compact/TTY) | stream       | no            |
///   | 1 (-v)          | stream       | no            |
///   | 2 (-vv)         | stream       | stream anyway |
///
/// `sensitive` always wins: never stream.
fn should_show_output(step: &Step, sensitive: bool, verbosity: u8) -> bool {
    if sensitive {
        return false;
    }
    if verbosity >= 2 {
        return true;
    }
    step.output
}

impl Runner {
    /// Run a single step once it is ready: resume short-circuit, cache
    /// consult, then execution by variant.
    pub(crate) async fn run_step(self: &Arc<Self>, step: &Step) -> Result<()> {
        let ss = self.get_step_state(&step.id);

        // Resume: a done non-sensitive step is skipped; its variables were
        // already restored from state. Sensitive steps re-execute.
        if ss.status == StepStatus::Done && !step.sensitive {
            self.log.log(&format!("[{}] skipping (already done)", step.id));
            self.ui_status_step(step, Status::Done);
            return Ok(());
        }

        if self.try_cache(step) {
            self.ui_status_step(step, Status::Done);
            return Ok(());
        }

        let sl = self.log.step(&step.id, step.sensitive);
        if step.sensitive {
            sl.redacted();
        }

        match &step.run {
            RunField::Single(cmd) => self.run_single(step, cmd, &sl).await,
            RunField::Strings(cmds) => self.run_parallel_strings(step, cmds, &sl).await,
            RunField::SubRuns(subs) => self.run_parallel_sub_runs(step, subs).await,
            RunField::Empty => Err(Error::InvalidPipeline(format!(
                "step {:?}: no run command",
                step.id
            ))),
        }
    }

    /// Consult the cache before spawning anything. On a valid hit the
    /// recorded outputs are republished as variables (skipping sensitive
    /// ones), the step is marked done, and no child runs. Read failures
    /// degrade to a warning.
    fn try_cache(&self, step: &Step) -> bool {
        if !step.cached.enabled {
            return false;
        }

        let entry = match self.cache.load(&step.id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                self.log.log(&format!("[{}] cache warning: {e}", step.id));
                return false;
            }
        };
        if !cache::is_valid(&entry, Utc::now()) {
            return false;
        }

        self.log.log(&format!("[{}] cache hit", step.id));

        if !entry.sensitive {
            if !entry.output.is_empty() {
                self.set_env(env_key(&[&step.id]), trim_newlines(&entry.output));
            }
            for sub in &entry.sub_outputs {
                if !sub.sensitive && !sub.output.is_empty() {
                    self.set_env(env_key(&[&step.id, &sub.id]), trim_newlines(&sub.output));
                }
            }
        }

        self.update_step_state(&step.id, |ss| {
            ss.status = StepStatus::Done;
            ss.exit_code = 0;
            ss.sensitive = step.sensitive;
            if !step.sensitive {
                ss.output = entry.output.clone();
            }
            ss.at = Some(Utc::now());
        });

        true
    }

    /// Store a successful step's result. Only successes are cached; an
    /// unparseable expiry warns and caches without one.
    fn save_cache(&self, step: &Step, mut entry: Entry) {
        if !step.cached.enabled {
            return;
        }

        let now = Utc::now();
        entry.cached_at = now;
        entry.expires_at = match cache::parse_expiry(&step.cached.expire_after, now) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                self.log.log(&format!(
                    "[{}] cache warning: invalid expiry {:?}: {e}; caching without expiry",
                    step.id, step.cached.expire_after
                ));
                None
            }
        };

        if let Err(e) = self.cache.save(&entry) {
            self.log.log(&format!("[{}] cache warning: {e}", step.id));
        }
    }

    async fn run_single(self: &Arc<Self>, step: &Step, cmd: &str, sl: &StepLogger) -> Result<()> {
        self.update_step_state(&step.id, |ss| ss.status = StepStatus::Running);
        self.ui_status(&step.id, Status::Running);
        sl.log(cmd);

        let show = should_show_output(step, step.sensitive, self.verbosity);
        let collect_stderr = self.has_ui() && !step.sensitive;

        let (attempts, result) = retry::retry(step.retry + 1, || {
            self.exec_capture(cmd, sl, show, &step.id, collect_stderr)
        })
        .await;

        match result {
            Ok(output) => {
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Done;
                    ss.exit_code = 0;
                    ss.sensitive = step.sensitive;
                    ss.attempts = attempts;
                    if !step.sensitive {
                        ss.output = output.clone();
                    }
                    ss.at = Some(Utc::now());
                });
                sl.exit(0);
                self.ui_status(&step.id, Status::Done);

                self.set_env(env_key(&[&step.id]), trim_newlines(&output));

                let cache_output = if step.sensitive { String::new() } else { output };
                self.save_cache(
                    step,
                    Entry {
                        step_id: step.id.clone(),
                        cached_at: Utc::now(),
                        expires_at: None,
                        exit_code: 0,
                        output: cache_output,
                        sensitive: step.sensitive,
                        run_type: RunType::Single,
                        sub_outputs: Vec::new(),
                    },
                );
                Ok(())
            }
            Err(failure) => {
                let code = failure.kind.exit_code();
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Failed;
                    ss.exit_code = code;
                    ss.attempts = attempts;
                    ss.at = Some(Utc::now());
                });
                sl.exit(code);
                self.emit_stderr_on_error(&step.id, &failure.stderr);
                self.ui_status(&step.id, Status::Failed);

                Err(match failure.kind {
                    ExecError::Interrupted => Error::Interrupted,
                    ExecError::Spawn(source) => Error::Spawn {
                        step: step.id.clone(),
                        source,
                    },
                    ExecError::Exit(exit_code) => Error::StepFailure {
                        step: step.id.clone(),
                        exit_code,
                    },
                })
            }
        }
    }

    /// Parallel unnamed commands: one child per string, stdout uncaptured
    /// (it goes to the log), success only if every child succeeds. Retries
    /// apply to the single variant only; these children run exactly once.
    async fn run_parallel_strings(
        self: &Arc<Self>,
        step: &Step,
        cmds: &[String],
        sl: &StepLogger,
    ) -> Result<()> {
        self.update_step_state(&step.id, |ss| ss.status = StepStatus::Running);

        let show = should_show_output(step, step.sensitive, self.verbosity);
        let collect_stderr = self.has_ui() && !step.sensitive;

        let mut handles = Vec::with_capacity(cmds.len());
        for (i, cmd) in cmds.iter().enumerate() {
            let runner = Arc::clone(self);
            let step_id = step.id.clone();
            let cmd = cmd.clone();
            let sl = sl.clone();
            handles.push(tokio::spawn(async move {
                let row_id = format!("{step_id}/run_{i}");
                runner.ui_status(&row_id, Status::Running);
                sl.log(&format!("parallel: {cmd}"));

                match runner
                    .exec_no_capture(&cmd, &sl, show, &row_id, collect_stderr)
                    .await
                {
                    Ok(()) => {
                        runner.ui_status(&row_id, Status::Done);
                        None
                    }
                    Err(failure) => {
                        runner.emit_stderr_on_error(&row_id, &failure.stderr);
                        runner.ui_status(&row_id, Status::Failed);
                        Some((format!("{cmd}: {}", failure.kind), failure.kind.exit_code()))
                    }
                }
            }));
        }

        let mut errs = Vec::new();
        let mut first_code = 1;
        for handle in handles {
            match handle.await {
                Ok(Some((msg, code))) => {
                    if errs.is_empty() {
                        first_code = code;
                    }
                    errs.push(msg);
                }
                Ok(None) => {}
                Err(e) => errs.push(format!("worker: {e}")),
            }
        }

        if !errs.is_empty() {
            self.update_step_state(&step.id, |ss| {
                ss.status = StepStatus::Failed;
                ss.at = Some(Utc::now());
            });
            self.log.log(&format!(
                "[{}] parallel failures: {}",
                step.id,
                errs.join("; ")
            ));
            return Err(Error::StepFailure {
                step: step.id.clone(),
                exit_code: first_code,
            });
        }

        self.update_step_state(&step.id, |ss| {
            ss.status = StepStatus::Done;
            ss.exit_code = 0;
            ss.at = Some(Utc::now());
        });

        self.save_cache(
            step,
            Entry {
                step_id: step.id.clone(),
                cached_at: Utc::now(),
                expires_at: None,
                exit_code: 0,
                output: String::new(),
                sensitive: false,
                run_type: RunType::Strings,
                sub_outputs: Vec::new(),
            },
        );
        Ok(())
    }

    /// Parallel named sub-runs: one child per sub-run, each stdout captured
    /// independently and published as `PIPE_<STEP>_<SUB>`. The step fails if
    /// any sub-run fails. Individual sub-runs are not retried.
    async fn run_parallel_sub_runs(
        self: &Arc<Self>,
        step: &Step,
        subs: &[SubRun],
    ) -> Result<()> {
        self.update_step_state(&step.id, |ss| ss.status = StepStatus::Running);
        let existing = self.get_step_state(&step.id).sub_steps;

        let mut handles = Vec::with_capacity(subs.len());
        for sub in subs {
            // Resume: done non-sensitive sub-runs are skipped.
            let prior = existing.get(&sub.id).cloned().unwrap_or_default();
            if prior.status == StepStatus::Done && !sub.sensitive {
                self.log
                    .log(&format!("[{}/{}] skipping (already done)", step.id, sub.id));
                self.ui_status(&format!("{}/{}", step.id, sub.id), Status::Done);
                continue;
            }

            let runner = Arc::clone(self);
            let step_id = step.id.clone();
            let sub = sub.clone();
            let show = should_show_output(step, sub.sensitive, self.verbosity);
            let collect_stderr = self.has_ui() && !sub.sensitive;
            handles.push(tokio::spawn(async move {
                let row_id = format!("{step_id}/{}", sub.id);
                runner.ui_status(&row_id, Status::Running);

                let sub_sl = runner.log.step(&row_id, sub.sensitive);
                if sub.sensitive {
                    sub_sl.redacted();
                }
                sub_sl.log(&sub.run);

                let result = runner
                    .exec_capture(&sub.run, &sub_sl, show, &row_id, collect_stderr)
                    .await;

                match result {
                    Ok(output) => {
                        runner.update_sub_state(
                            &step_id,
                            &sub.id,
                            StepState {
                                status: StepStatus::Done,
                                exit_code: 0,
                                sensitive: sub.sensitive,
                                output: if sub.sensitive {
                                    String::new()
                                } else {
                                    output.clone()
                                },
                                at: Some(Utc::now()),
                                ..Default::default()
                            },
                        );
                        runner.set_env(env_key(&[&step_id, &sub.id]), trim_newlines(&output));
                        sub_sl.exit(0);
                        runner.ui_status(&row_id, Status::Done);
                        None
                    }
                    Err(failure) => {
                        let code = failure.kind.exit_code();
                        runner.update_sub_state(
                            &step_id,
                            &sub.id,
                            StepState {
                                status: StepStatus::Failed,
                                exit_code: code,
                                at: Some(Utc::now()),
                                ..Default::default()
                            },
                        );
                        sub_sl.exit(code);
                        runner.emit_stderr_on_error(&row_id, &failure.stderr);
                        runner.ui_status(&row_id, Status::Failed);
                        Some((format!("{}: {}", sub.id, failure.kind), code))
                    }
                }
            }));
        }

        let mut errs = Vec::new();
        let mut first_code = 1;
        for handle in handles {
            match handle.await {
                Ok(Some((msg, code))) => {
                    if errs.is_empty() {
                        first_code = code;
                    }
                    errs.push(msg);
                }
                Ok(None) => {}
                Err(e) => errs.push(format!("worker: {e}")),
            }
        }

        if !errs.is_empty() {
            self.update_step_state(&step.id, |ss| {
                ss.status = StepStatus::Failed;
                ss.at = Some(Utc::now());
            });
            self.log.log(&format!(
                "[{}] sub-run failures: {}",
                step.id,
                errs.join("; ")
            ));
            return Err(Error::StepFailure {
                step: step.id.clone(),
                exit_code: first_code,
            });
        }

        self.update_step_state(&step.id, |ss| {
            ss.status = StepStatus::Done;
            ss.exit_code = 0;
            ss.at = Some(Utc::now());
        });

        let ss = self.get_step_state(&step.id);
        let sub_outputs = subs
            .iter()
            .map(|sr| {
                let sub = ss.sub_steps.get(&sr.id).cloned().unwrap_or_default();
                SubEntry {
                    id: sr.id.clone(),
                    output: sub.output,
                    sensitive: sub.sensitive,
                    exit_code: sub.exit_code,
                }
            })
            .collect();
        self.save_cache(
            step,
            Entry {
                step_id: step.id.clone(),
                cached_at: Utc::now(),
                expires_at: None,
                exit_code: 0,
                output: String::new(),
                sensitive: step.sensitive,
                run_type: RunType::SubRuns,
                sub_outputs,
            },
        );
        Ok(())
    }

    /// Run the interactive step with the terminal attached directly. It is
    /// skipped on resume when already done; it publishes no variables.
    pub(crate) async fn run_interactive(self: &Arc<Self>, step: &Step) -> Result<()> {
        let ss = self.get_step_state(&step.id);
        if ss.status == StepStatus::Done {
            self.log
                .log(&format!("[{}] skipping interactive (already done)", step.id));
            return Ok(());
        }

        let RunField::Single(cmd) = &step.run else {
            return Err(Error::InvalidPipeline(format!(
                "step {:?}: interactive steps take a single command",
                step.id
            )));
        };

        self.log.log(&format!("[{}] starting interactive", step.id));
        self.update_step_state(&step.id, |ss| ss.status = StepStatus::Running);

        eprintln!("\x1b[33m\u{25cf}\x1b[0m {}  \x1b[33minteractive...\x1b[0m", step.id);
        let started = std::time::Instant::now();

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .envs(self.env_snapshot())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Failed;
                    ss.exit_code = 1;
                    ss.at = Some(Utc::now());
                });
                print_interactive_result(&step.id, started.elapsed(), false);
                return Err(Error::Spawn {
                    step: step.id.clone(),
                    source,
                });
            }
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        match status {
            Ok(st) if st.success() => {
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Done;
                    ss.exit_code = 0;
                    ss.at = Some(Utc::now());
                });
                print_interactive_result(&step.id, started.elapsed(), true);
                Ok(())
            }
            Ok(st) => {
                let code = st.code().unwrap_or(1);
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Failed;
                    ss.exit_code = code;
                    ss.at = Some(Utc::now());
                });
                print_interactive_result(&step.id, started.elapsed(), false);
                Err(Error::StepFailure {
                    step: step.id.clone(),
                    exit_code: code,
                })
            }
            Err(source) => {
                self.update_step_state(&step.id, |ss| {
                    ss.status = StepStatus::Failed;
                    ss.exit_code = 1;
                    ss.at = Some(Utc::now());
                });
                print_interactive_result(&step.id, started.elapsed(), false);
                Err(Error::Spawn {
                    step: step.id.clone(),
                    source,
                })
            }
        }
    }

    /// Spawn `sh -c <cmd>` capturing stdout. Stderr lines go to the step
    /// logger (discarded when sensitive) and, when a status display is
    /// attached, into a buffer shown under the row on failure.
    async fn exec_capture(
        &self,
        cmd: &str,
        sl: &StepLogger,
        show: bool,
        row_id: &str,
        collect_stderr: bool,
    ) -> std::result::Result<String, ExecFailure> {
        self.exec(cmd, sl, show, row_id, true, collect_stderr).await
    }

    /// Spawn `sh -c <cmd>` without capture: stdout lines go to the step
    /// logger instead.
    async fn exec_no_capture(
        &self,
        cmd: &str,
        sl: &StepLogger,
        show: bool,
        row_id: &str,
        collect_stderr: bool,
    ) -> std::result::Result<(), ExecFailure> {
        self.exec(cmd, sl, show, row_id, false, collect_stderr)
            .await
            .map(|_| ())
    }

    async fn exec(
        &self,
        cmd: &str,
        sl: &StepLogger,
        show: bool,
        row_id: &str,
        capture_stdout: bool,
        collect_stderr: bool,
    ) -> std::result::Result<String, ExecFailure> {
        if self.is_cancelled() {
            return Err(ExecFailure {
                kind: ExecError::Interrupted,
                stderr: String::new(),
            });
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .envs(self.env_snapshot())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecFailure {
                kind: ExecError::Spawn(e),
                stderr: String::new(),
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let ui = self.ui_handle();
        let live_row = row_id.to_string();
        let sl_out = sl.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut captured = String::new();
            let mut buffered: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if capture_stdout {
                    if !captured.is_empty() {
                        captured.push('\n');
                    }
                    captured.push_str(&line);
                } else {
                    sl_out.log(&line);
                }
                if show {
                    match &ui {
                        Some(ui) => ui.add_output(&live_row, &line),
                        None => buffered.push(line),
                    }
                }
            }
            (captured, buffered)
        });

        let sl_err = sl.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                sl_err.log(&line);
                if collect_stderr {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let stderr_buf = stderr_task.await.unwrap_or_default();
                return Err(ExecFailure {
                    kind: ExecError::Interrupted,
                    stderr: stderr_buf,
                });
            }
        };

        let (captured, buffered) = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();

        // Verbose mode: flush this child's display lines as one block.
        self.emit_grouped(row_id, &buffered);

        match status {
            Ok(st) if st.success() => Ok(captured),
            Ok(st) => Err(ExecFailure {
                kind: ExecError::Exit(st.code().unwrap_or(1)),
                stderr: stderr_buf,
            }),
            Err(e) => Err(ExecFailure {
                kind: ExecError::Spawn(e),
                stderr: stderr_buf,
            }),
        }
    }
}

fn print_interactive_result(id: &str, elapsed: std::time::Duration, success: bool) {
    if success {
        eprintln!(
            "\x1b[32m\u{2713}\x1b[0m {id}  \x1b[2m{}\x1b[0m",
            format_duration(elapsed)
        );
    } else {
        eprintln!(
            "\x1b[31m\u{2717}\x1b[0m {id}  \x1b[31m{}\x1b[0m",
            format_duration(elapsed)
        );
    }
}
