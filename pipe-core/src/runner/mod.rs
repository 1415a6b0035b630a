// Pipeline runner
// This module is the scheduler: greedy topological dispatch of ready steps
// under a concurrency cap, cascade-fail of dependents, resume handling, and
// the interactive step that runs after the DAG. Per-step execution lives in
// step.rs.

mod retry;
mod step;

pub use retry::{retry, Retryable, RETRY_BACKOFF};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::cache::CacheStore;
use crate::config;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::logging::Logger;
use crate::parser::{Pipeline, RunField, Step};
use crate::state::{RunState, RunStatus, StateStore, StepState, StepStatus};
use crate::status::{Status, StatusSink};
use crate::vars::env_key;

/// Executes one pipeline run to completion.
///
/// Shared-state discipline: the run state is guarded by a single mutex that
/// also covers the save to disk, so a reader always observes a fully
/// applied prior write. The environment map has its own mutex; each child
/// spawn snapshots it, so a child sees a variable fully or not at all.
pub struct Runner {
    pipeline: Pipeline,
    state: Mutex<RunState>,
    state_store: StateStore,
    cache: CacheStore,
    log: Arc<Logger>,
    env: Mutex<HashMap<String, String>>,
    ui: Option<Arc<dyn StatusSink>>,
    verbosity: u8,
    max_parallel: usize,
    /// Serializes grouped verbose-mode output blocks on stderr.
    emit: Mutex<()>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

struct StepOutcome {
    idx: usize,
    result: Result<()>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Pipeline,
        state: RunState,
        state_store: StateStore,
        cache: CacheStore,
        log: Arc<Logger>,
        vars: HashMap<String, String>,
        ui: Option<Arc<dyn StatusSink>>,
        verbosity: u8,
    ) -> Runner {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Runner {
            pipeline,
            state: Mutex::new(state),
            state_store,
            cache,
            log,
            env: Mutex::new(vars),
            ui,
            verbosity,
            max_parallel: config::max_parallel(),
            emit: Mutex::new(()),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Override the in-flight child cap (normally `PIPE_MAX_PARALLEL` or
    /// the CPU count).
    pub fn set_max_parallel(&mut self, n: usize) {
        self.max_parallel = n.max(1);
    }

    pub fn run_id(&self) -> String {
        self.state.lock().expect("state mutex poisoned").run_id.clone()
    }

    /// Request cancellation, as an interrupt would. Live children are
    /// killed and their steps fail into the ordinary cascade path.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Rebuild the environment map from a previous run's completed steps.
    /// Sensitive steps are skipped; they re-execute to regenerate their
    /// variables.
    pub fn restore_env_from_state(&self) {
        let state = self.state.lock().expect("state mutex poisoned");
        let mut env = self.env.lock().expect("env mutex poisoned");
        for step in &self.pipeline.steps {
            let Some(ss) = state.steps.get(&step.id) else {
                continue;
            };
            if ss.status != StepStatus::Done || ss.sensitive {
                continue;
            }
            if !ss.output.is_empty() {
                env.insert(env_key(&[&step.id]), trim_newlines(&ss.output));
            }
            for (sub_id, sub) in &ss.sub_steps {
                if sub.status == StepStatus::Done && !sub.sensitive && !sub.output.is_empty() {
                    env.insert(env_key(&[&step.id, sub_id]), trim_newlines(&sub.output));
                }
            }
        }
    }

    /// Run the pipeline to completion.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let graph = Graph::build(&self.pipeline.steps)?;
        for warning in &graph.warnings {
            self.log.log(&format!("warning: {warning}"));
        }

        let interactive_idx = self.pipeline.steps.iter().position(|s| s.interactive);

        // Forward an interrupt to the dispatch machinery; each in-flight
        // exec watches the same channel and kills its child.
        let ctrlc = {
            let tx = self.cancel_tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(true);
                }
            })
        };

        let failed_steps = self.dispatch_dag(&graph, interactive_idx).await;
        ctrlc.abort();

        if !failed_steps.is_empty() {
            self.finish(RunStatus::Failed);
            if self.ui.is_none() {
                self.log.log(&format!(
                    "pipeline {:?} failed steps: {}",
                    self.pipeline.name,
                    failed_steps.join(", ")
                ));
            }
            if let Some(ui) = &self.ui {
                ui.finish();
            }
            eprintln!(
                "\n\x1b[2mPipeline failed. Resume with:\n  pipe {} --resume {}\x1b[0m\n",
                self.pipeline.name,
                self.run_id()
            );
            return Err(Error::PipelineFailed);
        }

        // DAG succeeded; the interactive step (if any) runs last with the
        // terminal to itself.
        if let Some(idx) = interactive_idx {
            if let Some(ui) = &self.ui {
                ui.finish();
            }
            let step = self.pipeline.steps[idx].clone();
            if let Err(e) = self.run_interactive(&step).await {
                self.finish(RunStatus::Failed);
                return Err(e);
            }
        }

        self.finish(RunStatus::Done);
        self.log.log(&format!(
            "pipeline {:?} completed (run {})",
            self.pipeline.name,
            self.run_id()
        ));
        if self.ui.is_some() && interactive_idx.is_none() {
            if let Some(ui) = &self.ui {
                ui.finish();
            }
        }
        Ok(())
    }

    /// Seed ready steps and consume the completion channel until every
    /// non-interactive step has finished or been cascade-failed. Returns
    /// the failed step ids in completion order.
    async fn dispatch_dag(
        self: &Arc<Self>,
        graph: &Graph,
        interactive_idx: Option<usize>,
    ) -> Vec<String> {
        let n = graph.len();
        let mut in_deg = graph.in_degree.clone();
        let mut failed = vec![false; n];
        let mut failed_steps = Vec::new();

        let total = n - usize::from(interactive_idx.is_some());
        let mut completed = 0usize;

        let sem = Arc::new(Semaphore::new(self.max_parallel));
        let (tx, mut rx) = mpsc::unbounded_channel::<StepOutcome>();

        for idx in 0..n {
            if Some(idx) == interactive_idx {
                continue;
            }
            if in_deg[idx] == 0 {
                self.spawn_worker(idx, &sem, &tx);
            }
        }

        while completed < total {
            let Some(outcome) = rx.recv().await else {
                break;
            };
            completed += 1;

            match outcome.result {
                Err(_) => {
                    failed[outcome.idx] = true;
                    failed_steps.push(graph.id(outcome.idx).to_string());
                    self.cascade_fail(
                        outcome.idx,
                        graph,
                        &mut failed,
                        &mut completed,
                        interactive_idx,
                    );
                }
                Ok(()) => {
                    for &dep in &graph.dependents[outcome.idx] {
                        if Some(dep) == interactive_idx || failed[dep] {
                            continue;
                        }
                        in_deg[dep] -= 1;
                        if in_deg[dep] == 0 {
                            self.spawn_worker(dep, &sem, &tx);
                        }
                    }
                }
            }
        }

        failed_steps
    }

    /// Spawn a worker for one step. The worker holds one semaphore permit
    /// per child process the step will fan out to (clamped to the cap so a
    /// wide step cannot deadlock the run).
    fn spawn_worker(
        self: &Arc<Self>,
        idx: usize,
        sem: &Arc<Semaphore>,
        tx: &mpsc::UnboundedSender<StepOutcome>,
    ) {
        let runner = Arc::clone(self);
        let sem = Arc::clone(sem);
        let tx = tx.clone();
        let step = self.pipeline.steps[idx].clone();
        tokio::spawn(async move {
            let slots = step.process_count().clamp(1, runner.max_parallel) as u32;
            let _permit = sem
                .acquire_many(slots)
                .await
                .expect("semaphore never closes");
            let result = runner.run_step(&step).await;
            let _ = tx.send(StepOutcome { idx, result });
        });
    }

    /// BFS through the failed step's transitive dependents, marking each
    /// failed in state and counting it as completed so the dispatch loop
    /// terminates.
    fn cascade_fail(
        &self,
        origin: usize,
        graph: &Graph,
        failed: &mut [bool],
        completed: &mut usize,
        interactive_idx: Option<usize>,
    ) {
        let origin_id = graph.id(origin).to_string();
        let mut queue = VecDeque::from([origin]);
        while let Some(curr) = queue.pop_front() {
            for &dep in &graph.dependents[curr] {
                if Some(dep) == interactive_idx || failed[dep] {
                    continue;
                }
                failed[dep] = true;
                let dep_id = graph.id(dep);
                self.log
                    .log(&format!("[{dep_id}] skipped (dependency {origin_id:?} failed)"));
                self.ui_status_step(&self.pipeline.steps[dep], Status::Failed);
                self.update_step_state(dep_id, |ss| {
                    ss.status = StepStatus::Failed;
                    ss.at = Some(Utc::now());
                });
                *completed += 1;
                queue.push_back(dep);
            }
        }
    }

    fn finish(&self, status: RunStatus) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.status = status;
        state.finished_at = Some(Utc::now());
        self.save_state_locked(&state);
    }

    // --- shared-state helpers ---

    pub(crate) fn get_step_state(&self, id: &str) -> StepState {
        self.state.lock().expect("state mutex poisoned").step(id)
    }

    /// Mutate a step's slot and persist, all under the state mutex.
    pub(crate) fn update_step_state(&self, id: &str, mutate: impl FnOnce(&mut StepState)) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let mut ss = state.steps.get(id).cloned().unwrap_or_default();
        mutate(&mut ss);
        state.steps.insert(id.to_string(), ss);
        self.save_state_locked(&state);
    }

    pub(crate) fn update_sub_state(&self, step_id: &str, sub_id: &str, sub: StepState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let mut ss = state.steps.get(step_id).cloned().unwrap_or_default();
        ss.sub_steps.insert(sub_id.to_string(), sub);
        state.steps.insert(step_id.to_string(), ss);
        self.save_state_locked(&state);
    }

    /// State write failures reduce resume fidelity but do not stop the run.
    fn save_state_locked(&self, state: &RunState) {
        if let Err(e) = self.state_store.save(state) {
            self.log.log(&format!("error: failed to save state: {e}"));
        }
    }

    pub(crate) fn set_env(&self, key: String, value: String) {
        self.env
            .lock()
            .expect("env mutex poisoned")
            .insert(key, value);
    }

    pub(crate) fn env_snapshot(&self) -> HashMap<String, String> {
        self.env.lock().expect("env mutex poisoned").clone()
    }

    // --- status display helpers ---

    pub(crate) fn has_ui(&self) -> bool {
        self.ui.is_some()
    }

    pub(crate) fn ui_handle(&self) -> Option<Arc<dyn StatusSink>> {
        self.ui.clone()
    }

    pub(crate) fn ui_status(&self, id: &str, status: Status) {
        if let Some(ui) = &self.ui {
            ui.set_status(id, status);
        }
    }

    /// Set the status of every display row belonging to a step.
    pub(crate) fn ui_status_step(&self, step: &Step, status: Status) {
        match &step.run {
            RunField::Strings(cmds) => {
                for i in 0..cmds.len() {
                    self.ui_status(&format!("{}/run_{i}", step.id), status);
                }
            }
            RunField::SubRuns(subs) => {
                for sub in subs {
                    self.ui_status(&format!("{}/{}", step.id, sub.id), status);
                }
            }
            _ => self.ui_status(&step.id, status),
        }
    }

    /// Send captured stderr lines to the status display so they render
    /// under the failed row. Must happen before the row flips to Failed,
    /// which flushes collected output.
    pub(crate) fn emit_stderr_on_error(&self, row_id: &str, stderr: &str) {
        let Some(ui) = &self.ui else { return };
        if stderr.is_empty() {
            return;
        }
        for line in stderr.trim_end_matches('\n').split('\n') {
            ui.add_output(row_id, line);
        }
    }

    /// Flush a finished child's buffered output as one block, prefixed with
    /// its row id, so parallel steps do not interleave on stderr.
    pub(crate) fn emit_grouped(&self, row_id: &str, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let _guard = self.emit.lock().expect("emit mutex poisoned");
        for line in lines {
            eprintln!("\x1b[36m[{row_id}]\x1b[0m {line}");
        }
    }

    // --- cancellation ---

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub(crate) fn trim_newlines(s: &str) -> String {
    s.trim_end_matches('\n').to_string()
}
