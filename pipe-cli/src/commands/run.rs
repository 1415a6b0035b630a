// The default command: run (or resume) a pipeline

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::bail;
use color_eyre::Result;
use tracing::{debug, warn};

use pipe_core::state::{RunState, RunStatus};
use pipe_core::{
    dotfile, lint_warnings, logging, vars, CacheStore, Error, Logger, Paths, Runner, StateStore,
    StatusSink,
};

use crate::commands::resolve_pipeline;
use crate::status_ui::StatusUi;

pub async fn execute(
    name: &str,
    resume: Option<&str>,
    verbosity: u8,
    var_args: &[String],
) -> Result<()> {
    let paths = Paths::resolve();

    let mut overrides = HashMap::new();
    for pair in var_args {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid variable {pair:?}; expected KEY=value");
        };
        overrides.insert(key.to_string(), value.to_string());
    }

    let pipeline = resolve_pipeline(&paths, name)?;
    debug!(
        pipeline = %pipeline.name,
        steps = pipeline.steps.len(),
        vars = pipeline.vars.len(),
        "parsed pipeline"
    );

    for warning in lint_warnings(&pipeline) {
        warn!("{warning}");
    }

    paths.ensure_dirs(&pipeline.name)?;

    let states = StateStore::new(&paths);
    let run_state = match resume {
        Some(run_id) => {
            let mut rs = states.load(&pipeline.name, run_id)?;
            rs.status = RunStatus::Running;
            debug!(run_id = %rs.run_id, "resuming run");
            rs
        }
        None => {
            let rs = RunState::new(&pipeline.name);
            debug!(run_id = %rs.run_id, "new run");
            rs
        }
    };

    // Compact status display on a terminal at default verbosity; plain
    // streamed log lines otherwise.
    let compact = verbosity == 0 && std::io::stderr().is_terminal();
    let logger = Logger::new(&paths, &pipeline.name, &run_state.run_id, compact)?;
    let ui: Option<Arc<dyn StatusSink>> = if compact {
        Some(Arc::new(StatusUi::new(&pipeline.steps)))
    } else {
        None
    };

    match logging::rotate_logs(&paths, &pipeline.name) {
        Ok(warnings) => {
            for warning in warnings {
                warn!("{warning}");
            }
        }
        Err(e) => warn!("log rotation failed: {e}"),
    }

    if resume.is_some() {
        logger.log(&format!(
            "resuming pipeline {:?} (run {})",
            pipeline.name, run_state.run_id
        ));
    } else {
        logger.log(&format!(
            "starting pipeline {:?} (run {})",
            pipeline.name, run_state.run_id
        ));
    }

    states.save(&run_state)?;
    if resume.is_none() {
        match states.rotate(&pipeline.name, &run_state.run_id) {
            Ok(warnings) => {
                for warning in warnings {
                    warn!("{warning}");
                }
            }
            Err(e) => warn!("state rotation failed: {e}"),
        }
    }

    let mut dot_vars = HashMap::new();
    if !pipeline.dot_file.is_empty() {
        match dotfile::parse_dot_file(Path::new(&pipeline.dot_file)) {
            Ok((parsed, warnings)) => {
                dot_vars = parsed;
                for warning in warnings {
                    warn!("{warning}");
                }
            }
            // Missing dot file: silent skip.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "dot file {} could not be fully read: {e}",
                pipeline.dot_file
            ),
        }
    }

    let (resolved, warnings) = vars::resolve_vars(&pipeline.vars, &dot_vars, &overrides);
    for warning in warnings {
        warn!("{warning}");
    }
    for warning in vars::unmatched_env_var_warnings(&pipeline.vars) {
        warn!("{warning}");
    }
    debug!(total = resolved.len(), overrides = overrides.len(), "resolved variables");

    let runner = Arc::new(Runner::new(
        pipeline,
        run_state,
        states,
        CacheStore::new(&paths),
        logger,
        resolved,
        ui,
        verbosity,
    ));
    if resume.is_some() {
        runner.restore_env_from_state();
    }

    match runner.run().await {
        Ok(()) => Ok(()),
        // Per-step failures are already on screen; just exit non-zero.
        Err(Error::PipelineFailed) => std::process::exit(1),
        Err(e) => Err(e.into()),
    }
}
