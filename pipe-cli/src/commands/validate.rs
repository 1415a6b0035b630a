// Validate a pipeline definition and surface lint findings

use color_eyre::Result;
use pipe_core::{lint_warnings, Graph, Paths};

use crate::commands::resolve_pipeline;
use crate::output;

pub fn execute(name: &str) -> Result<()> {
    let paths = Paths::resolve();
    let pipeline = resolve_pipeline(&paths, name)?;

    // Catches cycles and self-dependencies beyond what the loader enforces.
    Graph::build(&pipeline.steps)?;

    let warnings = lint_warnings(&pipeline);
    for warning in &warnings {
        output::warning(warning);
    }

    if warnings.is_empty() {
        output::success(&format!(
            "pipeline {:?} is valid ({} steps)",
            pipeline.name,
            pipeline.steps.len()
        ));
    } else {
        output::success(&format!(
            "pipeline {:?} is valid ({} steps, {} warnings)",
            pipeline.name,
            pipeline.steps.len(),
            warnings.len()
        ));
    }
    Ok(())
}
