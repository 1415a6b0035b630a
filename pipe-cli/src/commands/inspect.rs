// Show a pipeline's variables, steps, and dependency edges

use color_eyre::Result;
use pipe_core::{Graph, Paths, RunField};

use crate::commands::resolve_pipeline;

pub fn execute(name: &str) -> Result<()> {
    let paths = Paths::resolve();
    let pipeline = resolve_pipeline(&paths, name)?;
    let graph = Graph::build(&pipeline.steps)?;

    println!("Pipeline: {}", pipeline.name);
    if !pipeline.description.is_empty() {
        println!("          {}", pipeline.description);
    }
    if !pipeline.dot_file.is_empty() {
        println!("Env File: {}", pipeline.dot_file);
    }

    if !pipeline.vars.is_empty() {
        println!("\nVariables:");
        let mut keys: Vec<&String> = pipeline.vars.keys().collect();
        keys.sort();
        let width = keys.iter().map(|k| k.len()).max().unwrap_or(0);
        for key in keys {
            println!("  {key:<width$}  (default: {:?})", pipeline.vars[key]);
        }
    }

    println!("\nSteps: {}", pipeline.steps.len());
    for (i, step) in pipeline.steps.iter().enumerate() {
        let mut notes = Vec::new();
        if step.retry > 0 {
            notes.push(format!("retry: {}", step.retry));
        }
        if step.sensitive {
            notes.push("sensitive".to_string());
        }
        if step.cached.enabled {
            if step.cached.expire_after.is_empty() {
                notes.push("cached".to_string());
            } else {
                notes.push(format!("cached ({})", step.cached.expire_after));
            }
        }
        if step.interactive {
            notes.push("interactive".to_string());
        }

        let deps: Vec<&str> = graph.deps[i].iter().map(|&d| graph.id(d)).collect();

        print!("  - {}", step.id);
        if !notes.is_empty() {
            print!("  [{}]", notes.join(", "));
        }
        println!();
        match &step.run {
            RunField::Single(cmd) => println!("      run: {cmd}"),
            other => println!("      run: {other}"),
        }
        if !deps.is_empty() {
            println!("      after: {}", deps.join(", "));
        }
    }

    for warning in &graph.warnings {
        crate::output::warning(warning);
    }
    Ok(())
}
