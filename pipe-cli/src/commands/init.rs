// Scaffold a starter pipeline definition

use color_eyre::eyre::bail;
use color_eyre::Result;
use pipe_core::{parser, Paths};

use crate::output;

pub fn execute(name: &str) -> Result<()> {
    if !parser::is_valid_step_id(name) {
        bail!("invalid pipeline name {name:?}: use letters, digits, hyphens, and underscores");
    }

    let paths = Paths::resolve();
    std::fs::create_dir_all(&paths.files)?;

    let path = paths.files.join(format!("{name}.yaml"));
    if path.exists() {
        bail!("pipeline {name:?} already exists at {}", path.display());
    }

    let template = format!(
        r#"name: {name}
description: ""

vars:
  greeting: hello

steps:
  - id: first
    run: "echo $PIPE_VAR_GREETING"

  - id: second
    run: "echo after-$PIPE_FIRST"
"#
    );
    std::fs::write(&path, template)?;

    output::success(&format!("created {}", path.display()));
    output::dim(&format!("run it with: pipe {name}"));
    Ok(())
}
