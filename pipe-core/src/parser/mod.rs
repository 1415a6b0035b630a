// Pipeline loader
// Reads YAML definitions, enforces structural invariants, lists known pipelines

pub mod lint;
pub mod models;

pub use lint::lint_warnings;
pub use models::{CacheField, DependsOnField, Pipeline, RunField, Step, SubRun};

use std::collections::HashSet;
use std::path::Path;

use crate::config::Paths;
use crate::error::{Error, Result};

/// Lightweight metadata about a known pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInfo {
    pub name: String,
    pub description: String,
}

/// Load a pipeline by name from the files directory.
pub fn load_pipeline(paths: &Paths, name: &str) -> Result<Pipeline> {
    let path = paths.files.join(format!("{name}.yaml"));
    load_pipeline_from_path(&path, name)
}

/// Load and validate a pipeline definition from an explicit path. An empty
/// `name` field in the YAML falls back to the given name.
pub fn load_pipeline_from_path(path: &Path, name: &str) -> Result<Pipeline> {
    let data = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut pipeline: Pipeline = serde_yaml::from_str(&data).map_err(|source| Error::Yaml {
        name: name.to_string(),
        source,
    })?;

    if pipeline.name.is_empty() {
        pipeline.name = name.to_string();
    }

    validate(&pipeline)?;
    Ok(pipeline)
}

/// Check the structural invariants the rest of the engine assumes:
/// well-formed unique step ids, exactly one run variant per step, unique
/// sub-run ids within a step, well-formed variable keys, and at most one
/// interactive step.
pub fn validate(pipeline: &Pipeline) -> Result<()> {
    for key in pipeline.vars.keys() {
        if !is_valid_var_key(key) {
            return Err(Error::InvalidPipeline(format!(
                "variable key {key:?}: use only letters, digits, hyphens, and underscores"
            )));
        }
    }

    let mut ids = HashSet::new();
    let mut interactive = 0usize;
    for (i, step) in pipeline.steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(Error::InvalidPipeline(format!("step {i}: missing id")));
        }
        if !is_valid_step_id(&step.id) {
            return Err(Error::InvalidPipeline(format!(
                "step {i}: invalid id {:?}",
                step.id
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(Error::InvalidPipeline(format!(
                "step {i}: duplicate id {:?}",
                step.id
            )));
        }

        if step.run.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "step {:?}: missing run field",
                step.id
            )));
        }

        if let RunField::SubRuns(subs) = &step.run {
            let mut sub_ids = HashSet::new();
            for sub in subs {
                if sub.id.is_empty() || !is_valid_step_id(&sub.id) {
                    return Err(Error::InvalidPipeline(format!(
                        "step {:?}: invalid sub-run id {:?}",
                        step.id, sub.id
                    )));
                }
                if sub.run.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "step {:?}: sub-run {:?} missing run command",
                        step.id, sub.id
                    )));
                }
                if !sub_ids.insert(sub.id.as_str()) {
                    return Err(Error::InvalidPipeline(format!(
                        "step {:?}: duplicate sub-run id {:?}",
                        step.id, sub.id
                    )));
                }
            }
        }

        if step.interactive {
            interactive += 1;
            if interactive > 1 {
                return Err(Error::InvalidPipeline(
                    "at most one step may set interactive: true".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Enumerate `<files-dir>/*.yaml` into name + description summaries,
/// sorted by name. Unreadable or unparseable files are skipped.
pub fn list_pipelines(paths: &Paths) -> Result<Vec<PipelineInfo>> {
    let entries = match std::fs::read_dir(&paths.files) {
        Ok(entries) => entries,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::Io {
                path: paths.files.clone(),
                source,
            })
        }
    };

    let mut infos = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let Ok(data) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(pipeline) = serde_yaml::from_str::<Pipeline>(&data) else {
            continue;
        };
        let name = if pipeline.name.is_empty() {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string()
        } else {
            pipeline.name
        };
        infos.push(PipelineInfo {
            name,
            description: pipeline.description,
        });
    }

    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

/// Step ids start with an alphanumeric and continue with alphanumerics,
/// hyphens, or underscores.
pub fn is_valid_step_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Variable keys (and dot-file keys) allow letters, digits, hyphens, and
/// underscores, and are non-empty.
pub fn is_valid_var_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_yaml(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("{name}.yaml")), content).unwrap();
    }

    #[test]
    fn load_valid_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        write_yaml(
            &paths.files,
            "deploy",
            "name: deploy\ndescription: ship it\nsteps:\n  - id: build\n    run: make\n",
        );

        let p = load_pipeline(&paths, "deploy").unwrap();
        assert_eq!(p.name, "deploy");
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].id, "build");
    }

    #[test]
    fn name_defaults_to_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        write_yaml(&paths.files, "anon", "steps:\n  - id: a\n    run: x\n");

        let p = load_pipeline(&paths, "anon").unwrap();
        assert_eq!(p.name, "anon");
    }

    #[test]
    fn load_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        assert!(matches!(
            load_pipeline(&paths, "nope"),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let p: Pipeline = serde_yaml::from_str(
            "steps:\n  - id: a\n    run: x\n  - id: a\n    run: y\n",
        )
        .unwrap();
        let err = validate(&p).unwrap_err();
        assert!(err.to_string().contains("duplicate id"));
    }

    #[test]
    fn validate_rejects_missing_run() {
        let p: Pipeline = serde_yaml::from_str("steps:\n  - id: a\n").unwrap();
        let err = validate(&p).unwrap_err();
        assert!(err.to_string().contains("missing run"));
    }

    #[test]
    fn validate_rejects_bad_step_id() {
        let p: Pipeline = serde_yaml::from_str("steps:\n  - id: \"-bad\"\n    run: x\n").unwrap();
        assert!(validate(&p).is_err());
    }

    #[test]
    fn validate_rejects_two_interactive_steps() {
        let p: Pipeline = serde_yaml::from_str(
            "steps:\n  - id: a\n    run: x\n    interactive: true\n  - id: b\n    run: y\n    interactive: true\n",
        )
        .unwrap();
        let err = validate(&p).unwrap_err();
        assert!(err.to_string().contains("interactive"));
    }

    #[test]
    fn validate_rejects_duplicate_sub_run_ids() {
        let yaml = r#"
steps:
  - id: fetch
    run:
      - id: t
        run: a
      - id: t
        run: b
"#;
        let p: Pipeline = serde_yaml::from_str(yaml).unwrap();
        let err = validate(&p).unwrap_err();
        assert!(err.to_string().contains("duplicate sub-run id"));
    }

    #[test]
    fn list_pipelines_sorted_with_fallback_names() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        write_yaml(&paths.files, "zeta", "description: last\nsteps: []\n");
        write_yaml(&paths.files, "alpha", "name: alpha\ndescription: first\nsteps: []\n");

        let infos = list_pipelines(&paths).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "alpha");
        assert_eq!(infos[1].name, "zeta");
        assert_eq!(infos[1].description, "last");
    }

    #[test]
    fn list_pipelines_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path());
        assert!(list_pipelines(&paths).unwrap().is_empty());
    }
}
