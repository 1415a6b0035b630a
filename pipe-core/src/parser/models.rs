// Pipeline data model
// Mirrors the YAML schema; union-typed fields get custom deserializers

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// A validated pipeline definition. Immutable during a run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Declared variable keys and their default values.
    #[serde(default)]
    pub vars: HashMap<String, String>,
    /// Optional KEY=value file merged into the variable resolution chain.
    #[serde(default)]
    pub dot_file: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// The step marked `interactive: true`, if any.
    pub fn interactive_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.interactive)
    }
}

/// A single unit of execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub run: RunField,
    #[serde(default)]
    pub depends_on: DependsOnField,
    /// Extra attempts after a failure. Applies to the single-command
    /// variant only.
    #[serde(default)]
    pub retry: u32,
    /// Output must never be logged, stored, or cached as text.
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, rename = "cache")]
    pub cached: CacheField,
    /// Runs last, outside the DAG, with the terminal attached.
    #[serde(default)]
    pub interactive: bool,
    /// Stream stdout at default verbosity.
    #[serde(default)]
    pub output: bool,
}

impl Step {
    /// Number of concurrent child processes this step spawns.
    pub fn process_count(&self) -> usize {
        match &self.run {
            RunField::Strings(cmds) => cmds.len(),
            RunField::SubRuns(subs) => subs.len(),
            _ => 1,
        }
    }

    /// All shell commands of the step, across variants.
    pub fn commands(&self) -> Vec<&str> {
        match &self.run {
            RunField::Empty => Vec::new(),
            RunField::Single(cmd) => vec![cmd.as_str()],
            RunField::Strings(cmds) => cmds.iter().map(String::as_str).collect(),
            RunField::SubRuns(subs) => subs.iter().map(|s| s.run.as_str()).collect(),
        }
    }
}

/// The three YAML shapes of a step's `run` field:
///
///   - scalar string: one command
///   - sequence of strings: parallel plain commands, stdout uncaptured
///   - sequence of mappings: parallel named sub-runs, stdout captured per id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunField {
    /// No command given. Rejected by validation; exists so `Step` has a
    /// usable `Default`.
    #[default]
    Empty,
    Single(String),
    Strings(Vec<String>),
    SubRuns(Vec<SubRun>),
}

impl RunField {
    pub fn is_single(&self) -> bool {
        matches!(self, RunField::Single(_))
    }

    pub fn is_strings(&self) -> bool {
        matches!(self, RunField::Strings(_))
    }

    pub fn is_sub_runs(&self) -> bool {
        matches!(self, RunField::SubRuns(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RunField::Empty)
    }
}

impl<'de> Deserialize<'de> for RunField {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => Ok(RunField::Single(s)),
            serde_yaml::Value::Sequence(seq) => {
                if seq.is_empty() {
                    return Err(de::Error::custom("run: empty sequence"));
                }
                if matches!(seq.first(), Some(serde_yaml::Value::String(_))) {
                    let mut cmds = Vec::with_capacity(seq.len());
                    for item in seq {
                        match item {
                            serde_yaml::Value::String(s) => cmds.push(s),
                            _ => {
                                return Err(de::Error::custom(
                                    "run: each list item must be a string or a mapping (id + run)",
                                ))
                            }
                        }
                    }
                    Ok(RunField::Strings(cmds))
                } else if matches!(seq.first(), Some(serde_yaml::Value::Mapping(_))) {
                    let mut subs = Vec::with_capacity(seq.len());
                    for item in seq {
                        let sub: SubRun =
                            serde_yaml::from_value(item).map_err(de::Error::custom)?;
                        subs.push(sub);
                    }
                    Ok(RunField::SubRuns(subs))
                } else {
                    Err(de::Error::custom(
                        "run: each list item must be a string or a mapping (id + run)",
                    ))
                }
            }
            _ => Err(de::Error::custom(
                "run: must be a string command or a list of commands",
            )),
        }
    }
}

/// A named child of a parallel step. Its stdout is captured under a
/// compound environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubRun {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub sensitive: bool,
}

/// `depends_on` accepts a scalar step id or a sequence of ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependsOnField {
    pub steps: Vec<String>,
}

impl<'de> Deserialize<'de> for DependsOnField {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => Ok(DependsOnField {
                steps: if s.is_empty() { Vec::new() } else { vec![s] },
            }),
            serde_yaml::Value::Sequence(seq) => {
                let mut steps = Vec::with_capacity(seq.len());
                for item in seq {
                    match item {
                        serde_yaml::Value::String(s) => steps.push(s),
                        _ => {
                            return Err(de::Error::custom(
                                "depends_on: must be a string or list of strings",
                            ))
                        }
                    }
                }
                Ok(DependsOnField { steps })
            }
            _ => Err(de::Error::custom(
                "depends_on: must be a string or list of strings",
            )),
        }
    }
}

/// `cache` accepts a bool or a mapping with `expireAfter`:
///
///   - `cache: true` becomes `{enabled: true, expire_after: ""}`
///   - `cache: {expireAfter: "1h"}` becomes `{enabled: true, expire_after: "1h"}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheField {
    pub enabled: bool,
    pub expire_after: String,
}

impl<'de> Deserialize<'de> for CacheField {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Mapping {
            #[serde(default, rename = "expireAfter")]
            expire_after: String,
        }

        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::Bool(enabled) => Ok(CacheField {
                enabled,
                expire_after: String::new(),
            }),
            serde_yaml::Value::Mapping(_) => {
                let m: Mapping = serde_yaml::from_value(value).map_err(de::Error::custom)?;
                Ok(CacheField {
                    enabled: true,
                    expire_after: m.expire_after,
                })
            }
            other => Err(de::Error::custom(format!(
                "cache: must be a bool or a mapping with expireAfter, got {}",
                value_kind(&other)
            ))),
        }
    }
}

fn value_kind(v: &serde_yaml::Value) -> &'static str {
    match v {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

impl fmt::Display for RunField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunField::Empty => write!(f, "(none)"),
            RunField::Single(cmd) => write!(f, "{cmd}"),
            RunField::Strings(cmds) => write!(f, "{} parallel commands", cmds.len()),
            RunField::SubRuns(subs) => write!(f, "{} parallel sub-runs", subs.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_field_scalar() {
        let step: Step = serde_yaml::from_str("id: build\nrun: \"make all\"").unwrap();
        assert_eq!(step.run, RunField::Single("make all".into()));
        assert_eq!(step.process_count(), 1);
    }

    #[test]
    fn run_field_string_list() {
        let step: Step = serde_yaml::from_str("id: checks\nrun:\n  - make lint\n  - make test")
            .unwrap();
        assert_eq!(
            step.run,
            RunField::Strings(vec!["make lint".into(), "make test".into()])
        );
        assert_eq!(step.process_count(), 2);
    }

    #[test]
    fn run_field_sub_runs() {
        let yaml = r#"
id: fetch
run:
  - id: token
    run: get-token
    sensitive: true
  - id: region
    run: get-region
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        match &step.run {
            RunField::SubRuns(subs) => {
                assert_eq!(subs.len(), 2);
                assert_eq!(subs[0].id, "token");
                assert!(subs[0].sensitive);
                assert_eq!(subs[1].run, "get-region");
                assert!(!subs[1].sensitive);
            }
            other => panic!("expected sub-runs, got {other:?}"),
        }
    }

    #[test]
    fn run_field_empty_sequence_rejected() {
        let err = serde_yaml::from_str::<Step>("id: x\nrun: []").unwrap_err();
        assert!(err.to_string().contains("empty sequence"));
    }

    #[test]
    fn run_field_mixed_sequence_rejected() {
        assert!(serde_yaml::from_str::<Step>("id: x\nrun:\n  - ok\n  - 42").is_err());
    }

    #[test]
    fn depends_on_scalar_and_list() {
        let step: Step = serde_yaml::from_str("id: b\nrun: x\ndepends_on: a").unwrap();
        assert_eq!(step.depends_on.steps, vec!["a"]);

        let step: Step =
            serde_yaml::from_str("id: c\nrun: x\ndepends_on: [a, b]").unwrap();
        assert_eq!(step.depends_on.steps, vec!["a", "b"]);
    }

    #[test]
    fn cache_field_bool() {
        let step: Step = serde_yaml::from_str("id: x\nrun: y\ncache: true").unwrap();
        assert!(step.cached.enabled);
        assert!(step.cached.expire_after.is_empty());

        let step: Step = serde_yaml::from_str("id: x\nrun: y\ncache: false").unwrap();
        assert!(!step.cached.enabled);
    }

    #[test]
    fn cache_field_mapping() {
        let step: Step =
            serde_yaml::from_str("id: x\nrun: y\ncache:\n  expireAfter: \"30m\"").unwrap();
        assert!(step.cached.enabled);
        assert_eq!(step.cached.expire_after, "30m");
    }

    #[test]
    fn cache_field_invalid_shape_rejected() {
        assert!(serde_yaml::from_str::<Step>("id: x\nrun: y\ncache: [a]").is_err());
        assert!(serde_yaml::from_str::<Step>("id: x\nrun: y\ncache: \"yes\"").is_err());
    }

    #[test]
    fn step_defaults() {
        let step: Step = serde_yaml::from_str("id: x\nrun: y").unwrap();
        assert_eq!(step.retry, 0);
        assert!(!step.sensitive);
        assert!(!step.cached.enabled);
        assert!(!step.interactive);
        assert!(!step.output);
        assert!(step.depends_on.steps.is_empty());
    }

    #[test]
    fn commands_covers_all_variants() {
        let single = Step {
            run: RunField::Single("echo a".into()),
            ..Default::default()
        };
        assert_eq!(single.commands(), vec!["echo a"]);

        let subs = Step {
            run: RunField::SubRuns(vec![SubRun {
                id: "t".into(),
                run: "echo t".into(),
                sensitive: false,
            }]),
            ..Default::default()
        };
        assert_eq!(subs.commands(), vec!["echo t"]);
    }
}
