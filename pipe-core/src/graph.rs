// Dependency graph builder
// Explicit depends_on edges plus implicit edges from $PIPE_* references,
// with Kahn-style cycle detection

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::parser::{RunField, Step};
use crate::vars::env_key;

/// Matches `$PIPE_<NAME>` and `${PIPE_<NAME>}` references in shell commands.
fn pipe_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{?PIPE_([A-Z0-9_]+)\}?").unwrap())
}

/// A DAG over pipeline steps. Steps are integer indices into the original
/// step vector; ids appear only in `order`, warnings, and error messages.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// `deps[to]` lists the steps `to` depends on.
    pub deps: Vec<Vec<usize>>,
    /// `dependents[from]` lists the steps that depend on `from`.
    pub dependents: Vec<Vec<usize>>,
    pub in_degree: Vec<usize>,
    /// Step ids preserving YAML order; the scheduler's deterministic
    /// tiebreaker.
    pub order: Vec<String>,
    index: HashMap<String, usize>,
    /// Non-fatal findings, currently only unknown `depends_on` references.
    pub warnings: Vec<String>,
}

impl Graph {
    /// Build the dependency graph for an ordered step list.
    ///
    /// Explicit edges come from `depends_on`; implicit edges come from
    /// `$PIPE_X` references that resolve to another step's output variable.
    /// Unresolved references produce no edge and no warning (the shell may
    /// legitimately consume an externally provided variable). Self-references
    /// and cycles fail the build.
    pub fn build(steps: &[Step]) -> Result<Graph> {
        let n = steps.len();
        let mut graph = Graph {
            deps: vec![Vec::new(); n],
            dependents: vec![Vec::new(); n],
            in_degree: vec![0; n],
            order: Vec::with_capacity(n),
            index: HashMap::with_capacity(n),
            warnings: Vec::new(),
        };

        // env-name -> producing step index
        let mut env_to_step: HashMap<String, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            graph.order.push(step.id.clone());
            graph.index.insert(step.id.clone(), i);

            env_to_step.insert(env_key(&[&step.id]), i);
            if let RunField::SubRuns(subs) = &step.run {
                for sub in subs {
                    env_to_step.insert(env_key(&[&step.id, &sub.id]), i);
                }
            }
        }

        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        let mut add_edge = |graph: &mut Graph, from: usize, to: usize| {
            if edges.insert((from, to)) {
                graph.deps[to].push(from);
                graph.dependents[from].push(to);
                graph.in_degree[to] += 1;
            }
        };

        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on.steps {
                if dep == &step.id {
                    return Err(Error::InvalidPipeline(format!(
                        "step {:?}: self-dependency",
                        step.id
                    )));
                }
                match graph.index.get(dep).copied() {
                    Some(from) => add_edge(&mut graph, from, i),
                    None => graph.warnings.push(format!(
                        "step {:?}: unknown dependency {dep:?} (ignored)",
                        step.id
                    )),
                }
            }

            for reference in find_pipe_refs(step) {
                if let Some(&producer) = env_to_step.get(&reference) {
                    if producer != i {
                        add_edge(&mut graph, producer, i);
                    }
                }
            }
        }

        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.order[idx]
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Kahn's algorithm: peel zero in-degree steps; anything left with
    /// positive in-degree is on a cycle and named in the error.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_deg = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&i| in_deg[i] == 0).collect();

        let mut processed = 0;
        while let Some(curr) = queue.pop_front() {
            processed += 1;
            for &dep in &self.dependents[curr] {
                in_deg[dep] -= 1;
                if in_deg[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if processed < self.len() {
            let in_cycle: Vec<&str> = (0..self.len())
                .filter(|&i| in_deg[i] > 0)
                .map(|i| self.id(i))
                .collect();
            return Err(Error::InvalidPipeline(format!(
                "dependency cycle detected among steps: {}",
                in_cycle.join(", ")
            )));
        }

        Ok(())
    }
}

/// Distinct `PIPE_*` variable names referenced by a step's commands.
fn find_pipe_refs(step: &Step) -> Vec<String> {
    let mut refs = Vec::new();
    let mut seen = HashSet::new();
    for cmd in step.commands() {
        for cap in pipe_var_pattern().captures_iter(cmd) {
            let name = format!("PIPE_{}", &cap[1]);
            if seen.insert(name.clone()) {
                refs.push(name);
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{DependsOnField, SubRun};

    fn step(id: &str, run: &str) -> Step {
        Step {
            id: id.to_string(),
            run: RunField::Single(run.to_string()),
            ..Default::default()
        }
    }

    fn step_deps(id: &str, run: &str, deps: &[&str]) -> Step {
        Step {
            depends_on: DependsOnField {
                steps: deps.iter().map(|s| s.to_string()).collect(),
            },
            ..step(id, run)
        }
    }

    #[test]
    fn explicit_edges() {
        let steps = vec![
            step("a", "true"),
            step_deps("b", "true", &["a"]),
            step_deps("c", "true", &["a", "b"]),
        ];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.in_degree, vec![0, 1, 2]);
        assert_eq!(g.dependents[0], vec![1, 2]);
        assert_eq!(g.deps[2], vec![0, 1]);
        assert!(g.warnings.is_empty());
    }

    #[test]
    fn implicit_edge_from_variable_reference() {
        let steps = vec![
            step("get-version", "printf 1.2.3"),
            step("build", "printf built-$PIPE_GET_VERSION"),
        ];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.deps[1], vec![0]);
        assert_eq!(g.in_degree[1], 1);
    }

    #[test]
    fn braced_reference_resolves() {
        let steps = vec![
            step("ver", "printf 1"),
            step("use", "echo ${PIPE_VER}-suffix"),
        ];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.deps[1], vec![0]);
    }

    #[test]
    fn sub_run_reference_points_to_parent_step() {
        let steps = vec![
            Step {
                id: "fetch".into(),
                run: RunField::SubRuns(vec![SubRun {
                    id: "token".into(),
                    run: "get-token".into(),
                    sensitive: false,
                }]),
                ..Default::default()
            },
            step("use", "echo $PIPE_FETCH_TOKEN"),
        ];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.deps[1], vec![0]);
    }

    #[test]
    fn unresolved_reference_produces_no_edge_and_no_warning() {
        let steps = vec![step("only", "echo $PIPE_EXTERNAL_THING")];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.in_degree[0], 0);
        assert!(g.warnings.is_empty());
    }

    #[test]
    fn duplicate_edges_collapse() {
        // explicit dep and implicit reference to the same producer
        let steps = vec![
            step("a", "printf x"),
            step_deps("b", "echo $PIPE_A", &["a"]),
        ];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.in_degree[1], 1);
        assert_eq!(g.dependents[0], vec![1]);
    }

    #[test]
    fn self_dependency_fails() {
        let steps = vec![step_deps("a", "true", &["a"])];
        let err = Graph::build(&steps).unwrap_err();
        assert!(err.to_string().contains("self-dependency"));
    }

    #[test]
    fn self_variable_reference_is_not_an_edge() {
        let steps = vec![step("a", "echo $PIPE_A")];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.in_degree[0], 0);
    }

    #[test]
    fn unknown_dependency_warns() {
        let steps = vec![step_deps("a", "true", &["ghost"])];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.warnings.len(), 1);
        assert!(g.warnings[0].contains("ghost"));
        assert_eq!(g.in_degree[0], 0);
    }

    #[test]
    fn cycle_detected_and_named() {
        let steps = vec![
            step_deps("a", "true", &["c"]),
            step_deps("b", "true", &["a"]),
            step_deps("c", "true", &["b"]),
            step("free", "true"),
        ];
        let err = Graph::build(&steps).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a, b, c"));
        assert!(!msg.contains("free"));
    }

    #[test]
    fn order_preserves_yaml_order() {
        let steps = vec![step("z", "true"), step("a", "true"), step("m", "true")];
        let g = Graph::build(&steps).unwrap();
        assert_eq!(g.order, vec!["z", "a", "m"]);
        assert_eq!(g.index_of("m"), Some(2));
    }
}
