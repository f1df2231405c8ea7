//! Immutable templates: `Operation`, `Step`, and the `Benchmark` they belong to.
//!
//! These are the parsed-model types the (out-of-scope) declarative parser would
//! normally produce; the engine only ever reads them.

use crate::parameter::{Parameter, ParameterSet};
use crate::types::{DuplicatePolicy, UpdateMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One shell directive within a step's ordered operation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub do_string: String,
    pub async_filename: Option<String>,
    pub break_filename: Option<String>,
    pub error_filename: Option<String>,
    pub stdout_filename: Option<String>,
    pub stderr_filename: Option<String>,
    pub work_dir: Option<String>,
    /// A substitution-template boolean expression; `"true"` unless the parser says
    /// otherwise. Gates this operation only (see `Step::active`).
    pub active: String,
    pub shared: bool,
}

impl Operation {
    #[must_use]
    pub fn new(do_string: impl Into<String>) -> Self {
        Self {
            do_string: do_string.into(),
            async_filename: None,
            break_filename: None,
            error_filename: None,
            stdout_filename: None,
            stderr_filename: None,
            work_dir: None,
            active: "true".to_string(),
            shared: false,
        }
    }

    #[must_use]
    pub fn with_async_filename(mut self, name: impl Into<String>) -> Self {
        self.async_filename = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_break_filename(mut self, name: impl Into<String>) -> Self {
        self.break_filename = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_error_filename(mut self, name: impl Into<String>) -> Self {
        self.error_filename = Some(name.into());
        self
    }

    #[must_use]
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}

/// An immutable template describing one unit of repeated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Parameter/fileset/substituteset group names; each inner group is applied as
    /// one atomic merge (conflicts within a group are a spec error).
    pub use_groups: Vec<Vec<String>>,
    pub depends: BTreeSet<String>,
    pub iterations: u32,
    pub cycles: u32,
    pub procs: u32,
    pub shared_link_name: Option<String>,
    pub export: bool,
    pub alt_work_dir: Option<String>,
    pub suffix: String,
    pub max_async: Option<u32>,
    pub active: String,
    pub operations: Vec<Operation>,
}

impl Step {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            use_groups: Vec::new(),
            depends: BTreeSet::new(),
            iterations: 1,
            cycles: 1,
            procs: 1,
            shared_link_name: None,
            export: false,
            alt_work_dir: None,
            suffix: String::new(),
            max_async: None,
            active: "true".to_string(),
            operations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    #[must_use]
    pub fn with_procs(mut self, procs: u32) -> Self {
        self.procs = procs;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends.insert(step.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    #[must_use]
    pub fn with_shared_link_name(mut self, name: impl Into<String>) -> Self {
        self.shared_link_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn has_shared_operation(&self) -> bool {
        self.operations.iter().any(|op| op.shared)
    }

    /// Spec check: shared operations are forbidden in steps with `procs>1`
    /// (boundary behavior from §8).
    #[must_use]
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.procs > 1 && self.has_shared_operation() {
            return Err(crate::error::Error::IncompatibleUse {
                name: format!("step \"{}\": shared operation with procs>1", self.name),
            });
        }
        Ok(())
    }
}

/// The parsed specification plus its per-run parameter/fileset catalogs.
///
/// Step lookups and named parameter-set catalogs live here; the parser
/// (out of scope) is responsible for producing one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: u32,
    pub name: String,
    pub steps: Vec<Step>,
    pub parameter_sets: std::collections::HashMap<String, ParameterSet>,
}

impl Benchmark {
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            steps: Vec::new(),
            parameter_sets: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps with no dependencies: the scheduler's initial workpackage roots.
    pub fn root_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.depends.is_empty())
    }

    /// Steps that directly depend on `step_name`.
    pub fn dependents_of<'a>(&'a self, step_name: &'a str) -> impl Iterator<Item = &'a Step> {
        self.steps
            .iter()
            .filter(move |s| s.depends.contains(step_name))
    }

    /// Cycle-detect the step dependency graph (a consistency error, fatal before
    /// running, per §7).
    pub fn check_acyclic(&self) -> Result<(), crate::error::Error> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }
        use std::collections::HashMap as Map;

        let mut marks: Map<&str, Mark> = self.steps.iter().map(|s| (s.name.as_str(), Mark::Unvisited)).collect();
        let mut stack = Vec::new();

        fn visit<'a>(
            bench: &'a Benchmark,
            name: &'a str,
            marks: &mut Map<&'a str, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<(), crate::error::Error> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    stack.push(name.to_string());
                    return Err(crate::error::Error::CyclicDependency {
                        cycle: stack.clone(),
                    });
                }
                _ => {}
            }
            marks.insert(name, Mark::Visiting);
            stack.push(name.to_string());
            let Some(step) = bench.step(name) else {
                return Err(crate::error::Error::UnknownStep {
                    name: name.to_string(),
                });
            };
            for dep in &step.depends {
                visit(bench, dep, marks, stack)?;
            }
            stack.pop();
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for step in &self.steps {
            visit(self, &step.name, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    /// Merge a step's `use` groups, in order, into one `ParameterSet`. Each inner
    /// group is applied as one atomic merge: a conflict inside a single group is a
    /// spec error (`IncompatibleUse`), distinct from a conflict across groups which
    /// follows the ordinary duplicate policy.
    pub fn merge_uses(&self, step: &Step) -> Result<ParameterSet, crate::error::Error> {
        let mut merged = ParameterSet::new(DuplicatePolicy::Replace);
        for group in &step.use_groups {
            let mut group_set = ParameterSet::new(DuplicatePolicy::Error);
            for set_name in group {
                let Some(named) = self.parameter_sets.get(set_name) else {
                    return Err(crate::error::Error::UnknownStep {
                        name: set_name.clone(),
                    });
                };
                for param in named.iter() {
                    group_set.add(param.clone()).map_err(|_| crate::error::Error::IncompatibleUse {
                        name: param.name.clone(),
                    })?;
                }
            }
            for param in group_set.iter() {
                merged.add(param.clone())?;
            }
        }
        Ok(merged)
    }

    /// JUBE-reserved parameters scoped to the benchmark itself (refreshed every
    /// substitution pass, `update_mode = jube`).
    #[must_use]
    pub fn jube_parameterset(&self) -> ParameterSet {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(
            Parameter::new("jube_benchmark_id", self.id.to_string())
                .with_update_mode(UpdateMode::Jube),
        )
        .expect("fresh set never conflicts");
        set.add(
            Parameter::new("jube_benchmark_name", self.name.clone())
                .with_update_mode(UpdateMode::Jube),
        )
        .expect("fresh set never conflicts");
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_validate_rejects_shared_op_with_parallel_procs() {
        let step = Step::new("s")
            .with_procs(4)
            .with_operation(Operation::new("echo hi").shared());
        assert!(step.validate().is_err());
    }

    #[test]
    fn step_validate_allows_shared_op_with_single_proc() {
        let step = Step::new("s").with_operation(Operation::new("echo hi").shared());
        assert!(step.validate().is_ok());
    }

    #[test]
    fn root_steps_excludes_dependents() {
        let mut bench = Benchmark::new(0, "b");
        bench.steps.push(Step::new("a"));
        bench.steps.push(Step::new("b").depends_on("a"));
        let roots: Vec<&str> = bench.root_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(roots, vec!["a"]);
    }

    #[test]
    fn check_acyclic_detects_cycle() {
        let mut bench = Benchmark::new(0, "b");
        bench.steps.push(Step::new("a").depends_on("b"));
        bench.steps.push(Step::new("b").depends_on("a"));
        assert!(bench.check_acyclic().is_err());
    }

    #[test]
    fn check_acyclic_accepts_dag() {
        let mut bench = Benchmark::new(0, "b");
        bench.steps.push(Step::new("a"));
        bench.steps.push(Step::new("b").depends_on("a"));
        bench.steps.push(Step::new("c").depends_on("a").depends_on("b"));
        assert!(bench.check_acyclic().is_ok());
    }

    #[test]
    fn dependents_of_finds_direct_children() {
        let mut bench = Benchmark::new(0, "b");
        bench.steps.push(Step::new("a"));
        bench.steps.push(Step::new("b").depends_on("a"));
        bench.steps.push(Step::new("c"));
        let names: Vec<&str> = bench.dependents_of("a").map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
