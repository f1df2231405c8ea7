//! A minimal YAML benchmark loader.
//!
//! JUBE's real input grammar is an XML (or YAML) document with a parameter/
//! fileset/substituteset/patternset vocabulary far beyond this engine's scope.
//! This loader covers just enough of that shape — steps, their dependencies and
//! operations, and flat `use`-able parameter sets — to drive [`jube_engine`]
//! end to end from a file instead of hand-built [`jube_core::model`] values.

use std::collections::HashMap;
use std::path::Path;

use jube_core::model::{Benchmark, Operation, Step};
use jube_core::parameter::{Parameter, ParameterSet};
use jube_core::types::DuplicatePolicy;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read benchmark file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse benchmark file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("benchmark model error: {0}")]
    Model(#[from] jube_core::Error),
}

#[derive(Debug, Deserialize)]
struct RawBenchmark {
    id: u32,
    name: String,
    #[serde(default)]
    parameter_sets: HashMap<String, HashMap<String, String>>,
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    r#use: Vec<String>,
    #[serde(default = "default_one")]
    iterations: u32,
    #[serde(default = "default_one")]
    cycles: u32,
    #[serde(default = "default_one")]
    procs: u32,
    #[serde(default)]
    shared_link_name: Option<String>,
    #[serde(default)]
    alt_work_dir: Option<String>,
    #[serde(default)]
    max_async: Option<u32>,
    #[serde(default = "default_active")]
    active: String,
    operations: Vec<RawOperation>,
}

fn default_one() -> u32 {
    1
}

fn default_active() -> String {
    "true".to_string()
}

#[derive(Debug, Deserialize)]
struct RawOperation {
    #[serde(rename = "do")]
    do_string: String,
    #[serde(default)]
    r#async: Option<String>,
    #[serde(default)]
    r#break: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default = "default_active")]
    active: String,
    #[serde(default)]
    shared: bool,
}

/// Load and convert a YAML benchmark file into the in-memory model.
pub fn load(path: &Path) -> Result<Benchmark, LoadError> {
    let content = std::fs::read_to_string(path)?;
    let raw: RawBenchmark = serde_yaml::from_str(&content)?;

    let mut benchmark = Benchmark::new(raw.id, raw.name);
    for (set_name, entries) in raw.parameter_sets {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        for (name, value) in entries {
            set.add(Parameter::new(name, value))?;
        }
        benchmark.parameter_sets.insert(set_name, set);
    }

    for raw_step in raw.steps {
        let mut step = Step::new(raw_step.name)
            .with_iterations(raw_step.iterations)
            .with_cycles(raw_step.cycles)
            .with_procs(raw_step.procs);
        for dep in raw_step.depends {
            step = step.depends_on(dep);
        }
        if !raw_step.r#use.is_empty() {
            step.use_groups.push(raw_step.r#use);
        }
        step.shared_link_name = raw_step.shared_link_name;
        step.alt_work_dir = raw_step.alt_work_dir;
        step.max_async = raw_step.max_async;
        step.active = raw_step.active;

        for raw_op in raw_step.operations {
            let mut op = Operation::new(raw_op.do_string);
            op.async_filename = raw_op.r#async;
            op.break_filename = raw_op.r#break;
            op.error_filename = raw_op.error;
            op.stdout_filename = raw_op.stdout;
            op.stderr_filename = raw_op.stderr;
            op.work_dir = raw_op.work_dir;
            op.active = raw_op.active;
            op.shared = raw_op.shared;
            step = step.with_operation(op);
        }

        benchmark.steps.push(step);
    }

    Ok(benchmark)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_steps_dependencies_and_use_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        std::fs::write(
            &path,
            r#"
id: 1
name: demo
parameter_sets:
  values:
    x: "1,2,3"
steps:
  - name: prep
    operations:
      - do: "echo hi"
  - name: run
    depends: [prep]
    use: [values]
    operations:
      - do: "echo $x"
        async: ready
"#,
        )
        .unwrap();

        let benchmark = load(&path).unwrap();
        assert_eq!(benchmark.id, 1);
        assert_eq!(benchmark.steps.len(), 2);
        let run_step = benchmark.step("run").unwrap();
        assert!(run_step.depends.contains("prep"));
        assert_eq!(run_step.operations[0].async_filename.as_deref(), Some("ready"));
        assert_eq!(run_step.use_groups, vec![vec!["values".to_string()]]);
    }
}
