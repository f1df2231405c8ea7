//! Crash-safe, file-based workpackage state (§4.7.1): one `workpackages.yaml`
//! per benchmark directory, serialized with `serde_yaml` since that's the format
//! the rest of this stack already reads and writes, and rewritten atomically
//! (temp file + rename) so a crash mid-write never leaves a half-written file
//! behind.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use jube_core::model::Benchmark;
use jube_core::parameter::ParameterSet;
use jube_core::types::WorkpackageId;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::workpackage::{Workpackage, WorkpackageState};

/// Bumped whenever the on-disk shape changes in a way older engines can't read.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedFile {
    pub benchmark_id: u32,
    pub benchmark_name: String,
    pub format_version: u32,
    /// The environment every workpackage's `env`/`nonenv` diff below is relative to.
    pub process_start_env: HashMap<String, String>,
    pub workpackages: Vec<PersistedWorkpackage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedWorkpackage {
    pub id: WorkpackageId,
    pub step: String,
    pub iteration: u64,
    pub cycle: u32,
    pub next_op: usize,
    pub started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: WorkpackageState,
    pub parameters: ParameterSet,
    pub parents: Vec<WorkpackageId>,
    pub children: Vec<WorkpackageId>,
    pub siblings: Vec<WorkpackageId>,
    /// Entries present in this workpackage's environment but absent or different
    /// from `process_start_env`.
    pub env: Vec<(String, String)>,
    /// Names present in `process_start_env` but absent from this workpackage's
    /// environment (e.g. stripped by an operation's `env_clear`).
    pub nonenv: Vec<String>,
}

#[must_use]
pub fn build(benchmark: &Benchmark, start_env: &HashMap<String, String>, workpackages: &[Workpackage]) -> PersistedFile {
    let persisted = workpackages
        .iter()
        .map(|wp| {
            let mut env = Vec::new();
            let mut nonenv = Vec::new();
            for (key, value) in &wp.environment {
                if start_env.get(key) != Some(value) {
                    env.push((key.clone(), value.clone()));
                }
            }
            for key in start_env.keys() {
                if !wp.environment.contains_key(key) {
                    nonenv.push(key.clone());
                }
            }
            PersistedWorkpackage {
                id: wp.id,
                step: wp.step_name.clone(),
                iteration: wp.iteration,
                cycle: wp.cycle,
                next_op: wp.next_op,
                started: wp.started,
                started_at: wp.started_at,
                finished_at: wp.finished_at,
                state: wp.state,
                parameters: wp.parameters.clone(),
                parents: wp.parents.clone(),
                children: wp.children.clone(),
                siblings: wp.iteration_siblings.iter().copied().collect(),
                env,
                nonenv,
            }
        })
        .collect();

    PersistedFile {
        benchmark_id: benchmark.id,
        benchmark_name: benchmark.name.clone(),
        format_version: FORMAT_VERSION,
        process_start_env: start_env.clone(),
        workpackages: persisted,
    }
}

/// Write `file` to `path` via a sibling temp file and an atomic rename, so a
/// reader never observes a partially-written `workpackages.yaml`.
pub fn write_atomic(path: &Path, file: &PersistedFile) -> Result<()> {
    let yaml = serde_yaml::to_string(file).map_err(|e| EngineError::Persistence(e.to_string()))?;
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, yaml)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read(path: &Path) -> Result<PersistedFile> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| EngineError::Persistence(e.to_string()))
}

/// Rebuild the in-memory workpackage graph (and the start environment it was
/// diffed against) from a persisted file, for `continue`/resume (§4.7).
#[must_use]
pub fn reconstruct(file: &PersistedFile) -> (HashMap<String, String>, Vec<Workpackage>) {
    let workpackages = file
        .workpackages
        .iter()
        .map(|persisted| {
            let mut environment = file.process_start_env.clone();
            for name in &persisted.nonenv {
                environment.remove(name);
            }
            for (key, value) in &persisted.env {
                environment.insert(key.clone(), value.clone());
            }

            let mut wp = Workpackage::new(persisted.id, persisted.step.clone(), persisted.parameters.clone(), persisted.iteration);
            wp.cycle = persisted.cycle;
            wp.next_op = persisted.next_op;
            wp.started = persisted.started;
            wp.started_at = persisted.started_at;
            wp.finished_at = persisted.finished_at;
            wp.state = persisted.state;
            wp.parents = persisted.parents.clone();
            wp.children = persisted.children.clone();
            wp.iteration_siblings = persisted.siblings.iter().copied().collect();
            wp.environment = environment;
            wp
        })
        .collect();
    (file.process_start_env.clone(), workpackages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jube_core::types::DuplicatePolicy;

    fn sample_workpackage(id: u64) -> Workpackage {
        let mut wp = Workpackage::new(WorkpackageId(id), "s", ParameterSet::new(DuplicatePolicy::Replace), 0);
        wp.environment.insert("PATH".to_string(), "/usr/bin".to_string());
        wp.environment.insert("RESULT".to_string(), "42".to_string());
        wp
    }

    #[test]
    fn round_trips_through_atomic_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workpackages.yaml");
        let benchmark = Benchmark::new(7, "demo");
        let mut start_env = HashMap::new();
        start_env.insert("PATH".to_string(), "/usr/bin".to_string());
        start_env.insert("HOME".to_string(), "/root".to_string());

        let workpackages = vec![sample_workpackage(0)];
        let file = build(&benchmark, &start_env, &workpackages);
        write_atomic(&path, &file).unwrap();

        let reread = read(&path).unwrap();
        assert_eq!(reread.benchmark_id, 7);
        let (restored_env, restored_workpackages) = reconstruct(&reread);
        assert_eq!(restored_env.get("HOME").unwrap(), "/root");
        assert_eq!(restored_workpackages[0].environment.get("RESULT").unwrap(), "42");
        assert_eq!(restored_workpackages[0].environment.get("PATH").unwrap(), "/usr/bin");
        assert!(!restored_workpackages[0].environment.contains_key("HOME"), "HOME was never in this workpackage's env");
    }

    #[test]
    fn env_diff_only_records_changed_or_added_keys() {
        let benchmark = Benchmark::new(1, "b");
        let mut start_env = HashMap::new();
        start_env.insert("PATH".to_string(), "/usr/bin".to_string());
        let workpackages = vec![sample_workpackage(0)];
        let file = build(&benchmark, &start_env, &workpackages);
        let persisted = &file.workpackages[0];
        assert_eq!(persisted.env, vec![("RESULT".to_string(), "42".to_string())]);
        assert!(persisted.nonenv.is_empty());
    }
}
