//! A concrete instance of a step bound to a concrete parameter assignment.
//!
//! `Workpackage` itself stays a mostly-inert data record — see `scheduler` for the
//! state-machine logic that drives it through staging, substitution and operation
//! execution. Keeping the record free of execution logic is what makes the
//! `workpackages.yaml` persistence format (`persistence`) a straightforward
//! serialization of this struct.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use jube_core::parameter::ParameterSet;
use jube_core::types::WorkpackageId;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a workpackage (§3's `Workpackage` lifecycle, minus the
/// transient `Running` state which exists only inside `Scheduler::execute`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkpackageState {
    Queued,
    /// Suspended on a missing `async_filename`; re-polled on the next scheduler pass.
    Pending,
    /// A break-file halted this workpackage's cycles; terminal, but distinct from
    /// `Done` because the remaining operations never ran.
    Broken,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workpackage {
    pub id: WorkpackageId,
    pub step_name: String,
    pub parameters: ParameterSet,
    pub parents: Vec<WorkpackageId>,
    pub children: Vec<WorkpackageId>,
    /// Composite iteration label — see §4.3 step 4 for how this is derived for
    /// workpackages with parents from more than one step.
    pub iteration: u64,
    pub iteration_siblings: BTreeSet<WorkpackageId>,
    /// Cycle currently in progress (0-based); advances as `Step::cycles` repeat.
    pub cycle: u32,
    /// Index of the next operation to attempt within the current cycle.
    pub next_op: usize,
    pub environment: HashMap<String, String>,
    pub state: WorkpackageState,
    /// Set once `workpackage_dir`/`work` have been created; guards against
    /// re-creating directories across re-drives.
    pub started: bool,
    /// Wall-clock time of the first drive that created this workpackage's
    /// directory. `None` until then, even across a resume.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock time this workpackage reached `Done` or `Broken`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workpackage {
    #[must_use]
    pub fn new(id: WorkpackageId, step_name: impl Into<String>, parameters: ParameterSet, iteration: u64) -> Self {
        Self {
            id,
            step_name: step_name.into(),
            parameters,
            parents: Vec::new(),
            children: Vec::new(),
            iteration,
            iteration_siblings: BTreeSet::new(),
            cycle: 0,
            next_op: 0,
            environment: HashMap::new(),
            state: WorkpackageState::Queued,
            started: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// `<bench_dir>/<zero-padded-id>_<step>` (§3 invariant: unique by construction).
    #[must_use]
    pub fn dir(&self, bench_dir: &std::path::Path) -> PathBuf {
        bench_dir.join(format!("{}_{}", self.id.padded(), self.step_name))
    }

    #[must_use]
    pub fn work_dir(&self, bench_dir: &std::path::Path) -> PathBuf {
        self.dir(bench_dir).join("work")
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == WorkpackageState::Done
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state == WorkpackageState::Broken
    }

    /// Terminal for dependency-materialization purposes: both `Done` and `Broken`
    /// workpackages are finished, in the sense that they will never produce more
    /// operations, so dependents may proceed (§4.3, §4.4 `post_run`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, WorkpackageState::Done | WorkpackageState::Broken)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == WorkpackageState::Pending
    }

    /// Marks `other` as an iteration sibling of `self`, symmetrically (§3 invariant:
    /// the relation is symmetric and transitive).
    pub fn link_sibling(&mut self, other: WorkpackageId) {
        self.iteration_siblings.insert(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jube_core::types::DuplicatePolicy;

    #[test]
    fn dir_matches_padded_id_and_step_name() {
        let wp = Workpackage::new(WorkpackageId(7), "prep", ParameterSet::new(DuplicatePolicy::Replace), 0);
        let bench_dir = std::path::Path::new("/bench");
        assert_eq!(wp.dir(bench_dir), std::path::PathBuf::from("/bench/000007_prep"));
        assert_eq!(wp.work_dir(bench_dir), std::path::PathBuf::from("/bench/000007_prep/work"));
    }

    #[test]
    fn is_terminal_covers_done_and_broken() {
        let mut wp = Workpackage::new(WorkpackageId(0), "s", ParameterSet::new(DuplicatePolicy::Replace), 0);
        assert!(!wp.is_terminal());
        wp.state = WorkpackageState::Broken;
        assert!(wp.is_terminal());
        wp.state = WorkpackageState::Done;
        assert!(wp.is_terminal());
    }

    #[test]
    fn link_sibling_is_recorded_in_both_directions_by_caller() {
        let mut a = Workpackage::new(WorkpackageId(0), "s", ParameterSet::new(DuplicatePolicy::Replace), 0);
        let mut b = Workpackage::new(WorkpackageId(1), "s", ParameterSet::new(DuplicatePolicy::Replace), 1);
        a.link_sibling(b.id);
        b.link_sibling(a.id);
        assert!(a.iteration_siblings.contains(&b.id));
        assert!(b.iteration_siblings.contains(&a.id));
    }
}
