//! The cooperative single-threaded scheduler (§4.4/§5): a FIFO queue of
//! workpackages, a worker pool for steps with `procs>1`, and a rendezvous table
//! for shared operations. Nothing here preempts or blocks on a suspended
//! workpackage — `Pending`/`AwaitingShared` are ordinary return values threaded
//! back through [`WorkerResult`], never an exception or a parked task.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use jube_core::model::{Benchmark, Step};
use jube_core::parameter::{substitute_text, ParameterSet};
use jube_core::types::{UpdateMode, WorkpackageId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::active;
use crate::collaborators::{Analyser, FileStager, Substituter};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::jube_params::{self, strip_reserved};
use crate::operation::{self, ExecContext};
use crate::persistence;
use crate::workpackage::{Workpackage, WorkpackageState};

/// What a driven workpackage reports back, in place of a direct state mutation
/// (§5.1, §9: workers never touch shared graph state).
#[derive(Debug, Clone)]
enum RunOutcome {
    Done,
    Broken,
    Pending,
    AwaitingShared { cycle: u32, op_index: usize },
}

/// A worker's verdict on one workpackage, handed back over a join and applied by
/// the scheduler sequentially (§5.1).
#[derive(Debug)]
struct WorkerResult {
    id: WorkpackageId,
    environment: HashMap<String, String>,
    cycle: u32,
    next_op: usize,
    started: bool,
    outcome: RunOutcome,
}

/// How a shared operation's barrier resolves once every iteration sibling has
/// arrived at it: exactly one designated member runs it for real, the rest are
/// marked done without executing (§4.4 step on shared operations).
#[derive(Debug, Clone)]
enum SharedResolution {
    Execute { shared_dir: PathBuf },
    SkipMarked,
}

pub struct Scheduler {
    benchmark: Benchmark,
    bench_dir: PathBuf,
    config: EngineConfig,
    stager: Arc<dyn FileStager>,
    substituter: Arc<dyn Substituter>,
    analyser: Arc<dyn Analyser>,
    /// Dense, `id.0 == index`-indexed store of every workpackage materialized so far.
    workpackages: Vec<Workpackage>,
    queue: VecDeque<WorkpackageId>,
    /// Members that have arrived at a given (step, cycle, shared op index) and are
    /// waiting for the rest of their cohort (§5's rendezvous semantics).
    shared_waiting: HashMap<(String, u32, usize), BTreeSet<WorkpackageId>>,
    /// Captured once, at construction: the base environment every workpackage's
    /// persisted diff is computed against (§4.7.1).
    process_start_env: HashMap<String, String>,
}

impl Scheduler {
    /// Build a fresh scheduler and materialize every root workpackage (§4.2).
    pub fn new(
        benchmark: Benchmark,
        bench_dir: PathBuf,
        config: EngineConfig,
        stager: Arc<dyn FileStager>,
        substituter: Arc<dyn Substituter>,
        analyser: Arc<dyn Analyser>,
    ) -> Result<Self> {
        benchmark.check_acyclic()?;
        for step in &benchmark.steps {
            step.validate()?;
        }
        let mut scheduler = Self {
            benchmark,
            bench_dir,
            config,
            stager,
            substituter,
            analyser,
            workpackages: Vec::new(),
            queue: VecDeque::new(),
            shared_waiting: HashMap::new(),
            process_start_env: std::env::vars().collect(),
        };
        scheduler.create_root_workpackages()?;
        Ok(scheduler)
    }

    /// Reconstruct a scheduler from a previous `workpackages.yaml` (§4.7: resume
    /// continues the id counter and re-queues started-but-unfinished work first).
    pub fn resume(
        benchmark: Benchmark,
        bench_dir: PathBuf,
        config: EngineConfig,
        stager: Arc<dyn FileStager>,
        substituter: Arc<dyn Substituter>,
        analyser: Arc<dyn Analyser>,
    ) -> Result<Self> {
        let path = bench_dir.join("workpackages.yaml");
        let file = persistence::read(&path)?;
        if file.format_version > persistence::FORMAT_VERSION {
            return Err(EngineError::VersionMismatch {
                found: file.format_version,
                supported: persistence::FORMAT_VERSION,
            });
        }
        let (start_env, workpackages) = persistence::reconstruct(&file);
        let mut scheduler = Self {
            benchmark,
            bench_dir,
            config,
            stager,
            substituter,
            analyser,
            workpackages,
            queue: VecDeque::new(),
            shared_waiting: HashMap::new(),
            process_start_env: start_env,
        };

        let mut started_first = Vec::new();
        let mut fresh = Vec::new();
        for wp in &scheduler.workpackages {
            if wp.is_terminal() {
                continue;
            }
            if wp.started {
                started_first.push(wp.id);
            } else {
                fresh.push(wp.id);
            }
        }
        scheduler.queue.extend(started_first);
        scheduler.queue.extend(fresh);
        Ok(scheduler)
    }

    #[must_use]
    pub fn workpackages(&self) -> &[Workpackage] {
        &self.workpackages
    }

    #[must_use]
    pub fn workpackage(&self, id: WorkpackageId) -> Option<&Workpackage> {
        self.workpackages.get(id.0 as usize)
    }

    #[must_use]
    pub fn bench_dir(&self) -> &Path {
        &self.bench_dir
    }

    /// Run the `analyse` pattern extraction over one workpackage's work directory
    /// (the CLI front-end's `analyse`/`result` subcommands).
    pub fn analyse(&self, id: WorkpackageId) -> Result<HashMap<String, String>> {
        let wp = self
            .workpackages
            .get(id.0 as usize)
            .ok_or(EngineError::UnknownWorkpackage(id.0))?;
        let dict = wp.parameters.constant_parameter_dict();
        self.analyser.analyse(&wp.work_dir(&self.bench_dir), &dict)
    }

    fn step_is_active(&self, step: &Step) -> Result<bool> {
        let dict = jube_params::benchmark_and_step_params(&self.benchmark, step).constant_parameter_dict();
        active::evaluate(&step.active, &dict)
    }

    fn create_root_workpackages(&mut self) -> Result<()> {
        let root_steps: Vec<Step> = self.benchmark.root_steps().cloned().collect();
        for step in root_steps {
            if !self.step_is_active(&step)? {
                debug!(step = %step.name, "root step inactive, no workpackages created");
                continue;
            }
            let mut merged = self.benchmark.merge_uses(&step)?;
            merged.merge(&jube_params::benchmark_and_step_params(&self.benchmark, &step))?;
            for expansion in merged.expand_templates() {
                self.spawn_cohort(&step, expansion, &[]);
            }
        }
        Ok(())
    }

    /// Create `step.iterations` sibling workpackages sharing one expanded
    /// parameter assignment, link them as mutual iteration siblings, and record
    /// `parents` on each (§4.2/§4.3 step 4).
    fn spawn_cohort(&mut self, step: &Step, expansion: ParameterSet, parents: &[WorkpackageId]) -> Vec<WorkpackageId> {
        let iter_base = compute_iter_base(parents, &self.workpackages, &self.benchmark);
        let mut cohort = Vec::new();
        for local_iter in 0..step.iterations {
            let id = WorkpackageId(self.workpackages.len() as u64);
            let composite_iteration = u64::from(step.iterations) * iter_base + u64::from(local_iter);
            let mut wp = Workpackage::new(id, step.name.clone(), expansion.clone(), composite_iteration);
            wp.parents = parents.to_vec();
            self.workpackages.push(wp);
            self.queue.push_back(id);
            cohort.push(id);
        }
        for &parent in parents {
            self.workpackages[parent.0 as usize].children.extend(&cohort);
        }
        for &a in &cohort {
            for &b in &cohort {
                if a != b {
                    self.workpackages[a.0 as usize].link_sibling(b);
                }
            }
        }
        if let Some(&parent0) = parents.first() {
            self.propagate_siblings(&cohort, step, parent0);
        }
        cohort
    }

    /// Extend iteration-sibling links across the DAG: a new workpackage is also a
    /// sibling of any already-materialized same-step workpackage reachable through
    /// its first parent's existing siblings, provided the two parameter sets agree
    /// outside jube-reserved names (§4.3 step 6).
    fn propagate_siblings(&mut self, cohort: &[WorkpackageId], step: &Step, parent0: WorkpackageId) {
        let parent0_siblings: Vec<WorkpackageId> = self.workpackages[parent0.0 as usize].iteration_siblings.iter().copied().collect();
        let mut my_stripped = self.workpackages[cohort[0].0 as usize].parameters.clone();
        strip_reserved(&mut my_stripped);

        for sibling in parent0_siblings {
            let sibling_children: Vec<WorkpackageId> = self.workpackages[sibling.0 as usize].children.clone();
            for child_id in sibling_children {
                if self.workpackages[child_id.0 as usize].step_name != step.name {
                    continue;
                }
                let mut child_stripped = self.workpackages[child_id.0 as usize].parameters.clone();
                strip_reserved(&mut child_stripped);
                if child_stripped.is_compatible(&my_stripped, UpdateMode::Jube) {
                    for &new_id in cohort {
                        self.workpackages[new_id.0 as usize].link_sibling(child_id);
                        self.workpackages[child_id.0 as usize].link_sibling(new_id);
                    }
                }
            }
        }
    }

    /// §4.3: once a workpackage finishes, look for steps depending on its step and
    /// materialize every new combination its completion makes available.
    fn materialize_dependents(&mut self, completed_id: WorkpackageId) -> Result<()> {
        let completed_step_name = self.workpackages[completed_id.0 as usize].step_name.clone();
        let dependents: Vec<Step> = self.benchmark.dependents_of(&completed_step_name).cloned().collect();

        for step in dependents {
            if !self.step_is_active(&step)? {
                continue;
            }
            let mut dep_names: Vec<String> = step.depends.iter().cloned().collect();
            dep_names.sort_by_key(|name| self.benchmark.step(name).map_or(0, |s| s.iterations));

            let mut candidate_lists: Vec<Vec<WorkpackageId>> = Vec::with_capacity(dep_names.len());
            for dep_name in &dep_names {
                if *dep_name == completed_step_name {
                    candidate_lists.push(vec![completed_id]);
                    continue;
                }
                let ids: Vec<WorkpackageId> = self
                    .workpackages
                    .iter()
                    .filter(|w| w.step_name == *dep_name && w.is_terminal())
                    .map(|w| w.id)
                    .collect();
                if ids.is_empty() {
                    candidate_lists.clear();
                    break;
                }
                candidate_lists.push(ids);
            }
            if candidate_lists.len() != dep_names.len() {
                continue;
            }

            for tuple in cartesian_product(&candidate_lists) {
                self.try_materialize_combo(&step, &dep_names, &tuple)?;
            }
        }
        Ok(())
    }

    fn try_materialize_combo(&mut self, step: &Step, dep_order: &[String], tuple: &[WorkpackageId]) -> Result<()> {
        let mut merged: Option<ParameterSet> = None;
        for &id in tuple {
            let candidate = self.workpackages[id.0 as usize].parameters.clone();
            merged = Some(match merged {
                None => candidate,
                Some(mut acc) => {
                    if !acc.is_compatible(&candidate, UpdateMode::Jube) {
                        return Ok(()); // incompatible parent parameterizations: silently pruned (§4.3 step 3)
                    }
                    acc.merge(&candidate)?;
                    acc
                }
            });
        }
        let mut merged = merged.expect("tuple is never empty: step always has at least one dependency");
        strip_reserved(&mut merged);
        merged.merge(&self.benchmark.merge_uses(step)?)?;
        merged.merge(&jube_params::benchmark_and_step_params(&self.benchmark, step))?;

        for expansion in merged.expand_templates() {
            self.spawn_cohort(step, expansion, tuple);
        }
        Ok(())
    }

    fn pending_count(&self, step_name: &str) -> usize {
        self.workpackages.iter().filter(|w| w.step_name == step_name && w.state == WorkpackageState::Pending).count()
    }

    fn parent_work_dirs(&self, id: WorkpackageId) -> Vec<(String, PathBuf)> {
        self.workpackages[id.0 as usize]
            .parents
            .iter()
            .map(|&pid| {
                let parent = &self.workpackages[pid.0 as usize];
                (parent.step_name.clone(), parent.work_dir(&self.bench_dir))
            })
            .collect()
    }

    fn apply_worker_result(&mut self, result: WorkerResult) -> RunOutcome {
        let idx = result.id.0 as usize;
        let wp = &mut self.workpackages[idx];
        if !wp.started && result.started {
            wp.started_at.get_or_insert_with(Utc::now);
        }
        wp.environment = result.environment;
        wp.cycle = result.cycle;
        wp.next_op = result.next_op;
        wp.started = result.started;
        wp.state = match result.outcome {
            RunOutcome::Done => WorkpackageState::Done,
            RunOutcome::Broken => WorkpackageState::Broken,
            RunOutcome::Pending | RunOutcome::AwaitingShared { .. } => WorkpackageState::Pending,
        };
        if wp.is_terminal() {
            wp.finished_at.get_or_insert_with(Utc::now);
        }
        result.outcome
    }

    fn cohort_for(&self, id: WorkpackageId, step_name: &str) -> Vec<WorkpackageId> {
        let mut set: BTreeSet<WorkpackageId> = self.workpackages[id.0 as usize]
            .iteration_siblings
            .iter()
            .copied()
            .filter(|sid| self.workpackages[sid.0 as usize].step_name == step_name)
            .collect();
        set.insert(id);
        set.into_iter().collect()
    }

    fn try_resolve_shared_barrier(&self, key: &(String, u32, usize)) -> Result<Option<Vec<(WorkpackageId, SharedResolution)>>> {
        let Some(waiting) = self.shared_waiting.get(key) else {
            return Ok(None);
        };
        let (step_name, _, _) = key;
        let Some(&any_member) = waiting.iter().next() else {
            return Ok(None);
        };
        let cohort = self.cohort_for(any_member, step_name);
        if !cohort.iter().all(|m| waiting.contains(m)) {
            return Ok(None);
        }

        let winner = *cohort.iter().min().expect("cohort is non-empty");
        let step = self.benchmark.step(step_name).expect("step referenced by a live workpackage always exists");
        let shared_dir = self.compute_shared_dir(winner, step)?;

        Ok(Some(
            cohort
                .into_iter()
                .map(|id| {
                    if id == winner {
                        (id, SharedResolution::Execute { shared_dir: shared_dir.clone() })
                    } else {
                        (id, SharedResolution::SkipMarked)
                    }
                })
                .collect(),
        ))
    }

    fn compute_shared_dir(&self, id: WorkpackageId, step: &Step) -> Result<PathBuf> {
        let name_template = step.shared_link_name.clone().unwrap_or_else(|| "shared".to_string());
        let wp = &self.workpackages[id.0 as usize];
        let mut params = wp.parameters.clone();
        params.merge(&jube_params::workpackage_params(&self.benchmark, step, wp, &self.bench_dir))?;
        params.substitute(true)?;
        let dict = params.constant_parameter_dict();
        let name = substitute_text(&name_template, &dict);
        Ok(self.bench_dir.join(format!("{}_{name}", step.name)))
    }

    /// Drive one workpackage, resolving any shared-operation barrier it arrives at
    /// before moving on. Every workpackage touched (the original plus any barrier
    /// members forced to resolve alongside it) is returned for `post_run`.
    async fn execute_one(&mut self, id: WorkpackageId) -> Result<Vec<WorkpackageId>> {
        let mut touched = Vec::new();
        let mut worklist: VecDeque<(WorkpackageId, Option<((u32, usize), SharedResolution)>)> = VecDeque::new();
        worklist.push_back((id, None));

        while let Some((cur_id, forced)) = worklist.pop_front() {
            let idx = cur_id.0 as usize;
            if self.workpackages[idx].is_terminal() {
                continue;
            }
            let step = self.benchmark.step(&self.workpackages[idx].step_name).expect("workpackage step always exists").clone();
            let recheck_pending = self.workpackages[idx].is_pending();
            let wp_snapshot = self.workpackages[idx].clone();
            let parent_work_dirs = self.parent_work_dirs(cur_id);

            let result = drive_workpackage(
                wp_snapshot,
                &step,
                &self.benchmark,
                &self.bench_dir,
                &self.config,
                self.stager.as_ref(),
                self.substituter.as_ref(),
                &parent_work_dirs,
                &self.process_start_env,
                recheck_pending,
                forced,
            )
            .await?;

            touched.push(cur_id);
            let outcome = self.apply_worker_result(result);

            if let RunOutcome::AwaitingShared { cycle, op_index } = outcome {
                let key = (step.name.clone(), cycle, op_index);
                self.shared_waiting.entry(key.clone()).or_default().insert(cur_id);
                if let Some(resolutions) = self.try_resolve_shared_barrier(&key)? {
                    self.shared_waiting.remove(&key);
                    for (member_id, resolution) in resolutions {
                        worklist.push_back((member_id, Some(((cycle, op_index), resolution))));
                    }
                }
            }
        }
        Ok(touched)
    }

    async fn execute_batch(&mut self, ids: &[WorkpackageId], step: &Step) -> Result<()> {
        let permits = Arc::new(Semaphore::new(step.procs as usize));
        let mut tasks = JoinSet::new();
        for &id in ids {
            let wp_snapshot = self.workpackages[id.0 as usize].clone();
            let recheck_pending = wp_snapshot.is_pending();
            let benchmark = self.benchmark.clone();
            let bench_dir = self.bench_dir.clone();
            let config = self.config.clone();
            let step = step.clone();
            let stager = Arc::clone(&self.stager);
            let substituter = Arc::clone(&self.substituter);
            let parent_work_dirs = self.parent_work_dirs(id);
            let permits = Arc::clone(&permits);
            let process_start_env = self.process_start_env.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore never closed");
                drive_workpackage(
                    wp_snapshot,
                    &step,
                    &benchmark,
                    &bench_dir,
                    &config,
                    stager.as_ref(),
                    substituter.as_ref(),
                    &parent_work_dirs,
                    &process_start_env,
                    recheck_pending,
                    None,
                )
                .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| EngineError::Persistence(format!("worker task panicked: {e}")))??;
            self.apply_worker_result(result);
        }
        Ok(())
    }

    fn post_run(&mut self, id: WorkpackageId) -> Result<()> {
        let wp = &self.workpackages[id.0 as usize];
        info!(wp_id = %wp.id, step = %wp.step_name, state = ?wp.state, "workpackage finished");
        self.materialize_dependents(id)?;
        self.persist()?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let file = persistence::build(&self.benchmark, &self.process_start_env, &self.workpackages);
        persistence::write_atomic(&self.bench_dir.join("workpackages.yaml"), &file)
    }

    /// Drain the queue to exhaustion, executing every workpackage that is ready
    /// and not held back by its step's `max_async` cap. Workpackages suspended on
    /// an async gate stay `Pending` and are left for a later `continue` to re-poll
    /// (§6.1: a single `run`/`continue` invocation stops at the first such gate).
    pub async fn run_to_completion(&mut self) -> Result<()> {
        let mut held: VecDeque<WorkpackageId> = VecDeque::new();

        while let Some(id) = self.queue.pop_front() {
            if self.workpackages[id.0 as usize].is_terminal() {
                continue;
            }
            let step_name = self.workpackages[id.0 as usize].step_name.clone();
            let step = self.benchmark.step(&step_name).expect("workpackage step always exists").clone();

            if let Some(cap) = step.max_async {
                if self.pending_count(&step_name) >= cap as usize {
                    debug!(step = %step_name, cap, "deferring workpackage: max_async reached");
                    held.push_back(id);
                    continue;
                }
            }

            if step.procs > 1 {
                let mut batch = vec![id];
                while let Some(&next_id) = self.queue.front() {
                    let next = &self.workpackages[next_id.0 as usize];
                    if next.step_name == step_name && !next.is_terminal() {
                        batch.push(next_id);
                        self.queue.pop_front();
                    } else {
                        break;
                    }
                }
                self.execute_batch(&batch, &step).await?;
                let finished: Vec<WorkpackageId> = batch.into_iter().filter(|bid| self.workpackages[bid.0 as usize].is_terminal()).collect();
                for fid in finished {
                    self.post_run(fid)?;
                }
            } else {
                let touched = self.execute_one(id).await?;
                let finished: Vec<WorkpackageId> = touched.into_iter().filter(|tid| self.workpackages[tid.0 as usize].is_terminal()).collect();
                for fid in finished {
                    self.post_run(fid)?;
                }
            }
        }

        self.queue.extend(held);
        self.persist()?;
        Ok(())
    }
}

fn cartesian_product(lists: &[Vec<WorkpackageId>]) -> Vec<Vec<WorkpackageId>> {
    let mut result: Vec<Vec<WorkpackageId>> = vec![Vec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(result.len() * list.len());
        for prefix in &result {
            for &item in list {
                let mut combo = prefix.clone();
                combo.push(item);
                next.push(combo);
            }
        }
        result = next;
    }
    result
}

/// Fold each parent's local iteration index into one composite iteration number,
/// in dependency order (§4.3 step 4): `base' = parent_step.iterations * base + parent.iteration`.
fn compute_iter_base(parents: &[WorkpackageId], workpackages: &[Workpackage], benchmark: &Benchmark) -> u64 {
    let mut base = 0u64;
    for &parent_id in parents {
        let parent = &workpackages[parent_id.0 as usize];
        let parent_iterations = benchmark.step(&parent.step_name).map_or(1, |s| u64::from(s.iterations));
        base = parent_iterations * base + parent.iteration;
    }
    base
}

/// Drive one workpackage as far as it will go from its current `(cycle, next_op)`:
/// through staging and substitution (once, on first entry), then operations in
/// order until a cycle/operation suspends it, a break-file halts it, every cycle
/// completes, or it arrives at an unresolved shared-operation barrier.
#[allow(clippy::too_many_arguments)]
async fn drive_workpackage(
    mut wp: Workpackage,
    step: &Step,
    benchmark: &Benchmark,
    bench_dir: &Path,
    config: &EngineConfig,
    stager: &dyn FileStager,
    substituter: &dyn Substituter,
    parent_work_dirs: &[(String, PathBuf)],
    process_start_env: &HashMap<String, String>,
    recheck_pending: bool,
    forced_shared: Option<((u32, usize), SharedResolution)>,
) -> Result<WorkerResult> {
    let wp_dir = wp.dir(bench_dir);
    let work_dir = wp.work_dir(bench_dir);

    if !wp.started {
        std::fs::create_dir_all(&work_dir)?;
        for (name, parent_dir) in parent_work_dirs {
            let link_path = wp_dir.join(name);
            if !link_path.exists() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(parent_dir, &link_path)?;
                #[cfg(not(unix))]
                std::fs::write(&link_path, parent_dir.display().to_string())?;
            }
        }
        wp.environment = process_start_env.clone();
        wp.started = true;
    }

    let (params, param_dict) = refresh_params(&wp, step, benchmark, bench_dir)?;
    for exported in params.export_parameter_dict() {
        wp.environment.insert(exported.name.clone(), exported.value().to_string());
    }

    let effective_work_dir = if let Some(alt) = &step.alt_work_dir {
        bench_dir.join(substitute_text(alt, &param_dict))
    } else {
        work_dir.clone()
    };
    std::fs::create_dir_all(&effective_work_dir)?;
    stager.stage(&effective_work_dir, &param_dict, &wp.environment)?;
    substituter.substitute(&effective_work_dir, &param_dict)?;

    let mut param_dict = param_dict;
    let mut first_op_in_call = true;

    while wp.cycle < step.cycles {
        while wp.next_op < step.operations.len() {
            let op_index = wp.next_op;
            let op = &step.operations[op_index];

            if !active::evaluate(&op.active, &param_dict)? {
                wp.next_op += 1;
                first_op_in_call = false;
                continue;
            }

            let marker_path = wp_dir.join(format!("wp_done_{:02}", wp.cycle as usize * step.operations.len() + op_index));
            if marker_path.exists() {
                wp.next_op += 1;
                first_op_in_call = false;
                continue;
            }

            if op.shared {
                let resolution = forced_shared.as_ref().filter(|((c, i), _)| *c == wp.cycle && *i == op_index).map(|(_, r)| r);
                match resolution {
                    Some(SharedResolution::Execute { shared_dir }) => {
                        std::fs::create_dir_all(shared_dir)?;
                        let ctx = ExecContext {
                            shell: config.shell(),
                            work_dir: shared_dir,
                            error_msg_lines: config.error_msg_lines,
                        };
                        let op_outcome = operation::execute(op, &param_dict, &mut wp.environment, &ctx, false).await?;
                        std::fs::write(&marker_path, "")?;
                        if !op_outcome.continue_op {
                            return Ok(finish(wp, RunOutcome::Pending));
                        }
                        if !op_outcome.continue_cycle {
                            wp.cycle = step.cycles;
                            wp.next_op = op_index + 1;
                            return Ok(finish(wp, RunOutcome::Broken));
                        }
                        wp.next_op += 1;
                    }
                    Some(SharedResolution::SkipMarked) => {
                        std::fs::write(&marker_path, "")?;
                        wp.next_op += 1;
                    }
                    None => {
                        return Ok(finish(wp, RunOutcome::AwaitingShared { cycle: wp.cycle, op_index }));
                    }
                }
            } else {
                let only_check_pending = first_op_in_call && recheck_pending;
                let ctx = ExecContext {
                    shell: config.shell(),
                    work_dir: &effective_work_dir,
                    error_msg_lines: config.error_msg_lines,
                };
                let op_outcome = operation::execute(op, &param_dict, &mut wp.environment, &ctx, only_check_pending).await?;
                if !op_outcome.continue_op {
                    return Ok(finish(wp, RunOutcome::Pending));
                }
                std::fs::write(&marker_path, "")?;
                if !op_outcome.continue_cycle {
                    wp.cycle = step.cycles;
                    wp.next_op = op_index + 1;
                    return Ok(finish(wp, RunOutcome::Broken));
                }
                wp.next_op += 1;
            }
            first_op_in_call = false;
        }

        wp.cycle += 1;
        wp.next_op = 0;
        if wp.cycle < step.cycles {
            let (_, refreshed_dict) = refresh_params(&wp, step, benchmark, bench_dir)?;
            param_dict = refreshed_dict;
        }
    }

    let sentinel = if config.debug { "done_DEBUG" } else { "done" };
    std::fs::write(wp_dir.join(sentinel), "")?;
    for entry in std::fs::read_dir(&wp_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("wp_done_") {
            std::fs::remove_file(entry.path())?;
        }
    }

    Ok(finish(wp, RunOutcome::Done))
}

/// Rebuild this cycle's effective parameter dict: merge in fresh jube parameters
/// (current `cycle`/`iteration`/`abspath`) and substitute to a fixed point, so
/// `cycle`-phase scripted parameters see the right values each pass (§4.1).
fn refresh_params(wp: &Workpackage, step: &Step, benchmark: &Benchmark, bench_dir: &Path) -> Result<(ParameterSet, HashMap<String, String>)> {
    let mut params = wp.parameters.clone();
    params.merge(&jube_params::workpackage_params(benchmark, step, wp, bench_dir))?;
    params.substitute(true)?;
    let dict = params.constant_parameter_dict();
    Ok((params, dict))
}

fn finish(wp: Workpackage, outcome: RunOutcome) -> WorkerResult {
    WorkerResult {
        id: wp.id,
        environment: wp.environment,
        cycle: wp.cycle,
        next_op: wp.next_op,
        started: wp.started,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jube_core::model::Operation;
    use jube_core::types::DuplicatePolicy;
    use crate::collaborators::{NullAnalyser, NullStager, NullSubstituter};

    fn touch_step(name: &str) -> Step {
        Step::new(name).with_operation(Operation::new("true"))
    }

    #[tokio::test]
    async fn root_only_single_workpackage_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        bench.steps.push(touch_step("only"));
        let mut scheduler = Scheduler::new(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        assert_eq!(scheduler.workpackages().len(), 1);
        scheduler.run_to_completion().await.unwrap();
        assert!(scheduler.workpackages()[0].is_done());
    }

    #[tokio::test]
    async fn two_step_chain_creates_iteration_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        bench.steps.push(touch_step("a").with_iterations(2));
        bench.steps.push(touch_step("b").depends_on("a"));
        let mut scheduler = Scheduler::new(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        scheduler.run_to_completion().await.unwrap();
        let b_workpackages: Vec<_> = scheduler.workpackages().iter().filter(|w| w.step_name == "b").collect();
        assert_eq!(b_workpackages.len(), 2, "one dependent workpackage per parent iteration");
        assert!(b_workpackages.iter().all(|w| w.is_done()));
        assert!(b_workpackages[0].iteration_siblings.contains(&b_workpackages[1].id));
    }

    #[tokio::test]
    async fn template_fanout_creates_one_workpackage_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(jube_core::parameter::Parameter::new("x", "1,2,3")).unwrap();
        bench.parameter_sets.insert("values".to_string(), set);
        let mut step = touch_step("fan");
        step.use_groups.push(vec!["values".to_string()]);
        bench.steps.push(step);
        let scheduler = Scheduler::new(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        assert_eq!(scheduler.workpackages().len(), 3);
    }

    #[tokio::test]
    async fn async_gate_blocks_until_file_appears_then_resumes_without_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        bench.steps.push(
            Step::new("gated").with_operation(Operation::new("echo ran >> marker.txt").with_async_filename("ready")),
        );
        let mut scheduler = Scheduler::new(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        scheduler.run_to_completion().await.unwrap();
        assert!(scheduler.workpackages()[0].is_pending());

        let wp_dir = scheduler.workpackages()[0].dir(scheduler.bench_dir());
        std::fs::write(wp_dir.join("work").join("ready"), "").unwrap();

        scheduler.queue.push_back(WorkpackageId(0));
        scheduler.run_to_completion().await.unwrap();
        assert!(scheduler.workpackages()[0].is_done());
        let marker = std::fs::read_to_string(wp_dir.join("work").join("marker.txt")).unwrap();
        assert_eq!(marker.lines().count(), 1, "directive must not re-run once gate resolves");
    }

    #[tokio::test]
    async fn shared_operation_runs_exactly_once_across_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        bench.steps.push(
            Step::new("s")
                .with_iterations(3)
                .with_shared_link_name("pool")
                .with_operation(Operation::new("echo hi >> shared_ran.txt").shared()),
        );
        let mut scheduler = Scheduler::new(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        scheduler.run_to_completion().await.unwrap();
        assert!(scheduler.workpackages().iter().all(|w| w.is_done()));

        let shared_dir = dir.path().join("s_pool");
        let content = std::fs::read_to_string(shared_dir.join("shared_ran.txt")).unwrap();
        assert_eq!(content.lines().count(), 1, "shared operation must run exactly once for the whole cohort");
    }

    #[tokio::test]
    async fn resume_continues_id_counter_without_rerunning_done_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = Benchmark::new(1, "b");
        bench.steps.push(touch_step("only"));
        {
            let mut scheduler = Scheduler::new(
                bench.clone(),
                dir.path().to_path_buf(),
                EngineConfig::default(),
                Arc::new(NullStager),
                Arc::new(NullSubstituter),
                Arc::new(NullAnalyser),
            )
            .unwrap();
            scheduler.run_to_completion().await.unwrap();
        }

        let resumed = Scheduler::resume(
            bench,
            dir.path().to_path_buf(),
            EngineConfig::default(),
            Arc::new(NullStager),
            Arc::new(NullSubstituter),
            Arc::new(NullAnalyser),
        )
        .unwrap();
        assert_eq!(resumed.workpackages().len(), 1);
        assert!(resumed.workpackages()[0].is_done());
    }
}
