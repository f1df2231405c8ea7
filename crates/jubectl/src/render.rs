//! Terminal output for `info`/`log` (§6's CLI surface). Plain, script-friendly
//! tables rather than a TUI — the engine itself never needs to render anything.

use jube_engine::{Workpackage, WorkpackageState};

fn state_label(state: WorkpackageState) -> &'static str {
    match state {
        WorkpackageState::Queued => "queued",
        WorkpackageState::Pending => "pending",
        WorkpackageState::Broken => "broken",
        WorkpackageState::Done => "done",
    }
}

/// One line per workpackage: id, step, iteration, cycle, state.
pub fn print_workpackage_table(workpackages: &[Workpackage]) {
    if workpackages.is_empty() {
        println!("No workpackages.");
        return;
    }
    println!("{:<8}  {:<20}  {:<10}  {:<6}  {:<8}", "ID", "STEP", "ITERATION", "CYCLE", "STATE");
    println!("{}", "-".repeat(60));
    for wp in workpackages {
        println!(
            "{:<8}  {:<20}  {:<10}  {:<6}  {:<8}",
            wp.id,
            wp.step_name,
            wp.iteration,
            wp.cycle,
            state_label(wp.state),
        );
    }
}

/// Detailed single-workpackage view for `info --workpackage`.
pub fn print_workpackage_detail(wp: &Workpackage) {
    println!("Workpackage {}", wp.id);
    println!("  Step:       {}", wp.step_name);
    println!("  State:      {}", state_label(wp.state));
    println!("  Iteration:  {}", wp.iteration);
    println!("  Cycle:      {}", wp.cycle);
    println!("  Parents:    {}", format_ids(&wp.parents));
    println!("  Children:   {}", format_ids(&wp.children));
    println!("  Siblings:   {}", format_ids(&wp.iteration_siblings.iter().copied().collect::<Vec<_>>()));
    if let Some(started_at) = wp.started_at {
        println!("  Started:    {started_at}");
    }
    if let Some(finished_at) = wp.finished_at {
        println!("  Finished:   {finished_at}");
    }
}

fn format_ids(ids: &[jube_core::types::WorkpackageId]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// `result`: a flat `key=value` dump from the analyser.
pub fn print_result(result: &std::collections::HashMap<String, String>) {
    if result.is_empty() {
        println!("No results.");
        return;
    }
    let mut keys: Vec<&String> = result.keys().collect();
    keys.sort();
    for key in keys {
        println!("{key}={}", result[key]);
    }
}
