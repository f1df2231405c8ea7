//! Injection of the JUBE-reserved parameter set (§4.1): benchmark id/name, step
//! name, workpackage id/iteration/cycle/abspath. All carry `update_mode = jube` so
//! they are always excused from `ParameterSet::is_compatible` checks and always
//! refreshed on every substitution pass, per §4.1's phase ordering.

use jube_core::model::{Benchmark, Step};
use jube_core::parameter::{Parameter, ParameterSet};
use jube_core::types::{DuplicatePolicy, UpdateMode};

use crate::workpackage::Workpackage;

/// Benchmark- and step-scoped reserved parameters, known before any workpackage
/// exists for this step (§4.2: injected before template expansion).
#[must_use]
pub fn benchmark_and_step_params(benchmark: &Benchmark, step: &Step) -> ParameterSet {
    let mut set = ParameterSet::new(DuplicatePolicy::Replace);
    let add = |set: &mut ParameterSet, name: &str, value: String| {
        set.add(Parameter::new(name, value).with_update_mode(UpdateMode::Jube))
            .expect("fresh jube parameter set never conflicts");
    };
    add(&mut set, "jube_benchmark_id", benchmark.id.to_string());
    add(&mut set, "jube_benchmark_name", benchmark.name.clone());
    add(&mut set, "jube_step_name", step.name.clone());
    set
}

/// Workpackage-scoped reserved parameters, re-injected fresh every run/cycle (§4.5
/// step 2, §4.1 phase=use|cycle|always refresh points).
#[must_use]
pub fn workpackage_params(benchmark: &Benchmark, step: &Step, wp: &Workpackage, bench_dir: &std::path::Path) -> ParameterSet {
    let mut set = benchmark_and_step_params(benchmark, step);
    let add = |set: &mut ParameterSet, name: &str, value: String| {
        set.add(Parameter::new(name, value).with_update_mode(UpdateMode::Jube))
            .expect("fresh jube parameter set never conflicts");
    };
    add(&mut set, "jube_wp_id", wp.id.to_string());
    add(&mut set, "jube_wp_iteration", wp.iteration.to_string());
    add(&mut set, "jube_wp_cycle", wp.cycle.to_string());
    add(&mut set, "jube_wp_abspath", wp.dir(bench_dir).display().to_string());
    set
}

/// Every name reserved by the two injection points above, used to strip jube
/// parameters from a merged parent set before re-running step expansion (§4.3
/// step 5: "they will be re-injected").
pub const RESERVED_NAMES: &[&str] = &[
    "jube_benchmark_id",
    "jube_benchmark_name",
    "jube_step_name",
    "jube_wp_id",
    "jube_wp_iteration",
    "jube_wp_cycle",
    "jube_wp_abspath",
];

/// Remove every reserved name from `set` (§4.3 step 5: strip before re-merging a
/// parent parameter set, since the names will be re-injected fresh for the new step).
pub fn strip_reserved(set: &mut ParameterSet) {
    for name in RESERVED_NAMES {
        set.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jube_core::types::DuplicatePolicy as DP;

    #[test]
    fn benchmark_params_carry_jube_update_mode() {
        let bench = Benchmark::new(1, "b");
        let step = Step::new("s");
        let set = benchmark_and_step_params(&bench, &step);
        assert_eq!(set.get("jube_benchmark_id").unwrap().update_mode, UpdateMode::Jube);
        assert_eq!(set.get("jube_step_name").unwrap().value(), "s");
    }

    #[test]
    fn workpackage_params_include_abspath() {
        let bench = Benchmark::new(1, "b");
        let step = Step::new("s");
        let wp = Workpackage::new(jube_core::types::WorkpackageId(3), "s", ParameterSet::new(DP::Replace), 0);
        let set = workpackage_params(&bench, &step, &wp, std::path::Path::new("/bench"));
        assert_eq!(set.get("jube_wp_abspath").unwrap().value(), "/bench/000003_s");
    }
}
