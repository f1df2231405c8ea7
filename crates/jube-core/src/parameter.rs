//! Parameter and ParameterSet algebra: merging, template expansion, substitution
//! and scripted-value evaluation.

use crate::error::{Error, Result};
use crate::types::{ContentType, DuplicatePolicy, ParameterMode, UpdateMode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

const MAX_SUBSTITUTION_PASSES: usize = 50;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // The `\$\$` alternative must come first: it matches a deliberately escaped
    // dollar before either reference form can consume the inner `$name`, so
    // `$$name` is left untouched by substitution and only unescaped at final-sub
    // time (§4.1).
    PATTERN.get_or_init(|| Regex::new(r"\$\$|\$\{(?P<braced>[A-Za-z_]\w*)\}|\$(?P<bare>[A-Za-z_]\w*)").unwrap())
}

/// Whether `text` contains a genuine unresolved `$name`/`${name}` reference, as
/// opposed to a merely-escaped `$$`.
fn has_unresolved_reference(text: &str) -> bool {
    reference_pattern()
        .captures_iter(text)
        .any(|caps| caps.name("braced").is_some() || caps.name("bare").is_some())
}

/// The first genuine unresolved reference name in `text`, ignoring `$$` escapes.
fn first_unresolved_reference(text: &str) -> Option<String> {
    reference_pattern().captures_iter(text).find_map(|caps| {
        caps.name("braced")
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str().to_string())
    })
}

/// A single parameter: a name bound to either one value (static) or several
/// (template, split on `separator`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    raw: String,
    pub separator: char,
    pub content_type: ContentType,
    pub mode: ParameterMode,
    pub update_mode: UpdateMode,
    pub export: bool,
    pub duplicate: Option<DuplicatePolicy>,
    /// Index into the pre-expansion template's value list, if this parameter was
    /// produced by `expand_templates`. A plain relation, not a pointer: kept as an
    /// index so persistence stays a flat record.
    pub based_on: Option<usize>,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, raw_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: raw_value.into(),
            separator: ',',
            content_type: ContentType::default(),
            mode: ParameterMode::default(),
            update_mode: UpdateMode::default(),
            export: false,
            duplicate: None,
            based_on: None,
        }
    }

    #[must_use]
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ParameterMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_update_mode(mut self, update_mode: UpdateMode) -> Self {
        self.update_mode = update_mode;
        self
    }

    #[must_use]
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    #[must_use]
    pub fn with_duplicate(mut self, duplicate: DuplicatePolicy) -> Self {
        self.duplicate = Some(duplicate);
        self
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn split_values(&self) -> Vec<&str> {
        self.raw.split(self.separator).collect()
    }

    #[must_use]
    pub fn is_template(&self) -> bool {
        self.split_values().len() > 1
    }

    /// The current (single) value. Only meaningful once the parameter is no longer
    /// a template — callers must `expand_templates` the owning set first.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.raw
    }

    fn set_value(&mut self, value: impl Into<String>) {
        self.raw = value.into();
    }

    fn structurally_equal_options(&self, other: &Self) -> bool {
        self.separator == other.separator
            && self.content_type == other.content_type
            && self.mode == other.mode
            && self.update_mode == other.update_mode
            && self.export == other.export
    }
}

/// An insertion-ordered, name-addressed collection of parameters with its own
/// duplicate-resolution policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    policy: DuplicatePolicy,
    order: Vec<String>,
    params: HashMap<String, Parameter>,
}

impl ParameterSet {
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            order: Vec::new(),
            params: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.order.iter().map(|name| &self.params[name])
    }

    /// Add a parameter, honouring the set's duplicate policy (or the parameter's own
    /// override, which must not conflict with an already-recorded override for the
    /// same name).
    pub fn add(&mut self, param: Parameter) -> Result<()> {
        let Some(existing) = self.params.get(&param.name).cloned() else {
            self.order.push(param.name.clone());
            self.params.insert(param.name.clone(), param);
            return Ok(());
        };

        let effective_policy = match (existing.duplicate, param.duplicate) {
            (Some(a), Some(b)) if a as u8 != b as u8 => {
                return Err(Error::DuplicatePolicyConflict {
                    name: param.name,
                    existing: a.as_str(),
                    new: b.as_str(),
                });
            }
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => self.policy,
        };

        match effective_policy {
            DuplicatePolicy::Replace => {
                self.params.insert(param.name.clone(), param);
            }
            DuplicatePolicy::Concat => {
                if !existing.structurally_equal_options(&param) {
                    return Err(Error::ConcatOptionMismatch { name: param.name });
                }
                let mut merged = existing;
                merged.raw = format!("{}{}{}", merged.raw, merged.separator, param.raw);
                self.params.insert(merged.name.clone(), merged);
            }
            DuplicatePolicy::Error => {
                return Err(Error::DuplicateError { name: param.name });
            }
            DuplicatePolicy::None => {
                if existing.raw != param.raw || !existing.structurally_equal_options(&param) {
                    return Err(Error::DuplicateNotIdentical { name: param.name });
                }
            }
        }
        Ok(())
    }

    /// Remove a parameter by name, if present.
    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        let removed = self.params.remove(name);
        if removed.is_some() {
            self.order.retain(|n| n != name);
        }
        removed
    }

    /// Merge another set into this one, name by name, via `add`.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        for param in other.iter() {
            self.add(param.clone())?;
        }
        Ok(())
    }

    /// Two sets are compatible iff every name they share has an identical definition,
    /// excluding names whose `update_mode` is due to change at `phase` (those are
    /// allowed to differ — they will be refreshed anyway).
    #[must_use]
    pub fn is_compatible(&self, other: &Self, phase: UpdateMode) -> bool {
        for name in &self.order {
            let Some(other_param) = other.params.get(name) else {
                continue;
            };
            let mine = &self.params[name];
            if mine.update_mode.is_due_at(phase) {
                continue;
            }
            if mine.raw != other_param.raw || !mine.structurally_equal_options(other_param) {
                return false;
            }
        }
        true
    }

    /// Parameters whose `update_mode` is due to refresh at `phase`.
    #[must_use]
    pub fn get_updatable(&self, phase: UpdateMode) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.params[*name].update_mode.is_due_at(phase))
            .map(String::as_str)
            .collect()
    }

    /// Recursively expand every template parameter into the Cartesian product of
    /// fully-static sets, preserving declared value order for determinism.
    #[must_use]
    pub fn expand_templates(&self) -> Vec<Self> {
        let Some(template_name) = self
            .order
            .iter()
            .find(|name| self.params[*name].is_template())
            .cloned()
        else {
            return vec![self.clone()];
        };

        let template = self.params[&template_name].clone();
        let values: Vec<String> = template
            .split_values()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut out = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let mut next = self.clone();
            let mut resolved = template.clone();
            resolved.set_value(value);
            resolved.based_on = Some(index);
            next.params.insert(template_name.clone(), resolved);
            out.extend(next.expand_templates());
        }
        out
    }

    /// Iterate substitution to a fixed point. `final_pass` additionally unescapes
    /// `$$` to `$` and treats any parameter still containing an unresolved `$name`
    /// as a hard error (escapes aside, this is the only point substitution errors).
    pub fn substitute(&mut self, final_pass: bool) -> Result<()> {
        for _ in 0..MAX_SUBSTITUTION_PASSES {
            let snapshot: HashMap<String, String> = self
                .order
                .iter()
                .map(|name| (name.clone(), self.params[name].raw.clone()))
                .collect();

            let mut changed = false;
            for name in self.order.clone() {
                let param = self.params.get_mut(&name).unwrap();
                let substituted = substitute_once(&param.raw, &snapshot);
                if substituted != param.raw {
                    param.raw = substituted;
                    changed = true;
                }
            }

            self.evaluate_ready_scripts()?;

            if !changed {
                if final_pass {
                    self.finalize_escapes_and_check_unresolved()?;
                }
                return Ok(());
            }
        }

        let remaining: Vec<String> = self
            .order
            .iter()
            .filter(|name| has_unresolved_reference(&self.params[*name].raw))
            .cloned()
            .collect();
        Err(Error::SubstitutionDidNotConverge {
            max_passes: MAX_SUBSTITUTION_PASSES,
            remaining,
        })
    }

    /// Checks for a genuinely unresolved reference first (ignoring `$$` escapes),
    /// then unescapes `$$` to `$` — in that order, so a deliberately escaped
    /// reference like `$$HOME` never raises `UnresolvedParameter` (§4.1).
    fn finalize_escapes_and_check_unresolved(&mut self) -> Result<()> {
        for name in self.order.clone() {
            let param = self.params.get_mut(&name).unwrap();
            if let Some(reference) = first_unresolved_reference(&param.raw) {
                return Err(Error::UnresolvedParameter {
                    name: name.clone(),
                    reference,
                });
            }
            param.raw = param.raw.replace("$$", "$");
        }
        Ok(())
    }

    /// Evaluate any scripted parameter whose references have all resolved to static
    /// text (no more `$name` left in its value).
    fn evaluate_ready_scripts(&mut self) -> Result<()> {
        for name in self.order.clone() {
            let param = self.params.get(&name).unwrap().clone();
            if !param.mode.is_scripted() || has_unresolved_reference(&param.raw) {
                continue;
            }
            let evaluated = evaluate_script(&param)?;
            let slot = self.params.get_mut(&name).unwrap();
            slot.raw = evaluated;
            slot.mode = ParameterMode::Text;
        }
        Ok(())
    }

    /// Current value of every fully-static, non-scripted parameter, name to value.
    /// Mirrors the original's `constant_parameter_dict`: the flat map handed to
    /// substitution, staging and operation execution.
    #[must_use]
    pub fn constant_parameter_dict(&self) -> HashMap<String, String> {
        self.iter()
            .filter(|p| !p.is_template())
            .map(|p| (p.name.clone(), p.raw.clone()))
            .collect()
    }

    /// Parameters flagged `export = true`, for environment propagation.
    pub fn export_parameter_dict(&self) -> impl Iterator<Item = &Parameter> {
        self.iter().filter(|p| p.export)
    }
}

/// Single-pass `$name`/`${name}` substitution over a plain string against a flat
/// value map, exposed for callers outside the parameter set itself (operation
/// `do` strings, filenames, `active` expressions) that need the same textual
/// substitution `ParameterSet::substitute` applies internally.
#[must_use]
pub fn substitute_text(raw: &str, values: &HashMap<String, String>) -> String {
    substitute_once(raw, values)
}

fn substitute_once(raw: &str, values: &HashMap<String, String>) -> String {
    reference_pattern()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                // The `$$` alternative: passed through untouched until final-sub,
                // which is the only place an escape is actually collapsed (§4.1).
                return "$$".to_string();
            };
            values
                .get(name.as_str())
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn evaluate_script(param: &Parameter) -> Result<String> {
    let interpreter = match param.mode {
        ParameterMode::Shell => "sh",
        ParameterMode::Python => "python3",
        ParameterMode::Text => {
            return Err(Error::UnsupportedScriptMode {
                name: param.name.clone(),
                mode: "text",
            });
        }
    };
    let arg = match param.mode {
        ParameterMode::Shell => param.raw.clone(),
        ParameterMode::Python => format!("print({})", param.raw),
        ParameterMode::Text => unreachable!(),
    };

    let output = Command::new(interpreter)
        .arg("-c")
        .arg(&arg)
        .output()
        .map_err(|e| Error::ScriptEvaluationFailed {
            name: param.name.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::ScriptEvaluationFailed {
            name: param.name.clone(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_replace_overwrites() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "1")).unwrap();
        set.add(Parameter::new("p", "2")).unwrap();
        assert_eq!(set.get("p").unwrap().value(), "2");
    }

    #[test]
    fn add_error_policy_rejects_redefinition() {
        let mut set = ParameterSet::new(DuplicatePolicy::Error);
        set.add(Parameter::new("p", "1")).unwrap();
        let err = set.add(Parameter::new("p", "2"));
        assert!(matches!(err, Err(Error::DuplicateError { .. })));
    }

    #[test]
    fn add_none_policy_requires_identical() {
        let mut set = ParameterSet::new(DuplicatePolicy::None);
        set.add(Parameter::new("p", "1")).unwrap();
        set.add(Parameter::new("p", "1")).unwrap();
        let err = set.add(Parameter::new("p", "2"));
        assert!(matches!(err, Err(Error::DuplicateNotIdentical { .. })));
    }

    #[test]
    fn add_concat_merges_values() {
        let mut set = ParameterSet::new(DuplicatePolicy::Concat);
        set.add(Parameter::new("p", "a")).unwrap();
        set.add(Parameter::new("p", "b")).unwrap();
        assert_eq!(set.get("p").unwrap().value(), "a,b");
    }

    #[test]
    fn per_parameter_duplicate_override_conflict_is_rejected() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "1").with_duplicate(DuplicatePolicy::Error))
            .unwrap();
        let err = set.add(Parameter::new("p", "2").with_duplicate(DuplicatePolicy::Concat));
        assert!(matches!(err, Err(Error::DuplicatePolicyConflict { .. })));
    }

    #[test]
    fn expand_templates_cartesian_product() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "x,y,z")).unwrap();
        let expanded = set.expand_templates();
        assert_eq!(expanded.len(), 3);
        let values: Vec<&str> = expanded.iter().map(|s| s.get("p").unwrap().value()).collect();
        assert_eq!(values, vec!["x", "y", "z"]);
    }

    #[test]
    fn expand_templates_handles_two_independent_templates() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("a", "1,2")).unwrap();
        set.add(Parameter::new("b", "x,y")).unwrap();
        let expanded = set.expand_templates();
        assert_eq!(expanded.len(), 4);
    }

    #[test]
    fn expand_templates_is_noop_without_templates() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "solo")).unwrap();
        assert_eq!(set.expand_templates().len(), 1);
    }

    #[test]
    fn substitute_replaces_dollar_name_to_fixed_point() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("a", "1")).unwrap();
        set.add(Parameter::new("b", "$a-2")).unwrap();
        set.add(Parameter::new("c", "${b}-3")).unwrap();
        set.substitute(false).unwrap();
        assert_eq!(set.get("c").unwrap().value(), "1-2-3");
    }

    #[test]
    fn substitute_final_pass_errors_on_unresolved_reference() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("b", "$missing")).unwrap();
        let err = set.substitute(true);
        assert!(matches!(err, Err(Error::UnresolvedParameter { .. })));
    }

    #[test]
    fn substitute_final_pass_unescapes_double_dollar() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "cost: $$5")).unwrap();
        set.substitute(true).unwrap();
        assert_eq!(set.get("p").unwrap().value(), "cost: $5");
    }

    #[test]
    fn substitute_final_pass_unescapes_double_dollar_identifier_reference() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("p", "$$HOME is escaped")).unwrap();
        set.substitute(true).unwrap();
        assert_eq!(set.get("p").unwrap().value(), "$HOME is escaped");
    }

    #[test]
    fn substitute_non_final_pass_leaves_escaped_identifier_reference_intact() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("home", "/root")).unwrap();
        set.add(Parameter::new("p", "$$home stays literal")).unwrap();
        set.substitute(false).unwrap();
        assert_eq!(set.get("p").unwrap().value(), "$$home stays literal");
    }

    #[test]
    fn substitute_non_final_pass_leaves_unresolved_reference_intact() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("b", "$missing")).unwrap();
        set.substitute(false).unwrap();
        assert_eq!(set.get("b").unwrap().value(), "$missing");
    }

    #[test]
    fn is_compatible_ignores_names_due_to_update() {
        let mut a = ParameterSet::new(DuplicatePolicy::Replace);
        a.add(Parameter::new("cycle_count", "0").with_update_mode(UpdateMode::Cycle))
            .unwrap();
        let mut b = ParameterSet::new(DuplicatePolicy::Replace);
        b.add(Parameter::new("cycle_count", "1").with_update_mode(UpdateMode::Cycle))
            .unwrap();
        assert!(a.is_compatible(&b, UpdateMode::Cycle));
        assert!(!a.is_compatible(&b, UpdateMode::Use));
    }

    #[test]
    fn is_compatible_true_for_identical_shared_names() {
        let mut a = ParameterSet::new(DuplicatePolicy::Replace);
        a.add(Parameter::new("x", "1")).unwrap();
        let mut b = ParameterSet::new(DuplicatePolicy::Replace);
        b.add(Parameter::new("x", "1")).unwrap();
        b.add(Parameter::new("y", "2")).unwrap();
        assert!(a.is_compatible(&b, UpdateMode::Use));
    }

    #[test]
    fn get_updatable_filters_by_rank() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("a", "1").with_update_mode(UpdateMode::Never))
            .unwrap();
        set.add(Parameter::new("b", "2").with_update_mode(UpdateMode::Cycle))
            .unwrap();
        let updatable = set.get_updatable(UpdateMode::Cycle);
        assert_eq!(updatable, vec!["b"]);
    }

    #[test]
    fn export_parameter_dict_only_includes_exported() {
        let mut set = ParameterSet::new(DuplicatePolicy::Replace);
        set.add(Parameter::new("a", "1").with_export(true)).unwrap();
        set.add(Parameter::new("b", "2")).unwrap();
        let exported: Vec<&str> = set.export_parameter_dict().map(|p| p.name.as_str()).collect();
        assert_eq!(exported, vec!["a"]);
    }
}
