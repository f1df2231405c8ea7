//! `Operation::execute` (§4.6): substitute the `do` string, spawn it under a shell,
//! recover the mutated environment, and check the async/break/error gates.
//!
//! Grounded on this stack's pattern for shelling out to an external process and
//! capturing its result (see `Runner::execute_step` in the sibling execution
//! engine): spawn via `tokio::process::Command`, redirect stdout/stderr to files,
//! and turn a non-zero exit into a typed error carrying a trimmed stderr tail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use jube_core::model::Operation;
use jube_core::parameter::substitute_text;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{EngineError, Result};

/// `(continue_op, continue_cycle)` from §4.6's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOutcome {
    /// `false` means the operation ran but is awaiting its async-done file: the
    /// workpackage becomes `Pending` and this same operation is re-checked (not
    /// re-executed) on the next pass.
    pub continue_op: bool,
    /// `false` means a break-file was found: no further operations or cycles run
    /// for this workpackage.
    pub continue_cycle: bool,
}

impl OperationOutcome {
    const DONE: Self = Self {
        continue_op: true,
        continue_cycle: true,
    };
}

/// Everything `execute` needs beyond the operation itself and the current
/// parameter dict: the shell to use, the directory to run in, and how many
/// trailing stderr lines to keep on failure.
#[derive(Debug, Clone)]
pub struct ExecContext<'a> {
    pub shell: &'a str,
    pub work_dir: &'a Path,
    pub error_msg_lines: usize,
}

fn substituted_path(template: &Option<String>, parameters: &HashMap<String, String>, work_dir: &Path) -> Option<PathBuf> {
    template
        .as_ref()
        .map(|raw| work_dir.join(substitute_text(raw, parameters)))
}

/// Run one operation to completion (or to its first suspension point).
///
/// `only_check_pending` re-implements the "async-only re-poll" path from §4.6:
/// when `true`, steps 1-6 (substitute, spawn, parse env) are skipped entirely and
/// only the break/async/error gate checks (steps 7-9) run, against the same
/// operation the workpackage was already blocked on.
pub async fn execute(
    operation: &Operation,
    parameters: &HashMap<String, String>,
    environment: &mut HashMap<String, String>,
    ctx: &ExecContext<'_>,
    only_check_pending: bool,
) -> Result<OperationOutcome> {
    if !only_check_pending {
        run_directive(operation, parameters, environment, ctx).await?;
    }
    check_gates(operation, parameters, ctx.work_dir)
}

async fn run_directive(
    operation: &Operation,
    parameters: &HashMap<String, String>,
    environment: &mut HashMap<String, String>,
    ctx: &ExecContext<'_>,
) -> Result<()> {
    let do_string = substitute_text(&operation.do_string, parameters);

    let op_work_dir = if let Some(raw) = &operation.work_dir {
        let dir = ctx.work_dir.join(substitute_text(raw, parameters));
        tokio::fs::create_dir_all(&dir).await?;
        dir
    } else {
        ctx.work_dir.to_path_buf()
    };

    let stdout_path = substituted_path(&operation.stdout_filename, parameters, &op_work_dir)
        .unwrap_or_else(|| op_work_dir.join("stdout"));
    let stderr_path = substituted_path(&operation.stderr_filename, parameters, &op_work_dir)
        .unwrap_or_else(|| op_work_dir.join("stderr"));

    let env_dump_path = op_work_dir.join(crate::config::ENV_DUMP_FILENAME);
    let full_command = format!("{do_string} && env > {}", shell_quote(&env_dump_path));

    tracing::debug!(command = %do_string, work_dir = %op_work_dir.display(), "executing operation");

    let mut child = Command::new(ctx.shell)
        .arg("-c")
        .arg(&full_command)
        .current_dir(&op_work_dir)
        .env_clear()
        .envs(environment.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout_buf).await?;
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_end(&mut stderr_buf).await?;
    }
    let status = child.wait().await?;

    append_file(&stdout_path, &stdout_buf).await?;
    append_file(&stderr_path, &stderr_buf).await?;

    if !status.success() {
        let tail = tail_lines(&String::from_utf8_lossy(&stderr_buf), ctx.error_msg_lines);
        return Err(EngineError::OperationFailed {
            do_string,
            work_dir: op_work_dir.display().to_string(),
            stderr_tail: tail,
        });
    }

    if env_dump_path.exists() {
        let dump = tokio::fs::read_to_string(&env_dump_path).await?;
        *environment = parse_env_dump(&dump);
        tokio::fs::remove_file(&env_dump_path).await?;
    }

    Ok(())
}

fn check_gates(operation: &Operation, parameters: &HashMap<String, String>, work_dir: &Path) -> Result<OperationOutcome> {
    let mut outcome = OperationOutcome::DONE;

    if let Some(path) = substituted_path(&operation.break_filename, parameters, work_dir) {
        if path.exists() {
            outcome.continue_cycle = false;
        }
    }

    if let Some(path) = substituted_path(&operation.async_filename, parameters, work_dir) {
        if !path.exists() {
            outcome.continue_op = false;
        }
    }

    if let Some(path) = substituted_path(&operation.error_filename, parameters, work_dir) {
        if path.exists() {
            return Err(EngineError::ErrorFileDetected {
                do_string: substitute_text(&operation.do_string, parameters),
                error_file: path.display().to_string(),
            });
        }
    }

    Ok(outcome)
}

async fn append_file(path: &Path, content: &[u8]) -> Result<()> {
    use tokio::fs::OpenOptions;
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(content).await?;
    Ok(())
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Multi-line values survive an `env` dump as extra lines with no `=`; such a line
/// is a continuation of the immediately preceding entry's value (§4.6 step 6).
fn parse_env_dump(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut current_key: Option<String> = None;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.to_string(), value.to_string());
            current_key = Some(key.to_string());
        } else if let Some(key) = &current_key {
            if let Some(entry) = map.get_mut(key) {
                entry.push('\n');
                entry.push_str(line);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_dump_splits_on_first_equals() {
        let dump = "A=1\nB=2=2\nPATH=/a:/b\n";
        let map = parse_env_dump(dump);
        assert_eq!(map.get("A").unwrap(), "1");
        assert_eq!(map.get("B").unwrap(), "2=2");
        assert_eq!(map.get("PATH").unwrap(), "/a:/b");
    }

    #[test]
    fn parse_env_dump_joins_continuation_lines() {
        let dump = "A=line one\nline two\nB=2\n";
        let map = parse_env_dump(dump);
        assert_eq!(map.get("A").unwrap(), "line one\nline two");
        assert_eq!(map.get("B").unwrap(), "2");
    }

    #[test]
    fn tail_lines_keeps_last_n() {
        let text = "1\n2\n3\n4\n5\n";
        assert_eq!(tail_lines(text, 2), "4\n5");
    }

    #[test]
    fn tail_lines_keeps_everything_when_short() {
        let text = "1\n2\n";
        assert_eq!(tail_lines(text, 5), "1\n2");
    }

    #[tokio::test]
    async fn execute_runs_directive_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("echo hi > out.txt");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        let outcome = execute(&op, &params, &mut env, &ctx, false).await.unwrap();
        assert_eq!(outcome, OperationOutcome::DONE);
        let content = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content, "hi\n");
    }

    #[tokio::test]
    async fn execute_reports_pending_when_async_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("true").with_async_filename("ready");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        let outcome = execute(&op, &params, &mut env, &ctx, false).await.unwrap();
        assert!(!outcome.continue_op);
    }

    #[tokio::test]
    async fn execute_only_check_pending_does_not_rerun_directive() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("echo ran >> count.txt").with_async_filename("ready");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        execute(&op, &params, &mut env, &ctx, false).await.unwrap();
        std::fs::write(dir.path().join("ready"), "").unwrap();
        let outcome = execute(&op, &params, &mut env, &ctx, true).await.unwrap();
        assert!(outcome.continue_op);
        let count = std::fs::read_to_string(dir.path().join("count.txt")).unwrap();
        assert_eq!(count.lines().count(), 1, "directive must not re-run on poll-only check");
    }

    #[tokio::test]
    async fn execute_sets_continue_cycle_false_on_break_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stop"), "").unwrap();
        let op = Operation::new("true").with_break_filename("stop");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        let outcome = execute(&op, &params, &mut env, &ctx, false).await.unwrap();
        assert!(!outcome.continue_cycle);
    }

    #[tokio::test]
    async fn execute_fails_on_nonzero_exit_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("echo boom 1>&2; exit 3");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        let err = execute(&op, &params, &mut env, &ctx, false).await.unwrap_err();
        match err {
            EngineError::OperationFailed { stderr_tail, .. } => assert!(stderr_tail.contains("boom")),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_errors_when_error_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("touch failed").with_error_filename("failed");
        let params = HashMap::new();
        let mut env = HashMap::new();
        let ctx = ExecContext {
            shell: "/bin/sh",
            work_dir: dir.path(),
            error_msg_lines: 5,
        };
        let err = execute(&op, &params, &mut env, &ctx, false).await.unwrap_err();
        assert!(matches!(err, EngineError::ErrorFileDetected { .. }));
    }
}
