//! Ambient engine configuration: the execution shell, include path, output group,
//! env-dump naming and stderr tail length. This is not the benchmark specification
//! (that stays out of scope) — it is the handful of knobs the engine itself reads
//! from the environment and, optionally, a small local override file.
//!
//! Precedence: environment variable > `jube.conf` entry > built-in default, matching
//! the `key = value` override-file style the rest of this stack uses for its own
//! ambient configuration.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Default shell used to run `Operation::do_string` when `JUBE_EXEC_SHELL` is unset
/// or empty.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Default number of trailing stderr lines captured into a failed operation's error.
pub const DEFAULT_ERROR_MSG_LINES: usize = 5;

/// Filename pattern for the transient per-operation environment dump.
pub const ENV_DUMP_FILENAME: &str = "env_info";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shell used to run operations. Empty means "use `DEFAULT_SHELL`".
    pub exec_shell: String,
    /// Colon-separated include-search directories (consumed by the out-of-scope
    /// parser; carried here only so the engine can pass it through unmodified).
    pub include_path: Vec<std::path::PathBuf>,
    /// POSIX group to `chown`/setgid the benchmark directory to, if any.
    pub group_name: Option<String>,
    /// Trailing stderr lines captured on a failed operation.
    pub error_msg_lines: usize,
    /// Debug mode: sentinel becomes `done_DEBUG` instead of `done`, and debug-level
    /// tracing is more verbose at scheduler decision points.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exec_shell: String::new(),
            include_path: Vec::new(),
            group_name: None,
            error_msg_lines: DEFAULT_ERROR_MSG_LINES,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// The shell actually used to spawn operations: `JUBE_EXEC_SHELL` if set and
    /// non-empty, else the compile-time default (§4.6 step 3).
    #[must_use]
    pub fn shell(&self) -> &str {
        if self.exec_shell.is_empty() {
            DEFAULT_SHELL
        } else {
            &self.exec_shell
        }
    }

    /// Build from process environment, per §6's environment-variable surface.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(shell) = std::env::var("JUBE_EXEC_SHELL") {
            config.exec_shell = shell;
        }
        if let Ok(path) = std::env::var("JUBE_INCLUDE_PATH") {
            config.include_path = std::env::split_paths(&path).collect();
        }
        if let Ok(group) = std::env::var("JUBE_GROUP_NAME") {
            if !group.is_empty() {
                config.group_name = Some(group);
            }
        }
        config
    }

    /// Layer a `jube.conf` file (`key = value`, `#` comments) on top of the current
    /// values. Environment variables already applied by `from_env` take precedence
    /// over the file, so this should be called before `from_env` if both are used, or
    /// skipped for keys already set.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "exec_shell" => self.exec_shell = value.to_string(),
                "include_path" => {
                    self.include_path = std::env::split_paths(value).collect();
                }
                "group_name" => {
                    self.group_name = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    };
                }
                "error_msg_lines" => {
                    self.error_msg_lines = value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                }
                "debug" => self.debug = value == "true" || value == "1",
                _ => return Err(ConfigError::InvalidLine(format!("unknown config key: {key}"))),
            }
        }
        Ok(())
    }

    /// Load from `jube.conf` (if present) then overlay process environment, matching
    /// the documented precedence of env over file over default.
    #[must_use]
    pub fn load(conf_path: Option<&Path>) -> Self {
        let mut config = Self::default();
        if let Some(path) = conf_path {
            if path.exists() {
                if let Err(err) = config.load_file(path) {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable jube.conf");
                }
            }
        }
        let env = Self::from_env();
        if !env.exec_shell.is_empty() {
            config.exec_shell = env.exec_shell;
        }
        if !env.include_path.is_empty() {
            config.include_path = env.include_path;
        }
        if env.group_name.is_some() {
            config.group_name = env.group_name;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_defaults_when_empty() {
        let config = EngineConfig::default();
        assert_eq!(config.shell(), DEFAULT_SHELL);
    }

    #[test]
    fn shell_uses_override() {
        let mut config = EngineConfig::default();
        config.exec_shell = "/bin/zsh".to_string();
        assert_eq!(config.shell(), "/bin/zsh");
    }

    #[test]
    fn load_file_parses_known_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jube.conf");
        std::fs::write(&path, "# comment\nexec_shell = /bin/sh\nerror_msg_lines = 10\ndebug = true\n").unwrap();
        let mut config = EngineConfig::default();
        config.load_file(&path).unwrap();
        assert_eq!(config.exec_shell, "/bin/sh");
        assert_eq!(config.error_msg_lines, 10);
        assert!(config.debug);
    }

    #[test]
    fn load_file_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jube.conf");
        std::fs::write(&path, "bogus = 1\n").unwrap();
        let mut config = EngineConfig::default();
        assert!(config.load_file(&path).is_err());
    }
}
