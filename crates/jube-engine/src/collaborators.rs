//! Seams for the out-of-scope file staging, substitution and pattern-analysis
//! collaborators. The real JUBE carries a `fileset`/`substituteset`/`patternset`
//! grammar and a full analyser; here they are traits the scheduler calls through at
//! the points §4.5 and the `analyse` subcommand name, with the minimum concrete
//! implementations needed to run the §8 scenarios end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Copies or links files into a workpackage's working directory before its
/// operations run.
pub trait FileStager: std::fmt::Debug + Send + Sync {
    fn stage(
        &self,
        work_dir: &Path,
        parameters: &HashMap<String, String>,
        environment: &HashMap<String, String>,
    ) -> Result<()>;
}

/// No staging at all.
#[derive(Debug, Default)]
pub struct NullStager;

impl FileStager for NullStager {
    fn stage(&self, _work_dir: &Path, _parameters: &HashMap<String, String>, _environment: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }
}

/// Copies a fixed list of files into the work directory, ignoring missing sources.
/// The minimum needed to make staged-input scenarios runnable without a real
/// `fileset` grammar.
#[derive(Debug, Default)]
pub struct CopyStager {
    pub files: Vec<PathBuf>,
}

impl CopyStager {
    #[must_use]
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }
}

impl FileStager for CopyStager {
    fn stage(&self, work_dir: &Path, _parameters: &HashMap<String, String>, _environment: &HashMap<String, String>) -> Result<()> {
        for source in &self.files {
            let Some(name) = source.file_name() else {
                continue;
            };
            if !source.exists() {
                tracing::debug!(source = %source.display(), "stager: source missing, skipping");
                continue;
            }
            std::fs::copy(source, work_dir.join(name))?;
        }
        Ok(())
    }
}

/// File-level textual substitution on staged files (distinct from the in-memory
/// parameter substitution native to `jube_core::parameter`, which always runs).
pub trait Substituter: std::fmt::Debug + Send + Sync {
    fn substitute(&self, work_dir: &Path, parameters: &HashMap<String, String>) -> Result<()>;
}

/// No file-level substitution. Real substitution-set processing is out of scope.
#[derive(Debug, Default)]
pub struct NullSubstituter;

impl Substituter for NullSubstituter {
    fn substitute(&self, _work_dir: &Path, _parameters: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }
}

/// Pattern extraction over a completed workpackage's work directory, invoked by the
/// `analyse` CLI subcommand.
pub trait Analyser: std::fmt::Debug + Send + Sync {
    fn analyse(&self, work_dir: &Path, parameters: &HashMap<String, String>) -> Result<HashMap<String, String>>;
}

/// No pattern extraction. Real analysis (regex pattern sets over result files) is
/// out of scope.
#[derive(Debug, Default)]
pub struct NullAnalyser;

impl Analyser for NullAnalyser {
    fn analyse(&self, _work_dir: &Path, _parameters: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Reads one `name=value` line per pattern out of a named result file; the minimum
/// extraction needed to exercise the `analyse` subcommand without a real
/// pattern-matching DSL.
#[derive(Debug)]
pub struct LineAnalyser {
    pub result_filename: String,
}

impl Analyser for LineAnalyser {
    fn analyse(&self, work_dir: &Path, _parameters: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        let path = work_dir.join(&self.result_filename);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path).map_err(EngineError::Io)?;
        Ok(content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }
}
