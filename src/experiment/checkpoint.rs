//! Experiment persistence: the completed-task checkpoint and the streaming
//! per-run results file.
//!
//! Results are appended as JSON lines the moment each run completes, so a
//! large sweep never accumulates in memory and a crash loses at most the
//! in-flight runs. The checkpoint is rewritten atomically every N
//! completions and consumed by `resume`.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::runner::ExperimentRun;
use crate::error::DataError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub experiment: String,
    pub completed: BTreeSet<String>,
}

impl Checkpoint {
    pub fn new(experiment: &str) -> Self {
        Self {
            experiment: experiment.to_string(),
            completed: BTreeSet::new(),
        }
    }

    /// Load a checkpoint if one exists; a missing file is an empty one.
    pub fn load(path: &Path, experiment: &str) -> Result<Self, DataError> {
        if !path.exists() {
            return Ok(Self::new(experiment));
        }
        let raw = std::fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if checkpoint.experiment != experiment {
            tracing::warn!(
                found = %checkpoint.experiment,
                expected = experiment,
                "checkpoint belongs to a different experiment; ignoring"
            );
            return Ok(Self::new(experiment));
        }
        Ok(checkpoint)
    }

    /// Atomically rewrite the checkpoint (write-temp-then-rename).
    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Append-only JSONL writer for per-run records.
#[derive(Debug)]
pub struct ResultsWriter {
    file: std::fs::File,
    path: PathBuf,
}

impl ResultsWriter {
    pub fn open(path: &Path) -> Result<Self, DataError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, run: &ExperimentRun) -> Result<(), DataError> {
        let line = serde_json::to_string(run)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read every run record back from a results file.
pub fn read_runs(path: &Path) -> Result<Vec<ExperimentRun>, DataError> {
    let raw = std::fs::read_to_string(path)?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
        })
        .collect()
}
