use super::RuntimeError;
use crate::shared::logging::{run_log_path, runtime_log_path};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("logs"),
            self.root.join("logs/runs"),
            self.root.join("daemon"),
        ]
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    /// Presence of this file asks a running worker to exit.
    pub fn worker_stop_path(&self) -> PathBuf {
        self.daemon_dir().join("worker.stop")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        runtime_log_path(&self.root)
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        run_log_path(&self.root, run_id)
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
