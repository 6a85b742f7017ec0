pub mod assembly;
pub mod state_paths;
pub mod worker;

pub use assembly::{assemble_orchestrator, read_secret, Runtime};
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use worker::{
    clear_worker_stop, drain_submitted_once, request_worker_stop, run_worker, watch_stop_file,
    DrainReport, FailedBuild, DEFAULT_DRAIN_LIMIT, DEFAULT_WORKER_INTERVAL,
};

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::review::ReviewError;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open run storage: {0}")]
    Store(#[from] StoreError),
    #[error("failed to configure plan backend: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to configure review checks: {0}")]
    Review(#[from] ReviewError),
    #[error("failed to write runtime signal {path}: {source}")]
    Signal {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
