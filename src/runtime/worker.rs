//! Background builder: picks up submitted runs and renders their bundles.

use super::{RuntimeError, StatePaths};
use crate::orchestration::{ErrorKind, Orchestrator, OrchestratorError, RunState};
use crate::shared::{sleep_with_stop, EventLog, LogLevel};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_WORKER_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub built: Vec<String>,
    pub failed: Vec<FailedBuild>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBuild {
    pub run_id: String,
    pub error: String,
}

pub(crate) fn needs_attention(metadata: &serde_json::Map<String, serde_json::Value>) -> bool {
    metadata
        .get("error")
        .is_some_and(|error| !error.is_null())
}

/// Builds up to `limit` submitted runs, oldest first. Runs whose last build
/// failed are left for an operator to retry explicitly.
pub fn drain_submitted_once(
    orchestrator: &Orchestrator,
    limit: usize,
) -> Result<DrainReport, OrchestratorError> {
    let mut report = DrainReport::default();
    let pending = orchestrator
        .runs_in_state(RunState::Submitted)?
        .into_iter()
        .filter(|run| !needs_attention(&run.metadata))
        .take(limit);
    for run in pending {
        match orchestrator.build(&run.run_id) {
            Ok(_) => report.built.push(run.run_id),
            // Another worker or a manual command moved the run first.
            Err(err) if err.kind() == ErrorKind::InvalidTransition => {}
            Err(err) => report.failed.push(FailedBuild {
                run_id: run.run_id,
                error: err.to_string(),
            }),
        }
    }
    Ok(report)
}

/// Drops the stop marker so a running worker exits at its next check.
pub fn request_worker_stop(paths: &StatePaths) -> Result<PathBuf, RuntimeError> {
    let path = paths.worker_stop_path();
    fs::create_dir_all(paths.daemon_dir()).map_err(|source| RuntimeError::CreateDir {
        path: paths.daemon_dir().display().to_string(),
        source,
    })?;
    fs::write(&path, b"stop\n").map_err(|source| RuntimeError::Signal {
        path: path.display().to_string(),
        source,
    })?;
    Ok(path)
}

/// Removes a stop marker left by an earlier `worker stop`.
pub fn clear_worker_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.worker_stop_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RuntimeError::Signal {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Sets `stop` once the stop marker appears. The thread exits when either
/// the marker is seen or `stop` was set by someone else.
pub fn watch_stop_file(paths: &StatePaths, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    let marker = paths.worker_stop_path();
    thread::spawn(move || loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if marker.exists() {
            stop.store(true, Ordering::Relaxed);
            return;
        }
        thread::sleep(Duration::from_millis(250));
    })
}

/// Drains until `stop` is set. Returns the number of runs built.
pub fn run_worker(
    orchestrator: &Orchestrator,
    log: &EventLog,
    stop: &AtomicBool,
    interval: Duration,
    limit: usize,
) -> usize {
    log.runtime(LogLevel::Info, "worker.started", "build worker started");
    let mut total = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match drain_submitted_once(orchestrator, limit) {
            Ok(report) => {
                total += report.built.len();
                for failed in &report.failed {
                    log.runtime(
                        LogLevel::Error,
                        "worker.build_failed",
                        &format!("{}: {}", failed.run_id, failed.error),
                    );
                }
            }
            Err(err) => log.runtime(LogLevel::Error, "worker.drain_failed", &err.to_string()),
        }
        if !sleep_with_stop(stop, interval) {
            break;
        }
    }
    log.runtime(
        LogLevel::Info,
        "worker.stopped",
        &format!("build worker stopped after building {total} runs"),
    );
    total
}
