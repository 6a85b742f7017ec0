//! Composition root: turns validated settings into one orchestrator with all
//! of its collaborators.

use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::backend::{PlanBackend, TfeClient, TfeClientOptions, UnconfiguredBackend};
use crate::blueprint::BuiltinRenderer;
use crate::bundle::{BundleStorage, FsBundleStorage, MemoryBundleStorage};
use crate::config::{Settings, StorageBackend};
use crate::orchestration::{Collaborators, LockStore, Orchestrator, OrchestratorConfig, RunStore};
use crate::review::{GithubChecksClient, GithubChecksOptions, ReviewChecks};
use crate::shared::{EventLog, LogLevel, PollPolicy, Redactor, RetryPolicy};
use crate::storage::{KvStore, MemoryStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub paths: StatePaths,
    pub log: EventLog,
    pub orchestrator: Arc<Orchestrator>,
}

/// Non-empty value of the named environment variable.
pub fn read_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn assemble_orchestrator(settings: &Settings, paths: &StatePaths) -> Result<Runtime, RuntimeError> {
    bootstrap_state_root(paths)?;

    let backend_token = read_secret(&settings.backend.token_env);
    let review_token = if settings.review.enabled {
        read_secret(&settings.review.token_env)
    } else {
        None
    };
    let mut redactor = Redactor::new();
    for token in backend_token.iter().chain(review_token.iter()) {
        redactor.add_secret(token.clone());
    }
    let log = EventLog::new(&paths.root, redactor);

    let (run_kv, lock_kv, bundles): (Arc<dyn KvStore>, Arc<dyn KvStore>, Arc<dyn BundleStorage>) =
        match settings.storage.backend {
            StorageBackend::Sqlite => {
                let db_path = settings.database_path(&paths.root);
                (
                    Arc::new(SqliteStore::open(&db_path, "runs")?),
                    Arc::new(SqliteStore::open(&db_path, "locks")?),
                    Arc::new(FsBundleStorage::new(settings.bundles_dir(&paths.root))),
                )
            }
            StorageBackend::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryBundleStorage::new()),
            ),
        };

    let backend_cfg = &settings.backend;
    let request_timeout = Duration::from_secs(backend_cfg.request_timeout_seconds);
    let retry_delay = Duration::from_millis(backend_cfg.retry_delay_ms);
    let backend: Arc<dyn PlanBackend> = match backend_token {
        Some(token) => Arc::new(TfeClient::new(
            TfeClientOptions {
                api_url: backend_cfg.api_url.clone(),
                organization: backend_cfg.organization.clone(),
                token,
                request_timeout,
                max_retries: backend_cfg.max_retries,
                retry_delay,
                run_poll: PollPolicy::new(
                    Duration::from_secs(backend_cfg.poll_interval_seconds),
                    Duration::from_secs(backend_cfg.run_timeout_seconds),
                ),
                config_poll: PollPolicy::new(
                    Duration::from_secs(backend_cfg.poll_interval_seconds.min(2)),
                    Duration::from_secs(backend_cfg.config_timeout_seconds),
                ),
            },
            log.clone(),
        )?),
        None => {
            let reason = format!(
                "environment variable `{}` is not set; backend calls are disabled",
                backend_cfg.token_env
            );
            log.runtime(LogLevel::Warn, "backend.unconfigured", &reason);
            Arc::new(UnconfiguredBackend::new(reason))
        }
    };

    let checks: Option<Arc<dyn ReviewChecks>> = match review_token {
        Some(token) => Some(Arc::new(GithubChecksClient::new(
            GithubChecksOptions {
                api_url: settings.review.api_url.clone(),
                token,
                details_url: settings.review.details_url.clone(),
                request_timeout,
                max_retries: backend_cfg.max_retries,
                retry_delay,
            },
            log.clone(),
        )?)),
        None => {
            if settings.review.enabled {
                log.runtime(
                    LogLevel::Warn,
                    "review.unconfigured",
                    &format!(
                        "environment variable `{}` is not set; review checks are skipped",
                        settings.review.token_env
                    ),
                );
            }
            None
        }
    };

    let orchestrator = Orchestrator::new(
        RunStore::new(run_kv),
        LockStore::new(lock_kv, log.clone()),
        Collaborators {
            renderer: Arc::new(BuiltinRenderer::new(
                settings.renderer.module_source_base.clone(),
            )),
            bundles,
            backend,
            checks,
        },
        OrchestratorConfig {
            lock_ttl: Duration::from_secs(settings.locks.ttl_seconds),
            plan_check_name: settings.review.plan_check_name.clone(),
            apply_check_name: settings.review.apply_check_name.clone(),
            still_processing: RetryPolicy::new(
                backend_cfg.still_processing_attempts,
                Duration::from_millis(backend_cfg.still_processing_delay_ms),
            ),
        },
        log.clone(),
    );
    log.runtime(
        LogLevel::Info,
        "runtime.assembled",
        &format!(
            "storage={} state_root={}",
            settings.storage.backend.as_str(),
            paths.root.display()
        ),
    );

    Ok(Runtime {
        paths: paths.clone(),
        log,
        orchestrator: Arc::new(orchestrator),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sqlite_runtime_persists_runs_across_assemblies() {
        let dir = tempdir().expect("tempdir");
        let mut settings = Settings::default();
        settings.backend.organization = "acme".to_string();
        settings.backend.token_env = "STACKRUN_TEST_UNSET_BACKEND_TOKEN".to_string();
        settings.review.enabled = false;
        let paths = StatePaths::new(dir.path());

        let first = assemble_orchestrator(&settings, &paths).expect("assemble");
        let blueprint = serde_json::from_value(serde_json::json!({"kind": "postgres-db"}))
            .expect("blueprint");
        let view = first
            .orchestrator
            .submit_as("run-persisted", blueprint)
            .expect("submit");

        let second = assemble_orchestrator(&settings, &paths).expect("reassemble");
        assert_eq!(
            second.orchestrator.status("run-persisted").expect("status"),
            view
        );
        assert!(dir.path().join("stackrun.db").is_file());
    }
}
