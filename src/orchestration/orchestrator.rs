use crate::backend::{launch_run, BackendRunStatus, PlanBackend, RunOptions, RunStage};
use crate::blueprint::{Blueprint, BlueprintRenderer};
use crate::bundle::BundleStorage;
use crate::orchestration::checks::CheckSession;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::legacy::{import_legacy_dir, ImportReport};
use crate::orchestration::lock_store::{
    LeaseOutcome, LockStore, WorkspaceLease, WorkspaceLock, DEFAULT_LOCK_TTL,
};
use crate::orchestration::run_store::{RunRecord, RunStore, RunView};
use crate::orchestration::state_machine::RunState;
use crate::review::{CheckConclusion, ReviewChecks};
use crate::shared::retry::RetryPolicy;
use crate::shared::time::now_utc;
use crate::shared::{EventLog, LogLevel, RunId, WorkspaceName};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PLAN_CHECK_NAME: &str = "stackrun/plan";
pub const DEFAULT_APPLY_CHECK_NAME: &str = "stackrun/apply";
const RECENT_RUNS: usize = 5;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lock_ttl: Duration,
    pub plan_check_name: String,
    pub apply_check_name: String,
    /// Retry budget for `create_run` while a configuration version is still
    /// being processed.
    pub still_processing: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            plan_check_name: DEFAULT_PLAN_CHECK_NAME.to_string(),
            apply_check_name: DEFAULT_APPLY_CHECK_NAME.to_string(),
            still_processing: RetryPolicy::new(5, Duration::from_secs(2)),
        }
    }
}

/// External systems the orchestrator drives. Constructed once per process.
#[derive(Clone)]
pub struct Collaborators {
    pub renderer: Arc<dyn BlueprintRenderer>,
    pub bundles: Arc<dyn BundleStorage>,
    pub backend: Arc<dyn PlanBackend>,
    pub checks: Option<Arc<dyn ReviewChecks>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_runs: usize,
    pub by_state: BTreeMap<String, usize>,
    pub failed_runs: usize,
    pub awaiting_approval: usize,
    /// Runs whose blueprint asks for a recorded approval before apply.
    pub approval_required: usize,
    pub auto_approved: usize,
    /// Mean plan wall time over runs with both timestamps, rounded to 0.1s.
    pub average_plan_seconds: Option<f64>,
    pub active_locks: Vec<WorkspaceLock>,
    pub recent_runs: Vec<RunView>,
}

struct StageOutcome {
    backend_run_id: String,
    status: BackendRunStatus,
    output: String,
}

pub struct Orchestrator {
    runs: RunStore,
    locks: LockStore,
    collaborators: Collaborators,
    config: OrchestratorConfig,
    log: EventLog,
}

impl Orchestrator {
    pub fn new(
        runs: RunStore,
        locks: LockStore,
        collaborators: Collaborators,
        config: OrchestratorConfig,
        log: EventLog,
    ) -> Self {
        Self {
            runs,
            locks,
            collaborators,
            config,
            log,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn lock_store(&self) -> &LockStore {
        &self.locks
    }

    pub fn submit(&self, blueprint: Blueprint) -> Result<RunView, OrchestratorError> {
        let run_id = RunId::generate(now_utc()).map_err(OrchestratorError::IdAllocation)?;
        self.submit_as(run_id.as_str(), blueprint)
    }

    /// Submits with a caller-chosen run id.
    pub fn submit_as(&self, run_id: &str, blueprint: Blueprint) -> Result<RunView, OrchestratorError> {
        let run_id = RunId::parse(run_id).map_err(OrchestratorError::InvalidInput)?;
        blueprint.validate()?;
        let workspace = WorkspaceName::parse(&blueprint.workspace_for(run_id.as_str()))
            .map_err(OrchestratorError::InvalidInput)?;
        let now = now_utc();
        let mut record = RunRecord::new(
            run_id.as_str(),
            Some(workspace.to_string()),
            Some(blueprint.clone()),
            now,
        );
        record.metadata.insert("submitted_at".to_string(), json!(now));
        record.metadata.insert("kind".to_string(), json!(blueprint.kind));
        if let Some(external_id) = &blueprint.metadata.external_id {
            record
                .metadata
                .insert("external_id".to_string(), json!(external_id));
        }
        let record = self.runs.create(&record)?;
        self.log.run_event(
            run_id.as_str(),
            LogLevel::Info,
            "run.submitted",
            json!({"workspace": workspace.as_str(), "kind": blueprint.kind}),
        );
        Ok(record.view())
    }

    /// Validated state change with workspace locking for PLANNING and
    /// APPLYING. Contention fails fast with `WorkspaceBusy`, including when
    /// the run itself already holds the workspace. Leaving an exclusive state
    /// releases the lock, except for a cancellation.
    pub fn transition(
        &self,
        run_id: &str,
        target: RunState,
        workspace: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<RunView, OrchestratorError> {
        let now = now_utc();
        let record = self.runs.load(run_id)?;
        if !record.state.can_transition_to(target) {
            return Err(OrchestratorError::InvalidTransition {
                run_id: run_id.to_string(),
                from: record.state,
                to: target,
            });
        }
        let workspace = workspace
            .map(str::to_string)
            .or_else(|| record.workspace.clone());

        if target.is_workspace_exclusive() {
            let workspace = workspace.ok_or_else(|| {
                OrchestratorError::InvalidInput(format!(
                    "run `{run_id}` needs a workspace to enter `{target}`"
                ))
            })?;
            let workspace = WorkspaceName::parse(&workspace).map_err(OrchestratorError::InvalidInput)?;
            let lease = match self.locks.acquire_lease(
                workspace.as_str(),
                run_id,
                self.config.lock_ttl,
                now,
            )? {
                LeaseOutcome::Held(lease) => lease,
                LeaseOutcome::Busy(holder) => return Err(busy(holder)),
            };
            // A failed write drops the lease, which releases only this
            // acquisition.
            let done = self.runs.transition(
                run_id,
                Some(record.state),
                target,
                Some(workspace.as_str()),
                metadata,
                now,
            )?;
            lease.keep();
            self.log_transition(done.from, &done.record);
            return Ok(done.record.view());
        }

        let done = self.runs.transition(
            run_id,
            Some(record.state),
            target,
            workspace.as_deref(),
            metadata,
            now,
        )?;
        self.log_transition(done.from, &done.record);
        if done.from.is_workspace_exclusive() && target != RunState::Cancelled {
            if let Some(workspace) = &done.record.workspace {
                self.release_quietly(workspace, run_id);
            }
        }
        Ok(done.record.view())
    }

    /// Renders the blueprint and stores its bundle. Accepted from SUBMITTED
    /// and from PLAN_FAILED, which is how a failed plan is retried.
    pub fn build(&self, run_id: &str) -> Result<RunView, OrchestratorError> {
        let record = self.runs.load(run_id)?;
        if !matches!(record.state, RunState::Submitted | RunState::PlanFailed) {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                operation: "build",
                actual: record.state,
                expected: "submitted or plan_failed",
            });
        }
        let blueprint = record.blueprint.clone().ok_or_else(|| {
            OrchestratorError::InvalidInput(format!("run `{run_id}` has no blueprint to build"))
        })?;

        let rendered = self
            .collaborators
            .renderer
            .render(&blueprint.kind, &blueprint.variables)
            .map_err(OrchestratorError::from)
            .and_then(|files| {
                let bundle = self.collaborators.bundles.store(run_id, &files)?;
                Ok((files, bundle))
            });
        let (files, bundle) = match rendered {
            Ok(rendered) => rendered,
            Err(err) => {
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), json!(self.redacted(&err)));
                metadata.insert("error_kind".to_string(), json!(err.kind().as_str()));
                self.runs.merge_metadata(run_id, metadata, now_utc())?;
                self.log.run_event(
                    run_id,
                    LogLevel::Error,
                    "build.failed",
                    json!({"error": self.redacted(&err)}),
                );
                return Err(err);
            }
        };

        let mut started = Map::new();
        started.insert("build_started_at".to_string(), json!(now_utc()));
        started.insert("error".to_string(), Value::Null);
        started.insert("error_kind".to_string(), Value::Null);
        let building = self.runs.transition(
            run_id,
            Some(record.state),
            RunState::Building,
            None,
            started,
            now_utc(),
        )?;
        self.log_transition(building.from, &building.record);

        let mut built = Map::new();
        built.insert("bundle_key".to_string(), json!(bundle.key));
        built.insert("bundle_digest".to_string(), json!(bundle.digest));
        built.insert(
            "rendered_files".to_string(),
            json!(files.keys().collect::<Vec<_>>()),
        );
        built.insert("built_at".to_string(), json!(now_utc()));
        let done = self.runs.transition(
            run_id,
            Some(RunState::Building),
            RunState::Built,
            None,
            built,
            now_utc(),
        )?;
        self.log_transition(done.from, &done.record);
        Ok(done.record.view())
    }

    pub fn run_plan(&self, run_id: &str) -> Result<RunView, OrchestratorError> {
        let record = self.runs.load(run_id)?;
        if !matches!(record.state, RunState::Built | RunState::Submitted) {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                operation: "plan",
                actual: record.state,
                expected: "built or submitted",
            });
        }

        let mut started = Map::new();
        started.insert("plan_started_at".to_string(), json!(now_utc()));
        started.insert("error".to_string(), Value::Null);
        started.insert("error_kind".to_string(), Value::Null);
        let (lease, record) = self.enter_exclusive(&record, RunState::Planning, started)?;

        let session = match self.open_check(&record, &self.config.plan_check_name) {
            Ok(session) => session,
            Err(err) => return Err(self.record_failure(&record, RunState::PlanFailed, err, None)),
        };

        let result = lease
            .hold_while(|| self.execute_plan(&record))
            .and_then(|outcome| {
                let mut metadata = Map::new();
                metadata.insert("plan_reference".to_string(), json!(outcome.backend_run_id));
                metadata.insert("plan_status".to_string(), json!(outcome.status.as_str()));
                metadata.insert("plan_finished_at".to_string(), json!(now_utc()));
                let done = self.runs.transition(
                    run_id,
                    Some(RunState::Planning),
                    RunState::Planned,
                    None,
                    metadata,
                    now_utc(),
                )?;
                Ok((outcome, done))
            });

        let view = match result {
            Ok((outcome, done)) => {
                self.log_transition(done.from, &done.record);
                session.conclude(
                    CheckConclusion::Success,
                    "Plan succeeded",
                    &stage_summary(&outcome),
                );
                done.record.view()
            }
            Err(err) => {
                return Err(self.record_failure(&record, RunState::PlanFailed, err, Some(session)))
            }
        };
        drop(lease);
        Ok(view)
    }

    pub fn run_apply(&self, run_id: &str) -> Result<RunView, OrchestratorError> {
        let record = self.runs.load(run_id)?;
        if record.state != RunState::Planned {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                operation: "apply",
                actual: record.state,
                expected: "planned",
            });
        }
        let approval_required = record
            .blueprint
            .as_ref()
            .is_some_and(|blueprint| blueprint.metadata.approval_required);
        if approval_required && !record.metadata.get("approval").is_some_and(Value::is_object) {
            return Err(OrchestratorError::ApprovalRequired {
                run_id: run_id.to_string(),
            });
        }

        let mut started = Map::new();
        started.insert("apply_started_at".to_string(), json!(now_utc()));
        started.insert("error".to_string(), Value::Null);
        started.insert("error_kind".to_string(), Value::Null);
        let (lease, record) = self.enter_exclusive(&record, RunState::Applying, started)?;

        let session = match self.open_check(&record, &self.config.apply_check_name) {
            Ok(session) => session,
            Err(err) => return Err(self.record_failure(&record, RunState::ApplyFailed, err, None)),
        };

        let result = lease
            .hold_while(|| self.execute_apply(&record))
            .and_then(|outcome| {
                let mut metadata = Map::new();
                metadata.insert("apply_reference".to_string(), json!(outcome.backend_run_id));
                metadata.insert("apply_status".to_string(), json!(outcome.status.as_str()));
                metadata.insert("applied_at".to_string(), json!(now_utc()));
                let done = self.runs.transition(
                    run_id,
                    Some(RunState::Applying),
                    RunState::Applied,
                    None,
                    metadata,
                    now_utc(),
                )?;
                Ok((outcome, done))
            });

        let view = match result {
            Ok((outcome, done)) => {
                self.log_transition(done.from, &done.record);
                session.conclude(
                    CheckConclusion::Success,
                    "Apply succeeded",
                    &stage_summary(&outcome),
                );
                done.record.view()
            }
            Err(err) => {
                return Err(self.record_failure(&record, RunState::ApplyFailed, err, Some(session)))
            }
        };
        drop(lease);
        Ok(view)
    }

    /// Records an approval. Accepted in any non-terminal state.
    pub fn approve(&self, run_id: &str, change_record: Option<&str>) -> Result<RunView, OrchestratorError> {
        let record = self.runs.load(run_id)?;
        if record.state.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.to_string(),
                operation: "approve",
                actual: record.state,
                expected: "a non-terminal state",
            });
        }
        let now = now_utc();
        let mut metadata = Map::new();
        metadata.insert(
            "approval".to_string(),
            json!({"approved_at": now, "change_record": change_record}),
        );
        let record = self.runs.merge_metadata(run_id, metadata, now)?;
        self.log.run_event(
            run_id,
            LogLevel::Info,
            "run.approved",
            json!({"change_record": change_record}),
        );
        Ok(record.view())
    }

    /// Marks the run cancelled. An in-flight plan or apply is not interrupted
    /// and keeps the workspace until its backend calls return; its outcome is
    /// then discarded. A lock with no live operation behind it expires.
    pub fn cancel(&self, run_id: &str) -> Result<RunView, OrchestratorError> {
        let mut metadata = Map::new();
        metadata.insert("cancelled_at".to_string(), json!(now_utc()));
        let done = self.runs.transition(
            run_id,
            None,
            RunState::Cancelled,
            None,
            metadata,
            now_utc(),
        )?;
        self.log_transition(done.from, &done.record);
        Ok(done.record.view())
    }

    pub fn status(&self, run_id: &str) -> Result<RunView, OrchestratorError> {
        Ok(self.runs.load(run_id)?.view())
    }

    pub fn runs(&self, workspace: Option<&str>) -> Result<Vec<RunView>, OrchestratorError> {
        let records = match workspace {
            Some(workspace) => self.runs.runs_for_workspace(workspace)?,
            None => self.runs.all_runs()?,
        };
        Ok(records.iter().map(RunRecord::view).collect())
    }

    pub fn runs_in_state(&self, state: RunState) -> Result<Vec<RunView>, OrchestratorError> {
        let mut records: Vec<RunRecord> = self
            .runs
            .all_runs()?
            .into_iter()
            .filter(|record| record.state == state)
            .collect();
        records.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(records.iter().map(RunRecord::view).collect())
    }

    pub fn summary(&self) -> Result<RunSummary, OrchestratorError> {
        let mut records = self.runs.all_runs()?;
        let mut by_state = BTreeMap::new();
        for record in &records {
            *by_state.entry(record.state.to_string()).or_insert(0) += 1;
        }
        let failed_runs = records
            .iter()
            .filter(|record| matches!(record.state, RunState::PlanFailed | RunState::ApplyFailed))
            .count();
        let awaiting_approval = records
            .iter()
            .filter(|record| {
                record.state == RunState::Planned
                    && record
                        .blueprint
                        .as_ref()
                        .is_some_and(|blueprint| blueprint.metadata.approval_required)
                    && !record.metadata.get("approval").is_some_and(Value::is_object)
            })
            .count();
        let approval_required = records
            .iter()
            .filter(|record| {
                record
                    .blueprint
                    .as_ref()
                    .is_some_and(|blueprint| blueprint.metadata.approval_required)
            })
            .count();
        let plan_seconds: Vec<f64> = records.iter().filter_map(plan_seconds).collect();
        let average_plan_seconds = (!plan_seconds.is_empty()).then(|| {
            let mean = plan_seconds.iter().sum::<f64>() / plan_seconds.len() as f64;
            (mean * 10.0).round() / 10.0
        });
        records.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(RunSummary {
            total_runs: records.len(),
            by_state,
            failed_runs,
            awaiting_approval,
            approval_required,
            auto_approved: records.len() - approval_required,
            average_plan_seconds,
            active_locks: self.locks.live_locks(now_utc())?,
            recent_runs: records.iter().take(RECENT_RUNS).map(RunRecord::view).collect(),
        })
    }

    pub fn lock_status(&self, workspace: &str) -> Result<Option<WorkspaceLock>, OrchestratorError> {
        Ok(self.locks.current(workspace, now_utc())?)
    }

    /// Owner-checked manual release; a no-op when `run_id` does not hold it.
    pub fn release_lock(&self, workspace: &str, run_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.locks.release(workspace, run_id)?)
    }

    /// Loads runs written in the legacy file-per-run layout. Existing runs
    /// are left alone.
    pub fn import_legacy(&self, dir: &Path) -> Result<ImportReport, OrchestratorError> {
        import_legacy_dir(&self.runs, dir, &self.log)
    }

    pub fn events(&self, run_id: &str) -> Result<Vec<Value>, OrchestratorError> {
        self.runs.load(run_id)?;
        Ok(self.log.read_run_events(run_id))
    }

    fn enter_exclusive(
        &self,
        record: &RunRecord,
        target: RunState,
        metadata: Map<String, Value>,
    ) -> Result<(WorkspaceLease<'_>, RunRecord), OrchestratorError> {
        let workspace = match &record.workspace {
            Some(workspace) => workspace.clone(),
            None => record
                .blueprint
                .as_ref()
                .map(|blueprint| blueprint.workspace_for(&record.run_id))
                .unwrap_or_else(|| record.run_id.clone()),
        };
        let now = now_utc();
        let lease = match self
            .locks
            .acquire_lease(&workspace, &record.run_id, self.config.lock_ttl, now)?
        {
            LeaseOutcome::Held(lease) => lease,
            LeaseOutcome::Busy(holder) => return Err(busy(holder)),
        };
        let done = self.runs.transition(
            &record.run_id,
            Some(record.state),
            target,
            Some(&workspace),
            metadata,
            now,
        )?;
        self.log_transition(done.from, &done.record);
        Ok((lease, done.record))
    }

    fn open_check(&self, record: &RunRecord, name: &str) -> Result<CheckSession, OrchestratorError> {
        let external_id = record.metadata_str("external_id").or_else(|| {
            record
                .blueprint
                .as_ref()
                .and_then(|blueprint| blueprint.metadata.external_id.as_deref())
        });
        Ok(CheckSession::open(
            self.collaborators.checks.clone(),
            external_id,
            name,
            &record.run_id,
            self.log.clone(),
        )?)
    }

    fn execute_plan(&self, record: &RunRecord) -> Result<StageOutcome, OrchestratorError> {
        let run_id = record.run_id.as_str();
        let bundle_key = record
            .metadata_str("bundle_key")
            .ok_or_else(|| OrchestratorError::MissingBundle {
                run_id: run_id.to_string(),
            })?;
        let bundle = self.collaborators.bundles.get(bundle_key)?;
        let workspace_id = self.resolve_workspace(record)?;
        let backend = self.collaborators.backend.as_ref();
        let launched = launch_run(
            backend,
            &workspace_id,
            &bundle,
            &RunOptions {
                auto_apply: false,
                message: format!("stackrun plan for {run_id}"),
            },
            self.config.still_processing,
        )
        .map_err(|err| OrchestratorError::backend("plan launch", err))?;
        self.log.run_event(
            run_id,
            LogLevel::Info,
            "backend.run_created",
            json!({
                "stage": "plan",
                "backend_run_id": launched.run_id,
                "config_version_id": launched.config_version_id,
            }),
        );

        let mut metadata = Map::new();
        metadata.insert("workspace_id".to_string(), json!(workspace_id));
        metadata.insert("backend_run_id".to_string(), json!(launched.run_id));
        metadata.insert("config_version_id".to_string(), json!(launched.config_version_id));
        self.runs.merge_metadata(run_id, metadata, now_utc())?;

        self.await_stage(run_id, &launched.run_id, RunStage::Plan)
    }

    fn execute_apply(&self, record: &RunRecord) -> Result<StageOutcome, OrchestratorError> {
        let run_id = record.run_id.as_str();
        let backend = self.collaborators.backend.as_ref();
        let comment = format!("stackrun apply for {run_id}");

        let confirmed = match record.metadata_str("plan_reference") {
            Some(plan_ref) => {
                let status = backend
                    .run_status(plan_ref)
                    .map_err(|err| OrchestratorError::backend("plan status", err))?;
                if status.awaits_confirmation() {
                    backend
                        .apply(plan_ref, &comment)
                        .map_err(|err| OrchestratorError::backend("apply", err))?;
                    Some(plan_ref.to_string())
                } else if status.is_success(RunStage::Apply) {
                    Some(plan_ref.to_string())
                } else {
                    None
                }
            }
            None => None,
        };

        let backend_run_id = match confirmed {
            Some(backend_run_id) => backend_run_id,
            None => {
                let bundle_key = record.metadata_str("bundle_key").ok_or_else(|| {
                    OrchestratorError::MissingBundle {
                        run_id: run_id.to_string(),
                    }
                })?;
                let bundle = self.collaborators.bundles.get(bundle_key)?;
                let workspace_id = self.resolve_workspace(record)?;
                let launched = launch_run(
                    backend,
                    &workspace_id,
                    &bundle,
                    &RunOptions {
                        auto_apply: true,
                        message: comment,
                    },
                    self.config.still_processing,
                )
                .map_err(|err| OrchestratorError::backend("apply launch", err))?;
                launched.run_id
            }
        };
        self.log.run_event(
            run_id,
            LogLevel::Info,
            "backend.apply_started",
            json!({"backend_run_id": backend_run_id}),
        );
        let mut metadata = Map::new();
        metadata.insert("apply_run_id".to_string(), json!(backend_run_id));
        self.runs.merge_metadata(run_id, metadata, now_utc())?;

        self.await_stage(run_id, &backend_run_id, RunStage::Apply)
    }

    fn await_stage(
        &self,
        run_id: &str,
        backend_run_id: &str,
        stage: RunStage,
    ) -> Result<StageOutcome, OrchestratorError> {
        let backend = self.collaborators.backend.as_ref();
        let status = backend
            .wait_for_completion(backend_run_id, stage)
            .map_err(|err| OrchestratorError::backend("wait for completion", err))?;
        self.log.run_event(
            run_id,
            LogLevel::Info,
            "backend.run_settled",
            json!({
                "stage": stage.as_str(),
                "backend_run_id": backend_run_id,
                "status": status.as_str(),
            }),
        );
        if !status.is_success(stage) {
            return Err(OrchestratorError::BackendRunFailed {
                backend_run_id: backend_run_id.to_string(),
                status: status.to_string(),
            });
        }
        let output = match stage {
            RunStage::Plan => backend.plan_output(backend_run_id),
            RunStage::Apply => backend.apply_output(backend_run_id),
        }
        .unwrap_or_else(|err| {
            self.log.run_event(
                run_id,
                LogLevel::Warn,
                "backend.output_unavailable",
                json!({"stage": stage.as_str(), "error": err.to_string()}),
            );
            String::new()
        });
        Ok(StageOutcome {
            backend_run_id: backend_run_id.to_string(),
            status,
            output,
        })
    }

    fn resolve_workspace(&self, record: &RunRecord) -> Result<String, OrchestratorError> {
        let workspace = record.workspace.as_deref().unwrap_or(record.run_id.as_str());
        self.collaborators
            .backend
            .resolve_workspace(workspace)
            .map_err(|err| {
                if err.is_not_found() {
                    OrchestratorError::WorkspaceNotFound {
                        workspace: workspace.to_string(),
                    }
                } else {
                    OrchestratorError::backend("resolve workspace", err)
                }
            })
    }

    /// Writes the failure into the run and the review check, then hands the
    /// error back for the caller to surface.
    fn record_failure(
        &self,
        record: &RunRecord,
        failed: RunState,
        err: OrchestratorError,
        session: Option<CheckSession>,
    ) -> OrchestratorError {
        let run_id = record.run_id.as_str();
        let message = self.redacted(&err);
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), json!(message));
        metadata.insert("error_kind".to_string(), json!(err.kind().as_str()));
        metadata.insert("failed_at".to_string(), json!(now_utc()));

        let conclusion = match self.runs.transition(
            run_id,
            Some(record.state),
            failed,
            None,
            metadata,
            now_utc(),
        ) {
            Ok(done) => {
                self.log_transition(done.from, &done.record);
                CheckConclusion::Failure
            }
            Err(OrchestratorError::Cancelled { .. }) => CheckConclusion::Cancelled,
            Err(record_err) => {
                self.log.run_event(
                    run_id,
                    LogLevel::Error,
                    "run.failure_not_recorded",
                    json!({"error": self.redacted(&record_err)}),
                );
                CheckConclusion::Failure
            }
        };
        self.log.run_event(
            run_id,
            LogLevel::Error,
            "run.failed",
            json!({"state": failed.as_str(), "error": message, "error_kind": err.kind().as_str()}),
        );

        if let Some(session) = session {
            let title = match (conclusion, failed) {
                (CheckConclusion::Cancelled, _) => "Run cancelled",
                (_, RunState::PlanFailed) => "Plan failed",
                _ => "Apply failed",
            };
            session.conclude(conclusion, title, &message);
        }
        err
    }

    fn release_quietly(&self, workspace: &str, run_id: &str) {
        if let Err(err) = self.locks.release(workspace, run_id) {
            self.log.run_event(
                run_id,
                LogLevel::Error,
                "lock.release_failed",
                json!({"workspace": workspace, "error": err.to_string()}),
            );
        }
    }

    fn log_transition(&self, from: RunState, record: &RunRecord) {
        self.log.run_event(
            &record.run_id,
            LogLevel::Info,
            "state.changed",
            json!({
                "from": from.as_str(),
                "to": record.state.as_str(),
                "workspace": record.workspace,
            }),
        );
    }

    fn redacted(&self, err: &OrchestratorError) -> String {
        self.log.redactor().redact(&err.to_string())
    }
}

fn busy(holder: WorkspaceLock) -> OrchestratorError {
    OrchestratorError::WorkspaceBusy {
        workspace: holder.workspace,
        locked_by: holder.locked_by,
    }
}

/// Imported records only carry `apply_started_at`, which then stands in for the plan end.
fn plan_seconds(record: &RunRecord) -> Option<f64> {
    let at = |key: &str| {
        record
            .metadata
            .get(key)
            .cloned()
            .and_then(|value| serde_json::from_value::<DateTime<Utc>>(value).ok())
    };
    let started = at("plan_started_at")?;
    let finished = at("plan_finished_at").or_else(|| at("apply_started_at"))?;
    let millis = (finished - started).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}

fn stage_summary(outcome: &StageOutcome) -> String {
    let mut summary = format!(
        "Backend run `{}` finished with status `{}`.",
        outcome.backend_run_id, outcome.status
    );
    if !outcome.output.trim().is_empty() {
        summary.push_str("\n\n```\n");
        summary.push_str(&outcome.output);
        summary.push_str("\n```");
    }
    summary
}
