//! Remote plan/apply execution backend.
//!
//! The orchestrator only sees the [`PlanBackend`] trait. [`TfeClient`] speaks
//! the Terraform Enterprise / HCP Terraform JSON:API; tests supply fakes.

use crate::shared::retry::{poll_until, retry_with, PollPolicy, RetryPolicy};
use std::time::Duration;

pub mod tfe;

pub use tfe::{TfeClient, TfeClientOptions};

pub const DEFAULT_RUN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigVersion {
    pub id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigVersionStatus {
    Pending,
    Uploaded,
    Errored(String),
}

impl ConfigVersionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "uploaded" => Self::Uploaded,
            "pending" | "fetching" | "archived_pending" => Self::Pending,
            other => Self::Errored(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub auto_apply: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Plan,
    Apply,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    CostEstimating,
    CostEstimated,
    PolicyChecking,
    PolicyOverride,
    PolicyChecked,
    Confirmed,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Discarded,
    Errored,
    Canceled,
    ForceCanceled,
    Other(String),
}

impl BackendRunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "plan_queued" => Self::PlanQueued,
            "planning" => Self::Planning,
            "planned" => Self::Planned,
            "cost_estimating" => Self::CostEstimating,
            "cost_estimated" => Self::CostEstimated,
            "policy_checking" => Self::PolicyChecking,
            "policy_override" => Self::PolicyOverride,
            "policy_checked" => Self::PolicyChecked,
            "confirmed" => Self::Confirmed,
            "planned_and_finished" => Self::PlannedAndFinished,
            "apply_queued" => Self::ApplyQueued,
            "applying" => Self::Applying,
            "applied" => Self::Applied,
            "discarded" => Self::Discarded,
            "errored" => Self::Errored,
            "canceled" => Self::Canceled,
            "force_canceled" => Self::ForceCanceled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::PlanQueued => "plan_queued",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::CostEstimating => "cost_estimating",
            Self::CostEstimated => "cost_estimated",
            Self::PolicyChecking => "policy_checking",
            Self::PolicyOverride => "policy_override",
            Self::PolicyChecked => "policy_checked",
            Self::Confirmed => "confirmed",
            Self::PlannedAndFinished => "planned_and_finished",
            Self::ApplyQueued => "apply_queued",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Discarded => "discarded",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
            Self::ForceCanceled => "force_canceled",
            Self::Other(value) => value,
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Errored | Self::Canceled | Self::ForceCanceled | Self::Discarded
        )
    }

    /// A plan that finished and is waiting for someone to confirm the apply.
    pub fn awaits_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Planned | Self::CostEstimated | Self::PolicyChecked
        )
    }

    pub fn is_settled(&self, stage: RunStage) -> bool {
        self.is_success(stage) || self.is_failure()
    }

    pub fn is_success(&self, stage: RunStage) -> bool {
        match stage {
            RunStage::Plan => self.awaits_confirmation() || *self == Self::PlannedAndFinished,
            RunStage::Apply => matches!(self, Self::Applied | Self::PlannedAndFinished),
        }
    }
}

impl std::fmt::Display for BackendRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("configuration version is still being processed: {message}")]
    StillProcessing { message: String },
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
    #[error("configuration version `{id}` failed processing with status `{status}`")]
    ConfigVersionFailed { id: String, status: String },
    #[error("backend client misconfigured: {0}")]
    Configuration(String),
    #[error("backend not configured: {reason}")]
    NotConfigured { reason: String },
}

impl BackendError {
    /// The backend could not be reached, as opposed to it rejecting a
    /// request. A process without backend credentials counts as unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::NotConfigured { .. }
        )
    }

    pub fn is_still_processing(&self) -> bool {
        matches!(self, Self::StillProcessing { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub trait PlanBackend: Send + Sync {
    fn resolve_workspace(&self, name: &str) -> Result<String, BackendError>;

    fn create_config_version(&self, workspace_id: &str) -> Result<ConfigVersion, BackendError>;

    fn upload(&self, upload_url: &str, bundle: &[u8]) -> Result<(), BackendError>;

    fn config_version_status(&self, config_version_id: &str) -> Result<ConfigVersionStatus, BackendError>;

    fn create_run(
        &self,
        workspace_id: &str,
        config_version_id: &str,
        options: &RunOptions,
    ) -> Result<String, BackendError>;

    fn run_status(&self, run_id: &str) -> Result<BackendRunStatus, BackendError>;

    fn plan_output(&self, run_id: &str) -> Result<String, BackendError>;

    fn apply_output(&self, run_id: &str) -> Result<String, BackendError>;

    /// Confirms a planned run so the backend applies it.
    fn apply(&self, run_id: &str, comment: &str) -> Result<(), BackendError>;

    fn config_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(DEFAULT_CONFIG_POLL_INTERVAL, DEFAULT_CONFIG_TIMEOUT)
    }

    fn run_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(DEFAULT_RUN_POLL_INTERVAL, DEFAULT_RUN_TIMEOUT)
    }

    fn wait_for_configuration(&self, config_version_id: &str) -> Result<(), BackendError> {
        poll_until(
            self.config_poll_policy(),
            || match self.config_version_status(config_version_id)? {
                ConfigVersionStatus::Uploaded => Ok(Some(())),
                ConfigVersionStatus::Pending => Ok(None),
                ConfigVersionStatus::Errored(status) => Err(BackendError::ConfigVersionFailed {
                    id: config_version_id.to_string(),
                    status,
                }),
            },
            |waited, _| BackendError::Timeout {
                what: format!("configuration version {config_version_id}"),
                waited_secs: waited.as_secs(),
            },
        )
    }

    fn wait_for_completion(&self, run_id: &str, stage: RunStage) -> Result<BackendRunStatus, BackendError> {
        poll_until(
            self.run_poll_policy(),
            || {
                let status = self.run_status(run_id)?;
                Ok(status.is_settled(stage).then_some(status))
            },
            |waited, _| BackendError::Timeout {
                what: format!("{} of run {run_id}", stage.as_str()),
                waited_secs: waited.as_secs(),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedRun {
    pub workspace_id: String,
    pub config_version_id: String,
    pub run_id: String,
}

/// The create-run-from-config sequence: config version, upload, wait for
/// processing, then create the run. Only the "still processing" rejection of
/// `create_run` is retried here.
pub fn launch_run(
    backend: &dyn PlanBackend,
    workspace_id: &str,
    bundle: &[u8],
    options: &RunOptions,
    still_processing: RetryPolicy,
) -> Result<LaunchedRun, BackendError> {
    let version = backend.create_config_version(workspace_id)?;
    backend.upload(&version.upload_url, bundle)?;
    backend.wait_for_configuration(&version.id)?;
    let run_id = retry_with(still_processing, BackendError::is_still_processing, |_| {
        backend.create_run(workspace_id, &version.id, options)
    })?;
    Ok(LaunchedRun {
        workspace_id: workspace_id.to_string(),
        config_version_id: version.id,
        run_id,
    })
}

/// Stand-in used when no backend credentials are available. Read-only
/// commands keep working; any backend call fails with the stored reason.
#[derive(Debug, Clone)]
pub struct UnconfiguredBackend {
    reason: String,
}

impl UnconfiguredBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T, BackendError> {
        Err(BackendError::NotConfigured {
            reason: self.reason.clone(),
        })
    }
}

impl PlanBackend for UnconfiguredBackend {
    fn resolve_workspace(&self, _name: &str) -> Result<String, BackendError> {
        self.fail()
    }

    fn create_config_version(&self, _workspace_id: &str) -> Result<ConfigVersion, BackendError> {
        self.fail()
    }

    fn upload(&self, _upload_url: &str, _bundle: &[u8]) -> Result<(), BackendError> {
        self.fail()
    }

    fn config_version_status(&self, _config_version_id: &str) -> Result<ConfigVersionStatus, BackendError> {
        self.fail()
    }

    fn create_run(
        &self,
        _workspace_id: &str,
        _config_version_id: &str,
        _options: &RunOptions,
    ) -> Result<String, BackendError> {
        self.fail()
    }

    fn run_status(&self, _run_id: &str) -> Result<BackendRunStatus, BackendError> {
        self.fail()
    }

    fn plan_output(&self, _run_id: &str) -> Result<String, BackendError> {
        self.fail()
    }

    fn apply_output(&self, _run_id: &str) -> Result<String, BackendError> {
        self.fail()
    }

    fn apply(&self, _run_id: &str, _comment: &str) -> Result<(), BackendError> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_stage_settles_at_confirmation_or_failure() {
        for raw in ["planned", "cost_estimated", "policy_checked", "planned_and_finished"] {
            let status = BackendRunStatus::parse(raw);
            assert!(status.is_settled(RunStage::Plan), "{raw}");
            assert!(status.is_success(RunStage::Plan), "{raw}");
        }
        for raw in ["errored", "canceled", "discarded"] {
            let status = BackendRunStatus::parse(raw);
            assert!(status.is_settled(RunStage::Plan), "{raw}");
            assert!(!status.is_success(RunStage::Plan), "{raw}");
        }
        assert!(!BackendRunStatus::parse("planning").is_settled(RunStage::Plan));
    }

    #[test]
    fn apply_stage_waits_past_planned() {
        assert!(!BackendRunStatus::Planned.is_settled(RunStage::Apply));
        assert!(!BackendRunStatus::Applying.is_settled(RunStage::Apply));
        assert!(BackendRunStatus::Applied.is_success(RunStage::Apply));
        assert!(BackendRunStatus::PlannedAndFinished.is_success(RunStage::Apply));
        assert!(BackendRunStatus::Errored.is_settled(RunStage::Apply));
        assert!(!BackendRunStatus::Errored.is_success(RunStage::Apply));
    }

    #[test]
    fn unknown_statuses_round_trip_as_other() {
        let status = BackendRunStatus::parse("fetching_completed");
        assert_eq!(status, BackendRunStatus::Other("fetching_completed".to_string()));
        assert_eq!(status.to_string(), "fetching_completed");
        assert!(!status.is_settled(RunStage::Apply));
    }

    #[test]
    fn unconfigured_backend_reports_its_reason() {
        let backend = UnconfiguredBackend::new("TFE_TOKEN is not set");
        let err = backend.resolve_workspace("ws-1").expect_err("unconfigured");
        assert_eq!(err.to_string(), "backend not configured: TFE_TOKEN is not set");
        assert!(err.is_unavailable());
    }

    #[test]
    fn config_version_statuses_parse() {
        assert_eq!(ConfigVersionStatus::parse("uploaded"), ConfigVersionStatus::Uploaded);
        assert_eq!(ConfigVersionStatus::parse("pending"), ConfigVersionStatus::Pending);
        assert_eq!(
            ConfigVersionStatus::parse("errored"),
            ConfigVersionStatus::Errored("errored".to_string())
        );
    }
}
