use crate::backend::BackendError;
use crate::blueprint::RenderError;
use crate::bundle::BundleError;
use crate::orchestration::state_machine::RunState;
use crate::review::ReviewError;
use crate::storage::StoreError;

/// Coarse classification callers branch on. Each kind has a fixed
/// HTTP-equivalent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTransition,
    WorkspaceBusy,
    BackendError,
    BackendUnavailable,
    NotFound,
    ApprovalRequired,
    Cancelled,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTransition => "invalid_transition",
            Self::WorkspaceBusy => "workspace_busy",
            Self::BackendError => "backend_error",
            Self::BackendUnavailable => "backend_unavailable",
            Self::NotFound => "not_found",
            Self::ApprovalRequired => "approval_required",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidTransition | Self::InvalidInput => 422,
            Self::WorkspaceBusy | Self::Cancelled => 409,
            Self::BackendError => 502,
            Self::BackendUnavailable => 503,
            Self::NotFound => 404,
            Self::ApprovalRequired => 403,
            Self::Internal => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::WorkspaceBusy | Self::BackendUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run `{run_id}` cannot move from `{from}` to `{to}`")]
    InvalidTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },
    #[error("cannot {operation} run `{run_id}` in state `{actual}`; expected {expected}")]
    InvalidState {
        run_id: String,
        operation: &'static str,
        actual: RunState,
        expected: &'static str,
    },
    #[error("workspace `{workspace}` is busy; locked by run `{locked_by}`")]
    WorkspaceBusy { workspace: String, locked_by: String },
    #[error("run `{run_id}` not found")]
    RunNotFound { run_id: String },
    #[error("workspace `{workspace}` not found in the backend")]
    WorkspaceNotFound { workspace: String },
    #[error("run `{run_id}` already exists")]
    RunExists { run_id: String },
    #[error("run `{run_id}` has no deployment bundle; build it first")]
    MissingBundle { run_id: String },
    #[error("run `{run_id}` requires approval before apply")]
    ApprovalRequired { run_id: String },
    #[error("run `{run_id}` was cancelled")]
    Cancelled { run_id: String },
    #[error("run `{run_id}` kept changing underneath the orchestrator; giving up after {attempts} attempts")]
    ConcurrentModification { run_id: String, attempts: u32 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to allocate a run id: {0}")]
    IdAllocation(String),
    #[error("backend {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("backend run `{backend_run_id}` finished with status `{status}`")]
    BackendRunFailed {
        backend_run_id: String,
        status: String,
    },
    #[error("review check failed: {source}")]
    Review {
        #[source]
        source: ReviewError,
    },
    #[error("bundle storage failed: {source}")]
    Bundle {
        #[source]
        source: BundleError,
    },
    #[error("blueprint render failed: {source}")]
    Render {
        #[source]
        source: RenderError,
    },
    #[error("run state store failed: {source}")]
    Store {
        #[source]
        source: StoreError,
    },
    #[error("stored record `{key}` is corrupt: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("failed to read legacy record {path}: {reason}")]
    LegacyRecord { path: String, reason: String },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } | Self::InvalidState { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::WorkspaceBusy { .. } => ErrorKind::WorkspaceBusy,
            Self::RunNotFound { .. } | Self::WorkspaceNotFound { .. } | Self::MissingBundle { .. } => {
                ErrorKind::NotFound
            }
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::RunExists { .. } | Self::InvalidInput(_) | Self::LegacyRecord { .. } => {
                ErrorKind::InvalidInput
            }
            Self::Render { source } => match source {
                RenderError::Encode { .. } => ErrorKind::Internal,
                _ => ErrorKind::InvalidInput,
            },
            Self::Backend { source, .. } if source.is_unavailable() => {
                ErrorKind::BackendUnavailable
            }
            Self::Backend { .. } | Self::BackendRunFailed { .. } => ErrorKind::BackendError,
            Self::Review { source } => match source {
                ReviewError::InvalidTarget { .. } | ReviewError::InvalidSha { .. } => {
                    ErrorKind::InvalidInput
                }
                ReviewError::Unavailable { .. } => ErrorKind::BackendUnavailable,
                _ => ErrorKind::BackendError,
            },
            Self::Bundle { source } => match source {
                BundleError::NotFound { .. } => ErrorKind::NotFound,
                BundleError::InvalidKey { .. } | BundleError::Empty { .. } => {
                    ErrorKind::InvalidInput
                }
                _ => ErrorKind::Internal,
            },
            Self::Store { .. }
            | Self::CorruptRecord { .. }
            | Self::ConcurrentModification { .. }
            | Self::IdAllocation(_) => ErrorKind::Internal,
        }
    }

    pub fn backend(operation: &'static str, source: BackendError) -> Self {
        Self::Backend { operation, source }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl From<BundleError> for OrchestratorError {
    fn from(source: BundleError) -> Self {
        Self::Bundle { source }
    }
}

impl From<RenderError> for OrchestratorError {
    fn from(source: RenderError) -> Self {
        Self::Render { source }
    }
}

impl From<ReviewError> for OrchestratorError {
    fn from(source: ReviewError) -> Self {
        Self::Review { source }
    }
}
