pub mod checks;
pub mod error;
pub mod legacy;
pub mod lock_store;
pub mod orchestrator;
pub mod run_store;
pub mod state_machine;

pub use error::{ErrorKind, OrchestratorError};
pub use legacy::{ImportReport, LegacyRunFile};
pub use lock_store::{
    AcquireOutcome, LeaseOutcome, LockStore, WorkspaceLease, WorkspaceLock, DEFAULT_LOCK_TTL,
};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, RunSummary};
pub use run_store::{RunRecord, RunStore, RunView};
pub use state_machine::RunState;
