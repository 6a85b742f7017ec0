use crate::blueprint::Blueprint;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::state_machine::RunState;
use crate::storage::{Entry, KvStore, NewEntry, PutCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

const TRANSITION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub blueprint: Option<Blueprint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store version the record was read at; used for compare-and-swap.
    #[serde(skip)]
    pub version: u64,
}

/// Read-only projection handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: String,
    pub state: RunState,
    pub workspace: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<String>,
        workspace: Option<String>,
        blueprint: Option<Blueprint>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Submitted,
            workspace,
            metadata: Map::new(),
            blueprint,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn view(&self) -> RunView {
        RunView {
            run_id: self.run_id.clone(),
            state: self.state,
            workspace: self.workspace.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    fn from_entry(entry: Entry) -> Result<Self, OrchestratorError> {
        let mut record: RunRecord =
            serde_json::from_value(entry.body).map_err(|err| OrchestratorError::CorruptRecord {
                key: entry.key.clone(),
                reason: err.to_string(),
            })?;
        if record.run_id != entry.key {
            return Err(OrchestratorError::CorruptRecord {
                key: entry.key,
                reason: format!("record names run `{}`", record.run_id),
            });
        }
        record.version = entry.version;
        Ok(record)
    }

    fn to_entry(&self) -> Result<NewEntry, OrchestratorError> {
        let body = serde_json::to_value(self).map_err(|err| OrchestratorError::CorruptRecord {
            key: self.run_id.clone(),
            reason: err.to_string(),
        })?;
        Ok(NewEntry::new(self.run_id.clone(), body).with_index(self.workspace.clone()))
    }
}

/// Outcome of a committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: RunState,
    pub record: RunRecord,
}

/// Run records keyed by run id and indexed by workspace.
#[derive(Clone)]
pub struct RunStore {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore").finish_non_exhaustive()
    }
}

impl RunStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn create(&self, record: &RunRecord) -> Result<RunRecord, OrchestratorError> {
        match self.store.put(record.to_entry()?, PutCondition::Absent) {
            Ok(entry) => Ok(RunRecord {
                version: entry.version,
                ..record.clone()
            }),
            Err(err) if err.is_condition_failed() => Err(OrchestratorError::RunExists {
                run_id: record.run_id.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub fn find(&self, run_id: &str) -> Result<Option<RunRecord>, OrchestratorError> {
        self.store
            .get(run_id)?
            .map(RunRecord::from_entry)
            .transpose()
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        self.find(run_id)?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn runs_for_workspace(&self, workspace: &str) -> Result<Vec<RunRecord>, OrchestratorError> {
        self.store
            .query_index(workspace)?
            .into_iter()
            .map(RunRecord::from_entry)
            .collect()
    }

    pub fn all_runs(&self) -> Result<Vec<RunRecord>, OrchestratorError> {
        self.store
            .scan()?
            .into_iter()
            .map(RunRecord::from_entry)
            .collect()
    }

    /// Overlays `metadata` onto the record without touching its state.
    pub fn merge_metadata(
        &self,
        run_id: &str,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord, OrchestratorError> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let mut record = self.load(run_id)?;
            record.metadata.extend(metadata.clone());
            record.updated_at = now;
            match self
                .store
                .put(record.to_entry()?, PutCondition::Version(record.version))
            {
                Ok(entry) => {
                    record.version = entry.version;
                    return Ok(record);
                }
                Err(err) if err.is_condition_failed() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(OrchestratorError::ConcurrentModification {
            run_id: run_id.to_string(),
            attempts: TRANSITION_ATTEMPTS,
        })
    }

    /// Moves a run to `target` with a compare-and-swap on the record version.
    ///
    /// When `expected` is set, the run must still be in that state at write
    /// time. A run found `Cancelled` in the meantime yields
    /// [`OrchestratorError::Cancelled`] so stale outcomes never overwrite a
    /// cancellation.
    pub fn transition(
        &self,
        run_id: &str,
        expected: Option<RunState>,
        target: RunState,
        workspace: Option<&str>,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Transition, OrchestratorError> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let mut record = self.load(run_id)?;
            let from = record.state;
            if let Some(expected) = expected {
                if from != expected {
                    if from == RunState::Cancelled && target != RunState::Cancelled {
                        return Err(OrchestratorError::Cancelled {
                            run_id: run_id.to_string(),
                        });
                    }
                    return Err(OrchestratorError::InvalidTransition {
                        run_id: run_id.to_string(),
                        from,
                        to: target,
                    });
                }
            }
            if !from.can_transition_to(target) {
                if from == RunState::Cancelled && target != RunState::Cancelled {
                    return Err(OrchestratorError::Cancelled {
                        run_id: run_id.to_string(),
                    });
                }
                return Err(OrchestratorError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from,
                    to: target,
                });
            }

            record.state = target;
            record.updated_at = now;
            if let Some(workspace) = workspace {
                record.workspace = Some(workspace.to_string());
            }
            record.metadata.extend(metadata.clone());

            match self
                .store
                .put(record.to_entry()?, PutCondition::Version(record.version))
            {
                Ok(entry) => {
                    record.version = entry.version;
                    return Ok(Transition { from, record });
                }
                Err(err) if err.is_condition_failed() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(OrchestratorError::ConcurrentModification {
            run_id: run_id.to_string(),
            attempts: TRANSITION_ATTEMPTS,
        })
    }
}
