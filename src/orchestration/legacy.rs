//! Import of run files written by the earlier file-per-run layout.
//!
//! Each legacy file is a JSON object carrying `run_id`, a free-text `status`,
//! the submitted `blueprint`, and optional backend and approval fields.
//! Imported runs are indistinguishable from native ones through [`RunView`].

use crate::blueprint::Blueprint;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::run_store::{RunRecord, RunStore, RunView};
use crate::orchestration::state_machine::RunState;
use crate::shared::time::now_utc;
use crate::shared::{EventLog, LogLevel, RunId};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRunFile {
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: String,
    pub blueprint: Blueprint,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub tfe_run_id: Option<String>,
    #[serde(default)]
    pub approval: Option<Value>,
    #[serde(default)]
    pub plan_started: Option<String>,
    #[serde(default)]
    pub apply_started: Option<String>,
    #[serde(default)]
    pub applied_at: Option<String>,
    #[serde(default)]
    pub rendered_files: Option<Value>,
    #[serde(default)]
    pub sync_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// Runs that already exist in the store; never overwritten.
    pub skipped: Vec<String>,
    pub rejected: Vec<RejectedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub fn map_legacy_status(status: &str) -> Option<RunState> {
    let state = match status.trim().to_ascii_lowercase().as_str() {
        "submitted" => RunState::Submitted,
        "rendered" => RunState::Built,
        "plan_queued" | "planned" | "approved" => RunState::Planned,
        "apply_queued" | "applying" => RunState::Applying,
        "applied" => RunState::Applied,
        "apply_failed" => RunState::ApplyFailed,
        "plan_failed" => RunState::PlanFailed,
        "cancelled" | "canceled" => RunState::Cancelled,
        _ => return None,
    };
    Some(state)
}

/// Legacy timestamps are naive ISO-8601 in UTC; newer ones carry an offset.
fn parse_legacy_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

impl LegacyRunFile {
    pub fn read(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = fs::read_to_string(path).map_err(|err| OrchestratorError::LegacyRecord {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| OrchestratorError::LegacyRecord {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }

    /// Builds the native record. `fallback_id` is used when the file has no
    /// `run_id` field (the file stem in practice).
    pub fn to_record(&self, fallback_id: &str) -> Result<RunRecord, OrchestratorError> {
        let raw_id = self.run_id.as_deref().unwrap_or(fallback_id);
        let run_id = RunId::parse(raw_id).map_err(OrchestratorError::InvalidInput)?;
        let state = map_legacy_status(&self.status).ok_or_else(|| {
            OrchestratorError::InvalidInput(format!("unknown legacy status `{}`", self.status))
        })?;
        let created_at = self
            .timestamp
            .as_deref()
            .and_then(parse_legacy_time)
            .unwrap_or_else(now_utc);
        let updated_at = [&self.applied_at, &self.apply_started, &self.plan_started, &self.updated]
            .into_iter()
            .filter_map(|value| value.as_deref().and_then(parse_legacy_time))
            .max()
            .unwrap_or(created_at);

        let workspace = self.blueprint.workspace_for(run_id.as_str());
        let mut record = RunRecord::new(
            run_id.as_str(),
            Some(workspace),
            Some(self.blueprint.clone()),
            created_at,
        );
        record.state = state;
        record.updated_at = updated_at;
        record.metadata = self.metadata(created_at);
        Ok(record)
    }

    pub fn to_view(&self, fallback_id: &str) -> Result<RunView, OrchestratorError> {
        Ok(self.to_record(fallback_id)?.view())
    }

    fn metadata(&self, created_at: DateTime<Utc>) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("submitted_at".to_string(), json!(created_at));
        metadata.insert("kind".to_string(), json!(self.blueprint.kind));
        metadata.insert("legacy_status".to_string(), json!(self.status));
        if let Some(external_id) = &self.blueprint.metadata.external_id {
            metadata.insert("external_id".to_string(), json!(external_id));
        }
        if let Some(tfe_run_id) = self.tfe_run_id.as_deref().filter(|id| !id.is_empty()) {
            metadata.insert("backend_run_id".to_string(), json!(tfe_run_id));
            metadata.insert("plan_reference".to_string(), json!(tfe_run_id));
        }
        for (key, value) in [
            ("plan_started_at", &self.plan_started),
            ("apply_started_at", &self.apply_started),
            ("applied_at", &self.applied_at),
        ] {
            if let Some(at) = value.as_deref().and_then(parse_legacy_time) {
                metadata.insert(key.to_string(), json!(at));
            }
        }
        if let Some(files) = &self.rendered_files {
            let names = match files {
                Value::Object(map) => json!(map.keys().collect::<Vec<_>>()),
                other => other.clone(),
            };
            metadata.insert("rendered_files".to_string(), names);
        }
        if let Some(sync_status) = &self.sync_status {
            metadata.insert("sync_status".to_string(), json!(sync_status));
        }
        let approved = match &self.approval {
            Some(Value::Null) | Some(Value::Bool(false)) | None => {
                self.status.eq_ignore_ascii_case("approved")
            }
            Some(Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        };
        if approved {
            let change_record = match &self.approval {
                Some(Value::String(text)) => Some(text.clone()),
                Some(Value::Object(map)) => map
                    .get("change_record")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            };
            metadata.insert(
                "approval".to_string(),
                json!({
                    "approved_at": Value::Null,
                    "change_record": change_record,
                    "legacy": self.approval.clone().unwrap_or(Value::Bool(true)),
                }),
            );
        }
        metadata
    }
}

/// Imports every `*.json` file in `dir`. Per-file problems are reported in
/// the result; only an unreadable directory fails the whole import.
pub fn import_legacy_dir(
    runs: &RunStore,
    dir: &Path,
    log: &EventLog,
) -> Result<ImportReport, OrchestratorError> {
    let entries = fs::read_dir(dir).map_err(|err| OrchestratorError::LegacyRecord {
        path: dir.display().to_string(),
        reason: err.to_string(),
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| OrchestratorError::LegacyRecord {
            path: dir.display().to_string(),
            reason: err.to_string(),
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut report = ImportReport::default();
    for path in paths {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let record = LegacyRunFile::read(&path).and_then(|file| file.to_record(&stem));
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                log.runtime(
                    LogLevel::Warn,
                    "legacy.rejected",
                    &format!("{}: {err}", path.display()),
                );
                report.rejected.push(RejectedFile {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        match runs.create(&record) {
            Ok(_) => {
                log.run_event(
                    &record.run_id,
                    LogLevel::Info,
                    "run.imported",
                    json!({"path": path.display().to_string(), "state": record.state.as_str()}),
                );
                report.imported.push(record.run_id);
            }
            Err(OrchestratorError::RunExists { run_id }) => report.skipped.push(run_id),
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(value: Value) -> LegacyRunFile {
        serde_json::from_value(value).expect("legacy file")
    }

    #[test]
    fn statuses_map_onto_run_states() {
        assert_eq!(map_legacy_status("rendered"), Some(RunState::Built));
        assert_eq!(map_legacy_status("plan_queued"), Some(RunState::Planned));
        assert_eq!(map_legacy_status("approved"), Some(RunState::Planned));
        assert_eq!(map_legacy_status("apply_queued"), Some(RunState::Applying));
        assert_eq!(map_legacy_status("APPLIED"), Some(RunState::Applied));
        assert_eq!(map_legacy_status("port_sync_failed"), None);
    }

    #[test]
    fn naive_and_offset_timestamps_parse() {
        let naive = parse_legacy_time("2024-03-01T10:15:30.123456").expect("naive");
        assert_eq!(naive.to_rfc3339(), "2024-03-01T10:15:30.123456+00:00");
        let offset = parse_legacy_time("2024-03-01T12:15:30+02:00").expect("offset");
        assert_eq!(offset, parse_legacy_time("2024-03-01T10:15:30").expect("whole seconds"));
        assert!(parse_legacy_time("yesterday").is_none());
    }

    #[test]
    fn queued_plan_keeps_backend_reference() {
        let file = legacy(json!({
            "run_id": "porc-20240301101530123",
            "timestamp": "2024-03-01T10:15:30.123456",
            "status": "plan_queued",
            "blueprint": {"kind": "gke-cluster", "metadata": {"repo": "edge"}},
            "tfe_run_id": "run-abc",
            "plan_started": "2024-03-01T10:20:00"
        }));
        let view = file.to_view("ignored").expect("view");
        assert_eq!(view.run_id, "porc-20240301101530123");
        assert_eq!(view.state, RunState::Planned);
        assert_eq!(view.workspace.as_deref(), Some("edge"));
        assert_eq!(view.metadata["plan_reference"], "run-abc");
        assert!(view.metadata.get("approval").is_none());
    }

    #[test]
    fn approved_status_records_an_approval() {
        let file = legacy(json!({
            "status": "approved",
            "blueprint": {"kind": "postgres-db"}
        }));
        let record = file.to_record("porc-1").expect("record");
        assert_eq!(record.run_id, "porc-1");
        assert!(record.metadata["approval"].is_object());
    }
}
