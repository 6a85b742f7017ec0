use super::redact::Redactor;
use super::time::now_utc;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

pub fn runtime_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/runtime.log")
}

pub fn run_log_path(state_root: &Path, run_id: &str) -> PathBuf {
    state_root.join("logs/runs").join(format!("{run_id}.log"))
}

/// JSON-lines event sink. Every line is redacted before it reaches disk and
/// write failures are swallowed: losing a log line never fails a run.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    root: Option<PathBuf>,
    redactor: Redactor,
}

impl EventLog {
    pub fn new(state_root: impl Into<PathBuf>, redactor: Redactor) -> Self {
        Self {
            root: Some(state_root.into()),
            redactor,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn runtime(&self, level: LogLevel, event: &str, message: &str) {
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let mut payload = base_payload(level, event);
        payload.insert("message".to_string(), Value::String(message.to_string()));
        self.append(&runtime_log_path(root), payload);
    }

    pub fn run_event(&self, run_id: &str, level: LogLevel, event: &str, fields: Value) {
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let mut payload = base_payload(level, event);
        payload.insert("run_id".to_string(), Value::String(run_id.to_string()));
        match fields {
            Value::Object(map) => payload.extend(map),
            Value::Null => {}
            other => {
                payload.insert("message".to_string(), other);
            }
        }
        self.append(&run_log_path(root, run_id), payload);
    }

    /// Reads back a run's audit trail, skipping lines that fail to parse.
    pub fn read_run_events(&self, run_id: &str) -> Vec<Value> {
        let Some(root) = self.root.as_deref() else {
            return Vec::new();
        };
        let Ok(raw) = fs::read_to_string(run_log_path(root, run_id)) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn append(&self, path: &Path, payload: Map<String, Value>) {
        let Ok(line) = serde_json::to_string(&Value::Object(payload)) else {
            return;
        };
        let line = self.redactor.redact(&line);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

fn base_payload(level: LogLevel, event: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "timestamp".to_string(),
        Value::String(now_utc().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
    );
    payload.insert("level".to_string(), Value::String(level.as_str().to_string()));
    payload.insert("event".to_string(), Value::String(event.to_string()));
    payload
}
