#![allow(dead_code)]

use serde_json::{json, Value};
use stackrun::backend::{
    BackendError, BackendRunStatus, ConfigVersion, ConfigVersionStatus, PlanBackend, RunOptions,
};
use stackrun::blueprint::{Blueprint, BuiltinRenderer};
use stackrun::bundle::MemoryBundleStorage;
use stackrun::orchestration::{
    Collaborators, LockStore, Orchestrator, OrchestratorConfig, RunStore,
};
use stackrun::review::{
    CheckConclusion, CheckHandle, CheckOutput, CheckTarget, ReviewChecks, ReviewError,
};
use stackrun::shared::{EventLog, PollPolicy, RetryPolicy};
use stackrun::storage::{KvStore, MemoryStore};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

pub fn blueprint(value: Value) -> Blueprint {
    serde_json::from_value(value).expect("blueprint")
}

pub fn postgres_blueprint(workspace: &str) -> Blueprint {
    blueprint(json!({
        "kind": "postgres-db",
        "variables": {"db_name": "orders"},
        "metadata": {"workspace": workspace},
    }))
}

/// Holds backend calls until the test opens it.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    entered: usize,
    open: bool,
}

impl Gate {
    /// True once some call is parked at the gate.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("gate");
        while state.entered == 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = self.changed.wait_timeout(state, left).expect("gate").0;
        }
        true
    }

    pub fn entered(&self) -> usize {
        self.state.lock().expect("gate").entered
    }

    pub fn open(&self) {
        self.state.lock().expect("gate").open = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock().expect("gate");
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).expect("gate");
        }
    }
}

#[derive(Default)]
struct FakeBackendState {
    next_id: u32,
    statuses: BTreeMap<String, BackendRunStatus>,
    auto_apply: BTreeMap<String, bool>,
    uploads: Vec<(String, usize)>,
    applied: Vec<String>,
    created_runs: Vec<RunOptions>,
}

/// Scriptable in-process backend. Plans settle at `plan_status`, applies at
/// `apply_status`.
pub struct FakeBackend {
    state: Mutex<FakeBackendState>,
    pub plan_status: Mutex<BackendRunStatus>,
    pub apply_status: Mutex<BackendRunStatus>,
    pub missing_workspaces: Mutex<BTreeSet<String>>,
    pub still_processing_rejections: Mutex<u32>,
    pub fail_apply_with: Mutex<Option<u16>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeBackendState::default()),
            plan_status: Mutex::new(BackendRunStatus::Planned),
            apply_status: Mutex::new(BackendRunStatus::Applied),
            missing_workspaces: Mutex::new(BTreeSet::new()),
            still_processing_rejections: Mutex::new(0),
            fail_apply_with: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_plan_status(&self, status: BackendRunStatus) {
        *self.plan_status.lock().expect("lock") = status;
    }

    pub fn set_apply_status(&self, status: BackendRunStatus) {
        *self.apply_status.lock().expect("lock") = status;
    }

    pub fn set_run_status(&self, run_id: &str, status: BackendRunStatus) {
        self.state
            .lock()
            .expect("lock")
            .statuses
            .insert(run_id.to_string(), status);
    }

    pub fn mark_missing(&self, workspace: &str) {
        self.missing_workspaces
            .lock()
            .expect("lock")
            .insert(workspace.to_string());
    }

    pub fn reject_apply(&self, status: u16) {
        *self.fail_apply_with.lock().expect("lock") = Some(status);
    }

    pub fn reject_create_run_while_processing(&self, times: u32) {
        *self.still_processing_rejections.lock().expect("lock") = times;
    }

    /// Parks every later `create_config_version` call until the gate opens.
    pub fn hold_config_versions(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().expect("lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn created_runs(&self) -> Vec<RunOptions> {
        self.state.lock().expect("lock").created_runs.clone()
    }

    pub fn uploads(&self) -> usize {
        self.state.lock().expect("lock").uploads.len()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().expect("lock").applied.clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().expect("lock");
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

impl PlanBackend for FakeBackend {
    fn resolve_workspace(&self, name: &str) -> Result<String, BackendError> {
        if self.missing_workspaces.lock().expect("lock").contains(name) {
            return Err(BackendError::Status {
                status: 404,
                message: "not found".to_string(),
            });
        }
        Ok(format!("ws-{name}"))
    }

    fn create_config_version(&self, _workspace_id: &str) -> Result<ConfigVersion, BackendError> {
        let gate = self.gate.lock().expect("lock").clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        let id = self.next_id("cv");
        Ok(ConfigVersion {
            upload_url: format!("https://uploads.invalid/{id}"),
            id,
        })
    }

    fn upload(&self, upload_url: &str, bundle: &[u8]) -> Result<(), BackendError> {
        self.state
            .lock()
            .expect("lock")
            .uploads
            .push((upload_url.to_string(), bundle.len()));
        Ok(())
    }

    fn config_version_status(&self, _config_version_id: &str) -> Result<ConfigVersionStatus, BackendError> {
        Ok(ConfigVersionStatus::Uploaded)
    }

    fn create_run(
        &self,
        _workspace_id: &str,
        _config_version_id: &str,
        options: &RunOptions,
    ) -> Result<String, BackendError> {
        {
            let mut rejections = self.still_processing_rejections.lock().expect("lock");
            if *rejections > 0 {
                *rejections -= 1;
                return Err(BackendError::StillProcessing {
                    message: "configuration version still processing".to_string(),
                });
            }
        }
        let run_id = self.next_id("run");
        let status = if options.auto_apply {
            self.apply_status.lock().expect("lock").clone()
        } else {
            self.plan_status.lock().expect("lock").clone()
        };
        let mut state = self.state.lock().expect("lock");
        state.statuses.insert(run_id.clone(), status);
        state.auto_apply.insert(run_id.clone(), options.auto_apply);
        state.created_runs.push(options.clone());
        Ok(run_id)
    }

    fn run_status(&self, run_id: &str) -> Result<BackendRunStatus, BackendError> {
        self.state
            .lock()
            .expect("lock")
            .statuses
            .get(run_id)
            .cloned()
            .ok_or_else(|| BackendError::Status {
                status: 404,
                message: format!("run {run_id} not found"),
            })
    }

    fn plan_output(&self, run_id: &str) -> Result<String, BackendError> {
        Ok(format!("Plan for {run_id}: 1 to add, 0 to change, 0 to destroy."))
    }

    fn apply_output(&self, run_id: &str) -> Result<String, BackendError> {
        Ok(format!("Apply for {run_id} complete! Resources: 1 added."))
    }

    fn apply(&self, run_id: &str, _comment: &str) -> Result<(), BackendError> {
        if let Some(status) = *self.fail_apply_with.lock().expect("lock") {
            return Err(BackendError::Status {
                status,
                message: "apply rejected".to_string(),
            });
        }
        let next = self.apply_status.lock().expect("lock").clone();
        let mut state = self.state.lock().expect("lock");
        state.statuses.insert(run_id.to_string(), next);
        state.applied.push(run_id.to_string());
        Ok(())
    }

    fn config_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), Duration::from_secs(1))
    }

    fn run_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCheck {
    pub name: String,
    pub target: String,
    pub conclusion: Option<CheckConclusion>,
    pub title: Option<String>,
    pub summary: Option<String>,
}

#[derive(Default)]
pub struct FakeChecks {
    checks: Mutex<Vec<RecordedCheck>>,
}

impl FakeChecks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recorded(&self) -> Vec<RecordedCheck> {
        self.checks.lock().expect("lock").clone()
    }
}

impl ReviewChecks for FakeChecks {
    fn create_check(&self, target: &CheckTarget, name: &str) -> Result<CheckHandle, ReviewError> {
        let mut checks = self.checks.lock().expect("lock");
        checks.push(RecordedCheck {
            name: name.to_string(),
            target: target.to_string(),
            conclusion: None,
            title: None,
            summary: None,
        });
        Ok(CheckHandle {
            id: checks.len() as u64,
            target: target.clone(),
            name: name.to_string(),
        })
    }

    fn update_check(
        &self,
        handle: &CheckHandle,
        conclusion: CheckConclusion,
        output: &CheckOutput,
    ) -> Result<(), ReviewError> {
        let mut checks = self.checks.lock().expect("lock");
        let index = usize::try_from(handle.id - 1).expect("index");
        let check = checks.get_mut(index).expect("known check");
        check.conclusion = Some(conclusion);
        check.title = Some(output.title.clone());
        check.summary = Some(output.summary.clone());
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub backend: Arc<FakeBackend>,
    pub checks: Arc<FakeChecks>,
    pub lock_kv: Arc<dyn KvStore>,
}

pub fn config_with_ttl(lock_ttl: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        lock_ttl,
        still_processing: RetryPolicy::new(5, Duration::from_millis(1)),
        ..OrchestratorConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(config_with_ttl(Duration::from_secs(300)))
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let backend = FakeBackend::new();
    let checks = FakeChecks::new();
    let lock_kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        RunStore::new(Arc::new(MemoryStore::new())),
        LockStore::new(Arc::clone(&lock_kv), EventLog::disabled()),
        Collaborators {
            renderer: Arc::new(BuiltinRenderer::default()),
            bundles: Arc::new(MemoryBundleStorage::new()),
            backend: backend.clone(),
            checks: Some(checks.clone()),
        },
        config,
        EventLog::disabled(),
    );
    Harness {
        orchestrator,
        backend,
        checks,
        lock_kv,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub auth_header: String,
    pub body: String,
}

/// Single-threaded HTTP/1.1 responder serving a fixed number of requests.
pub struct MockHttpServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockHttpServer {
    pub fn start<F>(expected_requests: usize, responder: F) -> Self
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_for_thread = Arc::clone(&requests);

        let handle = thread::spawn(move || {
            for _ in 0..expected_requests {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

                let mut request_line = String::new();
                reader
                    .read_line(&mut request_line)
                    .expect("read request line");
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or("GET").to_string();
                let path = parts.next().unwrap_or("/").to_string();

                let mut auth_header = String::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).expect("read header");
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if lower.starts_with("authorization:") {
                        auth_header = line
                            .split_once(':')
                            .map(|(_, v)| v.trim().to_string())
                            .unwrap_or_default();
                    }
                    if lower.starts_with("content-length:") {
                        content_length = line
                            .split_once(':')
                            .map(|(_, v)| v.trim().parse::<usize>().unwrap_or(0))
                            .unwrap_or(0);
                    }
                }

                let mut body = vec![0_u8; content_length];
                if content_length > 0 {
                    reader.read_exact(&mut body).expect("read body");
                }
                let body = String::from_utf8_lossy(&body).to_string();

                let (status, response_body) = responder(&method, &path);
                requests_for_thread
                    .lock()
                    .expect("lock requests")
                    .push(RecordedRequest {
                        method,
                        path,
                        auth_header,
                        body,
                    });

                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    reason_phrase(status),
                    response_body.len(),
                    response_body
                );
                stream
                    .write_all(response.as_bytes())
                    .expect("write response");
                stream.flush().expect("flush response");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
            handle: Some(handle),
        }
    }

    /// Waits for every expected request, then returns them in arrival order.
    pub fn finish(mut self) -> Vec<RecordedRequest> {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("mock server thread");
        }
        self.requests.lock().expect("lock requests").clone()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
