use super::{
    BackendError, BackendRunStatus, ConfigVersion, ConfigVersionStatus, PlanBackend, RunOptions,
};
use crate::shared::redact::redact_token;
use crate::shared::retry::{retry_with, PollPolicy, RetryPolicy};
use crate::shared::{EventLog, LogLevel};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_TFE_API_URL: &str = "https://app.terraform.io";

const JSON_API: &str = "application/vnd.api+json";
const STILL_PROCESSING_MARKERS: [&str; 3] = [
    "still being processed",
    "still processing",
    "not yet uploaded",
];

#[derive(Debug, Clone)]
pub struct TfeClientOptions {
    pub api_url: String,
    pub organization: String,
    pub token: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub run_poll: PollPolicy,
    pub config_poll: PollPolicy,
}

pub struct TfeClient {
    base_url: String,
    organization: String,
    token: String,
    agent: ureq::Agent,
    transport_retry: RetryPolicy,
    run_poll: PollPolicy,
    config_poll: PollPolicy,
    log: EventLog,
}

impl std::fmt::Debug for TfeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfeClient")
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .field("token", &redact_token(&self.token))
            .finish()
    }
}

/// Strips a trailing `/` and `/api/v2` so endpoints can always be appended.
pub fn normalize_api_url(raw: &str) -> Result<String, BackendError> {
    let mut url = raw.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix("/api/v2") {
        url = stripped.trim_end_matches('/').to_string();
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(BackendError::Configuration(format!(
            "invalid API URL `{raw}`; expected http:// or https://"
        )));
    }
    Ok(url)
}

impl TfeClient {
    pub fn new(options: TfeClientOptions, log: EventLog) -> Result<Self, BackendError> {
        if options.token.trim().is_empty() {
            return Err(BackendError::Configuration(
                "backend API token is empty".to_string(),
            ));
        }
        if options.organization.trim().is_empty() {
            return Err(BackendError::Configuration(
                "backend organization is empty".to_string(),
            ));
        }
        let base_url = normalize_api_url(&options.api_url)?;
        let agent = ureq::AgentBuilder::new()
            .timeout(options.request_timeout)
            .build();
        if !(options.token.starts_with("at-") || options.token.starts_with("tk-")) {
            log.runtime(
                LogLevel::Warn,
                "backend.token_prefix",
                "backend token does not start with the expected `at-` or `tk-` prefix",
            );
        }
        Ok(Self {
            base_url,
            organization: options.organization,
            token: options.token,
            agent,
            transport_retry: RetryPolicy::new(options.max_retries.saturating_add(1), options.retry_delay),
            run_poll: options.run_poll,
            config_poll: options.config_poll,
            log,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let path = path.trim_matches('/');
        let path = path.strip_prefix("api/v2/").unwrap_or(path);
        format!("{}/api/v2/{}", self.base_url, path)
    }

    fn request_json(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value, BackendError> {
        let url = self.endpoint(path);
        self.log.runtime(
            LogLevel::Info,
            "backend.request",
            &format!(
                "{method} {url} authorization=Bearer {}",
                redact_token(&self.token)
            ),
        );
        let encoded = body.map(Value::to_string);
        let response = retry_with(
            self.transport_retry,
            |err: &BackendError| err.is_unavailable(),
            |attempt| {
                let request = self
                    .agent
                    .request(method, &url)
                    .set("Authorization", &format!("Bearer {}", self.token))
                    .set("Content-Type", JSON_API)
                    .set("Accept", JSON_API);
                let outcome = match encoded.as_deref() {
                    Some(raw) => request.send_string(raw),
                    None => request.call(),
                };
                outcome.map_err(|err| self.classify(method, &url, attempt, err))
            },
        )?;
        let status = response.status();
        self.log.runtime(
            LogLevel::Info,
            "backend.response",
            &format!("{method} {url} -> {status}"),
        );
        if status == 204 {
            return Ok(Value::Null);
        }
        let raw = response
            .into_string()
            .map_err(|err| BackendError::Malformed {
                endpoint: url.clone(),
                message: err.to_string(),
            })?;
        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw).map_err(|err| BackendError::Malformed {
            endpoint: url,
            message: err.to_string(),
        })
    }

    fn classify(&self, method: &str, url: &str, attempt: u32, err: ureq::Error) -> BackendError {
        match err {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                let message = error_message(status, url, &body);
                self.log.runtime(
                    LogLevel::Error,
                    "backend.error",
                    &format!("{method} {url} -> {status}: {message}"),
                );
                let lowered = body.to_ascii_lowercase();
                if matches!(status, 409 | 422)
                    && STILL_PROCESSING_MARKERS
                        .iter()
                        .any(|marker| lowered.contains(marker))
                {
                    BackendError::StillProcessing { message }
                } else {
                    BackendError::Status { status, message }
                }
            }
            ureq::Error::Transport(transport) => {
                self.log.runtime(
                    LogLevel::Warn,
                    "backend.transport",
                    &format!("{method} {url} attempt {attempt} failed: {transport}"),
                );
                BackendError::Unavailable {
                    message: format!("{method} {url}: {transport}"),
                }
            }
        }
    }

    /// Fetches a log blob from a pre-signed archivist URL. No auth header: the
    /// URL carries its own credentials.
    fn fetch_log(&self, url: &str) -> Result<String, BackendError> {
        let response = retry_with(
            self.transport_retry,
            |err: &BackendError| err.is_unavailable(),
            |attempt| {
                self.agent
                    .get(url)
                    .call()
                    .map_err(|err| self.classify("GET", "log-read-url", attempt, err))
            },
        )?;
        response.into_string().map_err(|err| BackendError::Malformed {
            endpoint: "log-read-url".to_string(),
            message: err.to_string(),
        })
    }
}

impl PlanBackend for TfeClient {
    fn resolve_workspace(&self, name: &str) -> Result<String, BackendError> {
        let path = format!(
            "organizations/{}/workspaces/{}",
            urlencoding::encode(&self.organization),
            urlencoding::encode(name)
        );
        let body = self.request_json("GET", &path, None)?;
        data_id(&body, &path)
    }

    fn create_config_version(&self, workspace_id: &str) -> Result<ConfigVersion, BackendError> {
        let path = format!("workspaces/{}/configuration-versions", urlencoding::encode(workspace_id));
        let payload = json!({
            "data": {
                "type": "configuration-versions",
                "attributes": {"auto-queue-runs": false}
            }
        });
        let body = self.request_json("POST", &path, Some(&payload))?;
        Ok(ConfigVersion {
            id: data_id(&body, &path)?,
            upload_url: data_attribute(&body, &path, "upload-url")?,
        })
    }

    fn upload(&self, upload_url: &str, bundle: &[u8]) -> Result<(), BackendError> {
        self.log.runtime(
            LogLevel::Info,
            "backend.upload",
            &format!("uploading {} byte configuration bundle", bundle.len()),
        );
        retry_with(
            self.transport_retry,
            |err: &BackendError| err.is_unavailable(),
            |attempt| {
                self.agent
                    .put(upload_url)
                    .set("Content-Type", "application/octet-stream")
                    .send_bytes(bundle)
                    .map_err(|err| self.classify("PUT", "upload-url", attempt, err))
            },
        )?;
        Ok(())
    }

    fn config_version_status(&self, config_version_id: &str) -> Result<ConfigVersionStatus, BackendError> {
        let path = format!("configuration-versions/{}", urlencoding::encode(config_version_id));
        let body = self.request_json("GET", &path, None)?;
        let status = data_attribute(&body, &path, "status")?;
        Ok(ConfigVersionStatus::parse(&status))
    }

    fn create_run(
        &self,
        workspace_id: &str,
        config_version_id: &str,
        options: &RunOptions,
    ) -> Result<String, BackendError> {
        let payload = json!({
            "data": {
                "type": "runs",
                "attributes": {
                    "auto-apply": options.auto_apply,
                    "message": options.message,
                },
                "relationships": {
                    "workspace": {
                        "data": {"type": "workspaces", "id": workspace_id}
                    },
                    "configuration-version": {
                        "data": {"type": "configuration-versions", "id": config_version_id}
                    }
                }
            }
        });
        let body = self.request_json("POST", "runs", Some(&payload))?;
        data_id(&body, "runs")
    }

    fn run_status(&self, run_id: &str) -> Result<BackendRunStatus, BackendError> {
        let path = format!("runs/{}", urlencoding::encode(run_id));
        let body = self.request_json("GET", &path, None)?;
        let status = data_attribute(&body, &path, "status")?;
        Ok(BackendRunStatus::parse(&status))
    }

    fn plan_output(&self, run_id: &str) -> Result<String, BackendError> {
        let path = format!("runs/{}/plan", urlencoding::encode(run_id));
        let body = self.request_json("GET", &path, None)?;
        let log_url = data_attribute(&body, &path, "log-read-url")?;
        self.fetch_log(&log_url)
    }

    fn apply_output(&self, run_id: &str) -> Result<String, BackendError> {
        let path = format!("runs/{}/apply", urlencoding::encode(run_id));
        let body = self.request_json("GET", &path, None)?;
        let log_url = data_attribute(&body, &path, "log-read-url")?;
        self.fetch_log(&log_url)
    }

    fn apply(&self, run_id: &str, comment: &str) -> Result<(), BackendError> {
        let path = format!("runs/{}/actions/apply", urlencoding::encode(run_id));
        self.request_json("POST", &path, Some(&json!({"comment": comment})))?;
        Ok(())
    }

    fn config_poll_policy(&self) -> PollPolicy {
        self.config_poll
    }

    fn run_poll_policy(&self) -> PollPolicy {
        self.run_poll
    }
}

fn data_id(body: &Value, endpoint: &str) -> Result<String, BackendError> {
    body.pointer("/data/id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Malformed {
            endpoint: endpoint.to_string(),
            message: "missing `data.id`".to_string(),
        })
}

fn data_attribute(body: &Value, endpoint: &str, attribute: &str) -> Result<String, BackendError> {
    body.get("data")
        .and_then(|data| data.get("attributes"))
        .and_then(|attributes| attributes.get(attribute))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Malformed {
            endpoint: endpoint.to_string(),
            message: format!("missing `data.attributes.{attribute}`"),
        })
}

/// Builds a readable message from a JSON:API error document, falling back to
/// the raw body.
fn error_message(status: u16, url: &str, body: &str) -> String {
    let details = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("errors").cloned())
        .and_then(|errors| errors.as_array().cloned())
        .map(|errors| {
            errors
                .iter()
                .map(|error| {
                    let title = error.get("title").and_then(Value::as_str).unwrap_or("");
                    let detail = error.get("detail").and_then(Value::as_str).unwrap_or("");
                    match (title.is_empty(), detail.is_empty()) {
                        (false, false) => format!("{title}: {detail}"),
                        (false, true) => title.to_string(),
                        _ => detail.to_string(),
                    }
                })
                .filter(|message| !message.is_empty())
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|joined| !joined.is_empty());
    let prefix = match status {
        401 => "authentication failed; check the backend API token".to_string(),
        403 => "authorization failed; the token lacks permission for this action".to_string(),
        404 => format!("resource not found: {url}"),
        _ => format!("request to {url} failed"),
    };
    match details {
        Some(details) => format!("{prefix} ({details})"),
        None if body.trim().is_empty() => prefix,
        None => format!("{prefix} ({})", truncate(body.trim(), 500)),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
