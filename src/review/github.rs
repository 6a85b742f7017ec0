use super::{CheckConclusion, CheckHandle, CheckOutput, CheckTarget, ReviewChecks, ReviewError};
use crate::shared::redact::redact_token;
use crate::shared::retry::{retry_with, RetryPolicy};
use crate::shared::time::now_utc;
use crate::shared::{EventLog, LogLevel};
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("stackrun/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct GithubChecksOptions {
    pub api_url: String,
    pub token: String,
    pub details_url: Option<String>,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

pub struct GithubChecksClient {
    api_url: String,
    token: String,
    details_url: Option<String>,
    agent: ureq::Agent,
    transport_retry: RetryPolicy,
    log: EventLog,
}

impl std::fmt::Debug for GithubChecksClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubChecksClient")
            .field("api_url", &self.api_url)
            .field("token", &redact_token(&self.token))
            .finish()
    }
}

impl GithubChecksClient {
    pub fn new(options: GithubChecksOptions, log: EventLog) -> Result<Self, ReviewError> {
        if options.token.trim().is_empty() {
            return Err(ReviewError::Configuration(
                "review API token is empty".to_string(),
            ));
        }
        let api_url = options.api_url.trim().trim_end_matches('/').to_string();
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ReviewError::Configuration(format!(
                "invalid review API URL `{}`",
                options.api_url
            )));
        }
        Ok(Self {
            api_url,
            token: options.token,
            details_url: options.details_url.filter(|url| !url.trim().is_empty()),
            agent: ureq::AgentBuilder::new()
                .timeout(options.request_timeout)
                .build(),
            transport_retry: RetryPolicy::new(options.max_retries.saturating_add(1), options.retry_delay),
            log,
        })
    }

    fn check_runs_path(&self, target: &CheckTarget) -> String {
        format!(
            "{}/repos/{}/{}/check-runs",
            self.api_url,
            urlencoding::encode(&target.owner),
            urlencoding::encode(&target.repo)
        )
    }

    fn send(&self, method: &str, url: &str, body: &Value) -> Result<Value, ReviewError> {
        self.log.runtime(
            LogLevel::Info,
            "review.request",
            &format!("{method} {url} authorization=Bearer {}", redact_token(&self.token)),
        );
        let raw = body.to_string();
        let response = retry_with(
            self.transport_retry,
            |err: &ReviewError| matches!(err, ReviewError::Unavailable { .. }),
            |_| {
                self.agent
                    .request(method, url)
                    .set("Authorization", &format!("Bearer {}", self.token))
                    .set("Accept", GITHUB_ACCEPT)
                    .set("User-Agent", USER_AGENT)
                    .set("X-GitHub-Api-Version", "2022-11-28")
                    .set("Content-Type", "application/json")
                    .send_string(&raw)
                    .map_err(|err| match err {
                        ureq::Error::Status(status, response) => ReviewError::Status {
                            status,
                            message: response
                                .into_string()
                                .unwrap_or_default()
                                .chars()
                                .take(500)
                                .collect(),
                        },
                        ureq::Error::Transport(transport) => ReviewError::Unavailable {
                            message: format!("{method} {url}: {transport}"),
                        },
                    })
            },
        )?;
        response
            .into_json::<Value>()
            .map_err(|err| ReviewError::Malformed {
                endpoint: url.to_string(),
                message: err.to_string(),
            })
    }
}

impl ReviewChecks for GithubChecksClient {
    fn create_check(&self, target: &CheckTarget, name: &str) -> Result<CheckHandle, ReviewError> {
        let url = self.check_runs_path(target);
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!(name));
        payload.insert("head_sha".to_string(), json!(target.sha));
        payload.insert("status".to_string(), json!("in_progress"));
        payload.insert(
            "started_at".to_string(),
            json!(now_utc().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        if let Some(details_url) = &self.details_url {
            payload.insert("details_url".to_string(), json!(details_url));
        }
        let body = self.send("POST", &url, &Value::Object(payload))?;
        let id = body
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ReviewError::Malformed {
                endpoint: url,
                message: "missing numeric `id`".to_string(),
            })?;
        Ok(CheckHandle {
            id,
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
        let url = format!("{}/{}", self.check_runs_path(&handle.target), handle.id);
        let payload = json!({
            "status": "completed",
            "completed_at": now_utc().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "conclusion": conclusion.as_str(),
            "output": {
                "title": output.title,
                "summary": output.summary,
            }
        });
        self.send("PATCH", &url, &payload)?;
        Ok(())
    }
}
