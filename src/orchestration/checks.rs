//! Scoped review-check reporting for one plan or apply attempt.

use crate::review::{
    truncate_summary, CheckConclusion, CheckHandle, CheckOutput, CheckTarget, ReviewChecks,
    ReviewError,
};
use crate::shared::{EventLog, LogLevel};
use serde_json::json;
use std::sync::Arc;

/// An open check for a run. Concluding consumes the session; dropping one
/// that was never concluded posts a failure so the check is never left
/// `in_progress`.
pub struct CheckSession {
    client: Option<Arc<dyn ReviewChecks>>,
    handle: Option<CheckHandle>,
    run_id: String,
    log: EventLog,
    concluded: bool,
}

impl CheckSession {
    /// Opens a check for `external_id`. Runs without an external id, or a
    /// process without a review client, get an inert session.
    pub fn open(
        client: Option<Arc<dyn ReviewChecks>>,
        external_id: Option<&str>,
        name: &str,
        run_id: &str,
        log: EventLog,
    ) -> Result<Self, ReviewError> {
        let mut session = Self {
            client: None,
            handle: None,
            run_id: run_id.to_string(),
            log,
            concluded: false,
        };
        let (Some(client), Some(external_id)) = (client, external_id) else {
            return Ok(session);
        };
        let target = CheckTarget::parse(external_id)?;
        let handle = client.create_check(&target, name)?;
        session.log.run_event(
            run_id,
            LogLevel::Info,
            "check.created",
            json!({"check_id": handle.id, "name": name, "target": target.to_string()}),
        );
        session.client = Some(client);
        session.handle = Some(handle);
        Ok(session)
    }

    pub fn check_id(&self) -> Option<u64> {
        self.handle.as_ref().map(|handle| handle.id)
    }

    /// Posts the final conclusion. Update failures are logged, not returned:
    /// the run outcome is already decided at this point.
    pub fn conclude(mut self, conclusion: CheckConclusion, title: &str, summary: &str) {
        self.concluded = true;
        self.post(conclusion, title, summary);
    }

    fn post(&self, conclusion: CheckConclusion, title: &str, summary: &str) {
        let (Some(client), Some(handle)) = (&self.client, &self.handle) else {
            return;
        };
        let output = CheckOutput {
            title: title.to_string(),
            summary: truncate_summary(&self.log.redactor().redact(summary)),
        };
        match client.update_check(handle, conclusion, &output) {
            Ok(()) => self.log.run_event(
                &self.run_id,
                LogLevel::Info,
                "check.updated",
                json!({"check_id": handle.id, "conclusion": conclusion.as_str()}),
            ),
            Err(err) => self.log.run_event(
                &self.run_id,
                LogLevel::Error,
                "check.update_failed",
                json!({"check_id": handle.id, "error": err.to_string()}),
            ),
        }
    }
}

impl Drop for CheckSession {
    fn drop(&mut self) {
        if self.concluded {
            return;
        }
        self.concluded = true;
        self.post(
            CheckConclusion::Failure,
            "Run interrupted",
            "The run ended before reporting a result.",
        );
    }
}
