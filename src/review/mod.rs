//! Commit status checks posted to the source-control review system.

use serde::{Deserialize, Serialize};

pub mod github;

pub use github::{GithubChecksClient, GithubChecksOptions};

/// Upper bound the review system accepts for a check summary.
pub const MAX_SUMMARY_CHARS: usize = 60_000;

const TRUNCATION_NOTE: &str = "\n\n... (output truncated)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTarget {
    pub owner: String,
    pub repo: String,
    pub sha: String,
}

impl CheckTarget {
    /// Parses `github:<owner>/<repo>@<sha>`.
    pub fn parse(external_id: &str) -> Result<Self, ReviewError> {
        let invalid = |reason: &str| ReviewError::InvalidTarget {
            value: external_id.to_string(),
            reason: reason.to_string(),
        };
        let rest = external_id
            .trim()
            .strip_prefix("github:")
            .ok_or_else(|| invalid("expected `github:` prefix"))?;
        let (repo_path, sha) = rest
            .split_once('@')
            .ok_or_else(|| invalid("expected `<owner>/<repo>@<sha>`"))?;
        let (owner, repo) = repo_path
            .split_once('/')
            .ok_or_else(|| invalid("expected `<owner>/<repo>`"))?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid("owner and repo must be single non-empty path segments"));
        }
        validate_sha(sha)?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            sha: sha.to_ascii_lowercase(),
        })
    }
}

impl std::fmt::Display for CheckTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "github:{}/{}@{}", self.owner, self.repo, self.sha)
    }
}

pub fn validate_sha(sha: &str) -> Result<(), ReviewError> {
    let valid = (7..=40).contains(&sha.len()) && sha.chars().all(|ch| ch.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(ReviewError::InvalidSha {
            sha: sha.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckHandle {
    pub id: u64,
    pub target: CheckTarget,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Cancelled,
    Neutral,
}

impl CheckConclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review target `{value}` is invalid: {reason}")]
    InvalidTarget { value: String, reason: String },
    #[error("commit sha `{sha}` is malformed; expected 7-40 hex characters")]
    InvalidSha { sha: String },
    #[error("review API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("review API unavailable: {message}")]
    Unavailable { message: String },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
    #[error("review client misconfigured: {0}")]
    Configuration(String),
}

pub trait ReviewChecks: Send + Sync {
    /// Opens a check in the `in_progress` state.
    fn create_check(&self, target: &CheckTarget, name: &str) -> Result<CheckHandle, ReviewError>;

    /// Completes a check with a conclusion.
    fn update_check(
        &self,
        handle: &CheckHandle,
        conclusion: CheckConclusion,
        output: &CheckOutput,
    ) -> Result<(), ReviewError>;
}

/// Caps a summary at [`MAX_SUMMARY_CHARS`], keeping the start of the text.
pub fn truncate_summary(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    let keep = MAX_SUMMARY_CHARS - TRUNCATION_NOTE.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_NOTE);
    out
}
