use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub mod render;

pub use render::BuiltinRenderer;

/// Rendered file name to file content, ordered so bundles are reproducible.
pub type RenderedFiles = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub kind: String,
    #[serde(default, alias = "schemaVersion", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, alias = "inputs")]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub metadata: BlueprintMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Blueprint {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.kind.trim().is_empty() {
            return Err(RenderError::MissingKind);
        }
        Ok(())
    }

    /// The deployment target a run of this blueprint locks: the explicit
    /// workspace, else the repository name, else the run itself.
    pub fn workspace_for(&self, run_id: &str) -> String {
        self.metadata
            .workspace
            .as_deref()
            .or(self.metadata.repo.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(run_id)
            .to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("blueprint must specify a `kind`")]
    MissingKind,
    #[error("unsupported blueprint kind `{kind}`")]
    UnknownKind { kind: String },
    #[error("blueprint variable `{name}` is invalid: {reason}")]
    InvalidVariable { name: String, reason: String },
    #[error("failed to encode rendered file `{file}`: {source}")]
    Encode {
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait BlueprintRenderer: Send + Sync {
    fn render(&self, kind: &str, variables: &Map<String, Value>) -> Result<RenderedFiles, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blueprint_accepts_inputs_alias_and_keeps_extra_metadata() {
        let blueprint: Blueprint = serde_json::from_value(json!({
            "kind": "gke-cluster",
            "schemaVersion": "1.0",
            "inputs": {"cluster_name": "edge"},
            "metadata": {"repo": "infra-edge", "owner": "platform"}
        }))
        .expect("parse blueprint");
        assert_eq!(blueprint.variables["cluster_name"], "edge");
        assert_eq!(blueprint.schema_version.as_deref(), Some("1.0"));
        assert_eq!(blueprint.metadata.extra["owner"], "platform");
        assert!(!blueprint.metadata.approval_required);
    }

    #[test]
    fn workspace_prefers_explicit_workspace_then_repo_then_run() {
        let mut blueprint: Blueprint =
            serde_json::from_value(json!({"kind": "postgres-db"})).expect("parse");
        assert_eq!(blueprint.workspace_for("run-1"), "run-1");
        blueprint.metadata.repo = Some("payments".to_string());
        assert_eq!(blueprint.workspace_for("run-1"), "payments");
        blueprint.metadata.workspace = Some("payments-prod".to_string());
        assert_eq!(blueprint.workspace_for("run-1"), "payments-prod");
    }

    #[test]
    fn blank_kind_is_rejected() {
        let blueprint: Blueprint = serde_json::from_value(json!({"kind": "  "})).expect("parse");
        assert!(matches!(blueprint.validate(), Err(RenderError::MissingKind)));
    }
}
