use super::{default_state_root, ConfigError};
use crate::backend::tfe::DEFAULT_TFE_API_URL;
use crate::blueprint::render::DEFAULT_MODULE_SOURCE_BASE;
use crate::orchestration::orchestrator::{DEFAULT_APPLY_CHECK_NAME, DEFAULT_PLAN_CHECK_NAME};
use crate::review::github::DEFAULT_GITHUB_API_URL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Directory for the database, bundles and logs. Defaults to
    /// `$HOME/.stackrun`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub bundles: BundleConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite file; relative paths resolve under the state root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lock_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default = "default_backend_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_config_timeout_seconds")]
    pub config_timeout_seconds: u64,
    #[serde(default = "default_still_processing_attempts")]
    pub still_processing_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub still_processing_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: default_backend_api_url(),
            organization: String::new(),
            token_env: default_backend_token_env(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_seconds: default_poll_interval_seconds(),
            run_timeout_seconds: default_run_timeout_seconds(),
            config_timeout_seconds: default_config_timeout_seconds(),
            still_processing_attempts: default_still_processing_attempts(),
            still_processing_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_review_api_url")]
    pub api_url: String,
    #[serde(default = "default_review_token_env")]
    pub token_env: String,
    #[serde(default = "default_plan_check_name")]
    pub plan_check_name: String,
    #[serde(default = "default_apply_check_name")]
    pub apply_check_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_review_api_url(),
            token_env: default_review_token_env(),
            plan_check_name: default_plan_check_name(),
            apply_check_name: default_apply_check_name(),
            details_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BundleConfig {
    /// Bundle directory; relative paths resolve under the state root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RendererConfig {
    #[serde(default = "default_module_source_base")]
    pub module_source_base: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            module_source_base: default_module_source_base(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_lock_ttl_seconds() -> u64 {
    300
}

fn default_backend_api_url() -> String {
    DEFAULT_TFE_API_URL.to_string()
}

fn default_backend_token_env() -> String {
    "TFE_TOKEN".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_run_timeout_seconds() -> u64 {
    1800
}

fn default_config_timeout_seconds() -> u64 {
    30
}

fn default_still_processing_attempts() -> u32 {
    5
}

fn default_review_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_review_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_plan_check_name() -> String {
    DEFAULT_PLAN_CHECK_NAME.to_string()
}

fn default_apply_check_name() -> String {
    DEFAULT_APPLY_CHECK_NAME.to_string()
}

fn default_module_source_base() -> String {
    DEFAULT_MODULE_SOURCE_BASE.to_string()
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Settings(format!(
            "`{field}` must be an http:// or https:// URL, got `{value}`"
        )))
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Settings(format!("`{field}` must be greater than 0")));
    }
    Ok(())
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ConfigError::NotInitialized {
                path: path.display().to_string(),
            },
            _ => ConfigError::Read {
                path: path.display().to_string(),
                source,
            },
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(root) = &self.state_root {
            if !root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }
        if self.backend.organization.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`backend.organization` must be non-empty".to_string(),
            ));
        }
        validate_http_url("backend.api_url", &self.backend.api_url)?;
        validate_http_url("review.api_url", &self.review.api_url)?;
        if self.backend.token_env.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`backend.token_env` must name an environment variable".to_string(),
            ));
        }
        require_positive("locks.ttl_seconds", self.locks.ttl_seconds)?;
        require_positive("backend.poll_interval_seconds", self.backend.poll_interval_seconds)?;
        require_positive("backend.request_timeout_seconds", self.backend.request_timeout_seconds)?;
        require_positive("backend.run_timeout_seconds", self.backend.run_timeout_seconds)?;
        require_positive("backend.config_timeout_seconds", self.backend.config_timeout_seconds)?;
        require_positive(
            "backend.still_processing_attempts",
            u64::from(self.backend.still_processing_attempts),
        )?;
        if self.review.plan_check_name.trim().is_empty()
            || self.review.apply_check_name.trim().is_empty()
        {
            return Err(ConfigError::Settings(
                "review check names must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => default_state_root(),
        }
    }

    pub fn database_path(&self, state_root: &Path) -> PathBuf {
        resolve_under(state_root, self.storage.database.as_deref(), "stackrun.db")
    }

    pub fn bundles_dir(&self, state_root: &Path) -> PathBuf {
        resolve_under(state_root, self.bundles.dir.as_deref(), "bundles")
    }
}

fn resolve_under(root: &Path, configured: Option<&Path>, default_name: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => root.join(path),
        None => root.join(default_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_fill_in_defaults() {
        let settings: Settings = serde_yaml::from_str(
            r#"
backend:
  organization: acme
"#,
        )
        .expect("parse");
        settings.validate().expect("valid");
        assert_eq!(settings.locks.ttl_seconds, 300);
        assert_eq!(settings.backend.token_env, "TFE_TOKEN");
        assert_eq!(settings.backend.still_processing_attempts, 5);
        assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
        assert_eq!(settings.review.plan_check_name, DEFAULT_PLAN_CHECK_NAME);
        assert!(settings.review.enabled);
    }

    #[test]
    fn relative_paths_resolve_under_state_root() {
        let settings: Settings = serde_yaml::from_str(
            r#"
storage:
  database: db/runs.db
bundles:
  dir: /srv/bundles
backend:
  organization: acme
"#,
        )
        .expect("parse");
        let root = Path::new("/var/lib/stackrun");
        assert_eq!(
            settings.database_path(root),
            PathBuf::from("/var/lib/stackrun/db/runs.db")
        );
        assert_eq!(settings.bundles_dir(root), PathBuf::from("/srv/bundles"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_err(), "missing organization");
        settings.backend.organization = "acme".to_string();
        settings.validate().expect("valid");

        let mut zero_ttl = settings.clone();
        zero_ttl.locks.ttl_seconds = 0;
        let err = zero_ttl.validate().expect_err("zero ttl");
        assert!(err.to_string().contains("locks.ttl_seconds"));

        let mut bad_url = settings.clone();
        bad_url.backend.api_url = "app.terraform.io".to_string();
        assert!(bad_url.validate().is_err());

        let mut relative_root = settings;
        relative_root.state_root = Some(PathBuf::from("state"));
        assert!(relative_root.validate().is_err());
    }

    #[test]
    fn missing_settings_file_points_at_setup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Settings::from_path(&dir.path().join("config.yaml")).expect_err("missing");
        assert!(matches!(err, ConfigError::NotInitialized { .. }));
        assert!(err.to_string().contains("stackrun setup"));
    }
}
