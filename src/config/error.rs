use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no settings at {path}; run `stackrun setup --organization <org>` first")]
    NotInitialized { path: String },
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode settings for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("HOME is not set; pass --state-root or set STACKRUN_CONFIG")]
    HomeDirectoryUnavailable,
}
