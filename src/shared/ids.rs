use chrono::{DateTime, Utc};
use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_WIDTH: usize = 4;
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;
const WORKSPACE_NAME_MAX_LEN: usize = 90;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

/// Workspace names follow the remote backend's naming rules, which also allow `.`.
pub fn validate_workspace_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value.len() > WORKSPACE_NAME_MAX_LEN {
        return Err(format!(
            "{kind} must be at most {WORKSPACE_NAME_MAX_LEN} characters"
        ));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-', '_' or '.'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal, $validate:path) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                $validate($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(RunId, "run id", validate_identifier_value);
define_id_type!(WorkspaceName, "workspace name", validate_workspace_value);

impl RunId {
    /// Allocates `run-<yyyymmddHHMMSSmmm>-<4 base36 chars>`. The timestamp keeps ids
    /// ordered by submission; the random suffix separates ids within one millisecond.
    pub fn generate(now: DateTime<Utc>) -> Result<Self, String> {
        let mut bytes = [0_u8; 4];
        getrandom(&mut bytes).map_err(|err| format!("failed to generate run id randomness: {err}"))?;
        let sample = u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE;
        Ok(Self(format!(
            "run-{}-{}",
            now.format("%Y%m%d%H%M%S%3f"),
            base36_encode_fixed(sample, RUN_SUFFIX_WIDTH)
        )))
    }
}

fn base36_encode_fixed(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}
