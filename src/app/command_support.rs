use crate::config::{load_global_settings, ConfigError, Settings};
use crate::orchestration::OrchestratorError;
use crate::runtime::{assemble_orchestrator, Runtime, StatePaths};
use serde::Serialize;
use std::collections::BTreeMap;

pub fn map_config_err(err: ConfigError) -> String {
    err.to_string()
}

/// Flattens an orchestrator error into `kind [status]: message` so scripts
/// can branch on the kind without parsing prose.
pub fn map_orchestrator_err(err: OrchestratorError) -> String {
    let kind = err.kind();
    format!("{} [{}]: {err}", kind.as_str(), kind.http_status())
}

pub fn load_settings() -> Result<Settings, String> {
    load_global_settings()
        .map(|(_, settings)| settings)
        .map_err(map_config_err)
}

pub fn open_runtime() -> Result<Runtime, String> {
    let settings = load_settings()?;
    let root = settings.resolve_state_root().map_err(map_config_err)?;
    assemble_orchestrator(&settings, &StatePaths::new(root)).map_err(|err| err.to_string())
}

pub fn render_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|err| format!("failed to encode output: {err}"))
}

/// Splits `args` into positionals and `--flag value` / `--switch` options.
/// Unknown flags are rejected.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub positional: Vec<String>,
    pub values: BTreeMap<String, String>,
    pub switches: Vec<String>,
}

impl ParsedArgs {
    pub fn parse(args: &[String], value_flags: &[&str], switch_flags: &[&str]) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if !arg.starts_with("--") {
                parsed.positional.push(arg.clone());
                continue;
            }
            if value_flags.contains(&arg.as_str()) {
                let value = iter
                    .next()
                    .ok_or_else(|| format!("`{arg}` requires a value"))?;
                parsed.values.insert(arg.clone(), value.clone());
            } else if switch_flags.contains(&arg.as_str()) {
                parsed.switches.push(arg.clone());
            } else {
                return Err(format!("unknown option `{arg}`"));
            }
        }
        Ok(parsed)
    }

    pub fn value(&self, flag: &str) -> Option<&str> {
        self.values.get(flag).map(String::as_str)
    }

    pub fn switch(&self, flag: &str) -> bool {
        self.switches.iter().any(|value| value == flag)
    }

    pub fn number(&self, flag: &str) -> Result<Option<u64>, String> {
        self.value(flag)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| format!("`{flag}` expects a whole number, got `{raw}`"))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn options_split_from_positionals() {
        let parsed = ParsedArgs::parse(
            &args(&["run-1", "--change-record", "CHG-7", "--force"]),
            &["--change-record"],
            &["--force"],
        )
        .expect("parse");
        assert_eq!(parsed.positional, vec!["run-1".to_string()]);
        assert_eq!(parsed.value("--change-record"), Some("CHG-7"));
        assert!(parsed.switch("--force"));
    }

    #[test]
    fn unknown_and_dangling_options_fail() {
        assert!(ParsedArgs::parse(&args(&["--nope"]), &[], &[]).is_err());
        assert!(ParsedArgs::parse(&args(&["--limit"]), &["--limit"], &[]).is_err());
        let parsed = ParsedArgs::parse(&args(&["--limit", "x"]), &["--limit"], &[]).expect("parse");
        assert!(parsed.number("--limit").is_err());
    }

    #[test]
    fn orchestrator_errors_carry_kind_and_status() {
        let message = map_orchestrator_err(OrchestratorError::WorkspaceBusy {
            workspace: "ws-1".to_string(),
            locked_by: "r1".to_string(),
        });
        assert_eq!(
            message,
            "workspace_busy [409]: workspace `ws-1` is busy; locked by run `r1`"
        );
    }
}
