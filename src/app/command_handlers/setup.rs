use crate::app::command_support::{map_config_err, ParsedArgs};
use crate::config::{default_global_config_path, save_settings_to, Settings, StorageBackend};
use crate::runtime::{bootstrap_state_root, StatePaths};
use std::path::PathBuf;

pub fn cmd_setup(args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(
        args,
        &["--organization", "--state-root", "--storage"],
        &["--force"],
    )?;
    if let Some(extra) = parsed.positional.first() {
        return Err(format!("unexpected argument `{extra}`"));
    }
    let organization = parsed
        .value("--organization")
        .ok_or_else(|| "usage: setup --organization <org> [--state-root <dir>] [--storage sqlite|memory] [--force]".to_string())?;

    let config_path = default_global_config_path().map_err(map_config_err)?;
    if config_path.exists() && !parsed.switch("--force") {
        return Err(format!(
            "settings already exist at {}; pass --force to overwrite",
            config_path.display()
        ));
    }

    let mut settings = Settings::default();
    settings.backend.organization = organization.to_string();
    settings.state_root = parsed.value("--state-root").map(PathBuf::from);
    settings.storage.backend = match parsed.value("--storage") {
        None | Some("sqlite") => StorageBackend::Sqlite,
        Some("memory") => StorageBackend::Memory,
        Some(other) => {
            return Err(format!(
                "unknown storage backend `{other}`; expected sqlite or memory"
            ))
        }
    };

    save_settings_to(&config_path, &settings).map_err(map_config_err)?;
    let state_root = settings.resolve_state_root().map_err(map_config_err)?;
    bootstrap_state_root(&StatePaths::new(&state_root)).map_err(|err| err.to_string())?;

    Ok(format!(
        "setup complete\nconfig={}\nstate_root={}\nstorage={}\ntoken_env={}",
        config_path.display(),
        state_root.display(),
        settings.storage.backend.as_str(),
        settings.backend.token_env
    ))
}
