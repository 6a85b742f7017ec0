use super::{default_global_config_path, ConfigError, Settings};
use std::path::PathBuf;

pub fn load_global_settings() -> Result<(PathBuf, Settings), ConfigError> {
    let path = default_global_config_path()?;
    let settings = Settings::from_path(&path)?;
    settings.validate()?;
    Ok((path, settings))
}
