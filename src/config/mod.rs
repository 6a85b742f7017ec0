pub mod error;
pub mod load;
pub mod paths;
pub mod save;
pub mod settings;

pub use error::ConfigError;
pub use load::load_global_settings;
pub use paths::{
    default_global_config_path, default_state_root, CONFIG_PATH_ENV, GLOBAL_SETTINGS_FILE_NAME,
    GLOBAL_STATE_DIR,
};
pub use save::{save_settings, save_settings_to};
pub use settings::{
    BackendConfig, BundleConfig, LockConfig, RendererConfig, ReviewConfig, Settings,
    StorageBackend, StorageConfig,
};
