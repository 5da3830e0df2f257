use crate::config::config_manager::{ConfigurationManager, SimulationConfig};
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

static GLOBAL_CONFIG_MANAGER: OnceCell<Arc<RwLock<ConfigurationManager>>> = OnceCell::new();

pub const CONFIG_ENV_VAR: &str = "WORLDTICK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "worldtick.toml";

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// Falls back to defaults when the file is missing or invalid
fn internal_initialize() -> Arc<RwLock<ConfigurationManager>> {
    let path = config_path();
    let config_manager = match ConfigurationManager::load_from_file(&path) {
        Ok(manager) => {
            info!("Loaded global config from {:?}", path);
            manager
        }
        Err(e) => {
            warn!("Failed to load global config from {:?}: {}. Using default configuration.", path, e);
            let mut manager = ConfigurationManager::default();
            manager.set_config_path(&path);
            manager
        }
    };
    Arc::new(RwLock::new(config_manager))
}

/// Gets the process-wide ConfigurationManager, loading it on first use.
pub fn get_config_manager() -> &'static Arc<RwLock<ConfigurationManager>> {
    GLOBAL_CONFIG_MANAGER.get_or_init(internal_initialize)
}

/// Installs an explicit manager. Returns false if the global config was already initialised.
pub fn initialize_with(manager: ConfigurationManager) -> bool {
    GLOBAL_CONFIG_MANAGER.set(Arc::new(RwLock::new(manager))).is_ok()
}

/// A copy of the current configuration.
pub fn get_config() -> SimulationConfig {
    get_config_manager()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get_config()
        .clone()
}
