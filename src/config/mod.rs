pub mod config_manager;
pub mod global_config;

pub use config_manager::{ConfigurationManager, SimulationConfig};
