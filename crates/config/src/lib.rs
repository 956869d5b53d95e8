//! Configuration loading for the dispatch engine.
//!
//! Config files: `switchyard.toml`, `switchyard.yaml` or `switchyard.json`.
//! Searched in `./` then the user config directory.

pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, load_config, parse_config},
    schema::{CircuitBreakerConfig, DispatchConfig, HandlersConfig, SwitchyardConfig},
};
