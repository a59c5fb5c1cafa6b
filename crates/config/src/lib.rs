//! Configuration for filebridge
//!
//! This crate loads the per-root bridge settings and the project registry.

pub mod loader;
pub mod registry;
pub mod settings;

pub use loader::{config_path, ConfigLoader, LoadedConfig};
pub use registry::{GlobalSettings, ProjectRegistry, RegistryDocument};
pub use settings::{BridgeConfig, BridgeSettings, CONFIG_VERSION};
