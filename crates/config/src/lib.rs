//! Configuration loading for the wagate gateway.
//!
//! Config files are discovered in the working directory first, then under
//! `~/.config/wagate/`. `${VAR}` placeholders are expanded before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir},
    schema::{
        BackoffKind, BridgeConfig, ConnectorKind, NativeConfig, ReconnectConfig, ServerConfig,
        WagateConfig, WhatsAppConfig,
    },
};
