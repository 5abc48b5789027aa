//! Shared configuration and logging for the meshcall workspace.

pub mod config;
pub mod logging;

pub use config::{load_config, Config, DemoConfig, LoggingConfig, MeshConfig};
