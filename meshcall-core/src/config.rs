use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mesh: MeshConfig,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

/// Connection establishment settings for the peer mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN-class servers used during ICE
    pub ice_servers: Vec<String>,
    /// Candidates gathered ahead of the first offer
    pub ice_candidate_pool_size: u8,
    /// Link quality sampling period in seconds
    pub link_stats_interval_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            // Mixed ports (19302, 3478, 443) so at least one survives simple filtering
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun.global.stun.twilio.com:3478".to_string(),
                "stun:stun.framasoft.org:3478".to_string(),
                "stun:stun.stunprotocol.org:3478".to_string(),
                "stun:stun.nextcloud.com:443".to_string(),
                "stun:stun.voip.blackberry.com:3478".to_string(),
            ],
            ice_candidate_pool_size: 10,
            link_stats_interval_secs: 3,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub const fn link_stats_interval(&self) -> Duration {
        Duration::from_secs(self.link_stats_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Settings for the in-process mesh demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub room: String,
    pub participants: usize,
    /// First participant starts a screen share once everyone is connected
    pub share_screen: bool,
    pub run_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            room: "lobby".to_string(),
            participants: 3,
            share_screen: true,
            run_secs: 20,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MESHCALL_MESH__LINK_STATS_INTERVAL_SECS=5, MESHCALL_MESH__ICE_SERVERS=stun:a,stun:b
        builder = builder.add_source(
            Environment::with_prefix("MESHCALL")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mesh.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for misconfigurations, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.mesh.ice_servers.is_empty() {
            errors.push("mesh.ice_servers must list at least one server".to_string());
        }
        for url in &self.mesh.ice_servers {
            let scheme = url.split(':').next().unwrap_or_default();
            if !matches!(scheme, "stun" | "stuns" | "turn" | "turns") {
                errors.push(format!("mesh.ice_servers: unsupported URL {url}"));
            }
        }
        if self.mesh.link_stats_interval_secs == 0 {
            errors.push("mesh.link_stats_interval_secs must be greater than zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }
        if self.demo.participants == 0 {
            errors.push("demo.participants must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `MESHCALL_CONFIG_PATH` environment variable (explicit path)
/// 2. ./meshcall.toml (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("MESHCALL_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "meshcall.toml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).unwrap_or_else(|e| {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Falling back to environment variables");
            Config::from_env().unwrap_or_default()
        })
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
