//! Contains the system configuration.
//!
//! The configuration is loaded from **config/settings.yml** once at startup. All
//! settings are optional; a missing file simply yields the built-in defaults, so a
//! node can be started without any configuration at all.
//!
//! ```yaml
//! server:
//!     host: 0.0.0.0
//!     port: 9010
//!
//! cache:
//!     group: main
//!     # Supports common suffixes like: k, m, g, t
//!     max_memory: 64m
//!
//! registry:
//!     path: /_geerpc_/registry
//!     # A peer whose last heartbeat is older than this is considered expired.
//!     ttl: 5m
//!     reap_interval: 1m
//! ```
use std::path::Path;
use std::time::Duration;

use yaml_rust::yaml::Yaml;
use yaml_rust::YamlLoader;

use crate::fmt::{parse_duration, parse_size};
use crate::platform::Platform;
use crate::registry::{DEFAULT_REAP_INTERVAL, DEFAULT_REGISTRY_PATH, DEFAULT_TTL};
use anyhow::Context;
use std::sync::Arc;

/// The settings of the cache partition served by this node.
pub struct CacheSettings {
    /// The name of the group to install and serve.
    pub group: String,

    /// The byte budget of the group's LRU store.
    pub max_memory: usize,
}

/// The settings of the membership registry.
pub struct RegistrySettings {
    /// The URL path the registry is mounted at.
    pub path: String,

    /// The liveness TTL for registered peers.
    pub ttl: Duration,

    /// The interval in which expired peers are reaped.
    pub reap_interval: Duration,
}

/// Provides access to the system configuration.
pub struct Config {
    root: Yaml,
}

impl Config {
    /// Creates an empty configuration where every query yields its fallback value.
    pub fn empty() -> Self {
        Config { root: Yaml::Null }
    }

    /// Parses a configuration from the given YAML string.
    pub fn from_string(yaml: &str) -> anyhow::Result<Self> {
        let mut documents =
            YamlLoader::load_from_str(yaml).context("Failed to parse the given config")?;

        Ok(Config {
            root: if documents.is_empty() {
                Yaml::Null
            } else {
                documents.remove(0)
            },
        })
    }

    /// Loads a configuration from the given file.
    pub fn load(file: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(file.as_ref())
            .with_context(|| format!("Failed to read {}", file.as_ref().display()))?;
        Config::from_string(&contents)
    }

    /// Loads **config/settings.yml** (if present) and installs the configuration into
    /// the given platform.
    ///
    /// Note that this is invoked by the [Builder](crate::builder::Builder) unless
    /// disabled. An unreadable file is reported and replaced by the defaults rather
    /// than taking the process down.
    pub fn install(platform: &Arc<Platform>) -> Arc<Config> {
        let config = if Path::new("config/settings.yml").exists() {
            match Config::load("config/settings.yml") {
                Ok(config) => {
                    log::info!("Loaded config/settings.yml...");
                    config
                }
                Err(error) => {
                    log::error!("Falling back to defaults: {:#}", error);
                    Config::empty()
                }
            }
        } else {
            log::info!("No config/settings.yml present, using defaults...");
            Config::empty()
        };

        let config = Arc::new(config);
        platform.register::<Config>(config.clone());

        config
    }

    /// Returns the address the RPC server should bind to.
    ///
    /// Defaults to "0.0.0.0:9010". A port of 0 lets the operating system pick one,
    /// which is mainly useful in tests.
    pub fn server_address(&self) -> String {
        format!(
            "{}:{}",
            self.root["server"]["host"].as_str().unwrap_or("0.0.0.0"),
            self.root["server"]["port"]
                .as_i64()
                .filter(|port| (0..=u16::MAX as i64).contains(port))
                .unwrap_or(9010)
        )
    }

    /// Returns the settings of the served cache partition.
    pub fn cache(&self) -> CacheSettings {
        CacheSettings {
            group: self.root["cache"]["group"]
                .as_str()
                .unwrap_or("main")
                .to_owned(),
            max_memory: self.root["cache"]["max_memory"]
                .as_str()
                .and_then(|literal| parse_size(literal).ok())
                .unwrap_or(64 * 1024 * 1024),
        }
    }

    /// Returns the settings of the membership registry.
    pub fn registry(&self) -> RegistrySettings {
        RegistrySettings {
            path: self.root["registry"]["path"]
                .as_str()
                .unwrap_or(DEFAULT_REGISTRY_PATH)
                .to_owned(),
            ttl: self.root["registry"]["ttl"]
                .as_str()
                .and_then(|literal| parse_duration(literal).ok())
                .unwrap_or(DEFAULT_TTL),
            reap_interval: self.root["registry"]["reap_interval"]
                .as_str()
                .and_then(|literal| parse_duration(literal).ok())
                .unwrap_or(DEFAULT_REAP_INTERVAL),
        }
    }
}
