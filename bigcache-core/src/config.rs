//! Environment- and file-backed configuration discovery for the agent.
//! Environment variables are authoritative; an optional TOML file fills
//! in anything the environment doesn't set.

use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_BUNDLE_PATH: &str = "/data/local/tmp/bigcache.bin";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bigcache/config.toml";

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    path: Option<PathBuf>,
    enabled: Option<bool>,
    verbosity: Option<u8>,
}

/// Resolved agent configuration: where the bundle lives, whether the
/// agent should run at all, and how verbose its logging should be.
#[derive(Debug, Clone)]
pub struct Config {
    pub bundle_path: PathBuf,
    pub enabled: bool,
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bundle_path: PathBuf::from(DEFAULT_BUNDLE_PATH),
            enabled: true,
            verbosity: 1,
        }
    }
}

impl Config {
    /// Reads `BIGCACHE_PATH`, `BIGCACHE_ENABLED`, `BIGCACHE_VERBOSE`, and
    /// (if present) the TOML file named by `BIGCACHE_CONFIG` or the
    /// default `/etc/bigcache/config.toml`. Environment variables win
    /// over file values; both win over the built-in defaults.
    pub fn discover() -> Self {
        let mut config = Config::default();

        let config_path = std::env::var("BIGCACHE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        if let Ok(contents) = std::fs::read_to_string(&config_path) {
            match toml::from_str::<FileConfig>(&contents) {
                Ok(file_config) => {
                    if let Some(path) = file_config.path {
                        config.bundle_path = path;
                    }
                    if let Some(enabled) = file_config.enabled {
                        config.enabled = enabled;
                    }
                    if let Some(verbosity) = file_config.verbosity {
                        config.verbosity = verbosity;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %config_path.display(), error = %e, "ignoring malformed config file");
                }
            }
        }

        if let Ok(path) = std::env::var("BIGCACHE_PATH") {
            config.bundle_path = PathBuf::from(path);
        }
        if let Ok(enabled) = std::env::var("BIGCACHE_ENABLED") {
            config.enabled = enabled != "0";
        }
        if let Ok(verbosity) = std::env::var("BIGCACHE_VERBOSE") {
            if let Ok(v) = verbosity.parse::<u8>() {
                config.verbosity = v.min(5);
            }
        }

        config
    }
}
