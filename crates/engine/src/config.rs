//! Hibernator configuration via `hibernator.toml`
//!
//! `enabled` and `parallel` can be changed while running: edit the file and
//! send a reload. `default_database` and `save_dir` are read once at startup;
//! changing them takes a restart.

use hibernator_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "hibernator.toml";

/// Hibernator configuration loaded from `hibernator.toml`.
///
/// # Example
///
/// ```toml
/// enabled = true
/// parallel = false
/// default_database = "postgres"
/// save_dir = "pg_hibernator"
/// poll_interval_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HibernatorConfig {
    /// Save buffers at shutdown and restore them at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Restore databases concurrently instead of one at a time
    #[serde(default)]
    pub parallel: bool,
    /// Database connected to when saving, and when restoring shared objects
    #[serde(default = "default_database")]
    pub default_database: String,
    /// Directory holding save-files
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Longest the orchestrator sleeps between decision points
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("pg_hibernator")
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl Default for HibernatorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            parallel: false,
            default_database: default_database(),
            save_dir: default_save_dir(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl HibernatorConfig {
    /// Orchestrator wait timeout
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.default_database.is_empty() {
            return Err(Error::Config("default_database must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Hibernator configuration
#
# Save shared buffers at shutdown and restore them at startup (default: true).
# Can be changed with a reload.
enabled = true

# Restore databases in parallel (default: false).
# Can be changed with a reload.
parallel = false

# Database to connect to when saving buffers and when restoring
# blocks of shared objects. Requires a restart.
default_database = "postgres"

# Directory holding save-files. Requires a restart.
save_dir = "pg_hibernator"

# Longest wait between orchestrator decision points, in milliseconds.
poll_interval_ms = 10000
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HibernatorConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ('{}')", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| Error::io(path, e))?;
        }
        Ok(())
    }

    /// Take the reloadable settings from `new`.
    ///
    /// Settings fixed at startup keep their current value; a change to one of
    /// them is logged and ignored.
    pub fn apply_reload(&mut self, new: HibernatorConfig) {
        if new.default_database != self.default_database {
            warn!(
                current = %self.default_database,
                requested = %new.default_database,
                "default_database cannot be changed without restarting"
            );
        }
        if new.save_dir != self.save_dir {
            warn!(
                current = %self.save_dir.display(),
                requested = %new.save_dir.display(),
                "save_dir cannot be changed without restarting"
            );
        }

        if new.enabled != self.enabled || new.parallel != self.parallel {
            info!(
                enabled = new.enabled,
                parallel = new.parallel,
                "Reloaded hibernator configuration"
            );
        } else {
            debug!("Reloaded hibernator configuration, nothing changed");
        }

        self.enabled = new.enabled;
        self.parallel = new.parallel;
        self.poll_interval_ms = new.poll_interval_ms;
    }
}

/// Where configuration comes from
pub trait ConfigSource: Send + Sync {
    /// Load the current configuration
    fn load(&self) -> Result<HibernatorConfig>;
}

/// Configuration read from a TOML file.
///
/// A missing file means all defaults.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Read configuration from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }

    /// Read `hibernator.toml` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CONFIG_FILE_NAME))
    }

    /// Path of the config file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<HibernatorConfig> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No config file, using defaults");
            return Ok(HibernatorConfig::default());
        }
        HibernatorConfig::from_file(&self.path)
    }
}

/// Configuration held in memory.
///
/// `set` replaces what the next `load` returns.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    config: Mutex<HibernatorConfig>,
}

impl StaticConfigSource {
    /// Serve `config`
    pub fn new(config: HibernatorConfig) -> Self {
        StaticConfigSource {
            config: Mutex::new(config),
        }
    }

    /// Replace the served configuration
    pub fn set(&self, config: HibernatorConfig) {
        *self.config.lock() = config;
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<HibernatorConfig> {
        let config = self.config.lock().clone();
        config.validate()?;
        Ok(config)
    }
}

impl<S: ConfigSource + ?Sized> ConfigSource for std::sync::Arc<S> {
    fn load(&self) -> Result<HibernatorConfig> {
        (**self).load()
    }
}
