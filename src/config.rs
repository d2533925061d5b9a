//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/saxsctrl.toml`)
//! 2. environment variables prefixed with `SAXSCTRL_`, nested keys separated
//!    by a double underscore (`SAXSCTRL_APPLICATION__LOG_LEVEL=debug`)
//!
//! ```toml
//! [application]
//! name = "SAXS beamline"
//! log_level = "info"
//! log_format = "compact"
//!
//! [[instruments]]
//! id = "detector"
//! kind = "pilatus"
//! connection = { address = "192.168.1.20:41234", read_timeout = "2s" }
//! settings = { image_path = "/data/current" }
//! ```

use anyhow::{anyhow, bail, Context as _, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use saxs_core::{ConnectionConfig, DriverRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_PATH: &str = "config/saxsctrl.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SAXSCTRL_";

/// Accepted log levels.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaxsConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "saxsctrl".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

/// One instrument in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Driver type, e.g. "pilatus", "trinamic", "genix", "tpg201", "haake"
    pub kind: String,
    /// Whether this instrument is built and connected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Transport settings
    pub connection: ConnectionConfig,
    /// Driver-specific settings, interpreted by the driver factory
    #[serde(default = "empty_table")]
    pub settings: toml::Value,
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl SaxsConfig {
    /// Load from [`DEFAULT_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_PATH)
    }

    /// Load from `path` and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("configuration file {} not found", path.display());
        }
        Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Provider chain used by [`SaxsConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Parse configuration text without consulting the environment.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::string(text))
            .extract()
            .context("Failed to parse configuration")
    }

    /// Check the configuration against the registered drivers.
    pub fn validate(&self, registry: &DriverRegistry) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                bail!("Instrument of kind '{}' has an empty id", instrument.kind);
            }
            if !ids.insert(instrument.id.as_str()) {
                bail!("Duplicate instrument ID: {}", instrument.id);
            }
            if !registry.has_factory(&instrument.kind) {
                return Err(anyhow!(
                    "Instrument '{}' has unknown kind '{}'. Known kinds: {}",
                    instrument.id,
                    instrument.kind,
                    registry.list_factories().join(", ")
                ));
            }
            instrument
                .connection
                .validate()
                .with_context(|| format!("Instrument '{}' connection", instrument.id))?;
            registry
                .validate(&instrument.kind, &instrument.settings)
                .with_context(|| format!("Instrument '{}' settings", instrument.id))?;
        }
        Ok(())
    }

    /// Instruments marked enabled.
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled)
    }
}
