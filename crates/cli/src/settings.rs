//! Layered settings: built-in defaults, then an optional file, then
//! `BATCHES__SECTION__KEY` environment variables.

use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use pipeline::LifecycleConfig;

pub const ENV_PREFIX: &str = "BATCHES";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub server: ServerSettings,
    pub lifecycle: LifecycleConfig,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { url: "sqlite://batch-executions.db".into(), max_connections: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Run the stall/error reset sweep inside the server process.
    pub run_resetter: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), run_resetter: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { filter: "info".into(), json: false }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        Self::from_builder(builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__")))
    }

    fn from_builder(builder: ConfigBuilder<config::builder::DefaultState>) -> anyhow::Result<Self> {
        Ok(builder.build()?.try_deserialize()?)
    }
}
