//! Application configuration.
//!
//! Values are layered with `figment`, lowest precedence first: built-in
//! defaults, the TOML file, `PG_BACKUP_API_*` environment variables, and
//! finally command line overrides.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pg-backup-api/config.toml";
pub const ENV_PREFIX: &str = "PG_BACKUP_API_";

/// How queued operations are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Inside the API server process.
    #[default]
    Worker,
    /// In a child process running the worker subcommand.
    Process,
}

/// A Barman server known to this API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Defaults to `<barman_home>/<server>/base`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basebackups_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub barman_home: PathBuf,
    pub barman_command: PathBuf,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub json_logs: bool,
    pub verbose: bool,
    pub launch_mode: LaunchMode,
    /// Executable run by `process` launch mode; this binary when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_command: Option<PathBuf>,
    pub max_concurrent_operations: usize,
    pub queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            barman_home: PathBuf::from("/var/lib/barman"),
            barman_command: PathBuf::from("barman"),
            host: "127.0.0.1".to_string(),
            port: 7480,
            log_file: None,
            json_logs: false,
            verbose: false,
            launch_mode: LaunchMode::Worker,
            worker_command: None,
            max_concurrent_operations: 4,
            queue_capacity: 32,
            command_timeout_secs: None,
            servers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load the configuration from `path` (or the default location), the
    /// environment and `overrides`.
    ///
    /// A missing file is not an error. `overrides` should skip unset fields
    /// when serialized so they don't mask lower layers.
    pub fn new<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_operations == 0 {
            bail!("max_concurrent_operations must be greater than 0");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Where base backups of a configured server live.
    pub fn basebackups_directory(&self, name: &str) -> Option<PathBuf> {
        let server = self.server(name)?;
        Some(
            server
                .basebackups_directory
                .clone()
                .unwrap_or_else(|| self.barman_home.join(name).join("base")),
        )
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
