//! Runner configuration, loaded from a TOML file.

use crate::domain::{EnvVariable, Environment, VariableMap};
use crate::engine::batch::{DEFAULT_CASE_TIMEOUT_MS, DEFAULT_CONCURRENCY, DEFAULT_RETRY_DELAY_MS};
use crate::engine::env::build_variable_map;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "getman-runner.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Prefix for relative request URLs.
    pub base_url: Option<String>,
    /// Name of the active entry in `environments`.
    pub environment: Option<String>,
    pub database_path: PathBuf,
    pub transport: TransportConfig,
    pub batch: BatchConfig,
    /// Global variables, below the active environment's.
    pub variables: Vec<EnvVariable>,
    pub environments: Vec<Environment>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            environment: None,
            database_path: PathBuf::from(".getman/runner.db"),
            transport: TransportConfig::default(),
            batch: BatchConfig::default(),
            variables: Vec::new(),
            environments: Vec::new(),
        }
    }
}

/// Settings for the shared HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub follow_redirects: bool,
    pub verify_ssl: bool,
    pub keep_alive: bool,
    pub proxy_url: Option<String>,
    pub default_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            verify_ssl: true,
            keep_alive: true,
            proxy_url: None,
            default_timeout_ms: DEFAULT_CASE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_count: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RunnerConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        if self.transport.default_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "transport.default_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(name) = &self.environment {
            if self.find_environment(name).is_none() {
                return Err(Error::InvalidConfig(format!("Unknown environment `{name}`")));
            }
        }
        Ok(())
    }

    fn find_environment(&self, name: &str) -> Option<&Environment> {
        self.environments
            .iter()
            .find(|env| env.name == name || (!env.id.is_empty() && env.id == name))
    }

    /// The environment named by `name`, or the configured default.
    pub fn active_environment(&self, name: Option<&str>) -> Result<Option<&Environment>> {
        match name.or(self.environment.as_deref()) {
            Some(name) => self
                .find_environment(name)
                .map(Some)
                .ok_or_else(|| Error::InvalidConfig(format!("Unknown environment `{name}`"))),
            None => Ok(None),
        }
    }

    /// Globals merged with the active environment's variables.
    pub fn global_variables(&self, environment: Option<&str>) -> Result<VariableMap> {
        let active = self.active_environment(environment)?;
        Ok(build_variable_map(&self.variables, active))
    }
}
