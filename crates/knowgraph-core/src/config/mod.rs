//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::DatabaseConfig;

/// Knowgraph configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub search: SearchConfig,
    pub tasks: TaskQueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum cosine similarity used when a caller does not pass one
    pub default_threshold: f32,
    pub default_limit: usize,
    /// Score bonus for nodes whose label or content contains the query text
    pub text_match_boost: f32,
    /// Upper bound on text matches merged into a hybrid search
    pub text_match_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// How many times a lost claim race is retried before reporting an empty queue
    pub claim_retries: u32,
    /// Id of the concept node every task is linked to with INSTANCE_OF
    pub anchor_id: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: crate::storage::database::default_database_path(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.7,
            default_limit: 10,
            text_match_boost: 0.15,
            text_match_limit: 50,
        }
    }
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            claim_retries: 3,
            anchor_id: "concept:tasks".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("KNOWGRAPH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("knowgraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be at least 1"));
        }
        if !(-1.0..=1.0).contains(&self.search.default_threshold) {
            return Err(anyhow!("search.default_threshold must be between -1.0 and 1.0"));
        }
        if self.search.default_limit == 0 {
            return Err(anyhow!("search.default_limit must be at least 1"));
        }
        if self.search.text_match_boost < 0.0 {
            return Err(anyhow!("search.text_match_boost must be non-negative"));
        }
        if self.tasks.anchor_id.trim().is_empty() {
            return Err(anyhow!("tasks.anchor_id must not be empty"));
        }
        Ok(())
    }

    /// Database connection settings derived from this configuration
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig::with_path(&self.database.path)
            .max_connections(self.database.max_connections)
            .busy_timeout_ms(self.database.busy_timeout_ms)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "database.path" => Ok(self.database.path.display().to_string()),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.busy_timeout_ms" => Ok(self.database.busy_timeout_ms.to_string()),
            "search.default_threshold" => Ok(self.search.default_threshold.to_string()),
            "search.default_limit" => Ok(self.search.default_limit.to_string()),
            "search.text_match_boost" => Ok(self.search.text_match_boost.to_string()),
            "search.text_match_limit" => Ok(self.search.text_match_limit.to_string()),
            "tasks.claim_retries" => Ok(self.tasks.claim_retries.to_string()),
            "tasks.anchor_id" => Ok(self.tasks.anchor_id.clone()),
            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "database.path" => self.database.path = PathBuf::from(value),
            "database.max_connections" => {
                self.database.max_connections = value
                    .parse()
                    .with_context(|| format!("Invalid max_connections value: {}", value))?;
            }
            "database.busy_timeout_ms" => {
                self.database.busy_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid busy_timeout_ms value: {}", value))?;
            }
            "search.default_threshold" => {
                self.search.default_threshold = value
                    .parse()
                    .with_context(|| format!("Invalid default_threshold value: {}", value))?;
            }
            "search.default_limit" => {
                self.search.default_limit = value
                    .parse()
                    .with_context(|| format!("Invalid default_limit value: {}", value))?;
            }
            "search.text_match_boost" => {
                self.search.text_match_boost = value
                    .parse()
                    .with_context(|| format!("Invalid text_match_boost value: {}", value))?;
            }
            "search.text_match_limit" => {
                self.search.text_match_limit = value
                    .parse()
                    .with_context(|| format!("Invalid text_match_limit value: {}", value))?;
            }
            "tasks.claim_retries" => {
                self.tasks.claim_retries = value
                    .parse()
                    .with_context(|| format!("Invalid claim_retries value: {}", value))?;
            }
            "tasks.anchor_id" => self.tasks.anchor_id = value.to_string(),
            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "database.path",
            "database.max_connections",
            "database.busy_timeout_ms",
            "search.default_threshold",
            "search.default_limit",
            "search.text_match_boost",
            "search.text_match_limit",
            "tasks.claim_retries",
            "tasks.anchor_id",
        ];

        keys.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}
