//! Configuration loading for the image harvester
//!
//! This module provides functionality for:
//! 1. Loading `config.toml`, writing defaults when it is missing
//! 2. Backing up and replacing a config file that no longer parses
//! 3. Loading the category -> class list from `categories.json`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::harvest::dedup::CrossCategoryPolicy;
use crate::harvest::search_query::{QueryRefinements, SearchLocators};

/// Error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Categories file not found: {0}")]
    CategoriesNotFound(String),

    #[error("Invalid categories file: {0}")]
    InvalidCategories(String),
}

/// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub output_directory: String,
    pub categories_file: String,
    pub log_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            output_directory: "./output".to_string(),
            categories_file: "./categories.json".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Workers {
    pub worker_count: usize,
    pub images_per_class: u32,
    pub acquire_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub keep_original_filenames: bool,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            worker_count: 4,
            images_per_class: 10,
            acquire_timeout_secs: 30,
            shutdown_grace_secs: 30,
            keep_original_filenames: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Scrape {
    pub max_missed: u32,
    pub high_res_failure_threshold: u32,
    pub recovery_depth: u32,
    pub hard_ceiling: u32,
    pub periodic_scroll_interval: u32,
    pub refresh_interval: u32,
    pub scroll_pause_ms: u64,
    pub page_load_timeout_secs: u64,
    pub load_more_wait_ms: u64,
    pub advanced_suffix: String,
    pub cross_category_policy: CrossCategoryPolicy,
    pub index_refresh_secs: u64,
}

impl Default for Scrape {
    fn default() -> Self {
        Self {
            max_missed: 25,
            high_res_failure_threshold: 15,
            recovery_depth: 50,
            hard_ceiling: 1000,
            periodic_scroll_interval: 5,
            refresh_interval: 50,
            scroll_pause_ms: 500,
            page_load_timeout_secs: 30,
            load_more_wait_ms: 3000,
            advanced_suffix: String::new(),
            cross_category_policy: CrossCategoryPolicy::Skip,
            index_refresh_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Http {
    pub request_interval_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_delay_secs: u64,
    pub connection_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub forbidden_attempts: u32,
    pub forbidden_backoff_ms: u64,
    pub rotate_user_agents: bool,
    pub user_agents: Vec<String>,
    pub ssl_skip_domains: Vec<String>,
    pub skip_marked_ssl_domains: bool,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            request_interval_ms: 1000,
            jitter_ms: 1000,
            max_retries: 5,
            retry_backoff_ms: 500,
            max_retry_delay_secs: 60,
            connection_timeout_secs: 15,
            request_timeout_secs: 60,
            forbidden_attempts: 5,
            forbidden_backoff_ms: 2000,
            rotate_user_agents: true,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
            ],
            ssl_skip_domains: Vec::new(),
            skip_marked_ssl_domains: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Browser {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub extra_args: Vec<String>,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            window_width: 1920,
            window_height: 1080,
            extra_args: vec![
                "--disable-gpu".to_string(),
                "--disable-extensions".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub workers: Workers,
    pub scrape: Scrape,
    pub query: QueryRefinements,
    pub locators: SearchLocators,
    pub http: Http,
    pub browser: Browser,
    pub logging: Logging,
}

impl AppConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.acquire_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.workers.shutdown_grace_secs)
    }
}

/// Holds the loaded `config.toml` for the lifetime of the process
pub struct ConfigManager {
    app_config: RwLock<AppConfig>,
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Loads the config from `config_dir`, creating the directory and a default file if needed
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;

        Ok(Self {
            app_config: RwLock::new(app_config),
            config_dir,
        })
    }

    fn config_path(config_dir: &Path) -> PathBuf {
        config_dir.join("config.toml")
    }

    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = Self::config_path(config_dir);

        if !config_path.exists() {
            warn!("Config file not found, writing defaults: {}", config_path.display());
            let default_config = AppConfig::default();
            fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse config.toml: {}", e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) =
                    fs::rename(&config_path, config_path.with_extension("toml.backup"))
                {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(toml_string) => {
                        if let Err(write_err) = fs::write(&config_path, toml_string) {
                            error!("Failed to write new config file: {}", write_err);
                        } else {
                            info!("Created new config.toml with default values");
                        }
                    }
                    Err(ser_err) => error!("Failed to serialize default config: {}", ser_err),
                }

                Ok(default_config)
            }
        }
    }

    pub fn config_file(&self) -> PathBuf {
        Self::config_path(&self.config_dir)
    }

    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    /// Applies an in-memory change without touching the file on disk
    pub fn update<F: FnOnce(&mut AppConfig)>(&self, apply: F) {
        apply(&mut *self.app_config.write());
    }
}

/// Category name -> class names. Categories iterate by name, classes keep file order.
pub type CategoryCatalog = BTreeMap<String, Vec<String>>;

/// Loads `categories.json`, skipping malformed categories and blank class names
pub fn load_categories(path: impl AsRef<Path>) -> ConfigResult<CategoryCatalog> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::CategoriesNotFound(path.display().to_string()));
    }

    let content = fs::read_to_string(path)?;
    parse_categories(&content)
}

pub fn parse_categories(content: &str) -> ConfigResult<CategoryCatalog> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| ConfigError::InvalidCategories(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| ConfigError::InvalidCategories("top level must be an object".to_string()))?;

    let mut catalog = CategoryCatalog::new();
    for (category, classes) in object {
        let Some(classes) = classes.as_array() else {
            warn!("Skipping category '{}' - invalid format", category);
            continue;
        };

        let mut names = Vec::with_capacity(classes.len());
        for class in classes {
            match class.as_str().map(str::trim) {
                Some(name) if !name.is_empty() => {
                    if !names.iter().any(|existing: &String| existing == name) {
                        names.push(name.to_string());
                    }
                }
                _ => warn!("Skipping invalid class name in category '{}'", category),
            }
        }
        catalog.insert(category.clone(), names);
    }

    Ok(catalog)
}
