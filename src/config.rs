//! Configuration for imgflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (IMGFLOW_HOME, IMGFLOW_RESULTS_DB)
//! 2. Config file (.imgflow/config.yaml)
//! 3. Defaults (~/.imgflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .imgflow/config.yaml
//! - Relative paths in the file resolve against the directory holding .imgflow/

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{RetryPolicy, WorkerSettings};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".imgflow";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub workers: Option<WorkersConfig>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (instances, default database)
    pub home: Option<String>,
    /// SQLite result database
    pub results_db: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    pub pool_size: Option<usize>,
    pub task_timeout_seconds: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub extensions: Option<Vec<String>>,
    pub stability_delay_secs: Option<u64>,
}

/// Directory watcher settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchSettings {
    /// Accepted file extensions, lowercase without the dot
    pub extensions: Vec<String>,
    /// Seconds a file must stay unchanged before it is submitted
    pub stability_delay_secs: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            extensions: ["png", "jpg", "jpeg", "gif", "bmp", "ppm"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            stability_delay_secs: 2,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite result database
    pub results_db: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub workers: WorkerSettings,
    pub watch: WatchSettings,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per instance
    pub fn instances_dir(&self) -> PathBuf {
        self.home.join("instances")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn worker_settings(config: Option<&WorkersConfig>) -> WorkerSettings {
    let defaults = WorkerSettings::default();
    let Some(config) = config else {
        return defaults;
    };

    WorkerSettings {
        pool_size: config.pool_size.unwrap_or(defaults.pool_size).max(1),
        task_timeout: config
            .task_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_timeout),
        retry: config.retry.clone().unwrap_or(defaults.retry),
    }
}

fn watch_settings(config: Option<&WatchConfig>) -> WatchSettings {
    let defaults = WatchSettings::default();
    let Some(config) = config else {
        return defaults;
    };

    WatchSettings {
        extensions: config
            .extensions
            .as_ref()
            .map(|exts| {
                exts.iter()
                    .map(|e| e.trim_start_matches('.').to_lowercase())
                    .collect()
            })
            .unwrap_or(defaults.extensions),
        stability_delay_secs: config
            .stability_delay_secs
            .unwrap_or(defaults.stability_delay_secs),
    }
}

/// Combine a config file, environment lookups and defaults
fn resolve(
    config_file: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = config_file.as_deref().map(load_config_file).transpose()?;

    // Project root is the parent of .imgflow/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();

    let home = env("IMGFLOW_HOME")
        .map(PathBuf::from)
        .or_else(|| paths.home.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or(default_home);

    let results_db = env("IMGFLOW_RESULTS_DB")
        .map(PathBuf::from)
        .or_else(|| paths.results_db.as_deref().map(|p| resolve_path(base_dir, p)))
        .unwrap_or_else(|| home.join("results.db"));

    Ok(ResolvedConfig {
        workers: worker_settings(file.as_ref().and_then(|f| f.workers.as_ref())),
        watch: watch_settings(file.as_ref().and_then(|f| f.watch.as_ref())),
        home,
        results_db,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_config_file(&cwd));

    resolve(config_file, |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the imgflow home directory
pub fn imgflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the instances directory ($IMGFLOW_HOME/instances)
pub fn instances_dir() -> Result<PathBuf> {
    Ok(config()?.instances_dir())
}

/// Get the result database path
pub fn results_db_path() -> Result<PathBuf> {
    Ok(config()?.results_db.clone())
}
