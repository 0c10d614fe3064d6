//! TOML-based configuration for askbridge.
//!
//! Supports a config file (askbridge.toml) with environment variable
//! expansion in path-like fields, plus `ASKBRIDGE_*` environment overrides.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! persistent = true
//! candidates = ["python3", "python"]
//! persistent_args = ["agent_worker.py", "--serve"]
//! oneshot_args = ["agent_worker.py"]
//! working_dir = "${BOT_HOME}/ai"
//! watch_paths = ["${BOT_HOME}/ai/agent_worker.py"]
//!
//! [queue]
//! max_concurrent = 2
//! max_pending = 25
//! max_wait_ms = 60000
//!
//! [cache]
//! ttl_seconds = 90
//! max_items = 200
//!
//! [metrics]
//! latency_samples = 200
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Worker process configuration.
    pub worker: WorkerSettings,

    /// Admission queue limits.
    pub queue: QueueSettings,

    /// Response cache configuration.
    pub cache: CacheSettings,

    /// Latency tracking configuration.
    pub metrics: MetricsSettings,

    /// Logging defaults.
    pub logging: LoggingSettings,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Use a long-lived worker; when false every call is a one-shot spawn.
    pub persistent: bool,

    /// Candidate executables, tried in order.
    pub candidates: Vec<String>,

    /// Arguments for the long-lived worker.
    pub persistent_args: Vec<String>,

    /// Arguments for one-shot fallback invocations.
    pub oneshot_args: Vec<String>,

    /// Working directory for both process kinds.
    pub working_dir: Option<String>,

    /// Source artifacts whose modification restarts the worker.
    pub watch_paths: Vec<String>,

    /// Environment variables set for the worker.
    pub env: BTreeMap<String, String>,

    /// Silence window after spawn that counts as a successful start.
    pub startup_grace_ms: u64,

    /// Default per-call timeout when the caller gives none.
    pub request_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert("PYTHONUTF8".to_string(), "1".to_string());
        env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        Self {
            persistent: true,
            candidates: vec!["python3".to_string(), "python".to_string()],
            persistent_args: vec!["agent_worker.py".to_string(), "--serve".to_string()],
            oneshot_args: vec!["agent_worker.py".to_string()],
            working_dir: None,
            watch_paths: Vec::new(),
            env,
            startup_grace_ms: 350,
            request_timeout_ms: 45_000,
        }
    }
}

impl WorkerSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.watch_paths.iter().map(PathBuf::from).collect()
    }
}

/// Admission queue limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Jobs allowed to run at once.
    pub max_concurrent: usize,

    /// Jobs allowed to wait for a slot.
    pub max_pending: usize,

    /// Longest a job may wait before it is timed out.
    pub max_wait_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_pending: 25,
            max_wait_ms: 60_000,
        }
    }
}

impl QueueSettings {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry lifetime in seconds; 0 disables caching.
    pub ttl_seconds: u64,

    /// Maximum number of cached answers.
    pub max_items: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 90,
            max_items: 200,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Latency tracking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Samples kept per operation.
    pub latency_samples: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            latency_samples: 200,
        }
    }
}

/// Logging defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text, expanding environment variables.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = toml::from_str(content)?;
        settings.expand_paths()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations, then apply
    /// environment overrides.
    ///
    /// Searches in order:
    /// 1. Environment variable `ASKBRIDGE_CONFIG`
    /// 2. `./askbridge.toml`
    /// 3. `~/.config/askbridge/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`], but an explicit path skips the search.
    pub fn load_from(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::load_file()?,
        };
        settings.apply_overrides_with(|name| env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn load_file() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("ASKBRIDGE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("askbridge.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("askbridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Apply `ASKBRIDGE_*` overrides read through `lookup`.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ASKBRIDGE_WORKER_CANDIDATES") {
            self.worker.candidates = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("ASKBRIDGE_PERSISTENT") {
            self.worker.persistent = parse_bool("ASKBRIDGE_PERSISTENT", &value)?;
        }
        override_parsed(&lookup, "ASKBRIDGE_QUEUE_MAX_CONCURRENT", &mut self.queue.max_concurrent)?;
        override_parsed(&lookup, "ASKBRIDGE_QUEUE_MAX_PENDING", &mut self.queue.max_pending)?;
        override_parsed(&lookup, "ASKBRIDGE_QUEUE_MAX_WAIT_MS", &mut self.queue.max_wait_ms)?;
        override_parsed(&lookup, "ASKBRIDGE_CACHE_TTL_SECONDS", &mut self.cache.ttl_seconds)?;
        override_parsed(&lookup, "ASKBRIDGE_CACHE_MAX_ITEMS", &mut self.cache.max_items)?;
        override_parsed(&lookup, "ASKBRIDGE_LATENCY_SAMPLES", &mut self.metrics.latency_samples)?;
        Ok(())
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.queue.max_concurrent == 0 {
            return Err(SettingsError::InvalidConfig(
                "queue.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.metrics.latency_samples == 0 {
            return Err(SettingsError::InvalidConfig(
                "metrics.latency_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn expand_paths(&mut self) -> Result<(), SettingsError> {
        let worker = &mut self.worker;
        if let Some(dir) = &worker.working_dir {
            worker.working_dir = Some(expand_env_vars(dir)?);
        }
        for arg in worker
            .persistent_args
            .iter_mut()
            .chain(worker.oneshot_args.iter_mut())
            .chain(worker.watch_paths.iter_mut())
        {
            *arg = expand_env_vars(arg)?;
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(name) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| SettingsError::InvalidOverride {
                name: name.to_string(),
                value: value.clone(),
            })?;
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidOverride {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
