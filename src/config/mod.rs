//! Configuration module for askbridge.
//!
//! Handles the config file, environment variable expansion, and overrides.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, LoggingSettings, MetricsSettings, QueueSettings, Settings,
    SettingsError, WorkerSettings,
};
