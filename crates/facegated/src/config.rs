use facegate_core::{ConfigError, PipelineConfig};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Optional TOML file with pipeline tuning.
    pub config_path: Option<PathBuf>,
    /// Overrides `matching.threshold` from the config file.
    pub match_threshold: Option<f32>,
    /// Base directory for relative frame image paths.
    pub frame_dir: Option<PathBuf>,
    /// Whether to register the control service on the session bus.
    pub dbus_enabled: bool,
    /// Frames that may wait for the engine before the reader blocks.
    pub queue_depth: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_db_path());

        Self {
            db_path,
            config_path: std::env::var("FACEGATE_CONFIG").ok().map(PathBuf::from),
            match_threshold: std::env::var("FACEGATE_MATCH_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok()),
            frame_dir: std::env::var("FACEGATE_FRAME_DIR").ok().map(PathBuf::from),
            dbus_enabled: std::env::var("FACEGATE_DBUS")
                .map(|v| v != "0")
                .unwrap_or(true),
            queue_depth: env_usize("FACEGATE_QUEUE_DEPTH", 8).max(1),
        }
    }

    /// Pipeline tuning from the config file (or defaults) with env overrides applied.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(threshold) = self.match_threshold {
            config.matching.threshold = threshold;
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
