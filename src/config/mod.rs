//! Configuration management for DeskStream
//!
//! This module handles application configuration including:
//! - Loading and saving configuration files
//! - Managing configuration directory
//! - Providing sensible defaults
//! - Configuration validation

use crate::desktop::encoder::{
    DEFAULT_DELTA_LEVEL, DEFAULT_KEYFRAME_LEVEL, DEFAULT_QUANTIZATION_STEP,
};
use crate::desktop::types::{
    DEFAULT_FPS, DEFAULT_QUALITY, DEFAULT_SCALE, DELTA_QUALITY_CEILING, MAX_FPS, MAX_SCALE,
    MIN_FPS, MIN_SCALE,
};
use crate::error::{ConfigError, ConfigResult};
use crate::logging::LogLevel;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// Constants for configuration (avoiding magic numbers)
const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_KEYFRAME_INTERVAL: u64 = 30;
const DEFAULT_MOTION_THRESHOLD: f64 = 0.015;
const DEFAULT_QUEUE_CAPACITY: usize = 2;
const DEFAULT_CAPTURE_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_LAG_SOFT_LIMIT_MS: u64 = 100;
const DEFAULT_LAG_HARD_LIMIT_MS: u64 = 200;
const DEFAULT_LAGGING_QUALITY_CAP: u8 = 70;
const DEFAULT_LAG_SMOOTHING: f64 = 1.0;
const DEFAULT_CLIENT_STALE_AFTER_SECS: u64 = 10;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture loop configuration
    pub stream: StreamConfig,

    /// Lag-driven quality adaptation
    pub adaptation: AdaptationConfig,

    /// Compression configuration
    pub compression: CompressionConfig,

    /// Screen source configuration
    pub capture: CaptureConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Capture loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Initial target frame rate (1-30)
    pub target_fps: u8,

    /// Initial capture scale (0.1-1.0)
    pub scale: f32,

    /// Quality requested before adaptation (1-100)
    pub base_quality: u8,

    /// Quality ceiling for delta frames (1-100)
    pub delta_quality_ceiling: u8,

    /// Force a keyframe every N cycles
    pub keyframe_interval: u64,

    /// Dissimilarity above which a changed frame is sent (0-1)
    pub motion_threshold: f64,

    /// Outgoing queue capacity
    pub queue_capacity: usize,

    /// Backoff after a failed capture in milliseconds
    pub capture_retry_delay_ms: u64,
}

/// Lag-driven quality adaptation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Lag above which quality is capped
    pub lag_soft_limit_ms: u64,

    /// Lag above which frames are dropped
    pub lag_hard_limit_ms: u64,

    /// Quality cap while lagging
    pub lagging_quality_cap: u8,

    /// Weight of the newest lag sample (0-1, 1 = latest sample only)
    pub lag_smoothing: f64,

    /// Forget a viewer after this many seconds without a heartbeat
    pub client_stale_after_secs: u64,
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd level for keyframes
    pub keyframe_level: i32,

    /// zstd level for delta frames
    pub delta_level: i32,

    /// Per-channel quantization stride for delta frames
    pub quantization_step: u8,
}

/// Screen source configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Display to capture (None = primary)
    pub display_index: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset
    pub level: LogLevel,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_FPS,
            scale: DEFAULT_SCALE,
            base_quality: DEFAULT_QUALITY,
            delta_quality_ceiling: DELTA_QUALITY_CEILING,
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            capture_retry_delay_ms: DEFAULT_CAPTURE_RETRY_DELAY_MS,
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            lag_soft_limit_ms: DEFAULT_LAG_SOFT_LIMIT_MS,
            lag_hard_limit_ms: DEFAULT_LAG_HARD_LIMIT_MS,
            lagging_quality_cap: DEFAULT_LAGGING_QUALITY_CAP,
            lag_smoothing: DEFAULT_LAG_SMOOTHING,
            client_stale_after_secs: DEFAULT_CLIENT_STALE_AFTER_SECS,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            keyframe_level: DEFAULT_KEYFRAME_LEVEL,
            delta_level: DEFAULT_DELTA_LEVEL,
            quantization_step: DEFAULT_QUANTIZATION_STEP,
        }
    }
}

impl Config {
    /// Validates configuration values
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> ConfigResult<()> {
        let stream = &self.stream;

        if !(MIN_FPS..=MAX_FPS).contains(&stream.target_fps) {
            return Err(ConfigError::InvalidValue(format!(
                "FPS must be between {} and {}",
                MIN_FPS, MAX_FPS
            )));
        }

        if !(MIN_SCALE..=MAX_SCALE).contains(&stream.scale) {
            return Err(ConfigError::InvalidValue(format!(
                "Scale must be between {} and {}",
                MIN_SCALE, MAX_SCALE
            )));
        }

        for (name, quality) in [
            ("Base quality", stream.base_quality),
            ("Delta quality ceiling", stream.delta_quality_ceiling),
            ("Lagging quality cap", self.adaptation.lagging_quality_cap),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be between 1 and 100",
                    name
                )));
            }
        }

        if stream.keyframe_interval == 0 {
            return Err(ConfigError::InvalidValue(
                "Keyframe interval must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&stream.motion_threshold) {
            return Err(ConfigError::InvalidValue(
                "Motion threshold must be between 0 and 1".to_string(),
            ));
        }

        if stream.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "Queue capacity must be at least 1".to_string(),
            ));
        }

        if self.adaptation.lag_soft_limit_ms > self.adaptation.lag_hard_limit_ms {
            return Err(ConfigError::InvalidValue(
                "Soft lag limit must not exceed the hard lag limit".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.adaptation.lag_smoothing)
            || self.adaptation.lag_smoothing == 0.0
        {
            return Err(ConfigError::InvalidValue(
                "Lag smoothing must be in (0, 1]".to_string(),
            ));
        }

        // Validate compression levels (1-22 for zstd)
        for level in [self.compression.keyframe_level, self.compression.delta_level] {
            if !(1..=22).contains(&level) {
                return Err(ConfigError::InvalidValue(
                    "Compression level must be between 1 and 22".to_string(),
                ));
            }
        }

        if self.compression.quantization_step == 0 {
            return Err(ConfigError::InvalidValue(
                "Quantization step must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager rooted at the platform config directory
    ///
    /// # Errors
    ///
    /// Returns error if project directory cannot be determined
    pub fn new() -> ConfigResult<Self> {
        Ok(Self::with_directory(Self::get_config_directory()?))
    }

    /// Creates a ConfigManager rooted at an explicit directory
    pub fn with_directory(config_dir: impl AsRef<Path>) -> Self {
        let config_dir = config_dir.as_ref().to_path_buf();
        let config_file = config_dir.join(CONFIG_FILE_NAME);
        Self {
            config_dir,
            config_file,
        }
    }

    /// Gets the configuration directory path
    fn get_config_directory() -> ConfigResult<PathBuf> {
        ProjectDirs::from("com", "deskstream", "DeskStream")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::DirectoryNotFound(
                    "Could not determine configuration directory".to_string(),
                )
            })
    }

    /// Ensures the configuration directory exists
    fn ensure_config_directory(&self) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).map_err(|e| {
                ConfigError::DirectoryCreationFailed(format!(
                    "Failed to create config directory at {:?}: {}",
                    self.config_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads configuration from file, or creates default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or created
    pub fn load_or_create_default(&self) -> ConfigResult<Config> {
        self.ensure_config_directory()?;

        if self.config_file.exists() {
            self.load()
        } else {
            let config = Config::default();
            self.save(&config)?;
            Ok(config)
        }
    }

    /// Loads configuration from file
    fn load(&self) -> ConfigResult<Config> {
        let content = fs::read_to_string(&self.config_file).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            ConfigError::LoadFailed(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be saved
    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        self.ensure_config_directory()?;
        config.validate()?;

        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&self.config_file, content).map_err(|e| {
            ConfigError::SaveFailed(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Gets the path to the configuration file
    pub fn config_file(&self) -> &PathBuf {
        &self.config_file
    }

    /// Gets the configuration directory path
    pub fn config_directory(&self) -> &PathBuf {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.target_fps, 30);
        assert_eq!(config.stream.base_quality, 95);
        assert_eq!(config.stream.keyframe_interval, 30);
        assert_eq!(config.stream.queue_capacity, 2);
        assert_eq!(config.adaptation.lagging_quality_cap, 70);
        assert!(config.capture.display_index.is_none());
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compression_defaults_match_encoder() {
        let compression = CompressionConfig::default();
        let encoder = crate::desktop::EncoderSettings::default();
        assert_eq!(compression.keyframe_level, encoder.keyframe_level);
        assert_eq!(compression.delta_level, encoder.delta_level);
        assert_eq!(compression.quantization_step, encoder.quantization_step);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.stream.target_fps = 60;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.scale = 0.05;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.adaptation.lag_soft_limit_ms = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.compression.delta_level = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_log_level_from_file() {
        let config: Config = toml::from_str("[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[stream]\ntarget_fps = 15\n").unwrap();
        assert_eq!(config.stream.target_fps, 15);
        assert_eq!(config.stream.base_quality, 95);
        assert_eq!(config.compression, CompressionConfig::default());
    }

    #[test]
    fn test_load_or_create_default() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(dir.path().join("nested"));

        let created = manager.load_or_create_default().unwrap();
        assert!(manager.config_file().exists());

        let mut changed = created.clone();
        changed.stream.target_fps = 12;
        manager.save(&changed).unwrap();

        let loaded = manager.load_or_create_default().unwrap();
        assert_eq!(loaded.stream.target_fps, 12);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_directory(dir.path());
        fs::write(manager.config_file(), "[stream]\nbase_quality = 0\n").unwrap();

        assert!(matches!(
            manager.load_or_create_default(),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
