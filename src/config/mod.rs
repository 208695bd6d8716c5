//! Configuration management for IronPress

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IronPressError, Result};

pub mod options;
pub mod profiles;

pub use options::*;
pub use profiles::*;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool and ingestion limits
    pub engine: EngineConfig,

    /// Thumbnail cache settings
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Options used when no profile is selected
    pub defaults: OptimizationOptions,

    /// Named option presets
    pub profiles: HashMap<String, OptimizationOptions>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            defaults: OptimizationOptions::default(),
            profiles: Profiles::all(),
        }
    }
}

/// Batch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads (None = one per logical core)
    pub workers: Option<usize>,

    /// Downgrade lossless+jpeg to best_quality instead of rejecting the batch
    pub auto_correct_lossless_jpeg: bool,

    /// Maximum number of files accepted by one ingestion
    pub max_files: usize,

    /// Maximum file size to ingest (in bytes)
    pub max_file_size: u64,

    /// Maximum path length in bytes
    pub max_path_length: usize,

    /// Directory recursion depth during ingestion
    pub max_scan_depth: usize,

    /// Files larger than this are memory-mapped instead of read
    pub mmap_threshold: u64,

    /// Maximum width or height accepted by the decoder
    pub max_dimension: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            auto_correct_lossless_jpeg: false,
            max_files: 10_000,
            max_file_size: 1024 * 1024 * 1024, // 1GB
            max_path_length: 4096,
            max_scan_depth: 10,
            mmap_threshold: 100 * 1024 * 1024, // 100MB
            max_dimension: 16_384,
        }
    }
}

impl EngineConfig {
    /// Resolved worker pool size
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Thumbnail cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Generate previews during ingestion
    pub enabled: bool,

    /// Cache directory (None = `<temp>/ironpress-thumbnails`)
    pub directory: Option<PathBuf>,

    /// Entries older than this are evicted when the cache is opened
    pub retention_days: u64,

    /// Longest side of a generated preview
    pub thumbnail_size: u32,

    /// WebP quality of generated previews
    pub thumbnail_quality: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            retention_days: 7,
            thumbnail_size: 150,
            thumbnail_quality: 60,
        }
    }
}

impl CacheConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("ironpress-thumbnails"))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON logging
    pub json_format: bool,

    /// Log file path (None = stderr)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            IronPressError::config(format!(
                "Failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        let extension = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        match extension.to_lowercase().as_str() {
            "toml" => toml::from_str(&content).map_err(Into::into),
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(Into::into),
            _ => Err(IronPressError::config(
                "Unsupported config file format. Use .toml or .yaml",
            )),
        }
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let content = match extension.to_lowercase().as_str() {
            "toml" => toml::to_string_pretty(self).map_err(|e| {
                IronPressError::config(format!("TOML serialization failed: {e}"))
            })?,
            "yaml" | "yml" => serde_yaml::to_string(self).map_err(|e| {
                IronPressError::config(format!("YAML serialization failed: {e}"))
            })?,
            _ => {
                return Err(IronPressError::config(
                    "Unsupported config file format. Use .toml or .yaml",
                ))
            }
        };

        std::fs::write(&path, content).map_err(|e| {
            IronPressError::config(format!(
                "Failed to write config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        Ok(())
    }

    /// Get a named option preset
    pub fn get_profile(&self, name: &str) -> Result<&OptimizationOptions> {
        self.profiles.get(name).ok_or_else(|| {
            let mut available: Vec<_> = self.profiles.keys().collect();
            available.sort();
            IronPressError::config(format!(
                "Profile '{name}' not found. Available profiles: {available:?}"
            ))
        })
    }

    /// Pick the options for a batch: a named profile or the defaults,
    /// auto-corrected when the engine is configured to do so
    pub fn resolve_options(&self, profile: Option<&str>) -> Result<OptimizationOptions> {
        let options = match profile {
            Some(name) => self.get_profile(name)?.clone(),
            None => self.defaults.clone(),
        };

        if self.engine.auto_correct_lossless_jpeg {
            Ok(options.corrected())
        } else {
            Ok(options)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.engine.workers {
            return Err(IronPressError::config("Worker count must be greater than 0"));
        }

        if self.engine.max_files == 0 {
            return Err(IronPressError::config("max_files must be greater than 0"));
        }

        if self.cache.thumbnail_size == 0 {
            return Err(IronPressError::config(
                "Thumbnail size must be greater than 0",
            ));
        }

        if self.cache.thumbnail_quality == 0 || self.cache.thumbnail_quality > 100 {
            return Err(IronPressError::config(
                "Thumbnail quality must be between 1 and 100",
            ));
        }

        // Destination folders are checked at dispatch time, they may not exist yet
        for (name, profile) in &self.profiles {
            let mut profile = profile.clone();
            profile.destination = Destination::SameFolder;
            if self.engine.auto_correct_lossless_jpeg {
                profile = profile.corrected();
            }
            profile.validate().map_err(|e| {
                IronPressError::config(format!("Invalid profile '{name}': {e}"))
            })?;
        }

        Ok(())
    }

    /// Merge with another configuration (other takes precedence)
    pub fn merge(mut self, other: Config) -> Self {
        self.profiles.extend(other.profiles);

        if other.engine.workers.is_some() {
            self.engine.workers = other.engine.workers;
        }
        if other.cache.directory.is_some() {
            self.cache.directory = other.cache.directory;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.profiles.contains_key("web"));
        assert!(config.profiles.contains_key("archive"));
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.retention(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.engine.workers = Some(6);
        config.cache.retention_days = 3;
        config.logging.json_format = true;
        config.profiles.insert(
            "thumbs".to_string(),
            OptimizationOptions::new().resize(ResizePreset::Custom { width: 320, height: 200 }),
        );

        for name in ["ironpress.toml", "ironpress.yaml", "ironpress.yml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();

            let loaded = Config::from_file(&path).unwrap();
            assert_eq!(loaded.engine.workers, Some(6), "{name}");
            assert_eq!(loaded.cache.retention(), Duration::from_secs(3 * 86_400));
            assert!(loaded.logging.json_format);
            assert_eq!(
                loaded.get_profile("thumbs").unwrap().resize_preset,
                ResizePreset::Custom { width: 320, height: 200 }
            );
        }
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ironpress.ini");
        assert!(Config::default().to_file(&path).is_err());

        std::fs::write(&path, "[engine]\n").unwrap();
        assert!(matches!(
            Config::from_file(&path).unwrap_err(),
            IronPressError::ConfigError { .. }
        ));
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            workers = 3

            [defaults]
            output_format = "jpeg"
            compression_profile = "smallest"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.worker_count(), 3);
        assert_eq!(config.engine.max_files, 10_000);
        assert_eq!(config.defaults.output_format, OutputFormat::Jpeg);
        assert_eq!(config.cache.thumbnail_size, 150);
    }

    #[test]
    fn test_profile_lookup() {
        let config = Config::default();
        assert_eq!(config.get_profile("email").unwrap(), &Profiles::email());
        assert!(matches!(
            config.get_profile("poster"),
            Err(IronPressError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_resolve_options_auto_correct() {
        let mut config = Config::default();
        config.defaults = OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .profile(CompressionProfile::Lossless);

        assert!(config.resolve_options(None).unwrap().validate().is_err());

        config.engine.auto_correct_lossless_jpeg = true;
        let resolved = config.resolve_options(None).unwrap();
        assert_eq!(resolved.compression_profile, CompressionProfile::BestQuality);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let mut config = Config::default();
        config.profiles.insert(
            "broken".to_string(),
            OptimizationOptions::new()
                .format(OutputFormat::Jpeg)
                .profile(CompressionProfile::Lossless),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge() {
        let mut other = Config::default();
        other.engine.workers = Some(2);
        other.profiles.clear();
        other.profiles.insert("tiny".to_string(), Profiles::email());

        let merged = Config::default().merge(other);
        assert_eq!(merged.engine.workers, Some(2));
        assert!(merged.profiles.contains_key("tiny"));
        assert!(merged.profiles.contains_key("web"));
    }
}
