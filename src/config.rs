/// Layered configuration for the storefront client
///
/// Sources, lowest priority first:
/// - built-in defaults (the serde `default` functions below)
/// - `config/storefront.toml` (optional)
/// - environment variables, e.g. `STOREFRONT__OPTIMIZER__MAX_WIDTH=800`

use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const APP_DIR: &str = "storefront";

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorefrontConfig {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl StorefrontConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg: StorefrontConfig = Config::builder()
            .add_source(File::with_name("config/storefront").required(false))
            .add_source(Environment::with_prefix("STOREFRONT").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.optimizer.validate()?;
        Ok(cfg)
    }
}

// ========== Image optimizer ==========

/// Size and quality policy for uploaded product photos
///
/// Three tiers: anything above `reject_size` is refused without decoding,
/// anything at or below `target_size` passes through untouched, everything
/// in between is resized to `max_width` and re-encoded at `quality`. The
/// result must fit in `max_file_size`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Hard cap for the optimized output, in bytes. Default: 1 MiB.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Inputs above this are rejected outright. Default: 2 MiB.
    #[serde(default = "default_reject_size")]
    pub reject_size: u64,
    /// Inputs at or below this are returned unchanged. Default: 500 KiB.
    #[serde(default = "default_target_size")]
    pub target_size: u64,
    /// Maximum output width in pixels. Default: 1200.
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Lossy encoder quality in (0, 1]. Default: 0.7.
    #[serde(default = "default_quality")]
    pub quality: f32,
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_reject_size() -> u64 {
    2 * default_max_file_size()
}
fn default_target_size() -> u64 {
    500 * 1024
}
fn default_max_width() -> u32 {
    1200
}
fn default_quality() -> f32 {
    0.7
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            reject_size: default_reject_size(),
            target_size: default_target_size(),
            max_width: default_max_width(),
            quality: default_quality(),
        }
    }
}

impl OptimizerConfig {
    /// Reject combinations that would make the tiers overlap
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_width == 0 {
            return Err(ConfigError::Message("optimizer.max_width must be positive".into()));
        }
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            return Err(ConfigError::Message(format!(
                "optimizer.quality must be in (0, 1], got {}",
                self.quality
            )));
        }
        if self.target_size > self.reject_size {
            return Err(ConfigError::Message(format!(
                "optimizer.target_size ({}) exceeds optimizer.reject_size ({})",
                self.target_size, self.reject_size
            )));
        }
        Ok(())
    }

    /// Quality mapped onto the JPEG encoder's 1..=100 scale
    pub fn jpeg_quality(&self) -> u8 {
        (self.quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

// ========== Storage ==========

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory holding uploaded objects. Default: `<data dir>/storefront/storage`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Bucket name, part of every public URL. Default: "products".
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Base of public object URLs. Default: "http://localhost:54321/storage/v1/object/public".
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Shown for products without an image. Default: "assets/no-image.png".
    #[serde(default = "default_placeholder_url")]
    pub placeholder_url: String,
    /// Largest object the store accepts, in bytes. Default: 5 MiB.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

fn default_bucket() -> String {
    "products".into()
}
fn default_public_base_url() -> String {
    "http://localhost:54321/storage/v1/object/public".into()
}
fn default_placeholder_url() -> String {
    "assets/no-image.png".into()
}
fn default_max_object_size() -> u64 {
    5 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            bucket: default_bucket(),
            public_base_url: default_public_base_url(),
            placeholder_url: default_placeholder_url(),
            max_object_size: default_max_object_size(),
        }
    }
}

impl StorageConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| app_data_dir().join("storage"))
    }
}

// ========== Database ==========

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct DatabaseConfig {
    /// SQLite file. Default: `<data dir>/storefront/catalog.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Get the path where the database should be stored
    ///
    /// - Linux: ~/.local/share/storefront/catalog.db
    /// - macOS: ~/Library/Application Support/storefront/catalog.db
    /// - Windows: %APPDATA%\storefront\catalog.db
    pub fn db_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| app_data_dir().join("catalog.db"))
    }
}

// ========== Sync ==========

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Buffered change events per subscriber before it lags. Default: 64.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
