use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{MarkerDefaults, DEFAULT_MARKER_DESCRIPTION, DEFAULT_MARKER_TITLE};
use crate::intake::{ImageIntake, MAX_IMAGE_BYTES};
use crate::proximity::DEFAULT_THRESHOLD_M;
use crate::storage::StoreConfig;

/// Contents of `maplab.toml`. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MaplabConfig {
    pub database: DatabaseSection,
    pub markers: MarkersSection,
    pub images: ImagesSection,
    pub proximity: ProximitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: String,
    /// SQLite busy timeout
    pub connection_timeout_ms: u64,
    /// How long one transaction attempt waits for the connection
    pub transaction_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub log_statements: bool,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            path: default_database_path().display().to_string(),
            connection_timeout_ms: store.connection_timeout.as_millis() as u64,
            transaction_timeout_ms: store.transaction_timeout.as_millis() as u64,
            max_retry_attempts: store.max_retry_attempts,
            retry_base_delay_ms: store.retry_base_delay.as_millis() as u64,
            log_statements: store.log_statements,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarkersSection {
    pub default_title: String,
    pub default_description: String,
}

impl Default for MarkersSection {
    fn default() -> Self {
        Self {
            default_title: DEFAULT_MARKER_TITLE.to_string(),
            default_description: DEFAULT_MARKER_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagesSection {
    pub max_size_bytes: u64,
}

impl Default for ImagesSection {
    fn default() -> Self {
        Self {
            max_size_bytes: MAX_IMAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProximitySection {
    pub threshold_meters: f64,
}

impl Default for ProximitySection {
    fn default() -> Self {
        Self {
            threshold_meters: DEFAULT_THRESHOLD_M,
        }
    }
}

impl MaplabConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            connection_timeout: Duration::from_millis(self.database.connection_timeout_ms),
            transaction_timeout: Duration::from_millis(self.database.transaction_timeout_ms),
            max_retry_attempts: self.database.max_retry_attempts,
            retry_base_delay: Duration::from_millis(self.database.retry_base_delay_ms),
            log_statements: self.database.log_statements,
        }
    }

    pub fn marker_defaults(&self) -> MarkerDefaults {
        MarkerDefaults {
            title: self.markers.default_title.clone(),
            description: self.markers.default_description.clone(),
        }
    }

    pub fn image_intake(&self) -> ImageIntake {
        ImageIntake::new(self.images.max_size_bytes)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("maplab.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from("maplab.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<MaplabConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: MaplabConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &MaplabConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
