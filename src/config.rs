use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::classifier::ClassifierConfig;
use crate::error::ConfigError;
use crate::filters::{AltitudeConfig, AttitudeConfig};
use crate::history::DEFAULT_HISTORY_CAPACITY;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// Nearest-time join tolerance [s]
    pub tolerance: f64,
    /// Samples kept per sensor history
    pub history_capacity: usize,
    /// User equivalent range error used for `pos_error = hdop * h_uere` [m]
    pub h_uere: f64,
    /// Hostname for fixes that carry none
    pub hostname: Option<String>,
    pub read_cpu_temperature: bool,
    pub thermal_zone: PathBuf,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.08,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            h_uere: 15.0,
            hostname: None,
            read_cpu_temperature: true,
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the JSON-lines live store
    pub live_dir: PathBuf,
    /// Directory of the archive files
    pub archive_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            live_dir: PathBuf::from("tracking_live"),
            archive_dir: PathBuf::from("logs_json"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub merger: MergerConfig,
    pub classifier: ClassifierConfig,
    pub altitude: AltitudeConfig,
    pub attitude: AttitudeConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}
