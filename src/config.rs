//! Configuration management for the sound dose tracker
//!
//! Runtime configuration is loaded from a JSON file so thresholds, the dose
//! window and the processor calibration can be adjusted without rebuilding.
//! Missing or malformed files fall back to defaults with a warning.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::DoseError;
use crate::mel::CSD_WINDOW_SECONDS;

/// Default RS2 value in dBA as defined in IEC 62368-1 3rd edition.
pub const DEFAULT_RS2_VALUE: f32 = 100.0;
/// Lowest accepted RS2 value in dBA.
pub const MIN_RS2_VALUE: f32 = 80.0;
/// Highest accepted RS2 value in dBA.
pub const MAX_RS2_VALUE: f32 = 100.0;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "SOUND_DOSE_CONFIG";

/// Complete tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoseConfig {
    /// Momentary exposure warning threshold in dBA, [80, 100]
    pub rs2_value: f32,
    /// Length of the rolling CSD window in seconds
    pub csd_window_secs: i64,
    /// Compute MEL values with this crate's processors
    pub use_framework_mel: bool,
    /// Count every device's exposure instead of only the loudest
    pub compute_csd_on_all_devices: bool,
    pub processor: ProcessorConfig,
    pub http: HttpConfig,
}

/// MEL processor calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Level in dBA reached by a 0 dBFS signal at the listener's ear
    pub dbfs_to_dba_offset: f32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            dbfs_to_dba_offset: 110.0,
        }
    }
}

/// HTTP control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Token required by HTTP consumers
    pub token: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8_788,
            token: "sound-dose".to_string(),
        }
    }
}

impl Default for DoseConfig {
    fn default() -> Self {
        Self {
            rs2_value: DEFAULT_RS2_VALUE,
            csd_window_secs: CSD_WINDOW_SECONDS,
            use_framework_mel: true,
            compute_csd_on_all_devices: false,
            processor: ProcessorConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Check an RS2 value against the inclusive [80, 100] dBA range.
pub fn validate_rs2(value: f32) -> Result<f32, DoseError> {
    if (MIN_RS2_VALUE..=MAX_RS2_VALUE).contains(&value) {
        Ok(value)
    } else {
        Err(DoseError::InvalidArgument { value })
    }
}

impl DoseConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(contents: &str) -> Result<Self, DoseError> {
        let config: DoseConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tracker cannot run with.
    pub fn validate(&self) -> Result<(), DoseError> {
        validate_rs2(self.rs2_value)?;
        if self.csd_window_secs <= 0 {
            return Err(DoseError::ConfigInvalid {
                reason: format!(
                    "csd_window_secs must be positive (got {})",
                    self.csd_window_secs
                ),
            });
        }
        if !self.processor.dbfs_to_dba_offset.is_finite() {
            return Err(DoseError::ConfigInvalid {
                reason: "processor.dbfs_to_dba_offset must be finite".to_string(),
            });
        }
        Ok(())
    }

    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The loaded configuration, or defaults if the file is missing, is not
    /// valid JSON, or fails validation.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Rejected configuration from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load from `$SOUND_DOSE_CONFIG`, or `config/sound_dose.json`.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| "config/sound_dose.json".to_string());
        Self::load_from_file(path)
    }
}
