//! Pipeline configuration.
//!
//! Selects which virtual sensors each instance serves, the per-device axis
//! conversion and alignment, and the fixed rates of the calibration and
//! fusion loops. Loaded from TOML; every section has working defaults.

use crate::sensors::types::VirtualSensorId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Unit conversion and board alignment for one physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Raw count to physical unit factor, per axis
    pub conversion: [f32; 3],
    /// Alignment matrix; `alignment[j][i]` weights raw axis `j` into axis `i`
    pub alignment: [[f32; 3]; 3],
}

impl AxisConfig {
    pub fn uniform(factor: f32) -> Self {
        Self {
            conversion: [factor; 3],
            alignment: IDENTITY,
        }
    }
}

/// Magnetic-family instance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagneticConfig {
    /// Virtual sensors this instance serves
    pub active: Vec<VirtualSensorId>,
    /// Magnetometer axes; the default converts mGauss to uT
    pub axes: AxisConfig,
    /// Run hard-iron calibration against the accelerometer
    pub calibration_enabled: bool,
    /// Minimum rate of the calibration loop (Hz)
    pub calibration_frequency_hz: u32,
    /// Minimum rate of the geomagnetic fusion loop (Hz)
    pub geomag_frequency_hz: u32,
    /// Full scale programmed when the stream comes up (gauss)
    pub default_full_scale: u32,
}

impl Default for MagneticConfig {
    fn default() -> Self {
        Self {
            active: vec![
                VirtualSensorId::Magnetic,
                VirtualSensorId::UncalibratedMagnetic,
                VirtualSensorId::Orientation,
                VirtualSensorId::Gravity,
                VirtualSensorId::LinearAcceleration,
                VirtualSensorId::GeomagneticRotationVector,
                VirtualSensorId::FusionMagnetic,
            ],
            axes: AxisConfig::uniform(0.1),
            calibration_enabled: true,
            calibration_frequency_hz: 25,
            geomag_frequency_hz: 50,
            default_full_scale: 4,
        }
    }
}

/// Accelerometer reference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Accelerometer axes; the default converts mg to m/s^2
    pub axes: AxisConfig,
    /// Full scale programmed when the stream comes up (g)
    pub default_full_scale: u32,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            axes: AxisConfig::uniform(9.80665e-3),
            default_full_scale: 4,
        }
    }
}

/// Gyroscope-family instance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroConfig {
    /// Virtual sensors this instance serves
    pub active: Vec<VirtualSensorId>,
    /// Slowest period requested from the inner magnetic and accelerometer
    /// instances (ms)
    pub default_delay_ms: u64,
    /// Synchronization markers skipped after the stream comes up
    pub startup_samples_to_discard: u32,
    /// Nominal full scale (dps)
    pub default_full_scale: u32,
}

impl Default for GyroConfig {
    fn default() -> Self {
        Self {
            active: vec![
                VirtualSensorId::SynthesizedGyroscope,
                VirtualSensorId::FusionGyroscope,
            ],
            default_delay_ms: 20,
            startup_samples_to_discard: 5,
            default_full_scale: 2000,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub magnetic: MagneticConfig,
    pub accel: AccelConfig,
    pub gyro: GyroConfig,
}

impl PipelineConfig {
    /// Check the settings before any instance is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.magnetic.active.is_empty() && self.gyro.active.is_empty() {
            return Err(ConfigError::Invalid("no virtual sensor is active".into()));
        }
        if let Some(id) = self.magnetic.active.iter().find(|id| !id.is_magnetic_family()) {
            return Err(ConfigError::Invalid(format!(
                "{} cannot be served by the magnetic instance",
                id
            )));
        }
        if let Some(id) = self.gyro.active.iter().find(|id| !id.is_gyroscope_family()) {
            return Err(ConfigError::Invalid(format!(
                "{} cannot be served by the gyroscope instance",
                id
            )));
        }
        if self.magnetic.calibration_frequency_hz == 0 || self.magnetic.geomag_frequency_hz == 0 {
            return Err(ConfigError::Invalid("loop frequencies must be positive".into()));
        }
        if self.gyro.default_delay_ms == 0 {
            return Err(ConfigError::Invalid("gyroscope default delay must be positive".into()));
        }
        if self.magnetic.default_full_scale == 0
            || self.accel.default_full_scale == 0
            || self.gyro.default_full_scale == 0
        {
            return Err(ConfigError::Invalid("full scale must be positive".into()));
        }
        Ok(())
    }
}

/// Get the directory holding the configuration file.
pub fn get_config_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "sensorfuse", "SensorFuse")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    get_config_dir().join("pipeline.toml")
}

/// Load and validate configuration from `path`.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let config: PipelineConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;
    Ok(config)
}

/// Load from `path`, or defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("No configuration at {}, using defaults", path.display());
        return Ok(PipelineConfig::default());
    }
    load_config(path)
}

/// Save configuration to `path`.
pub fn save_config(path: &Path, config: &PipelineConfig) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
