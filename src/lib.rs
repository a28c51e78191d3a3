//! SensorFuse - virtual sensor fusion and decimation pipeline
//!
//! Turns raw magnetometer and accelerometer streams into a set of
//! independently subscribable virtual sensors (calibrated magnetic field,
//! orientation, gravity, linear acceleration, rotation vector, synthesized
//! gyroscope), each at its own requested rate, from a single physical
//! sampling period per device.

pub mod config;
pub mod sensors;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use sensors::buffer::CrossSensorBuffer;
pub use sensors::gyro::GyroInstance;
pub use sensors::magnetic::MagneticInstance;
pub use sensors::types::{OutputRecord, SensorError, VirtualSensorId};
pub use sensors::{SharedSensor, VirtualSensor};
