//! Numerical engines consumed by the pipeline.
//!
//! The pipeline only depends on the two traits; [`HardIronCalibration`] and
//! [`GeomagneticFusion`] are small reference implementations used by the
//! demo binary and the end-to-end tests.

use crate::sensors::types::{Accuracy, EngineError};
use glam::{Mat3, Quat, Vec3};

/// Standard gravity (m/s^2).
pub const GRAVITY_EARTH: f32 = 9.80665;

/// Stateful hard-iron calibration of the magnetometer.
pub trait CalibrationEngine: Send {
    /// Feed the latest aligned magnetic vector (uT).
    fn save_raw_vector(&mut self, magnetic: Vec3);

    /// Feed the companion accelerometer vector (m/s^2).
    fn save_reference(&mut self, acceleration: Vec3);

    /// Run one calibration step and report the current accuracy.
    fn run(&mut self) -> Accuracy;

    /// Current hard-iron offset to subtract from raw vectors.
    fn offset(&self) -> Vec3;
}

/// Stateful accelerometer + magnetometer fusion.
pub trait FusionEngine: Send {
    /// Advance the filter by `delta_ms` with the latest vectors.
    fn run(&mut self, delta_ms: u32, acceleration: Vec3, magnetic: Vec3);

    /// Azimuth, pitch, roll in degrees.
    fn orientation(&self) -> Result<Vec3, EngineError>;

    fn gravity(&self) -> Result<Vec3, EngineError>;

    fn linear_acceleration(&self) -> Result<Vec3, EngineError>;

    fn rotation_vector(&self) -> Result<Quat, EngineError>;

    /// Angular rate derived from successive orientations (rad/s).
    fn synthesized_angular_rate(&self) -> Result<Vec3, EngineError>;
}

/// Min/max hard-iron estimator.
///
/// The offset is the centre of the box spanned by every accepted sample.
/// Accuracy grows with how much of the expected field sphere the samples
/// cover. Samples taken while the device is being shaken (acceleration far
/// from 1 g) are not accepted.
#[derive(Debug, Clone)]
pub struct HardIronCalibration {
    /// Expected local field strength (uT)
    field_strength: f32,
    /// Samples needed before an offset is reported
    min_samples: usize,
    min: Vec3,
    max: Vec3,
    sample_count: usize,
    pending: Option<Vec3>,
    reference: Vec3,
    offset: Vec3,
    accuracy: Accuracy,
}

impl Default for HardIronCalibration {
    fn default() -> Self {
        Self::new(50.0, 25)
    }
}

impl HardIronCalibration {
    pub fn new(field_strength: f32, min_samples: usize) -> Self {
        Self {
            field_strength,
            min_samples: min_samples.max(1),
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
            sample_count: 0,
            pending: None,
            reference: Vec3::ZERO,
            offset: Vec3::ZERO,
            accuracy: Accuracy::Unreliable,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn device_is_steady(&self) -> bool {
        // No reference yet: nothing to judge by
        if self.reference == Vec3::ZERO {
            return true;
        }
        let g = self.reference.length() / GRAVITY_EARTH;
        (0.5..=1.5).contains(&g)
    }

    fn coverage_accuracy(&self) -> Accuracy {
        let span = self.max - self.min;
        let ratio = span.min_element() / (2.0 * self.field_strength);
        if ratio >= 0.8 {
            Accuracy::High
        } else if ratio >= 0.5 {
            Accuracy::Medium
        } else if ratio >= 0.25 {
            Accuracy::Low
        } else {
            Accuracy::Unreliable
        }
    }
}

impl CalibrationEngine for HardIronCalibration {
    fn save_raw_vector(&mut self, magnetic: Vec3) {
        self.pending = Some(magnetic);
    }

    fn save_reference(&mut self, acceleration: Vec3) {
        self.reference = acceleration;
    }

    fn run(&mut self) -> Accuracy {
        let Some(sample) = self.pending.take() else {
            return self.accuracy;
        };
        if !self.device_is_steady() {
            return self.accuracy;
        }

        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        self.sample_count += 1;

        if self.sample_count >= self.min_samples {
            self.offset = (self.min + self.max) * 0.5;
            self.accuracy = self.coverage_accuracy();
        }
        self.accuracy
    }

    fn offset(&self) -> Vec3 {
        self.offset
    }
}

/// Tilt-compensated compass with a low-pass gravity estimate.
#[derive(Debug, Clone)]
pub struct GeomagneticFusion {
    /// Gravity low-pass time constant (ms)
    time_constant_ms: f32,
    gravity: Option<Vec3>,
    linear: Vec3,
    rotation: Option<Mat3>,
    previous: Option<Quat>,
    angular_rate: Option<Vec3>,
}

impl Default for GeomagneticFusion {
    fn default() -> Self {
        Self::new(200.0)
    }
}

impl GeomagneticFusion {
    pub fn new(time_constant_ms: f32) -> Self {
        Self {
            time_constant_ms: time_constant_ms.max(0.0),
            gravity: None,
            linear: Vec3::ZERO,
            rotation: None,
            previous: None,
            angular_rate: None,
        }
    }

    /// Device-to-world (east, north, up) rotation, rows are the world axes
    /// expressed in device coordinates.
    fn rotation_from(gravity: Vec3, magnetic: Vec3) -> Option<Mat3> {
        let east = magnetic.cross(gravity);
        let norm_east = east.length();
        let norm_gravity = gravity.length();
        if norm_east < 0.1 || norm_gravity < 0.1 {
            return None;
        }
        let east = east / norm_east;
        let up = gravity / norm_gravity;
        let north = up.cross(east);
        Some(Mat3::from_cols(east, north, up).transpose())
    }
}

impl FusionEngine for GeomagneticFusion {
    fn run(&mut self, delta_ms: u32, acceleration: Vec3, magnetic: Vec3) {
        let dt = delta_ms as f32;
        let gravity = match self.gravity {
            None => acceleration,
            Some(g) => {
                let alpha = dt / (self.time_constant_ms + dt).max(f32::EPSILON);
                g + (acceleration - g) * alpha
            }
        };
        self.gravity = Some(gravity);
        self.linear = acceleration - gravity;

        self.rotation = Self::rotation_from(gravity, magnetic);
        let Some(rotation) = self.rotation else {
            self.previous = None;
            self.angular_rate = None;
            return;
        };

        let current = Quat::from_mat3(&rotation.transpose()).normalize();
        if let Some(previous) = self.previous {
            if delta_ms > 0 {
                let delta = (previous.inverse() * current).normalize();
                let (axis, mut angle) = delta.to_axis_angle();
                if angle > std::f32::consts::PI {
                    angle -= std::f32::consts::TAU;
                }
                self.angular_rate = Some(axis * (angle / (dt / 1000.0)));
            }
        }
        self.previous = Some(current);
    }

    fn orientation(&self) -> Result<Vec3, EngineError> {
        let r = self.rotation.ok_or(EngineError::NotReady)?;
        // r.row(i) is world axis i in device coordinates
        let (east, north, up) = (r.row(0), r.row(1), r.row(2));
        let mut azimuth = east.y.atan2(north.y).to_degrees();
        if azimuth < 0.0 {
            azimuth += 360.0;
        }
        let pitch = (-up.y).clamp(-1.0, 1.0).asin().to_degrees();
        let roll = (-up.x).atan2(up.z).to_degrees();
        Ok(Vec3::new(azimuth, pitch, roll))
    }

    fn gravity(&self) -> Result<Vec3, EngineError> {
        self.gravity.ok_or(EngineError::NotReady)
    }

    fn linear_acceleration(&self) -> Result<Vec3, EngineError> {
        self.gravity.map(|_| self.linear).ok_or(EngineError::NotReady)
    }

    fn rotation_vector(&self) -> Result<Quat, EngineError> {
        self.previous.ok_or(EngineError::NotReady)
    }

    fn synthesized_angular_rate(&self) -> Result<Vec3, EngineError> {
        self.angular_rate.ok_or(EngineError::NotReady)
    }
}
