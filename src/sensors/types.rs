//! Sensor identifiers, output records and error types.
//!
//! Defines the closed set of virtual sensors, the bitset that tracks which of
//! them are active, per-sensor tables, and the records delivered upward.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host handle base; handles are numbered from here like the HAL sensor list.
pub const ID_BASE: i32 = 1;
/// Host handle of the physical accelerometer.
pub const HANDLE_ACCELEROMETER: i32 = ID_BASE;
/// Host handle of the calibrated magnetic field sensor.
pub const HANDLE_MAGNETIC_FIELD: i32 = ID_BASE + 1;
/// Host handle of the orientation (azimuth/pitch/roll) sensor.
pub const HANDLE_ORIENTATION: i32 = ID_BASE + 2;
/// Host handle of the gravity sensor.
pub const HANDLE_GRAVITY: i32 = ID_BASE + 8;
/// Host handle of the linear acceleration sensor.
pub const HANDLE_LINEAR_ACCELERATION: i32 = ID_BASE + 9;
/// Host handle of the uncalibrated magnetic field sensor.
pub const HANDLE_UNCALIB_MAGNETIC_FIELD: i32 = ID_BASE + 14;
/// Host handle of the geomagnetic rotation vector.
pub const HANDLE_GEOMAG_ROTATION_VECTOR: i32 = ID_BASE + 15;
/// Host handle shared by the publish-only fusion feeds.
pub const HANDLE_SENSOR_FUSION: i32 = ID_BASE + 16;
/// Host handle of the synthesized gyroscope.
pub const HANDLE_VIRTUAL_GYROSCOPE: i32 = ID_BASE + 17;

/// Identifies one logical output of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualSensorId {
    /// Hard-iron compensated magnetic field (uT)
    Magnetic,
    /// Aligned raw magnetic field plus bias (uT)
    UncalibratedMagnetic,
    /// Azimuth, pitch, roll (degrees)
    Orientation,
    /// Gravity vector (m/s^2)
    Gravity,
    /// Acceleration with gravity removed (m/s^2)
    LinearAcceleration,
    /// Rotation quaternion from accelerometer and magnetometer
    GeomagneticRotationVector,
    /// Angular rate derived from successive orientations (rad/s)
    SynthesizedGyroscope,
    /// Calibrated magnetic vector published for other instances
    FusionMagnetic,
    /// Synthesized angular rate published for other instances
    FusionGyroscope,
}

impl VirtualSensorId {
    /// Number of distinct ids.
    pub const COUNT: usize = 9;

    /// Every id, in table order.
    pub const ALL: [VirtualSensorId; Self::COUNT] = [
        VirtualSensorId::Magnetic,
        VirtualSensorId::UncalibratedMagnetic,
        VirtualSensorId::Orientation,
        VirtualSensorId::Gravity,
        VirtualSensorId::LinearAcceleration,
        VirtualSensorId::GeomagneticRotationVector,
        VirtualSensorId::SynthesizedGyroscope,
        VirtualSensorId::FusionMagnetic,
        VirtualSensorId::FusionGyroscope,
    ];

    /// Position of this id in per-sensor tables and in the enabled bitset.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Host handle addressing this id. Both fusion feeds share one handle.
    pub fn handle(self) -> i32 {
        match self {
            VirtualSensorId::Magnetic => HANDLE_MAGNETIC_FIELD,
            VirtualSensorId::UncalibratedMagnetic => HANDLE_UNCALIB_MAGNETIC_FIELD,
            VirtualSensorId::Orientation => HANDLE_ORIENTATION,
            VirtualSensorId::Gravity => HANDLE_GRAVITY,
            VirtualSensorId::LinearAcceleration => HANDLE_LINEAR_ACCELERATION,
            VirtualSensorId::GeomagneticRotationVector => HANDLE_GEOMAG_ROTATION_VECTOR,
            VirtualSensorId::SynthesizedGyroscope => HANDLE_VIRTUAL_GYROSCOPE,
            VirtualSensorId::FusionMagnetic | VirtualSensorId::FusionGyroscope => {
                HANDLE_SENSOR_FUSION
            }
        }
    }

    /// Publish-only ids feed the cross-sensor buffer and never emit records.
    pub fn is_publish_only(self) -> bool {
        matches!(
            self,
            VirtualSensorId::FusionMagnetic | VirtualSensorId::FusionGyroscope
        )
    }

    /// Ids whose output comes from the geomagnetic fusion engine.
    pub fn is_geomagnetic(self) -> bool {
        matches!(
            self,
            VirtualSensorId::Orientation
                | VirtualSensorId::Gravity
                | VirtualSensorId::LinearAcceleration
                | VirtualSensorId::GeomagneticRotationVector
        )
    }

    /// Ids served by a magnetic-family instance.
    pub fn is_magnetic_family(self) -> bool {
        !self.is_gyroscope_family()
    }

    /// Ids served by a gyroscope-family instance.
    pub fn is_gyroscope_family(self) -> bool {
        matches!(
            self,
            VirtualSensorId::SynthesizedGyroscope | VirtualSensorId::FusionGyroscope
        )
    }
}

impl std::fmt::Display for VirtualSensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VirtualSensorId::Magnetic => write!(f, "Magnetic Field"),
            VirtualSensorId::UncalibratedMagnetic => write!(f, "Uncalibrated Magnetic Field"),
            VirtualSensorId::Orientation => write!(f, "Orientation"),
            VirtualSensorId::Gravity => write!(f, "Gravity"),
            VirtualSensorId::LinearAcceleration => write!(f, "Linear Acceleration"),
            VirtualSensorId::GeomagneticRotationVector => write!(f, "Geomagnetic Rotation Vector"),
            VirtualSensorId::SynthesizedGyroscope => write!(f, "Virtual Gyroscope"),
            VirtualSensorId::FusionMagnetic => write!(f, "Fusion Magnetic Feed"),
            VirtualSensorId::FusionGyroscope => write!(f, "Fusion Gyroscope Feed"),
        }
    }
}

/// Bitset over [`VirtualSensorId`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnabledMask(u16);

impl EnabledMask {
    /// Mask with no bit set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Mask with every id set.
    pub fn all() -> Self {
        Self::from_ids(VirtualSensorId::ALL)
    }

    /// Build a mask from a list of ids.
    pub fn from_ids<I: IntoIterator<Item = VirtualSensorId>>(ids: I) -> Self {
        let mut mask = Self::empty();
        for id in ids {
            mask.insert(id);
        }
        mask
    }

    pub fn insert(&mut self, id: VirtualSensorId) {
        self.0 |= 1 << id.index();
    }

    pub fn remove(&mut self, id: VirtualSensorId) {
        self.0 &= !(1 << id.index());
    }

    pub fn contains(&self, id: VirtualSensorId) -> bool {
        self.0 & (1 << id.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bit pattern, for logging.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Iterate the set ids in table order.
    pub fn iter(&self) -> impl Iterator<Item = VirtualSensorId> + '_ {
        VirtualSensorId::ALL
            .into_iter()
            .filter(move |id| self.contains(*id))
    }

    /// True when any id of `other` is also set here.
    pub fn intersects(&self, other: EnabledMask) -> bool {
        self.0 & other.0 != 0
    }
}

/// Fixed-size table holding one value per [`VirtualSensorId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorTable<T> {
    entries: [T; VirtualSensorId::COUNT],
}

impl<T: Copy + Default> Default for SensorTable<T> {
    fn default() -> Self {
        Self {
            entries: [T::default(); VirtualSensorId::COUNT],
        }
    }
}

impl<T: Copy> SensorTable<T> {
    pub fn get(&self, id: VirtualSensorId) -> T {
        self.entries[id.index()]
    }

    pub fn set(&mut self, id: VirtualSensorId, value: T) {
        self.entries[id.index()] = value;
    }

    /// Iterate `(id, value)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtualSensorId, T)> + '_ {
        VirtualSensorId::ALL
            .into_iter()
            .map(move |id| (id, self.entries[id.index()]))
    }
}

/// Requested period per virtual sensor in milliseconds; 0 means not requested.
pub type DelayTable = SensorTable<u64>;

/// Discrete confidence level attached to an output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    /// Value cannot be trusted (default before any calibration)
    #[default]
    Unreliable,
    Low,
    Medium,
    High,
}

impl Accuracy {
    /// Convert an engine accuracy level (0..=3); anything else is unreliable.
    pub fn from_level(level: i32) -> Self {
        match level {
            1 => Accuracy::Low,
            2 => Accuracy::Medium,
            3 => Accuracy::High,
            _ => Accuracy::Unreliable,
        }
    }

    pub fn level(self) -> i32 {
        match self {
            Accuracy::Unreliable => 0,
            Accuracy::Low => 1,
            Accuracy::Medium => 2,
            Accuracy::High => 3,
        }
    }
}

impl std::fmt::Display for Accuracy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accuracy::Unreliable => write!(f, "Unreliable"),
            Accuracy::Low => write!(f, "Low"),
            Accuracy::Medium => write!(f, "Medium"),
            Accuracy::High => write!(f, "High"),
        }
    }
}

/// Data carried by an [`OutputRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Payload {
    /// Plain 3-axis vector
    Vector { value: Vec3 },
    /// Raw aligned vector and the bias that calibration would remove
    Uncalibrated { uncalibrated: Vec3, bias: Vec3 },
    /// Azimuth, pitch, roll in degrees
    Angles { azimuth: f32, pitch: f32, roll: f32 },
    /// Unit rotation quaternion; heading accuracy is `None` when unknown
    RotationVector {
        rotation: Quat,
        heading_accuracy: Option<f32>,
    },
}

impl Payload {
    pub fn vector(value: Vec3) -> Self {
        Payload::Vector { value }
    }
}

/// Output of one numerical step, before it is stamped and addressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub accuracy: Accuracy,
    pub payload: Payload,
}

impl Reading {
    pub fn new(accuracy: Accuracy, payload: Payload) -> Self {
        Self { accuracy, payload }
    }
}

/// The externally delivered unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Timestamp of the synchronized sample (ns)
    pub timestamp_ns: i64,
    /// Virtual sensor that produced this record
    pub sensor: VirtualSensorId,
    /// Data quality tag
    pub accuracy: Accuracy,
    /// Output value
    pub payload: Payload,
}

/// Errors surfaced by the pipeline to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// Zero output capacity or another malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle or id that this instance does not serve
    #[error("Unknown sensor target: {0}")]
    UnknownTarget(i32),

    /// Raw source missing or unopenable
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Raw read or control write failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Call made after the instance and its dependents were torn down
    #[error("State inconsistency: {0}")]
    StateInconsistency(String),
}

impl SensorError {
    /// Negative status code for the host framework.
    pub fn errno(&self) -> i32 {
        match self {
            SensorError::InvalidArgument(_) | SensorError::UnknownTarget(_) => -22,
            SensorError::HardwareUnavailable(_) => -19,
            SensorError::Io(_) => -5,
            SensorError::StateInconsistency(_) => -77,
        }
    }
}

/// Failure reported by a numerical engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Insufficient history; try again next cycle
    #[error("Engine not ready")]
    NotReady,
}
