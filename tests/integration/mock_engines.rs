//! Scriptable engines and test rigs.
//!
//! The engines record what the pipeline fed them and answer with fixed
//! values, so tests can switch readiness on and off between read passes.

use glam::{Quat, Vec3};
use sensorfuse::config::{AccelConfig, GyroConfig, MagneticConfig};
use sensorfuse::sensors::accel::AccelInstance;
use sensorfuse::sensors::engine::{CalibrationEngine, FusionEngine};
use sensorfuse::sensors::source::{ChannelSource, SourceFeed};
use sensorfuse::sensors::types::{Accuracy, EngineError};
use sensorfuse::{CrossSensorBuffer, GyroInstance, MagneticInstance, VirtualSensorId};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MS: i64 = 1_000_000;

/// Values the scripted fusion engine reports once ready.
pub const ORIENTATION: Vec3 = Vec3::new(90.0, 0.0, 0.0);
pub const GRAVITY: Vec3 = Vec3::new(0.0, 0.0, 9.80665);
pub const ANGULAR_RATE: Vec3 = Vec3::new(0.0, 0.0, 0.5);

/// Inputs seen and readiness switches of a [`ScriptedFusion`].
#[derive(Debug, Default)]
pub struct FusionScript {
    /// Every getter answers NotReady while false
    pub ready: bool,
    /// Orientation alone answers NotReady while false
    pub orientation_ready: bool,
    /// Delta time of every run (ms)
    pub deltas: Vec<u32>,
    pub last_acceleration: Vec3,
    pub last_magnetic: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct FusionHandle(Arc<Mutex<FusionScript>>);

impl FusionHandle {
    pub fn lock(&self) -> MutexGuard<'_, FusionScript> {
        self.0.lock().unwrap()
    }

    pub fn set_ready(&self, ready: bool) {
        let mut script = self.lock();
        script.ready = ready;
        script.orientation_ready = ready;
    }

    pub fn deltas(&self) -> Vec<u32> {
        self.lock().deltas.clone()
    }
}

pub struct ScriptedFusion {
    script: FusionHandle,
}

impl ScriptedFusion {
    pub fn new() -> (Self, FusionHandle) {
        let script = FusionHandle::default();
        (
            Self {
                script: script.clone(),
            },
            script,
        )
    }

    fn answer<T>(&self, value: T) -> Result<T, EngineError> {
        if self.script.lock().ready {
            Ok(value)
        } else {
            Err(EngineError::NotReady)
        }
    }
}

impl FusionEngine for ScriptedFusion {
    fn run(&mut self, delta_ms: u32, acceleration: Vec3, magnetic: Vec3) {
        let mut script = self.script.lock();
        script.deltas.push(delta_ms);
        script.last_acceleration = acceleration;
        script.last_magnetic = magnetic;
    }

    fn orientation(&self) -> Result<Vec3, EngineError> {
        if !self.script.lock().orientation_ready {
            return Err(EngineError::NotReady);
        }
        self.answer(ORIENTATION)
    }

    fn gravity(&self) -> Result<Vec3, EngineError> {
        self.answer(GRAVITY)
    }

    fn linear_acceleration(&self) -> Result<Vec3, EngineError> {
        self.answer(Vec3::ZERO)
    }

    fn rotation_vector(&self) -> Result<Quat, EngineError> {
        self.answer(Quat::IDENTITY)
    }

    fn synthesized_angular_rate(&self) -> Result<Vec3, EngineError> {
        self.answer(ANGULAR_RATE)
    }
}

/// Calibration with a known offset and accuracy.
pub struct FixedCalibration {
    pub offset: Vec3,
    pub accuracy: Accuracy,
}

impl CalibrationEngine for FixedCalibration {
    fn save_raw_vector(&mut self, _magnetic: Vec3) {}

    fn save_reference(&mut self, _acceleration: Vec3) {}

    fn run(&mut self) -> Accuracy {
        self.accuracy
    }

    fn offset(&self) -> Vec3 {
        self.offset
    }
}

/// Calibration offset used by every rig (uT).
pub const BIAS: Vec3 = Vec3::new(1.0, 2.0, 3.0);

/// Magnetic instance wired to channel sources and scripted engines.
pub struct MagneticRig {
    pub mag: MagneticInstance,
    pub mag_feed: SourceFeed,
    pub acc_feed: SourceFeed,
    pub fusion: FusionHandle,
    pub buffer: Arc<CrossSensorBuffer>,
}

pub fn magnetic_rig(config: MagneticConfig) -> MagneticRig {
    let buffer = Arc::new(CrossSensorBuffer::new());
    magnetic_rig_on(config, buffer, true)
}

pub fn magnetic_rig_on(
    config: MagneticConfig,
    buffer: Arc<CrossSensorBuffer>,
    available: bool,
) -> MagneticRig {
    let (acc_source, acc_feed) = ChannelSource::new("accel", 64);
    let accel = AccelInstance::new(AccelConfig::default(), Box::new(acc_source), buffer.clone());

    let (mag_source, mag_feed) = ChannelSource::new("magn", 64);
    let mag_source = if available {
        mag_source
    } else {
        ChannelSource::unavailable("magn")
    };

    let (fusion, handle) = ScriptedFusion::new();
    let mag = MagneticInstance::new(
        config,
        Box::new(mag_source),
        accel,
        Box::new(FixedCalibration {
            offset: BIAS,
            accuracy: Accuracy::Medium,
        }),
        Box::new(fusion),
        buffer.clone(),
    );
    MagneticRig {
        mag,
        mag_feed,
        acc_feed,
        fusion: handle,
        buffer,
    }
}

/// Virtual gyroscope wired to channel sources and scripted engines. The
/// accelerometer feed belongs to the inner magnetic instance, the only
/// accelerometer in the tree.
pub struct GyroRig {
    pub gyro: GyroInstance,
    pub mag_feed: SourceFeed,
    pub acc_feed: SourceFeed,
    pub fusion: FusionHandle,
    pub buffer: Arc<CrossSensorBuffer>,
}

pub fn gyro_rig(config: GyroConfig) -> GyroRig {
    gyro_rig_serving(config, vec![VirtualSensorId::FusionMagnetic])
}

/// Gyroscope rig whose inner magnetic instance serves `magnetic_active`.
pub fn gyro_rig_serving(config: GyroConfig, magnetic_active: Vec<VirtualSensorId>) -> GyroRig {
    let buffer = Arc::new(CrossSensorBuffer::new());
    let inner = magnetic_rig_on(
        MagneticConfig {
            active: magnetic_active,
            ..MagneticConfig::default()
        },
        buffer.clone(),
        true,
    );

    let (fusion, handle) = ScriptedFusion::new();
    let gyro = GyroInstance::new(config, inner.mag, Box::new(fusion), buffer.clone());
    GyroRig {
        gyro,
        mag_feed: inner.mag_feed,
        acc_feed: inner.acc_feed,
        fusion: handle,
        buffer,
    }
}
