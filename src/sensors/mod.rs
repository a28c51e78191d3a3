//! Virtual sensor pipeline.
//!
//! Raw magnetometer and accelerometer streams are assembled into
//! synchronized samples, pushed through calibration and fusion engines, and
//! down-sampled per virtual sensor. Instances cross-feed each other through
//! an explicitly shared [`CrossSensorBuffer`].

pub mod accel;
pub mod buffer;
pub mod decimation;
pub mod enable;
pub mod engine;
pub mod gyro;
pub mod magnetic;
pub mod rate;
pub mod source;
pub mod types;

use std::sync::{Arc, Mutex, MutexGuard};

pub use accel::AccelInstance;
pub use buffer::{CrossSensorBuffer, SlotName, SlotValue};
pub use decimation::DecimationTable;
pub use enable::{EnableStateMachine, Transition};
pub use engine::{CalibrationEngine, FusionEngine, GeomagneticFusion, HardIronCalibration};
pub use gyro::GyroInstance;
pub use magnetic::MagneticInstance;
pub use rate::RateNegotiator;
pub use source::{ChannelSource, DeviceMonitor, RawEvent, RawSampleSource, SampleAssembler, SourceFeed};
pub use types::{
    Accuracy, EnabledMask, EngineError, OutputRecord, Payload, SensorError, VirtualSensorId,
};

/// Contract every instance exposes to the host framework.
pub trait VirtualSensor: Send {
    /// Turn the virtual sensor behind `handle` on or off.
    fn enable(&mut self, handle: i32, on: bool) -> Result<(), SensorError>;

    /// Request a sampling period for `handle`; zero is ignored.
    fn set_delay(&mut self, handle: i32, period_ns: i64) -> Result<(), SensorError>;

    /// Run one pass over the raw source, appending at most `max_count`
    /// records to `out`. Returns the number appended.
    fn read_events(&mut self, out: &mut Vec<OutputRecord>, max_count: usize) -> Result<usize, SensorError>;

    /// True after a bring-up until the next `read_events`.
    fn has_pending_events(&self) -> bool;
}

/// Instance shared between a control thread and its reader thread.
///
/// Every call takes the instance mutex, so enable/setDelay never interleave
/// with a decimation pass.
pub struct SharedSensor<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSensor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: VirtualSensor> SharedSensor<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sensor)),
        }
    }

    pub fn enable(&self, handle: i32, on: bool) -> Result<(), SensorError> {
        self.lock().enable(handle, on)
    }

    pub fn set_delay(&self, handle: i32, period_ns: i64) -> Result<(), SensorError> {
        self.lock().set_delay(handle, period_ns)
    }

    pub fn read_events(&self, out: &mut Vec<OutputRecord>, max_count: usize) -> Result<usize, SensorError> {
        self.lock().read_events(out, max_count)
    }

    pub fn has_pending_events(&self) -> bool {
        self.lock().has_pending_events()
    }

    /// Run `f` with exclusive access to the instance.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
