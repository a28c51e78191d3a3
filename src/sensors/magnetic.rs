//! Magnetic-family virtual sensor instance.
//!
//! One physical magnetometer feeds the calibrated and uncalibrated magnetic
//! field, the geomagnetic fusion outputs (orientation, gravity, linear
//! acceleration, rotation vector) and the `FusionMagnetic` feed that other
//! instances read from the cross-sensor buffer. The instance owns the
//! accelerometer it uses as calibration and fusion reference.

use crate::config::MagneticConfig;
use crate::sensors::accel::AccelInstance;
use crate::sensors::buffer::{CrossSensorBuffer, SlotName};
use crate::sensors::decimation::DecimationTable;
use crate::sensors::enable::{EnableStateMachine, Transition};
use crate::sensors::engine::{CalibrationEngine, FusionEngine};
use crate::sensors::rate::{ns_to_ms, period_for_frequency, RateNegotiator};
use crate::sensors::source::{RawSampleSource, RawVectorSample, SampleAssembler};
use crate::sensors::types::{
    Accuracy, EnabledMask, EngineError, OutputRecord, Payload, Reading, SensorError,
    VirtualSensorId, HANDLE_GEOMAG_ROTATION_VECTOR, HANDLE_GRAVITY, HANDLE_LINEAR_ACCELERATION,
    HANDLE_MAGNETIC_FIELD, HANDLE_ORIENTATION, HANDLE_SENSOR_FUSION, HANDLE_UNCALIB_MAGNETIC_FIELD,
};
use crate::sensors::VirtualSensor;
use glam::Vec3;
use std::sync::Arc;

/// Magnetometer-driven instance.
pub struct MagneticInstance {
    config: MagneticConfig,
    source: Box<dyn RawSampleSource>,
    assembler: SampleAssembler,
    /// Calibration and fusion reference, exclusively owned
    accel: AccelInstance,
    calibration: Box<dyn CalibrationEngine>,
    fusion: Box<dyn FusionEngine>,
    buffer: Arc<CrossSensorBuffer>,
    state: EnableStateMachine,
    rates: RateNegotiator,
    decimation: DecimationTable,
    /// Accelerometer period requested for calibration (ms)
    calibration_period: u64,
    /// Accelerometer period requested per geomagnetic output (ms)
    geomag_period: u64,
    full_scale: Option<u32>,
    pending: bool,
    retired: bool,
    warned_no_reference: bool,
}

impl MagneticInstance {
    /// Build an instance serving `config.active`.
    ///
    /// `accel` must publish into the same `buffer`.
    pub fn new(
        config: MagneticConfig,
        source: Box<dyn RawSampleSource>,
        accel: AccelInstance,
        calibration: Box<dyn CalibrationEngine>,
        fusion: Box<dyn FusionEngine>,
        buffer: Arc<CrossSensorBuffer>,
    ) -> Self {
        if !source.is_available() {
            tracing::error!("Magnetometer source not found");
        }

        let mut supported = EnabledMask::empty();
        for id in &config.active {
            if id.is_magnetic_family() {
                supported.insert(*id);
            } else {
                tracing::warn!("{} is not served by a magnetic instance, ignored", id);
            }
        }

        let calibration_period = period_for_frequency(config.calibration_frequency_hz);
        let geomag_period = period_for_frequency(config.geomag_frequency_hz);

        let mut rates = RateNegotiator::new();
        if config.calibration_enabled {
            rates = rates.with_ceiling(calibration_period);
        }
        for id in VirtualSensorId::ALL.into_iter().filter(|id| id.is_geomagnetic()) {
            rates = rates.with_id_ceiling(id, geomag_period);
        }

        let assembler = SampleAssembler::new(config.axes.conversion, config.axes.alignment);
        Self {
            config,
            source,
            assembler,
            accel,
            calibration,
            fusion,
            buffer,
            state: EnableStateMachine::new(supported),
            rates,
            decimation: DecimationTable::new(),
            calibration_period,
            geomag_period,
            full_scale: None,
            pending: false,
            retired: false,
            warned_no_reference: false,
        }
    }

    /// Map a host handle to the id it addresses on this instance.
    pub fn resolve(&self, handle: i32) -> Result<VirtualSensorId, SensorError> {
        let id = match handle {
            HANDLE_MAGNETIC_FIELD => VirtualSensorId::Magnetic,
            HANDLE_UNCALIB_MAGNETIC_FIELD => VirtualSensorId::UncalibratedMagnetic,
            HANDLE_ORIENTATION => VirtualSensorId::Orientation,
            HANDLE_GRAVITY => VirtualSensorId::Gravity,
            HANDLE_LINEAR_ACCELERATION => VirtualSensorId::LinearAcceleration,
            HANDLE_GEOMAG_ROTATION_VECTOR => VirtualSensorId::GeomagneticRotationVector,
            HANDLE_SENSOR_FUSION => VirtualSensorId::FusionMagnetic,
            _ => return Err(SensorError::UnknownTarget(handle)),
        };
        if !self.state.supported().contains(id) {
            return Err(SensorError::UnknownTarget(handle));
        }
        Ok(id)
    }

    pub fn is_available(&self) -> bool {
        self.source.is_available()
    }

    /// Whether `id` is in this instance's configured set.
    pub fn serves(&self, id: VirtualSensorId) -> bool {
        self.state.supported().contains(id)
    }

    pub fn enabled(&self) -> EnabledMask {
        self.state.enabled()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Period the magnetometer is programmed at; the clock of every output.
    pub fn physical_period(&self) -> Option<u64> {
        self.rates.programmed_period()
    }

    pub fn thresholds(&self) -> &DecimationTable {
        &self.decimation
    }

    pub fn accel(&self) -> &AccelInstance {
        &self.accel
    }

    /// Turn one virtual sensor on or off.
    pub fn enable_id(&mut self, id: VirtualSensorId, on: bool) -> Result<(), SensorError> {
        self.ensure_live()?;
        self.switch(id, on)
    }

    /// Request `period_ms` for one virtual sensor. Zero is ignored.
    pub fn set_delay_for(&mut self, id: VirtualSensorId, period_ms: u64) -> Result<(), SensorError> {
        self.ensure_live()?;
        if !self.state.supported().contains(id) {
            return Err(SensorError::UnknownTarget(id.handle()));
        }
        if period_ms == 0 {
            return Ok(());
        }

        let source = &mut self.source;
        self.rates
            .set_delay(id, period_ms, &mut self.decimation, |ms| source.write_period(ms))?;

        if self.state.is_streaming() {
            if let Err(e) = self.request_reference_rates(id) {
                tracing::warn!("Accelerometer reference rate for {} not applied: {}", id, e);
            }
        }
        Ok(())
    }

    pub fn set_full_scale(&mut self, full_scale: u32) -> Result<(), SensorError> {
        if full_scale == 0 {
            return Err(SensorError::InvalidArgument("full scale must be positive".into()));
        }
        if self.full_scale != Some(full_scale) {
            self.source.write_full_scale(full_scale)?;
            self.full_scale = Some(full_scale);
        }
        Ok(())
    }

    /// Force every sensor off and retire the instance.
    pub fn shutdown(&mut self) {
        if self.retired {
            return;
        }
        for id in self.state.enabled().iter().collect::<Vec<_>>() {
            if let Err(e) = self.switch(id, false) {
                tracing::warn!("Teardown of {} failed: {}", id, e);
            }
        }
        self.accel.shutdown();
        self.retired = true;
        tracing::info!("Magnetic instance retired");
    }

    fn ensure_live(&self) -> Result<(), SensorError> {
        if self.retired {
            return Err(SensorError::StateInconsistency(
                "magnetic instance already torn down".into(),
            ));
        }
        Ok(())
    }

    fn switch(&mut self, id: VirtualSensorId, on: bool) -> Result<(), SensorError> {
        let transition = self.state.request(id, on)?;
        match transition {
            Transition::Unchanged => return Ok(()),
            Transition::BringUp(_) => {
                self.set_full_scale(self.config.default_full_scale)?;
                let source = &mut self.source;
                self.rates
                    .reprogram(&mut self.decimation, |ms| source.write_period(ms))?;
                self.source.write_enable(true)?;
                self.assembler.reset();
                self.pending = true;
                tracing::info!("Magnetometer stream up for {}", id);
            }
            Transition::TearDown(_) => {
                self.source.write_enable(false)?;
                tracing::info!("Magnetometer stream down");
            }
            Transition::Enable(_) | Transition::Disable(_) => {}
        }
        self.state.commit(transition);

        if let Err(e) = self.update_reference(transition) {
            tracing::warn!("Accelerometer reference for {} not updated: {}", id, e);
        }

        if !on {
            let source = &mut self.source;
            let cleared = self
                .rates
                .clear(id, &mut self.decimation, |ms| source.write_period(ms));
            self.decimation.reset_counters();
            if matches!(transition, Transition::TearDown(_)) {
                self.rates.invalidate(&mut self.decimation);
            }
            cleared?;
        }
        Ok(())
    }

    /// Keep the owned accelerometer requested for exactly the consumers
    /// that need it.
    fn update_reference(&mut self, transition: Transition) -> Result<(), SensorError> {
        let calibrating = self.config.calibration_enabled;
        match transition {
            Transition::Unchanged => {}
            Transition::BringUp(id) | Transition::Enable(id) => {
                if calibrating && matches!(transition, Transition::BringUp(_)) {
                    self.accel.enable(VirtualSensorId::Magnetic, true)?;
                }
                if id.is_geomagnetic() {
                    self.accel.enable(id, true)?;
                }
                self.request_reference_rates(id)?;
            }
            Transition::Disable(id) | Transition::TearDown(id) => {
                if id.is_geomagnetic() {
                    self.accel.enable(id, false)?;
                }
                if calibrating && matches!(transition, Transition::TearDown(_)) {
                    self.accel.enable(VirtualSensorId::Magnetic, false)?;
                }
            }
        }
        Ok(())
    }

    fn request_reference_rates(&mut self, id: VirtualSensorId) -> Result<(), SensorError> {
        if self.config.calibration_enabled {
            self.accel
                .set_delay(VirtualSensorId::Magnetic, self.calibration_period)?;
        }
        if id.is_geomagnetic() && self.state.is_enabled(id) {
            self.accel.set_delay(id, self.geomag_period)?;
        }
        Ok(())
    }

    /// Hold or release the reference accelerometer for a consumer outside
    /// this instance, keyed by that consumer's id.
    pub(crate) fn request_reference(
        &mut self,
        requester: VirtualSensorId,
        on: bool,
    ) -> Result<(), SensorError> {
        self.accel.enable(requester, on)
    }

    pub(crate) fn set_reference_delay(
        &mut self,
        requester: VirtualSensorId,
        period_ms: u64,
    ) -> Result<(), SensorError> {
        self.accel.set_delay(requester, period_ms)
    }

    /// Publish the reference accelerometer and refill the raw buffer.
    pub(crate) fn begin_pass(&mut self) -> Result<(), SensorError> {
        if let Err(e) = self.accel.pump() {
            tracing::warn!("Accelerometer reference read failed: {}", e);
        }
        self.source.fill()?;
        Ok(())
    }

    /// Consume buffered events up to and including the next synchronization
    /// marker and run one cycle on it. Returns the marker timestamp and the
    /// number of records appended, or `None` once the buffer is drained.
    pub(crate) fn next_sample(
        &mut self,
        out: &mut Vec<OutputRecord>,
        capacity: usize,
    ) -> Option<(i64, usize)> {
        while let Some(event) = self.source.next_event() {
            let Some(sample) = self.assembler.push(&event) else {
                continue;
            };
            if !self.state.is_streaming() {
                continue;
            }
            let appended = self.process(&sample, out, capacity);
            return Some((sample.timestamp_ns, appended));
        }
        None
    }

    fn process(&mut self, sample: &RawVectorSample, out: &mut Vec<OutputRecord>, capacity: usize) -> usize {
        let raw = sample.vector;
        let reference = self.buffer.fetch(SlotName::Acceleration);

        let (calibrated, accuracy, bias) = if self.config.calibration_enabled {
            self.calibration.save_raw_vector(raw);
            self.calibration.save_reference(reference.vector);
            let accuracy = self.calibration.run();
            let bias = self.calibration.offset();
            (raw - bias, accuracy, bias)
        } else {
            (Vec3::ZERO, Accuracy::Unreliable, Vec3::ZERO)
        };

        let enabled = self.state.enabled();
        if enabled.contains(VirtualSensorId::FusionMagnetic) {
            self.buffer.publish(SlotName::Magnetic, calibrated, accuracy);
        }

        if enabled.iter().any(|id| id.is_geomagnetic()) {
            if reference.accuracy == Accuracy::Unreliable {
                if !self.warned_no_reference {
                    tracing::warn!("No accelerometer reference yet, fusion runs on a zero vector");
                    self.warned_no_reference = true;
                }
            } else {
                self.warned_no_reference = false;
            }
            let delta_ms = self.rates.programmed_period().unwrap_or(0);
            self.fusion
                .run(delta_ms.min(u32::MAX as u64) as u32, reference.vector, calibrated);
        }

        let fusion = &self.fusion;
        self.decimation
            .dispatch(sample.timestamp_ns, enabled, out, capacity, |id| match id {
                VirtualSensorId::Magnetic => Ok(Reading::new(accuracy, Payload::vector(calibrated))),
                VirtualSensorId::UncalibratedMagnetic => Ok(Reading::new(
                    accuracy,
                    Payload::Uncalibrated {
                        uncalibrated: raw,
                        bias,
                    },
                )),
                VirtualSensorId::Orientation => fusion.orientation().map(|angles| {
                    Reading::new(
                        accuracy,
                        Payload::Angles {
                            azimuth: angles.x,
                            pitch: angles.y,
                            roll: angles.z,
                        },
                    )
                }),
                VirtualSensorId::Gravity => fusion
                    .gravity()
                    .map(|v| Reading::new(reference.accuracy, Payload::vector(v))),
                VirtualSensorId::LinearAcceleration => fusion
                    .linear_acceleration()
                    .map(|v| Reading::new(reference.accuracy, Payload::vector(v))),
                VirtualSensorId::GeomagneticRotationVector => fusion.rotation_vector().map(|q| {
                    Reading::new(
                        accuracy,
                        Payload::RotationVector {
                            rotation: q,
                            heading_accuracy: None,
                        },
                    )
                }),
                // Served by the gyroscope family or publish-only
                VirtualSensorId::SynthesizedGyroscope
                | VirtualSensorId::FusionMagnetic
                | VirtualSensorId::FusionGyroscope => Err(EngineError::NotReady),
            })
    }
}

impl VirtualSensor for MagneticInstance {
    fn enable(&mut self, handle: i32, on: bool) -> Result<(), SensorError> {
        let id = self.resolve(handle)?;
        self.enable_id(id, on)
    }

    fn set_delay(&mut self, handle: i32, period_ns: i64) -> Result<(), SensorError> {
        let id = self.resolve(handle)?;
        self.set_delay_for(id, ns_to_ms(period_ns))
    }

    fn read_events(&mut self, out: &mut Vec<OutputRecord>, max_count: usize) -> Result<usize, SensorError> {
        if max_count == 0 {
            return Err(SensorError::InvalidArgument("output capacity is zero".into()));
        }
        if !self.source.is_available() {
            return Err(SensorError::HardwareUnavailable("magnetometer".into()));
        }
        self.pending = false;
        if self.retired {
            return Ok(0);
        }

        self.begin_pass()?;
        let mut appended = 0;
        while appended < max_count {
            match self.next_sample(out, max_count - appended) {
                Some((_, n)) => appended += n,
                None => break,
            }
        }
        Ok(appended)
    }

    fn has_pending_events(&self) -> bool {
        self.pending
    }
}

impl Drop for MagneticInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
