//! Gyroscope-family virtual sensor instance.
//!
//! Synthesizes an angular rate from successive accelerometer + magnetometer
//! orientations. The instance has no raw device of its own: it owns a
//! magnetic instance, runs on the magnetometer's synchronization markers,
//! holds that instance's reference accelerometer as one more requester, and
//! reads both vectors back from the cross-sensor buffer.

use crate::config::GyroConfig;
use crate::sensors::buffer::{CrossSensorBuffer, SlotName};
use crate::sensors::decimation::DecimationTable;
use crate::sensors::enable::{EnableStateMachine, Transition};
use crate::sensors::engine::FusionEngine;
use crate::sensors::magnetic::MagneticInstance;
use crate::sensors::rate::{ns_to_ms, RateNegotiator};
use crate::sensors::types::{
    Accuracy, EnabledMask, OutputRecord, Payload, Reading, SensorError, VirtualSensorId,
    HANDLE_SENSOR_FUSION, HANDLE_VIRTUAL_GYROSCOPE,
};
use crate::sensors::VirtualSensor;
use std::sync::Arc;

/// Synthesized gyroscope.
pub struct GyroInstance {
    config: GyroConfig,
    /// Clock, magnetic input and acceleration input, exclusively owned
    magnetic: MagneticInstance,
    fusion: Box<dyn FusionEngine>,
    buffer: Arc<CrossSensorBuffer>,
    state: EnableStateMachine,
    rates: RateNegotiator,
    decimation: DecimationTable,
    full_scale: Option<u32>,
    /// Markers still to skip after bring-up
    startup_remaining: u32,
    previous_timestamp: Option<i64>,
    pending: bool,
    retired: bool,
}

impl GyroInstance {
    /// Build an instance serving `config.active`.
    ///
    /// `magnetic` must serve `FusionMagnetic` and publish into `buffer`.
    pub fn new(
        config: GyroConfig,
        magnetic: MagneticInstance,
        fusion: Box<dyn FusionEngine>,
        buffer: Arc<CrossSensorBuffer>,
    ) -> Self {
        if !magnetic.accel().is_available() {
            tracing::error!("Virtual gyroscope: accelerometer source not found");
        }
        if !magnetic.serves(VirtualSensorId::FusionMagnetic) {
            tracing::error!("Virtual gyroscope: magnetic instance does not publish its feed");
        }

        let mut supported = EnabledMask::empty();
        for id in &config.active {
            if id.is_gyroscope_family() {
                supported.insert(*id);
            } else {
                tracing::warn!("{} is not served by a gyroscope instance, ignored", id);
            }
        }

        Self {
            config,
            magnetic,
            fusion,
            buffer,
            state: EnableStateMachine::new(supported),
            rates: RateNegotiator::new(),
            decimation: DecimationTable::new(),
            full_scale: None,
            startup_remaining: 0,
            previous_timestamp: None,
            pending: false,
            retired: false,
        }
    }

    pub fn resolve(&self, handle: i32) -> Result<VirtualSensorId, SensorError> {
        let id = match handle {
            HANDLE_VIRTUAL_GYROSCOPE => VirtualSensorId::SynthesizedGyroscope,
            HANDLE_SENSOR_FUSION => VirtualSensorId::FusionGyroscope,
            _ => return Err(SensorError::UnknownTarget(handle)),
        };
        if !self.state.supported().contains(id) {
            return Err(SensorError::UnknownTarget(handle));
        }
        Ok(id)
    }

    pub fn enabled(&self) -> EnabledMask {
        self.state.enabled()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    pub fn magnetic(&self) -> &MagneticInstance {
        &self.magnetic
    }

    /// Access to the inner instance's own handles. Disabling the feed the
    /// gyroscope depends on from here starves the gyroscope.
    pub fn magnetic_mut(&mut self) -> &mut MagneticInstance {
        &mut self.magnetic
    }

    pub fn thresholds(&self) -> &DecimationTable {
        &self.decimation
    }

    pub fn full_scale(&self) -> Option<u32> {
        self.full_scale
    }

    /// Record the nominal range; there is no device to program.
    pub fn set_full_scale(&mut self, full_scale: u32) -> Result<(), SensorError> {
        if full_scale == 0 {
            return Err(SensorError::InvalidArgument("full scale must be positive".into()));
        }
        self.full_scale = Some(full_scale);
        Ok(())
    }

    /// Force every sensor off, tear down the owned instances and retire.
    pub fn shutdown(&mut self) {
        if self.retired {
            return;
        }
        for id in self.state.enabled().iter().collect::<Vec<_>>() {
            if let Err(e) = self.switch(id, false) {
                tracing::warn!("Teardown of {} failed: {}", id, e);
            }
        }
        self.magnetic.shutdown();
        self.retired = true;
        tracing::info!("Virtual gyroscope retired");
    }

    fn ensure_live(&self) -> Result<(), SensorError> {
        if self.retired || self.magnetic.is_retired() {
            return Err(SensorError::StateInconsistency(
                "virtual gyroscope inputs already torn down".into(),
            ));
        }
        Ok(())
    }

    fn switch(&mut self, id: VirtualSensorId, on: bool) -> Result<(), SensorError> {
        let transition = self.state.request(id, on)?;
        let mut outcome = Ok(());
        match transition {
            Transition::Unchanged => return Ok(()),
            Transition::BringUp(_) => {
                self.set_full_scale(self.config.default_full_scale)?;
                self.magnetic.enable_id(VirtualSensorId::FusionMagnetic, true)?;
                if let Err(e) = self
                    .magnetic
                    .request_reference(VirtualSensorId::SynthesizedGyroscope, true)
                {
                    if let Err(undo) = self.magnetic.enable_id(VirtualSensorId::FusionMagnetic, false) {
                        tracing::warn!("Magnetic input left enabled: {}", undo);
                    }
                    return Err(e);
                }
                self.startup_remaining = self.config.startup_samples_to_discard;
                self.previous_timestamp = None;
                self.pending = true;
                tracing::info!("Virtual gyroscope up for {}", id);
            }
            Transition::TearDown(_) => {
                // Both inputs are released even if one of them fails
                let disabled = self.magnetic.enable_id(VirtualSensorId::FusionMagnetic, false);
                let released = self
                    .magnetic
                    .request_reference(VirtualSensorId::SynthesizedGyroscope, false);
                for e in [&disabled, &released].into_iter().filter_map(|r| r.as_ref().err()) {
                    tracing::warn!("Virtual gyroscope input not released: {}", e);
                }
                outcome = disabled.and(released);
                tracing::info!("Virtual gyroscope down");
            }
            Transition::Enable(_) | Transition::Disable(_) => {}
        }
        self.state.commit(transition);

        if !on {
            self.rates
                .follow_clock(id, 0, self.magnetic.physical_period(), &mut self.decimation);
            self.decimation.reset_counters();
        }
        outcome
    }

    fn process(&mut self, timestamp_ns: i64, out: &mut Vec<OutputRecord>, capacity: usize) -> usize {
        let acceleration = self.buffer.fetch(SlotName::Acceleration);
        let magnetic = self.buffer.fetch(SlotName::Magnetic);

        let elapsed = match self.previous_timestamp {
            Some(previous) => ns_to_ms(timestamp_ns.saturating_sub(previous)),
            None => 0,
        };
        self.previous_timestamp = Some(timestamp_ns);
        let delta_ms = if elapsed == 0 {
            self.magnetic.physical_period().unwrap_or(0)
        } else {
            elapsed
        };

        self.fusion.run(
            delta_ms.min(u32::MAX as u64) as u32,
            acceleration.vector,
            magnetic.vector,
        );
        let rate = self.fusion.synthesized_angular_rate();

        let enabled = self.state.enabled();
        let appended = self.decimation.dispatch(timestamp_ns, enabled, out, capacity, |_| {
            rate.map(|v| Reading::new(Accuracy::High, Payload::vector(v)))
        });

        if enabled.contains(VirtualSensorId::FusionGyroscope) {
            if let Ok(v) = rate {
                self.buffer.publish(SlotName::AngularRate, v, Accuracy::High);
            }
        }
        appended
    }
}

impl VirtualSensor for GyroInstance {
    fn enable(&mut self, handle: i32, on: bool) -> Result<(), SensorError> {
        self.ensure_live()?;
        if !self.magnetic.accel().is_available() {
            return Err(SensorError::HardwareUnavailable("accelerometer".into()));
        }
        let id = self.resolve(handle)?;
        self.switch(id, on)
    }

    fn set_delay(&mut self, handle: i32, period_ns: i64) -> Result<(), SensorError> {
        self.ensure_live()?;
        let id = self.resolve(handle)?;
        let period_ms = ns_to_ms(period_ns);
        if period_ms == 0 {
            return Ok(());
        }

        let input_period = period_ms.min(self.config.default_delay_ms);
        self.magnetic
            .set_delay_for(VirtualSensorId::FusionMagnetic, input_period)?;
        self.magnetic
            .set_reference_delay(VirtualSensorId::SynthesizedGyroscope, input_period)?;

        self.rates.follow_clock(
            id,
            period_ms,
            self.magnetic.physical_period(),
            &mut self.decimation,
        );
        tracing::debug!(
            "{} at {} ms, inputs at {} ms, threshold {}",
            id,
            period_ms,
            input_period,
            self.decimation.threshold(id)
        );
        Ok(())
    }

    fn read_events(&mut self, out: &mut Vec<OutputRecord>, max_count: usize) -> Result<usize, SensorError> {
        if max_count == 0 {
            return Err(SensorError::InvalidArgument("output capacity is zero".into()));
        }
        if !self.magnetic.is_available() {
            return Err(SensorError::HardwareUnavailable("magnetometer".into()));
        }
        self.pending = false;
        if self.retired {
            return Ok(0);
        }

        self.magnetic.begin_pass()?;
        self.rates
            .retime(self.magnetic.physical_period(), &mut self.decimation);

        // The inner instance only carries the publish-only feed
        let mut inner = Vec::new();
        let mut appended = 0;
        while appended < max_count {
            let Some((timestamp_ns, _)) = self.magnetic.next_sample(&mut inner, 0) else {
                break;
            };
            if !self.state.is_streaming() {
                continue;
            }
            if self.startup_remaining > 0 {
                self.startup_remaining -= 1;
                tracing::trace!("Start-up sample discarded, {} left", self.startup_remaining);
                continue;
            }
            appended += self.process(timestamp_ns, out, max_count - appended);
        }
        Ok(appended)
    }

    fn has_pending_events(&self) -> bool {
        self.pending
    }
}

impl Drop for GyroInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
