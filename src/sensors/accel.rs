//! Physical accelerometer owned by a fusion instance as its reference input.
//!
//! Requests are keyed by the id of the virtual sensor that needs the
//! accelerometer, so several consumers inside one owner can hold it on at
//! different rates. The stream runs while any requester is active and every
//! synchronized vector is published to the `Acceleration` slot.

use crate::config::AccelConfig;
use crate::sensors::buffer::{CrossSensorBuffer, SlotName};
use crate::sensors::decimation::DecimationTable;
use crate::sensors::enable::{EnableStateMachine, Transition};
use crate::sensors::rate::RateNegotiator;
use crate::sensors::source::{RawSampleSource, SampleAssembler};
use crate::sensors::types::{Accuracy, EnabledMask, SensorError, VirtualSensorId};
use std::sync::Arc;

/// Accelerometer instance driven by its owner.
pub struct AccelInstance {
    config: AccelConfig,
    source: Box<dyn RawSampleSource>,
    assembler: SampleAssembler,
    buffer: Arc<CrossSensorBuffer>,
    state: EnableStateMachine,
    rates: RateNegotiator,
    // Thresholds are unused: every sample is published, but the table keeps
    // the negotiator's bookkeeping uniform with the virtual instances.
    decimation: DecimationTable,
    full_scale: Option<u32>,
}

impl AccelInstance {
    pub fn new(
        config: AccelConfig,
        source: Box<dyn RawSampleSource>,
        buffer: Arc<CrossSensorBuffer>,
    ) -> Self {
        if !source.is_available() {
            tracing::error!("Accelerometer source not found");
        }
        let assembler = SampleAssembler::new(config.axes.conversion, config.axes.alignment);
        Self {
            config,
            source,
            assembler,
            buffer,
            state: EnableStateMachine::new(EnabledMask::all()),
            rates: RateNegotiator::new(),
            decimation: DecimationTable::new(),
            full_scale: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.source.is_available()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    /// Requesters currently holding the stream on.
    pub fn requesters(&self) -> EnabledMask {
        self.state.enabled()
    }

    pub fn programmed_period(&self) -> Option<u64> {
        self.rates.programmed_period()
    }

    /// Turn the accelerometer on or off on behalf of `requester`.
    pub fn enable(&mut self, requester: VirtualSensorId, on: bool) -> Result<(), SensorError> {
        let transition = self.state.request(requester, on)?;
        match transition {
            Transition::BringUp(_) => {
                self.set_full_scale(self.config.default_full_scale)?;
                let source = &mut self.source;
                self.rates
                    .reprogram(&mut self.decimation, |ms| source.write_period(ms))?;
                self.source.write_enable(true)?;
                self.assembler.reset();
                tracing::info!("Accelerometer stream up for {}", requester);
            }
            Transition::TearDown(_) => {
                self.source.write_enable(false)?;
                tracing::info!("Accelerometer stream down");
            }
            Transition::Unchanged | Transition::Enable(_) | Transition::Disable(_) => {}
        }
        self.state.commit(transition);

        if !on && transition != Transition::Unchanged {
            let source = &mut self.source;
            let cleared = self
                .rates
                .clear(requester, &mut self.decimation, |ms| source.write_period(ms));
            if matches!(transition, Transition::TearDown(_)) {
                self.rates.invalidate(&mut self.decimation);
            }
            cleared?;
        }
        Ok(())
    }

    /// Request `period_ms` on behalf of `requester`.
    pub fn set_delay(&mut self, requester: VirtualSensorId, period_ms: u64) -> Result<(), SensorError> {
        let source = &mut self.source;
        self.rates
            .set_delay(requester, period_ms, &mut self.decimation, |ms| {
                source.write_period(ms)
            })
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

    /// Drain whatever the device has buffered and publish each synchronized
    /// vector. Returns the number of vectors published.
    pub fn pump(&mut self) -> Result<usize, SensorError> {
        if !self.state.is_streaming() {
            return Ok(0);
        }

        self.source.fill()?;
        let mut published = 0;
        while let Some(event) = self.source.next_event() {
            if let Some(sample) = self.assembler.push(&event) {
                self.buffer
                    .publish(SlotName::Acceleration, sample.vector, Accuracy::High);
                published += 1;
            }
        }
        Ok(published)
    }

    /// Release every requester and stop the stream.
    pub fn shutdown(&mut self) {
        for requester in self.state.enabled().iter().collect::<Vec<_>>() {
            if let Err(e) = self.enable(requester, false) {
                tracing::warn!("Accelerometer teardown for {} failed: {}", requester, e);
            }
        }
    }
}

impl Drop for AccelInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
