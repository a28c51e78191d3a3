//! Per-sensor down-sampling of the physical stream.
//!
//! Every synchronized sample advances the counter of each enabled virtual
//! sensor. When a counter reaches its threshold the sensor fires: the counter
//! goes back to zero and the sensor's output step runs. The reset happens
//! even if the step reports that its engine is not ready, so a sensor keeps
//! its cadence and simply misses that slot.

use crate::sensors::types::{
    DelayTable, EnabledMask, EngineError, OutputRecord, Reading, SensorTable, VirtualSensorId,
};

/// Counter and threshold for one virtual sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecimationEntry {
    pub counter: u32,
    /// Physical cycles between outputs; 0 never fires
    pub threshold: u32,
}

/// Decimation state for every virtual sensor of an instance.
#[derive(Debug, Clone, Default)]
pub struct DecimationTable {
    entries: SensorTable<DecimationEntry>,
}

impl DecimationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(&self, id: VirtualSensorId) -> u32 {
        self.entries.get(id).threshold
    }

    pub fn counter(&self, id: VirtualSensorId) -> u32 {
        self.entries.get(id).counter
    }

    /// Recompute every threshold as `requested / period`, rounding down.
    ///
    /// With no programmed period all thresholds are 0.
    pub fn recompute(&mut self, delays: &DelayTable, period_ms: Option<u64>) {
        for (id, requested) in delays.iter() {
            let threshold = match period_ms {
                Some(period) if period > 0 => (requested / period).min(u32::MAX as u64) as u32,
                _ => 0,
            };
            let mut entry = self.entries.get(id);
            entry.threshold = threshold;
            self.entries.set(id, entry);
        }
    }

    /// Zero every counter.
    pub fn reset_counters(&mut self) {
        for id in VirtualSensorId::ALL {
            self.reset_counter(id);
        }
    }

    pub fn reset_counter(&mut self, id: VirtualSensorId) {
        let mut entry = self.entries.get(id);
        entry.counter = 0;
        self.entries.set(id, entry);
    }

    /// Advance one synchronization cycle and append the records that fire.
    ///
    /// `produce` runs the output step for a firing sensor. Records are
    /// stamped with `timestamp_ns` and appended while `capacity` allows;
    /// sensors whose step fails are skipped without consuming capacity.
    /// Publish-only ids are ignored here. Returns the number appended.
    pub fn dispatch<F>(
        &mut self,
        timestamp_ns: i64,
        enabled: EnabledMask,
        out: &mut Vec<OutputRecord>,
        capacity: usize,
        mut produce: F,
    ) -> usize
    where
        F: FnMut(VirtualSensorId) -> Result<Reading, EngineError>,
    {
        let mut appended = 0;

        for id in enabled.iter().filter(|id| !id.is_publish_only()) {
            let mut entry = self.entries.get(id);
            entry.counter = entry.counter.saturating_add(1);

            let fires = entry.threshold > 0 && entry.counter >= entry.threshold;
            if fires {
                entry.counter = 0;
            }
            self.entries.set(id, entry);

            if !fires {
                continue;
            }

            match produce(id) {
                Ok(reading) if appended < capacity => {
                    out.push(OutputRecord {
                        timestamp_ns,
                        sensor: id,
                        accuracy: reading.accuracy,
                        payload: reading.payload,
                    });
                    appended += 1;
                }
                Ok(_) => {
                    tracing::trace!("{} fired with no output capacity left", id);
                }
                Err(EngineError::NotReady) => {
                    tracing::trace!("{} skipped: engine not ready", id);
                }
            }
        }

        appended
    }
}
