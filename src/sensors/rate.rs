//! Negotiation of the single physical sampling period.
//!
//! Each virtual sensor requests its own period. The hardware can only run at
//! one, so it runs at the fastest request and slower sensors are decimated.
//! Ceilings clamp the physical period further when a dependent loop (hard-iron
//! calibration, geomagnetic fusion) must run at a minimum rate regardless of
//! what consumers asked for.

use crate::sensors::decimation::DecimationTable;
use crate::sensors::types::{DelayTable, SensorError, SensorTable, VirtualSensorId};

/// Convert a host period in nanoseconds to whole milliseconds.
pub fn ns_to_ms(period_ns: i64) -> u64 {
    if period_ns <= 0 {
        0
    } else {
        (period_ns / 1_000_000) as u64
    }
}

/// Period in milliseconds for a loop that must run at `frequency_hz`.
pub fn period_for_frequency(frequency_hz: u32) -> u64 {
    if frequency_hz == 0 {
        0
    } else {
        (1000 / frequency_hz as u64).max(1)
    }
}

/// Tracks requested periods and the programmed physical period.
#[derive(Debug, Clone, Default)]
pub struct RateNegotiator {
    delays: DelayTable,
    programmed: Option<u64>,
    ceiling: Option<u64>,
    id_ceilings: SensorTable<Option<u64>>,
}

impl RateNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp the physical period to at most `ceiling_ms` whenever anything is
    /// requested. This is an override, not a derivation: the period may end
    /// up faster than every consumer asked for.
    pub fn with_ceiling(mut self, ceiling_ms: u64) -> Self {
        self.ceiling = (ceiling_ms > 0).then_some(ceiling_ms);
        self
    }

    /// Clamp the physical period to at most `ceiling_ms` while `id` has a
    /// non-zero request.
    pub fn with_id_ceiling(mut self, id: VirtualSensorId, ceiling_ms: u64) -> Self {
        self.id_ceilings.set(id, (ceiling_ms > 0).then_some(ceiling_ms));
        self
    }

    pub fn delays(&self) -> &DelayTable {
        &self.delays
    }

    pub fn requested(&self, id: VirtualSensorId) -> u64 {
        self.delays.get(id)
    }

    /// Period currently programmed into the hardware.
    pub fn programmed_period(&self) -> Option<u64> {
        self.programmed
    }

    /// Period the hardware should run at for the current requests, or `None`
    /// when nothing is requested.
    pub fn effective_period(&self) -> Option<u64> {
        let fastest = self
            .delays
            .iter()
            .map(|(_, ms)| ms)
            .filter(|ms| *ms > 0)
            .min()?;

        let mut period = fastest;
        if let Some(ceiling) = self.ceiling {
            period = period.min(ceiling);
        }
        for (id, ceiling) in self.id_ceilings.iter() {
            if let Some(ceiling) = ceiling {
                if self.delays.get(id) > 0 {
                    period = period.min(ceiling);
                }
            }
        }
        Some(period)
    }

    /// Record a request of `period_ms` for `id` and renegotiate.
    ///
    /// A zero request is a no-op. `write` programs the hardware and is only
    /// called when the effective period changes; if it fails the previous
    /// period stays programmed and the error is returned after the
    /// thresholds were recomputed against it.
    pub fn set_delay<W>(
        &mut self,
        id: VirtualSensorId,
        period_ms: u64,
        table: &mut DecimationTable,
        write: W,
    ) -> Result<(), SensorError>
    where
        W: FnOnce(u64) -> Result<(), SensorError>,
    {
        if period_ms == 0 {
            return Ok(());
        }
        self.delays.set(id, period_ms);
        self.renegotiate(table, write)
    }

    /// Drop the request of `id` (the sensor was disabled) and renegotiate.
    pub fn clear<W>(
        &mut self,
        id: VirtualSensorId,
        table: &mut DecimationTable,
        write: W,
    ) -> Result<(), SensorError>
    where
        W: FnOnce(u64) -> Result<(), SensorError>,
    {
        self.delays.set(id, 0);
        self.renegotiate(table, write)
    }

    /// Record a request for a sensor that runs on a clock owned by another
    /// instance; the thresholds follow `clock_period` instead of a period of
    /// our own.
    pub fn follow_clock(
        &mut self,
        id: VirtualSensorId,
        period_ms: u64,
        clock_period: Option<u64>,
        table: &mut DecimationTable,
    ) {
        self.delays.set(id, period_ms);
        self.retime(clock_period, table);
    }

    /// Follow a change of the borrowed clock's period.
    pub fn retime(&mut self, clock_period: Option<u64>, table: &mut DecimationTable) {
        if clock_period != self.programmed {
            tracing::debug!("Clock period {:?} ms -> {:?} ms", self.programmed, clock_period);
            self.programmed = clock_period;
            table.reset_counters();
        }
        table.recompute(&self.delays, self.programmed);
    }

    /// Program the period the current requests need, if any. Called on
    /// bring-up, after [`RateNegotiator::invalidate`].
    pub fn reprogram<W>(&mut self, table: &mut DecimationTable, write: W) -> Result<(), SensorError>
    where
        W: FnOnce(u64) -> Result<(), SensorError>,
    {
        self.renegotiate(table, write)
    }

    /// The device was turned off; its period register no longer counts.
    pub fn invalidate(&mut self, table: &mut DecimationTable) {
        self.programmed = None;
        table.reset_counters();
        table.recompute(&self.delays, None);
    }

    fn renegotiate<W>(&mut self, table: &mut DecimationTable, write: W) -> Result<(), SensorError>
    where
        W: FnOnce(u64) -> Result<(), SensorError>,
    {
        let mut result = Ok(());

        if let Some(period) = self.effective_period() {
            if Some(period) != self.programmed {
                match write(period) {
                    Ok(()) => {
                        tracing::debug!(
                            "Physical period {:?} ms -> {} ms",
                            self.programmed,
                            period
                        );
                        self.programmed = Some(period);
                        table.reset_counters();
                    }
                    Err(e) => {
                        tracing::error!("Failed to program {} ms period: {}", period, e);
                        result = Err(e);
                    }
                }
            }
        }

        table.recompute(&self.delays, self.programmed);
        tracing::debug!(
            "Delays {:?}, programmed {:?} ms",
            self.delays.iter().filter(|(_, ms)| *ms > 0).collect::<Vec<_>>(),
            self.programmed
        );
        result
    }
}
