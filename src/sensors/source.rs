//! Raw sample sources and synchronized sample assembly.
//!
//! A physical sensor delivers one event per changed axis followed by a
//! synchronization marker. [`SampleAssembler`] folds those events into one
//! [`RawVectorSample`] per marker, applying unit conversion and the board
//! alignment matrix.

use crate::sensors::types::SensorError;
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use glam::{Mat3, Vec3};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Axis codes reported by the input driver.
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_Z: u16 = 0x02;

/// Event class of a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Absolute axis value
    Axis,
    /// Synchronization marker: the multi-axis sample is complete
    Sync,
    /// Anything else the driver may emit
    Other(u16),
}

/// One record read from a raw device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub code: u16,
    pub value: i32,
    /// Kernel timestamp (ns)
    pub timestamp_ns: i64,
}

impl RawEvent {
    pub fn axis(code: u16, value: i32, timestamp_ns: i64) -> Self {
        Self {
            kind: EventKind::Axis,
            code,
            value,
            timestamp_ns,
        }
    }

    pub fn sync(timestamp_ns: i64) -> Self {
        Self {
            kind: EventKind::Sync,
            code: 0,
            value: 0,
            timestamp_ns,
        }
    }

    /// The three axis events plus the marker for one complete sample.
    pub fn frame(raw: [i32; 3], timestamp_ns: i64) -> [RawEvent; 4] {
        [
            RawEvent::axis(ABS_X, raw[0], timestamp_ns),
            RawEvent::axis(ABS_Y, raw[1], timestamp_ns),
            RawEvent::axis(ABS_Z, raw[2], timestamp_ns),
            RawEvent::sync(timestamp_ns),
        ]
    }
}

/// Pull-style access to a physical sensor plus its control surface.
///
/// `fill` moves whatever the device has ready into a bounded local buffer;
/// `next_event` consumes from that buffer. Control writes program the
/// hardware and are only issued by the pipeline when a value changes.
pub trait RawSampleSource: Send {
    /// Whether the device node could be opened.
    fn is_available(&self) -> bool;

    /// Refill the local buffer, returning the number of events now buffered.
    fn fill(&mut self) -> Result<usize, SensorError>;

    /// Consume the next buffered event.
    fn next_event(&mut self) -> Option<RawEvent>;

    /// Turn the physical stream on or off.
    fn write_enable(&mut self, enabled: bool) -> Result<(), SensorError>;

    /// Program the physical sampling period.
    fn write_period(&mut self, period_ms: u64) -> Result<(), SensorError>;

    /// Program the measurement range.
    fn write_full_scale(&mut self, full_scale: u32) -> Result<(), SensorError>;
}

/// One synchronized, converted and aligned 3-axis sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawVectorSample {
    pub vector: Vec3,
    pub timestamp_ns: i64,
}

/// Folds per-axis events into synchronized samples.
///
/// Axis values persist across markers: a driver only reports axes that
/// changed, so an axis missing from a frame keeps its previous value.
#[derive(Debug, Clone)]
pub struct SampleAssembler {
    conversion: Vec3,
    alignment: Mat3,
    raw: Vec3,
}

impl SampleAssembler {
    /// `alignment[j][i]` weights raw axis `j` into output axis `i`.
    pub fn new(conversion: [f32; 3], alignment: [[f32; 3]; 3]) -> Self {
        Self {
            conversion: Vec3::from_array(conversion),
            alignment: Mat3::from_cols_array_2d(&alignment),
            raw: Vec3::ZERO,
        }
    }

    /// Feed one event; returns a sample when the event is a marker.
    pub fn push(&mut self, event: &RawEvent) -> Option<RawVectorSample> {
        match event.kind {
            EventKind::Axis => {
                let value = event.value as f32;
                match event.code {
                    ABS_X => self.raw.x = value * self.conversion.x,
                    ABS_Y => self.raw.y = value * self.conversion.y,
                    ABS_Z => self.raw.z = value * self.conversion.z,
                    code => tracing::warn!("Unknown axis code {:#04x} ignored", code),
                }
                None
            }
            EventKind::Sync => Some(RawVectorSample {
                vector: self.alignment * self.raw,
                timestamp_ns: event.timestamp_ns,
            }),
            EventKind::Other(kind) => {
                tracing::warn!("Unknown event (type = {}, code = {}) ignored", kind, event.code);
                None
            }
        }
    }

    /// Forget the last axis values.
    pub fn reset(&mut self) {
        self.raw = Vec3::ZERO;
    }
}

/// Control writes observed on a [`ChannelSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub enabled: bool,
    pub period_ms: Option<u64>,
    pub full_scale: Option<u32>,
    pub enable_writes: usize,
    pub period_writes: usize,
    pub full_scale_writes: usize,
    /// When set, every control write fails with an I/O error
    pub fail_writes: bool,
}

/// Shared view of a [`ChannelSource`]'s control state, for tests and
/// simulators that need to follow what the pipeline programmed.
#[derive(Debug, Clone, Default)]
pub struct DeviceMonitor {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceMonitor {
    pub fn snapshot(&self) -> DeviceState {
        self.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn period_ms(&self) -> Option<u64> {
        self.lock().period_ms
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer half of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct SourceFeed {
    tx: Sender<RawEvent>,
    monitor: DeviceMonitor,
}

impl SourceFeed {
    /// Queue one raw event; returns false once the source was dropped.
    pub fn send(&self, event: RawEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Queue a complete 3-axis frame followed by its marker.
    pub fn send_frame(&self, raw: [i32; 3], timestamp_ns: i64) -> bool {
        RawEvent::frame(raw, timestamp_ns)
            .into_iter()
            .all(|event| self.send(event))
    }

    pub fn monitor(&self) -> &DeviceMonitor {
        &self.monitor
    }
}

/// Raw source fed over a crossbeam channel, used by the simulator and tests.
pub struct ChannelSource {
    name: String,
    rx: Option<Receiver<RawEvent>>,
    buffer: VecDeque<RawEvent>,
    capacity: usize,
    monitor: DeviceMonitor,
}

impl ChannelSource {
    /// Create a source whose `fill` buffers at most `capacity` events.
    pub fn new(name: &str, capacity: usize) -> (Self, SourceFeed) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let monitor = DeviceMonitor::default();
        let source = Self {
            name: name.to_string(),
            rx: Some(rx),
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            monitor: monitor.clone(),
        };
        (source, SourceFeed { tx, monitor })
    }

    /// A source whose device node is missing.
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rx: None,
            buffer: VecDeque::new(),
            capacity: 1,
            monitor: DeviceMonitor::default(),
        }
    }

    pub fn monitor(&self) -> DeviceMonitor {
        self.monitor.clone()
    }

    fn check_write(&self, what: &str) -> Result<(), SensorError> {
        if self.rx.is_none() {
            return Err(SensorError::HardwareUnavailable(self.name.clone()));
        }
        if self.monitor.lock().fail_writes {
            return Err(SensorError::Io(format!("{}: {} write failed", self.name, what)));
        }
        Ok(())
    }
}

impl RawSampleSource for ChannelSource {
    fn is_available(&self) -> bool {
        self.rx.is_some()
    }

    fn fill(&mut self) -> Result<usize, SensorError> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| SensorError::HardwareUnavailable(self.name.clone()))?;

        while self.buffer.len() < self.capacity {
            match rx.try_recv() {
                Ok(event) => self.buffer.push_back(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.buffer.is_empty() {
                        return Err(SensorError::Io(format!("{}: feed disconnected", self.name)));
                    }
                    break;
                }
            }
        }
        Ok(self.buffer.len())
    }

    fn next_event(&mut self) -> Option<RawEvent> {
        self.buffer.pop_front()
    }

    fn write_enable(&mut self, enabled: bool) -> Result<(), SensorError> {
        self.check_write("enable")?;
        let mut state = self.monitor.lock();
        state.enabled = enabled;
        state.enable_writes += 1;
        Ok(())
    }

    fn write_period(&mut self, period_ms: u64) -> Result<(), SensorError> {
        self.check_write("period")?;
        let mut state = self.monitor.lock();
        state.period_ms = Some(period_ms);
        state.period_writes += 1;
        Ok(())
    }

    fn write_full_scale(&mut self, full_scale: u32) -> Result<(), SensorError> {
        self.check_write("full scale")?;
        let mut state = self.monitor.lock();
        state.full_scale = Some(full_scale);
        state.full_scale_writes += 1;
        Ok(())
    }
}
