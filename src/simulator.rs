//! Simulated IMU feeding the demo pipeline.
//!
//! A device lying flat and turning slowly about its vertical axis. Every
//! attached source only receives frames while the pipeline has it enabled,
//! at the period the pipeline programmed.

use glam::{Quat, Vec3};
use sensorfuse::config::AxisConfig;
use sensorfuse::sensors::engine::GRAVITY_EARTH;
use sensorfuse::sensors::source::{ChannelSource, SourceFeed};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Field seen by the device at rest, pointing north (uT).
const EARTH_FIELD: Vec3 = Vec3::new(0.0, 22.0, -42.0);

/// Yaw rate of the simulated device (rad/s).
const YAW_RATE: f32 = 0.5;

/// Simulation tick.
const TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Magnetometer,
    Accelerometer,
}

struct Device {
    kind: DeviceKind,
    feed: SourceFeed,
    conversion: [f32; 3],
    last_frame_ms: Option<u64>,
}

/// Collection of simulated devices driven by one thread.
#[derive(Default)]
pub struct ImuSimulator {
    devices: Vec<Device>,
}

impl ImuSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a raw source backed by this simulator.
    pub fn attach(&mut self, name: &str, kind: DeviceKind, axes: &AxisConfig) -> ChannelSource {
        let (source, feed) = ChannelSource::new(name, 64);
        self.devices.push(Device {
            kind,
            feed,
            conversion: axes.conversion,
            last_frame_ms: None,
        });
        source
    }

    /// Run until `stop` fires or is dropped.
    pub fn spawn(mut self, stop: crossbeam::channel::Receiver<()>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("imu-simulator".into())
            .spawn(move || {
                let start = Instant::now();
                let ticker = crossbeam::channel::tick(TICK);
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => self.step(start.elapsed()),
                        recv(stop) -> _ => break,
                    }
                }
                tracing::info!("Simulator stopped after {:.1} s", start.elapsed().as_secs_f32());
            })
    }

    fn step(&mut self, elapsed: Duration) {
        let now_ms = elapsed.as_millis() as u64;
        let timestamp_ns = elapsed.as_nanos() as i64;
        let yaw = YAW_RATE * elapsed.as_secs_f32();

        for device in &mut self.devices {
            let monitor = device.feed.monitor();
            let Some(period) = monitor.period_ms().filter(|_| monitor.is_enabled()) else {
                device.last_frame_ms = None;
                continue;
            };
            if let Some(last) = device.last_frame_ms {
                if now_ms < last + period {
                    continue;
                }
            }
            device.last_frame_ms = Some(now_ms);

            let physical = match device.kind {
                DeviceKind::Magnetometer => Quat::from_rotation_z(-yaw) * EARTH_FIELD,
                DeviceKind::Accelerometer => Vec3::new(0.0, 0.0, GRAVITY_EARTH),
            };
            device.feed.send_frame(to_raw(physical, device.conversion), timestamp_ns);
        }
    }
}

fn to_raw(value: Vec3, conversion: [f32; 3]) -> [i32; 3] {
    let mut raw = [0; 3];
    for (axis, out) in raw.iter_mut().enumerate() {
        if conversion[axis] != 0.0 {
            *out = (value[axis] / conversion[axis]).round() as i32;
        }
    }
    raw
}
