//! SensorFuse demo
//!
//! Runs a magnetic instance and a virtual gyroscope over a simulated IMU and
//! prints every produced record as one JSON line.
//!
//! Usage: `sensorfuse [config.toml] [seconds]`

use anyhow::Context;
use sensorfuse::config::{self, PipelineConfig};
use sensorfuse::sensors::accel::AccelInstance;
use sensorfuse::sensors::engine::{GeomagneticFusion, HardIronCalibration};
use sensorfuse::sensors::types::{
    HANDLE_GEOMAG_ROTATION_VECTOR, HANDLE_MAGNETIC_FIELD, HANDLE_ORIENTATION,
    HANDLE_VIRTUAL_GYROSCOPE,
};
use sensorfuse::{
    CrossSensorBuffer, GyroInstance, MagneticInstance, OutputRecord, SensorError, SharedSensor,
    VirtualSensor,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod simulator;

use simulator::{DeviceKind, ImuSimulator};

/// Records requested per read pass.
const READ_BATCH: usize = 16;

/// Pause between read passes of a reader thread.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const MS: i64 = 1_000_000;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting SensorFuse v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let seconds: u64 = match args.next() {
        Some(s) => s.parse().with_context(|| format!("invalid duration '{}'", s))?,
        None => 3,
    };

    let config = config::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate()?;

    let mut imu = ImuSimulator::new();

    // One buffer per instance tree keeps a single producer per slot
    let magnetic_buffer = Arc::new(CrossSensorBuffer::new());
    let gyro_buffer = Arc::new(CrossSensorBuffer::new());
    let magnetic = SharedSensor::new(build_magnetic(&config, &mut imu, &magnetic_buffer, "magn"));
    let gyro = SharedSensor::new(build_gyro(&config, &mut imu, &gyro_buffer));

    request(&magnetic, HANDLE_MAGNETIC_FIELD, 20);
    request(&magnetic, HANDLE_ORIENTATION, 100);
    request(&magnetic, HANDLE_GEOMAG_ROTATION_VECTOR, 200);
    request(&gyro, HANDLE_VIRTUAL_GYROSCOPE, 50);

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
    let simulator = imu.spawn(stop_rx).context("failed to start simulator")?;

    let (record_tx, record_rx) = crossbeam::channel::unbounded::<OutputRecord>();
    let running = Arc::new(AtomicBool::new(true));
    let readers = vec![
        spawn_reader("magnetic-reader", magnetic.clone(), record_tx.clone(), running.clone())?,
        spawn_reader("gyro-reader", gyro.clone(), record_tx, running.clone())?,
    ];

    let deadline = crossbeam::channel::after(Duration::from_secs(seconds));
    let stdout = std::io::stdout();
    let mut printed = 0usize;
    loop {
        crossbeam::select! {
            recv(record_rx) -> record => {
                let Ok(record) = record else { break };
                let mut out = stdout.lock();
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
                printed += 1;
            }
            recv(deadline) -> _ => break,
        }
    }

    running.store(false, Ordering::Relaxed);
    for reader in readers {
        if reader.join().is_err() {
            tracing::error!("Reader thread panicked");
        }
    }
    drop(stop_tx);
    if simulator.join().is_err() {
        tracing::error!("Simulator thread panicked");
    }

    magnetic.with(|m| m.shutdown());
    gyro.with(|g| g.shutdown());
    tracing::info!("Printed {} records", printed);
    Ok(())
}

fn build_magnetic(
    config: &PipelineConfig,
    imu: &mut ImuSimulator,
    buffer: &Arc<CrossSensorBuffer>,
    name: &str,
) -> MagneticInstance {
    let acc_source = imu.attach(&format!("{}-accel", name), DeviceKind::Accelerometer, &config.accel.axes);
    let accel = AccelInstance::new(config.accel.clone(), Box::new(acc_source), buffer.clone());
    let source = imu.attach(name, DeviceKind::Magnetometer, &config.magnetic.axes);
    MagneticInstance::new(
        config.magnetic.clone(),
        Box::new(source),
        accel,
        Box::new(HardIronCalibration::default()),
        Box::new(GeomagneticFusion::default()),
        buffer.clone(),
    )
}

fn build_gyro(
    config: &PipelineConfig,
    imu: &mut ImuSimulator,
    buffer: &Arc<CrossSensorBuffer>,
) -> GyroInstance {
    // The inner instance only has to publish its feed
    let mut inner = config.clone();
    inner.magnetic.active = vec![sensorfuse::VirtualSensorId::FusionMagnetic];
    let magnetic = build_magnetic(&inner, imu, buffer, "gyro-magn");

    GyroInstance::new(
        config.gyro.clone(),
        magnetic,
        Box::new(GeomagneticFusion::default()),
        buffer.clone(),
    )
}

/// Enable `handle` at `period_ms`, logging instead of failing when the
/// configuration leaves it out.
fn request<S: VirtualSensor>(sensor: &SharedSensor<S>, handle: i32, period_ms: i64) {
    let result = sensor
        .enable(handle, true)
        .and_then(|_| sensor.set_delay(handle, period_ms * MS));
    match result {
        Ok(()) => tracing::info!("Handle {} enabled at {} ms", handle, period_ms),
        Err(e) => tracing::warn!("Handle {} not enabled: {} ({})", handle, e, e.errno()),
    }
}

fn spawn_reader<S: VirtualSensor + 'static>(
    name: &str,
    sensor: SharedSensor<S>,
    records: crossbeam::channel::Sender<OutputRecord>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let name = name.to_string();
    std::thread::Builder::new().name(name.clone()).spawn(move || {
        let mut out = Vec::with_capacity(READ_BATCH);
        while running.load(Ordering::Relaxed) {
            out.clear();
            match sensor.read_events(&mut out, READ_BATCH) {
                Ok(_) => {
                    for record in out.drain(..) {
                        if records.send(record).is_err() {
                            return;
                        }
                    }
                }
                Err(SensorError::Io(e)) => {
                    tracing::warn!("{}: raw source closed: {}", name, e);
                    break;
                }
                Err(e) => tracing::debug!("{}: read failed: {}", name, e),
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    })
}
