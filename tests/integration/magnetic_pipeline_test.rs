//! Magnetic instance end to end over channel sources.

use crate::mock_engines::{magnetic_rig, magnetic_rig_on, MagneticRig, BIAS, GRAVITY, MS, ORIENTATION};
use glam::Vec3;
use sensorfuse::config::MagneticConfig;
use sensorfuse::sensors::types::{
    Accuracy, Payload, HANDLE_GEOMAG_ROTATION_VECTOR, HANDLE_GRAVITY, HANDLE_MAGNETIC_FIELD,
    HANDLE_ORIENTATION, HANDLE_UNCALIB_MAGNETIC_FIELD,
};
use sensorfuse::{CrossSensorBuffer, SensorError, VirtualSensor, VirtualSensorId};
use std::sync::Arc;

fn without_calibration() -> MagneticConfig {
    MagneticConfig {
        calibration_enabled: false,
        ..MagneticConfig::default()
    }
}

fn request(r: &mut MagneticRig, handle: i32, period_ms: i64) {
    r.mag.enable(handle, true).unwrap();
    r.mag.set_delay(handle, period_ms * MS).unwrap();
}

fn read(r: &mut MagneticRig, max_count: usize) -> Vec<sensorfuse::OutputRecord> {
    let mut out = Vec::new();
    let n = r.mag.read_events(&mut out, max_count).unwrap();
    assert_eq!(n, out.len());
    out
}

/// Enabling twice leaves the mask and the hardware untouched.
#[test]
fn test_repeated_enable_has_no_side_effects() {
    let mut r = magnetic_rig(MagneticConfig::default());
    r.mag.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();

    let mag_before = r.mag_feed.monitor().snapshot();
    let acc_before = r.acc_feed.monitor().snapshot();
    let mask_before = r.mag.enabled();

    r.mag.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
    assert_eq!(r.mag_feed.monitor().snapshot(), mag_before);
    assert_eq!(r.acc_feed.monitor().snapshot(), acc_before);
    assert_eq!(r.mag.enabled(), mask_before);
}

/// The last disable stops the stream and the reference exactly once.
#[test]
fn test_last_disable_tears_down_once() {
    let mut r = magnetic_rig(MagneticConfig::default());
    r.mag.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
    r.mag.enable(HANDLE_ORIENTATION, true).unwrap();

    r.mag.enable(HANDLE_MAGNETIC_FIELD, false).unwrap();
    assert!(r.mag_feed.monitor().is_enabled());
    assert!(r.acc_feed.monitor().is_enabled());

    r.mag.enable(HANDLE_ORIENTATION, false).unwrap();
    r.mag.enable(HANDLE_ORIENTATION, false).unwrap();

    let mag = r.mag_feed.monitor().snapshot();
    let acc = r.acc_feed.monitor().snapshot();
    assert!(!mag.enabled && !acc.enabled);
    assert_eq!(mag.enable_writes, 2);
    assert_eq!(acc.enable_writes, 2);
}

/// Calibrated and uncalibrated outputs carry the offset and its accuracy.
#[test]
fn test_calibrated_and_uncalibrated_outputs() {
    let mut r = magnetic_rig(MagneticConfig::default());
    request(&mut r, HANDLE_MAGNETIC_FIELD, 20);
    request(&mut r, HANDLE_UNCALIB_MAGNETIC_FIELD, 20);

    r.mag_feed.send_frame([100, 200, 300], 5 * MS);
    let out = read(&mut r, 8);
    assert_eq!(out.len(), 2);

    let raw = Vec3::new(10.0, 20.0, 30.0);
    assert_eq!(out[0].sensor, VirtualSensorId::Magnetic);
    assert_eq!(out[0].accuracy, Accuracy::Medium);
    match out[0].payload {
        Payload::Vector { value } => assert!((value - (raw - BIAS)).length() < 1e-4),
        other => panic!("unexpected payload {other:?}"),
    }

    assert_eq!(out[1].sensor, VirtualSensorId::UncalibratedMagnetic);
    match out[1].payload {
        Payload::Uncalibrated { uncalibrated, bias } => {
            assert!((uncalibrated - raw).length() < 1e-4);
            assert_eq!(bias, BIAS);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(out.iter().all(|o| o.timestamp_ns == 5 * MS));
}

/// Geomagnetic outputs come from the fusion engine fed with the reference
/// accelerometer and the calibrated field.
#[test]
fn test_geomagnetic_outputs() {
    let mut r = magnetic_rig(MagneticConfig::default());
    r.fusion.set_ready(true);
    request(&mut r, HANDLE_ORIENTATION, 20);
    request(&mut r, HANDLE_GRAVITY, 20);
    request(&mut r, HANDLE_GEOMAG_ROTATION_VECTOR, 20);

    r.acc_feed.send_frame([0, 0, 1000], 1);
    r.mag_feed.send_frame([100, 200, 300], 2);
    let out = read(&mut r, 8);

    let sensors: Vec<_> = out.iter().map(|o| o.sensor).collect();
    assert_eq!(
        sensors,
        vec![
            VirtualSensorId::Orientation,
            VirtualSensorId::Gravity,
            VirtualSensorId::GeomagneticRotationVector,
        ]
    );
    assert_eq!(
        out[0].payload,
        Payload::Angles {
            azimuth: ORIENTATION.x,
            pitch: ORIENTATION.y,
            roll: ORIENTATION.z,
        }
    );
    assert_eq!(out[1].payload, Payload::vector(GRAVITY));
    assert_eq!(out[1].accuracy, Accuracy::High);
    match out[2].payload {
        Payload::RotationVector {
            heading_accuracy, ..
        } => assert_eq!(heading_accuracy, None),
        other => panic!("unexpected payload {other:?}"),
    }

    let script = r.fusion.lock();
    assert_eq!(script.deltas, vec![20]);
    assert!((script.last_acceleration - GRAVITY).length() < 1e-3);
    assert!((script.last_magnetic - (Vec3::new(10.0, 20.0, 30.0) - BIAS)).length() < 1e-4);
}

/// Boundary case: a firing cycle on which the engine is not ready is lost
/// and the sensor waits for its next full period.
#[test]
fn test_not_ready_cycle_is_skipped() {
    let mut r = magnetic_rig(without_calibration());
    // 40 ms over the 20 ms geomagnetic clock: threshold 2
    request(&mut r, HANDLE_ORIENTATION, 40);
    assert_eq!(r.mag.physical_period(), Some(20));

    for t in 1..=3 {
        r.mag_feed.send_frame([100, 200, 300], 20 * t * MS);
    }
    assert!(read(&mut r, 8).is_empty());

    r.fusion.set_ready(true);
    for t in 4..=6 {
        r.mag_feed.send_frame([100, 200, 300], 20 * t * MS);
    }
    let stamps: Vec<i64> = read(&mut r, 8).iter().map(|o| o.timestamp_ns).collect();
    assert_eq!(stamps, vec![80 * MS, 120 * MS]);
}

/// A sensor whose engine is not ready leaves the capacity to the others.
#[test]
fn test_not_ready_keeps_capacity() {
    let mut r = magnetic_rig(without_calibration());
    r.fusion.lock().ready = true;
    request(&mut r, HANDLE_ORIENTATION, 20);
    request(&mut r, HANDLE_GRAVITY, 20);

    r.mag_feed.send_frame([100, 200, 300], MS);
    let out = read(&mut r, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].sensor, VirtualSensorId::Gravity);
}

/// A full output buffer ends the pass; the next pass resumes where the
/// raw source stopped.
#[test]
fn test_read_resumes_after_capacity_exhausted() {
    let mut r = magnetic_rig(MagneticConfig::default());
    request(&mut r, HANDLE_MAGNETIC_FIELD, 20);
    request(&mut r, HANDLE_UNCALIB_MAGNETIC_FIELD, 20);

    for t in 1..=3 {
        r.mag_feed.send_frame([1, 1, 1], t * 20 * MS);
    }

    let first: Vec<i64> = read(&mut r, 4).iter().map(|o| o.timestamp_ns).collect();
    assert_eq!(first, vec![20 * MS, 20 * MS, 40 * MS, 40 * MS]);

    let second: Vec<i64> = read(&mut r, 4).iter().map(|o| o.timestamp_ns).collect();
    assert_eq!(second, vec![60 * MS, 60 * MS]);
}

/// Unknown handles fail without touching any state.
#[test]
fn test_unknown_handle() {
    let mut r = magnetic_rig(MagneticConfig::default());

    let err = r.mag.enable(99, true).unwrap_err();
    assert_eq!(err, SensorError::UnknownTarget(99));
    assert_eq!(err.errno(), -22);
    assert!(r.mag.set_delay(99, 20 * MS).is_err());

    assert_eq!(r.mag_feed.monitor().snapshot(), Default::default());
    assert!(r.mag.enabled().is_empty());
}

/// Zero capacity is an invalid argument.
#[test]
fn test_zero_capacity() {
    let mut r = magnetic_rig(MagneticConfig::default());
    let mut out = Vec::new();
    let err = r.mag.read_events(&mut out, 0).unwrap_err();
    assert!(matches!(err, SensorError::InvalidArgument(_)));
    assert!(err.errno() < 0);
}

/// A missing device keeps the instance constructible but non-functional.
#[test]
fn test_unavailable_magnetometer() {
    let mut r = magnetic_rig_on(
        MagneticConfig::default(),
        Arc::new(CrossSensorBuffer::new()),
        false,
    );
    let mut out = Vec::new();
    let err = r.mag.read_events(&mut out, 4).unwrap_err();
    assert!(matches!(err, SensorError::HardwareUnavailable(_)));
    assert_eq!(err.errno(), -19);

    assert!(r.mag.enable(HANDLE_MAGNETIC_FIELD, true).is_err());
    assert!(r.mag.enabled().is_empty());
}

/// A failed period write is reported and the old period stays in force.
#[test]
fn test_failed_period_write() {
    let mut r = magnetic_rig(MagneticConfig::default());
    request(&mut r, HANDLE_MAGNETIC_FIELD, 20);

    r.mag_feed.monitor().set_fail_writes(true);
    let err = r.mag.set_delay(HANDLE_UNCALIB_MAGNETIC_FIELD, 10 * MS).unwrap_err();
    assert!(matches!(err, SensorError::Io(_)));
    assert_eq!(r.mag.physical_period(), Some(20));
    assert_eq!(r.mag_feed.monitor().period_ms(), Some(20));
}

/// Periods that round down to zero milliseconds are ignored.
#[test]
fn test_sub_millisecond_delay_is_ignored() {
    let mut r = magnetic_rig(MagneticConfig::default());
    r.mag.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
    r.mag.set_delay(HANDLE_MAGNETIC_FIELD, 999_999).unwrap();
    r.mag.set_delay(HANDLE_MAGNETIC_FIELD, 0).unwrap();

    assert_eq!(r.mag_feed.monitor().snapshot().period_writes, 0);
    assert_eq!(r.mag.physical_period(), None);
}

/// The pending flag is raised on bring-up and cleared by a read.
#[test]
fn test_pending_flag() {
    let mut r = magnetic_rig(MagneticConfig::default());
    assert!(!r.mag.has_pending_events());
    r.mag.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
    assert!(r.mag.has_pending_events());

    read(&mut r, 4);
    assert!(!r.mag.has_pending_events());
}

/// Dropping the instance tears down its stream and reference once.
#[test]
fn test_drop_tears_down() {
    let mut r = magnetic_rig(MagneticConfig::default());
    request(&mut r, HANDLE_MAGNETIC_FIELD, 20);
    request(&mut r, HANDLE_ORIENTATION, 20);

    let MagneticRig {
        mag,
        mag_feed,
        acc_feed,
        ..
    } = r;
    drop(mag);

    assert!(!mag_feed.monitor().is_enabled());
    assert!(!acc_feed.monitor().is_enabled());
    assert_eq!(mag_feed.monitor().snapshot().enable_writes, 2);
    assert_eq!(acc_feed.monitor().snapshot().enable_writes, 2);
}
