//! Control and reader threads sharing one instance.

use crate::mock_engines::{magnetic_rig, MS};
use sensorfuse::config::MagneticConfig;
use sensorfuse::sensors::types::{HANDLE_MAGNETIC_FIELD, HANDLE_UNCALIB_MAGNETIC_FIELD};
use sensorfuse::{OutputRecord, SharedSensor, VirtualSensorId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A sensor enabled on the control thread is served on the reader thread.
#[test]
fn test_enable_on_one_thread_read_on_another() {
    let rig = magnetic_rig(MagneticConfig::default());
    let feed = rig.mag_feed.clone();
    let shared = SharedSensor::new(rig.mag);

    let control = {
        let shared = shared.clone();
        std::thread::spawn(move || {
            shared.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
            shared.set_delay(HANDLE_MAGNETIC_FIELD, 20 * MS).unwrap();
        })
    };
    control.join().unwrap();
    assert!(shared.has_pending_events());

    for t in 1..=4 {
        feed.send_frame([10, 10, 10], t * 20 * MS);
    }

    let reader = {
        let shared = shared.clone();
        std::thread::spawn(move || {
            let mut out = Vec::new();
            shared.read_events(&mut out, 16).unwrap();
            out
        })
    };
    let out = reader.join().unwrap();
    assert_eq!(out.len(), 4);
    assert!(!shared.has_pending_events());
}

/// Toggling a sensor while a reader is running never yields records for
/// sensors outside the configured set or out of timestamp order.
#[test]
fn test_concurrent_toggle_and_read() {
    let rig = magnetic_rig(MagneticConfig::default());
    let feed = rig.mag_feed.clone();
    let shared = SharedSensor::new(rig.mag);
    shared.enable(HANDLE_MAGNETIC_FIELD, true).unwrap();
    shared.set_delay(HANDLE_MAGNETIC_FIELD, 20 * MS).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let shared = shared.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut records: Vec<OutputRecord> = Vec::new();
            loop {
                let finished = done.load(Ordering::Acquire);
                let mut out = Vec::new();
                shared.read_events(&mut out, 8).unwrap();
                records.extend(out);
                if finished {
                    break;
                }
                std::thread::yield_now();
            }
            records
        })
    };

    for t in 1..=200i64 {
        let on = t % 2 == 0;
        shared.enable(HANDLE_UNCALIB_MAGNETIC_FIELD, on).unwrap();
        if on {
            shared.set_delay(HANDLE_UNCALIB_MAGNETIC_FIELD, 40 * MS).unwrap();
        }
        feed.send_frame([10, 20, 30], t * 20 * MS);
    }
    done.store(true, Ordering::Release);

    let mut records = reader.join().unwrap();
    // Drain anything fed after the reader's final pass
    loop {
        let mut out = Vec::new();
        if shared.read_events(&mut out, 64).unwrap() == 0 {
            break;
        }
        records.extend(out);
    }

    let magnetic = records
        .iter()
        .filter(|r| r.sensor == VirtualSensorId::Magnetic)
        .count();
    assert_eq!(magnetic, 200);
    assert!(records.iter().all(|r| matches!(
        r.sensor,
        VirtualSensorId::Magnetic | VirtualSensorId::UncalibratedMagnetic
    )));
    assert!(records
        .windows(2)
        .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    shared.with(|mag| assert!(mag.is_streaming()));
}
