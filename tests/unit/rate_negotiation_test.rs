//! Unit tests for physical period negotiation.

use sensorfuse::sensors::decimation::DecimationTable;
use sensorfuse::sensors::rate::RateNegotiator;
use sensorfuse::VirtualSensorId;

/// Small deterministic generator so sequences are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Two sensors at 10 ms and 25 ms run the hardware at 10 ms.
#[test]
fn test_two_sensor_scenario() {
    let mut rates = RateNegotiator::new();
    let mut table = DecimationTable::new();
    let mut writes = Vec::new();

    rates
        .set_delay(VirtualSensorId::Magnetic, 10, &mut table, |ms| {
            writes.push(ms);
            Ok(())
        })
        .unwrap();
    rates
        .set_delay(VirtualSensorId::Orientation, 25, &mut table, |ms| {
            writes.push(ms);
            Ok(())
        })
        .unwrap();

    assert_eq!(rates.programmed_period(), Some(10));
    assert_eq!(writes, vec![10]);
    assert_eq!(table.threshold(VirtualSensorId::Magnetic), 1);
    assert_eq!(table.threshold(VirtualSensorId::Orientation), 2);
}

/// Over arbitrary request sequences the period is the minimum non-zero
/// request and every threshold is the floored ratio.
#[test]
fn test_period_is_minimum_of_requests() {
    let ids = [
        VirtualSensorId::Magnetic,
        VirtualSensorId::UncalibratedMagnetic,
        VirtualSensorId::Orientation,
        VirtualSensorId::Gravity,
        VirtualSensorId::LinearAcceleration,
    ];
    let mut rng = Lcg(7);

    for _ in 0..20 {
        let mut rates = RateNegotiator::new();
        let mut table = DecimationTable::new();

        for _ in 0..30 {
            let id = ids[(rng.next() % ids.len() as u64) as usize];
            if rng.next() % 4 == 0 {
                rates.clear(id, &mut table, |_| Ok(())).unwrap();
            } else {
                let period = 1 + rng.next() % 200;
                rates.set_delay(id, period, &mut table, |_| Ok(())).unwrap();
            }

            let expected = ids
                .iter()
                .map(|id| rates.requested(*id))
                .filter(|ms| *ms > 0)
                .min();
            assert_eq!(rates.effective_period(), expected);

            if let Some(period) = expected {
                assert_eq!(rates.programmed_period(), Some(period));
                for id in ids {
                    assert_eq!(
                        table.threshold(id) as u64,
                        rates.requested(id) / period,
                        "{id}"
                    );
                }
            }
        }
    }
}

/// A zero request neither records anything nor touches the hardware.
#[test]
fn test_zero_request_is_ignored() {
    let mut rates = RateNegotiator::new();
    let mut table = DecimationTable::new();

    rates
        .set_delay(VirtualSensorId::Gravity, 50, &mut table, |_| Ok(()))
        .unwrap();
    rates
        .set_delay(VirtualSensorId::Gravity, 0, &mut table, |_| {
            panic!("no write expected")
        })
        .unwrap();

    assert_eq!(rates.requested(VirtualSensorId::Gravity), 50);
    assert_eq!(rates.programmed_period(), Some(50));
}

/// A calibration ceiling runs the hardware faster than any consumer asked.
#[test]
fn test_ceiling_is_an_override() {
    let mut rates = RateNegotiator::new().with_ceiling(40);
    let mut table = DecimationTable::new();

    rates
        .set_delay(VirtualSensorId::Magnetic, 100, &mut table, |_| Ok(()))
        .unwrap();
    rates
        .set_delay(VirtualSensorId::UncalibratedMagnetic, 200, &mut table, |_| Ok(()))
        .unwrap();

    assert_eq!(rates.programmed_period(), Some(40));
    assert_eq!(table.threshold(VirtualSensorId::Magnetic), 2);
    assert_eq!(table.threshold(VirtualSensorId::UncalibratedMagnetic), 5);
}
