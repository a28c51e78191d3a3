//! Latest-value slots shared between independently scheduled instances.
//!
//! One instance publishes its freshest computed vector, others fetch a
//! snapshot on their own schedule. Each slot has its own mutex, held only
//! for a fixed-size copy, so readers never wait on a numerical engine.

use crate::sensors::types::Accuracy;
use glam::Vec3;
use std::sync::{Mutex, MutexGuard};

/// Names of the shared slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotName {
    /// Last accelerometer vector (m/s^2)
    Acceleration,
    /// Last calibrated magnetic vector (uT)
    Magnetic,
    /// Last synthesized angular rate (rad/s)
    AngularRate,
}

impl SlotName {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            SlotName::Acceleration => 0,
            SlotName::Magnetic => 1,
            SlotName::AngularRate => 2,
        }
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlotValue {
    pub vector: Vec3,
    pub accuracy: Accuracy,
}

impl SlotValue {
    pub fn new(vector: Vec3, accuracy: Accuracy) -> Self {
        Self { vector, accuracy }
    }
}

/// Explicitly constructed context shared (via `Arc`) between the instances
/// that cross-feed each other.
#[derive(Debug, Default)]
pub struct CrossSensorBuffer {
    slots: [Mutex<SlotValue>; SlotName::COUNT],
}

impl CrossSensorBuffer {
    /// All slots start as a zero vector tagged unreliable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a slot with the latest value.
    pub fn publish(&self, slot: SlotName, vector: Vec3, accuracy: Accuracy) {
        *self.lock(slot) = SlotValue::new(vector, accuracy);
    }

    /// Copy out the most recently published value.
    pub fn fetch(&self, slot: SlotName) -> SlotValue {
        *self.lock(slot)
    }

    // A writer cannot leave a slot half-written, so a poisoned lock still
    // guards a consistent value.
    fn lock(&self, slot: SlotName) -> MutexGuard<'_, SlotValue> {
        self.slots[slot.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
