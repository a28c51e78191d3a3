//! Enabled-set bookkeeping for one instance.
//!
//! The machine only decides; the owning instance performs the side effects
//! (bringing the physical stream up, cascading to dependents) between
//! [`EnableStateMachine::request`] and [`EnableStateMachine::commit`], so a
//! failed bring-up leaves the mask untouched.

use crate::sensors::types::{EnabledMask, SensorError, VirtualSensorId};

/// Effect of an enable/disable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Request matches the current state; nothing to do
    Unchanged,
    /// First bit set: the physical stream and dependents must come up
    BringUp(VirtualSensorId),
    /// Bit set while others were already active
    Enable(VirtualSensorId),
    /// Bit cleared while others stay active
    Disable(VirtualSensorId),
    /// Last bit cleared: the physical stream and dependents must go down
    TearDown(VirtualSensorId),
}

/// Tracks which of an instance's virtual sensors are active.
#[derive(Debug, Clone)]
pub struct EnableStateMachine {
    supported: EnabledMask,
    enabled: EnabledMask,
}

impl EnableStateMachine {
    /// `supported` is the set of ids this instance serves.
    pub fn new(supported: EnabledMask) -> Self {
        Self {
            supported,
            enabled: EnabledMask::empty(),
        }
    }

    pub fn supported(&self) -> EnabledMask {
        self.supported
    }

    pub fn enabled(&self) -> EnabledMask {
        self.enabled
    }

    pub fn is_enabled(&self, id: VirtualSensorId) -> bool {
        self.enabled.contains(id)
    }

    /// True while at least one sensor is active.
    pub fn is_streaming(&self) -> bool {
        !self.enabled.is_empty()
    }

    /// Work out what turning `id` on or off would mean.
    pub fn request(&self, id: VirtualSensorId, on: bool) -> Result<Transition, SensorError> {
        if !self.supported.contains(id) {
            return Err(SensorError::UnknownTarget(id.handle()));
        }

        let transition = match (on, self.enabled.contains(id)) {
            (true, true) | (false, false) => Transition::Unchanged,
            (true, false) if self.enabled.is_empty() => Transition::BringUp(id),
            (true, false) => Transition::Enable(id),
            (false, true) => {
                let mut remaining = self.enabled;
                remaining.remove(id);
                if remaining.is_empty() {
                    Transition::TearDown(id)
                } else {
                    Transition::Disable(id)
                }
            }
        };
        Ok(transition)
    }

    /// Apply a transition once its side effects succeeded.
    pub fn commit(&mut self, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::BringUp(id) | Transition::Enable(id) => self.enabled.insert(id),
            Transition::Disable(id) | Transition::TearDown(id) => self.enabled.remove(id),
        }
        tracing::debug!("{:?}, enabled mask {:#06x}", transition, self.enabled.bits());
    }
}
