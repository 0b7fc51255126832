use crate::axis::{Axis, AxisArray};
use crate::timing::LoopTiming;
use bincode::{Decode, Encode};

/// Anticipatory term from the rate of change of the pilot setpoint.
///
/// The estimate is a pure first difference, so a steady stick yields exactly
/// zero on the next tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct FeedForward {
    previous_setpoint: AxisArray<f32>,
    /// Inverse of the transition point as a fraction of stick travel, 0 when disabled.
    transition_inv: f32,
    frequency: f32,
}

impl FeedForward {
    pub fn new(transition: f32, timing: LoopTiming) -> Self {
        let transition_inv = if transition > 0.0 {
            100.0 / transition
        } else {
            0.0
        };
        Self {
            previous_setpoint: AxisArray::default(),
            transition_inv,
            frequency: timing.frequency(),
        }
    }

    /// Attenuation near center stick, reaching 1 at the transition point.
    pub fn transition(&self, deflection: f32) -> f32 {
        if self.transition_inv > 0.0 {
            (deflection.abs() * self.transition_inv).min(1.0)
        } else {
            1.0
        }
    }

    /// Advances the setpoint history of `axis` and returns F for it.
    pub fn compute(&mut self, axis: Axis, setpoint: f32, deflection: f32, kf: f32, enabled: bool) -> f32 {
        let delta = setpoint - self.previous_setpoint[axis];
        self.previous_setpoint[axis] = setpoint;
        if !enabled || kf == 0.0 {
            return 0.0;
        }
        kf * self.transition(deflection) * delta * self.frequency
    }

    /// Keeps the history current while outputs are gated.
    pub fn track(&mut self, axis: Axis, setpoint: f32) {
        self.previous_setpoint[axis] = setpoint;
    }

    /// Continues from the setpoint history of `previous` after a re-init.
    pub fn carry_over(&mut self, previous: &FeedForward) {
        self.previous_setpoint = previous.previous_setpoint;
    }
}
