//! Control laws: how the rate setpoint of an axis is formed from the pilot
//! command and, in the self-leveling laws, from the attitude error.

use crate::axis::{Axis, AxisArray};
use crate::profile::LevelSettings;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Estimated attitude, degrees. Positive roll is right wing down, positive
/// pitch is nose up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
}

/// Accelerometer trims applied to the attitude before leveling, degrees.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct RollPitchTrims {
    pub roll: f32,
    pub pitch: f32,
}

impl Attitude {
    /// Trimmed inclination on a roll or pitch axis, 0 for yaw.
    pub fn trimmed(&self, axis: Axis, trims: &RollPitchTrims) -> f32 {
        match axis {
            Axis::Roll => self.roll - trims.roll,
            Axis::Pitch => self.pitch - trims.pitch,
            Axis::Yaw => 0.0,
        }
    }

    /// 0 level, 90 vertical, 180 inverted.
    pub fn inclination(&self) -> f32 {
        self.roll.abs().max(self.pitch.abs())
    }
}

/// Externally owned mode bits, read once per tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct FlightModeFlags {
    pub armed: bool,
    /// Stabilization gate; off means every output is forced to zero.
    pub stabilization: bool,
    pub angle_mode: bool,
    pub horizon_mode: bool,
    /// Mixer reports airmode active, enables absolute control integration.
    pub airmode: bool,
}

impl FlightModeFlags {
    pub fn level_mode(&self) -> bool {
        self.angle_mode || self.horizon_mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLaw {
    /// Pure rate tracking.
    Acro,
    /// Attitude hold, the stick commands an angle.
    Angle,
    /// Leveling fading out as the stick moves away from center.
    Horizon,
}

impl ControlLaw {
    /// Yaw always flies rate; leveling needs an attitude estimate.
    pub fn select(modes: &FlightModeFlags, axis: Axis, attitude: Option<&Attitude>) -> Self {
        if axis.is_yaw() || attitude.is_none() {
            ControlLaw::Acro
        } else if modes.angle_mode {
            ControlLaw::Angle
        } else if modes.horizon_mode {
            ControlLaw::Horizon
        } else {
            ControlLaw::Acro
        }
    }

    /// Angle leveling produces a P-like term only.
    pub fn holds_iterm(self) -> bool {
        matches!(self, ControlLaw::Angle)
    }

    pub fn zeroes_dterm(self) -> bool {
        matches!(self, ControlLaw::Angle)
    }

    pub fn feeds_forward(self) -> bool {
        !matches!(self, ControlLaw::Angle)
    }
}

/// Precomputed leveling constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelController {
    angle_limit: f32,
    level_gain: f32,
    horizon_gain: f32,
    horizon_transition: f32,
    horizon_factor_ratio: f32,
    horizon_cutoff_degrees: f32,
    expert_mode: bool,
}

impl LevelController {
    pub fn new(settings: &LevelSettings) -> Self {
        Self {
            angle_limit: settings.angle_limit,
            level_gain: settings.angle_strength / 10.0,
            horizon_gain: settings.horizon_strength / 10.0,
            horizon_transition: settings.horizon_transition,
            horizon_factor_ratio: (100.0 - settings.horizon_tilt_effect) * 0.01,
            horizon_cutoff_degrees: (175.0 - settings.horizon_tilt_effect) * 1.8,
            expert_mode: settings.horizon_tilt_expert_mode,
        }
    }

    /// Horizon leveling strength: 1 at center stick, falling to 0 toward full
    /// deflection, lowered further as the craft tilts.
    pub fn horizon_strength(&self, deflection: &AxisArray<f32>, attitude: &Attitude) -> f32 {
        let stick = 1.0 - deflection[Axis::Roll].abs().max(deflection[Axis::Pitch].abs());
        let inclination = attitude.inclination();

        let strength = if self.expert_mode {
            if self.horizon_transition > 0.0 && self.horizon_cutoff_degrees > 0.0 {
                let tilt_ratio = ((self.horizon_cutoff_degrees - inclination)
                    / self.horizon_cutoff_degrees)
                    .clamp(0.0, 1.0);
                ((stick - 1.0) * 100.0 / self.horizon_transition + 1.0) * tilt_ratio
            } else {
                0.0
            }
        } else {
            let sensitivity = if self.horizon_factor_ratio < 1.01 {
                let tilt_ratio = (180.0 - inclination) / 180.0 * (1.0 - self.horizon_factor_ratio)
                    + self.horizon_factor_ratio;
                self.horizon_transition * tilt_ratio
            } else {
                self.horizon_transition
            };
            if sensitivity <= 0.0 {
                0.0
            } else {
                (stick - 1.0) * (100.0 / sensitivity) + 1.0
            }
        };
        strength.clamp(0.0, 1.0)
    }

    /// Angle between the commanded and the trimmed measured inclination.
    pub fn angle_error(
        &self,
        axis: Axis,
        deflection: f32,
        attitude: &Attitude,
        trims: &RollPitchTrims,
    ) -> f32 {
        let commanded = (self.angle_limit * deflection).clamp(-self.angle_limit, self.angle_limit);
        commanded - attitude.trimmed(axis, trims)
    }

    /// Rate setpoint of `axis` under `law`.
    #[allow(clippy::too_many_arguments)]
    pub fn setpoint(
        &self,
        law: ControlLaw,
        axis: Axis,
        rate_setpoint: f32,
        deflection: f32,
        attitude: Option<&Attitude>,
        trims: &RollPitchTrims,
        horizon_strength: f32,
    ) -> f32 {
        let Some(attitude) = attitude else {
            return rate_setpoint;
        };
        match law {
            ControlLaw::Acro => rate_setpoint,
            ControlLaw::Angle => self.angle_error(axis, deflection, attitude, trims) * self.level_gain,
            ControlLaw::Horizon => {
                let error = self.angle_error(axis, deflection, attitude, trims);
                rate_setpoint + error * self.horizon_gain * horizon_strength
            }
        }
    }

    /// Rate setpoint driving a roll or pitch axis back to level.
    pub fn recovery_setpoint(&self, axis: Axis, attitude: &Attitude, trims: &RollPitchTrims) -> f32 {
        -attitude.trimmed(axis, trims) * self.level_gain
    }
}
