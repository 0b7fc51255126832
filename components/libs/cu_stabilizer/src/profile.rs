//! Tunable configuration of the stabilizer.
//!
//! Gains are stored in the integer-style units pilots tune with (`P = 40`),
//! the controller scales them at `init`. Every struct is `#[serde(default)]`
//! so a RON profile only has to name what differs from the reference tune.

use crate::axis::{Axis, AxisArray};
use crate::error::{StabilizerError, StabilizerResult};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Raw per-axis gains.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub f: f32,
}

impl PidGains {
    pub const fn new(p: f32, i: f32, d: f32, f: f32) -> Self {
        Self { p, i, d, f }
    }
}

/// Self-leveling (angle and horizon) settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelSettings {
    /// Angle mode leveling strength.
    pub angle_strength: f32,
    /// Horizon mode leveling strength.
    pub horizon_strength: f32,
    /// Stick sensitivity of the horizon blend.
    pub horizon_transition: f32,
    /// Maximum commanded inclination, degrees.
    pub angle_limit: f32,
    /// 0..=250, how much inclination reduces horizon leveling.
    pub horizon_tilt_effect: f32,
    pub horizon_tilt_expert_mode: bool,
}

impl Default for LevelSettings {
    fn default() -> Self {
        Self {
            angle_strength: 50.0,
            horizon_strength: 50.0,
            horizon_transition: 75.0,
            angle_limit: 55.0,
            horizon_tilt_effect: 75.0,
            horizon_tilt_expert_mode: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum DtermLowpassType {
    Pt1,
    #[default]
    Biquad,
}

/// Signal the derivative is taken from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum DtermSource {
    /// Derivative on the measured rate, no kick on setpoint steps.
    #[default]
    Measurement,
    /// Derivative on the rate error.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtermFilterSettings {
    pub source: DtermSource,
    pub lowpass_type: DtermLowpassType,
    pub lowpass_hz: f32,
    pub lowpass2_hz: f32,
    pub notch_hz: f32,
    pub notch_cutoff_hz: f32,
}

impl Default for DtermFilterSettings {
    fn default() -> Self {
        Self {
            source: DtermSource::Measurement,
            lowpass_type: DtermLowpassType::Biquad,
            lowpass_hz: 100.0,
            lowpass2_hz: 0.0,
            notch_hz: 260.0,
            notch_cutoff_hz: 160.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum ItermRelaxMode {
    #[default]
    Off,
    Rp,
    Rpy,
    RpInc,
    RpyInc,
}

impl ItermRelaxMode {
    pub fn applies_to(self, axis: Axis) -> bool {
        match self {
            ItermRelaxMode::Off => false,
            ItermRelaxMode::Rp | ItermRelaxMode::RpInc => !axis.is_yaw(),
            ItermRelaxMode::Rpy | ItermRelaxMode::RpyInc => true,
        }
    }

    /// INC variants let integration that shrinks |I| through untouched.
    pub fn increment_only(self) -> bool {
        matches!(self, ItermRelaxMode::RpInc | ItermRelaxMode::RpyInc)
    }
}

impl FromStr for ItermRelaxMode {
    type Err = StabilizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ItermRelaxMode::Off),
            "rp" => Ok(ItermRelaxMode::Rp),
            "rpy" => Ok(ItermRelaxMode::Rpy),
            "rp_inc" => Ok(ItermRelaxMode::RpInc),
            "rpy_inc" => Ok(ItermRelaxMode::RpyInc),
            _ => Err(unknown("iterm_relax", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum ItermRelaxType {
    #[default]
    Setpoint,
    Gyro,
}

impl FromStr for ItermRelaxType {
    type Err = StabilizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "setpoint" => Ok(ItermRelaxType::Setpoint),
            "gyro" => Ok(ItermRelaxType::Gyro),
            _ => Err(unknown("iterm_relax_type", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum AntiGravityMode {
    #[default]
    Smooth,
    Step,
}

impl FromStr for AntiGravityMode {
    type Err = StabilizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smooth" => Ok(AntiGravityMode::Smooth),
            "step" => Ok(AntiGravityMode::Step),
            _ => Err(unknown("anti_gravity_mode", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum CrashRecoveryMode {
    #[default]
    Off,
    /// Detect and fly the recovery.
    On,
    /// Like `On`, and ask for an audible alert while recovering.
    Beep,
    /// Detect only, and ask the arming layer to disarm.
    Disarm,
}

impl FromStr for CrashRecoveryMode {
    type Err = StabilizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(CrashRecoveryMode::Off),
            "on" => Ok(CrashRecoveryMode::On),
            "beep" => Ok(CrashRecoveryMode::Beep),
            "disarm" => Ok(CrashRecoveryMode::Disarm),
            _ => Err(unknown("crash_recovery", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashSettings {
    pub mode: CrashRecoveryMode,
    /// Recovery timeout, ms.
    pub time_ms: u16,
    /// Divergence dwell before recovery starts, ms.
    pub delay_ms: u16,
    /// Attitude considered level again, degrees.
    pub recovery_angle: f32,
    /// Rotation rate considered settled, deg/s.
    pub recovery_rate: f32,
    /// Rate derivative threshold, thousands of deg/s².
    pub dthreshold: f32,
    /// Rate error threshold, deg/s.
    pub gthreshold: f32,
    /// Pilot setpoint above which divergence is considered commanded, deg/s.
    pub setpoint_threshold: f32,
    /// Yaw error clamp while recovering, deg/s.
    pub limit_yaw: f32,
}

impl Default for CrashSettings {
    fn default() -> Self {
        Self {
            mode: CrashRecoveryMode::Off,
            time_ms: 500,
            delay_ms: 0,
            recovery_angle: 10.0,
            recovery_rate: 100.0,
            dthreshold: 50.0,
            gthreshold: 400.0,
            setpoint_threshold: 350.0,
            limit_yaw: 200.0,
        }
    }
}

/// The active PID profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidProfile {
    pub pid: AxisArray<PidGains>,
    pub level: LevelSettings,

    pub pid_sum_limit: f32,
    pub pid_sum_limit_yaw: f32,

    pub iterm_limit: f32,
    /// Saturation (percent of motor mix range) where windup protection starts.
    pub iterm_windup_point_percent: u8,
    pub iterm_rotation: bool,
    pub iterm_relax: ItermRelaxMode,
    pub iterm_relax_type: ItermRelaxType,
    pub iterm_relax_cutoff: f32,

    pub abs_control_gain: f32,
    pub abs_control_limit: f32,
    pub abs_control_error_limit: f32,
    pub abs_control_cutoff: f32,

    pub anti_gravity_mode: AntiGravityMode,
    /// Throttle movement, per mille per 100 ms, arming the step boost.
    pub iterm_throttle_threshold: f32,
    /// 1000 means no boost.
    pub iterm_accelerator_gain: f32,

    pub feed_forward_transition: f32,
    /// deg/s per ms, 0 disables.
    pub rate_accel_limit: f32,
    pub yaw_rate_accel_limit: f32,

    pub yaw_lowpass_hz: f32,
    pub dterm: DtermFilterSettings,
    pub crash: CrashSettings,
}

impl Default for PidProfile {
    fn default() -> Self {
        Self {
            pid: AxisArray::new(
                PidGains::new(40.0, 40.0, 30.0, 65.0),
                PidGains::new(58.0, 50.0, 35.0, 60.0),
                PidGains::new(70.0, 45.0, 20.0, 60.0),
            ),
            level: LevelSettings::default(),
            pid_sum_limit: 500.0,
            pid_sum_limit_yaw: 400.0,
            iterm_limit: 150.0,
            iterm_windup_point_percent: 50,
            iterm_rotation: false,
            iterm_relax: ItermRelaxMode::Off,
            iterm_relax_type: ItermRelaxType::Setpoint,
            iterm_relax_cutoff: 11.0,
            abs_control_gain: 0.0,
            abs_control_limit: 90.0,
            abs_control_error_limit: 20.0,
            abs_control_cutoff: 11.0,
            anti_gravity_mode: AntiGravityMode::Smooth,
            iterm_throttle_threshold: 250.0,
            iterm_accelerator_gain: 1000.0,
            feed_forward_transition: 100.0,
            rate_accel_limit: 0.0,
            yaw_rate_accel_limit: 100.0,
            yaw_lowpass_hz: 0.0,
            dterm: DtermFilterSettings::default(),
            crash: CrashSettings::default(),
        }
    }
}

impl PidProfile {
    /// Parses a profile written in RON, missing fields keep their defaults.
    pub fn from_ron(text: &str) -> StabilizerResult<Self> {
        ron::from_str(text).map_err(|e| StabilizerError::ProfileParse(e.to_string()))
    }

    pub fn sum_limit(&self, axis: Axis) -> f32 {
        if axis.is_yaw() {
            self.pid_sum_limit_yaw
        } else {
            self.pid_sum_limit
        }
    }

    pub fn validate(&self) -> StabilizerResult<()> {
        for (axis, gains) in self.pid.iter() {
            for (term, value) in [("p", gains.p), ("i", gains.i), ("d", gains.d), ("f", gains.f)] {
                if !non_negative(value) {
                    return Err(StabilizerError::InvalidGain { axis, term, value });
                }
            }
        }
        for (name, value) in [
            ("pid_sum_limit", self.pid_sum_limit),
            ("pid_sum_limit_yaw", self.pid_sum_limit_yaw),
        ] {
            if !positive(value) {
                return Err(StabilizerError::InvalidSumLimit { name, value });
            }
        }
        if !positive(self.iterm_limit) {
            return Err(StabilizerError::InvalidItermLimit(self.iterm_limit));
        }
        if !(1..=100).contains(&self.iterm_windup_point_percent) {
            return Err(StabilizerError::InvalidWindupPoint(
                self.iterm_windup_point_percent,
            ));
        }
        if !(self.iterm_accelerator_gain >= 1000.0 && self.iterm_accelerator_gain.is_finite()) {
            return Err(StabilizerError::InvalidSetting {
                name: "iterm_accelerator_gain",
                value: self.iterm_accelerator_gain,
            });
        }
        if !(0.0..=250.0).contains(&self.level.horizon_tilt_effect) {
            return Err(StabilizerError::InvalidSetting {
                name: "horizon_tilt_effect",
                value: self.level.horizon_tilt_effect,
            });
        }
        let level = &self.level;
        let crash = &self.crash;
        let checked = [
            ("angle_strength", level.angle_strength),
            ("horizon_strength", level.horizon_strength),
            ("horizon_transition", level.horizon_transition),
            ("angle_limit", level.angle_limit),
            ("iterm_relax_cutoff", self.iterm_relax_cutoff),
            ("abs_control_gain", self.abs_control_gain),
            ("abs_control_limit", self.abs_control_limit),
            ("abs_control_error_limit", self.abs_control_error_limit),
            ("abs_control_cutoff", self.abs_control_cutoff),
            ("iterm_throttle_threshold", self.iterm_throttle_threshold),
            ("feed_forward_transition", self.feed_forward_transition),
            ("rate_accel_limit", self.rate_accel_limit),
            ("yaw_rate_accel_limit", self.yaw_rate_accel_limit),
            ("yaw_lowpass_hz", self.yaw_lowpass_hz),
            ("dterm_lowpass_hz", self.dterm.lowpass_hz),
            ("dterm_lowpass2_hz", self.dterm.lowpass2_hz),
            ("dterm_notch_hz", self.dterm.notch_hz),
            ("dterm_notch_cutoff_hz", self.dterm.notch_cutoff_hz),
            ("crash_recovery_angle", crash.recovery_angle),
            ("crash_recovery_rate", crash.recovery_rate),
            ("crash_dthreshold", crash.dthreshold),
            ("crash_gthreshold", crash.gthreshold),
            ("crash_setpoint_threshold", crash.setpoint_threshold),
            ("crash_limit_yaw", crash.limit_yaw),
        ];
        for (name, value) in checked {
            if !non_negative(value) {
                return Err(StabilizerError::InvalidSetting { name, value });
            }
        }
        // relax and absolute control need a live filter to work with
        if self.iterm_relax != ItermRelaxMode::Off && self.iterm_relax_cutoff <= 0.0 {
            return Err(StabilizerError::InvalidSetting {
                name: "iterm_relax_cutoff",
                value: self.iterm_relax_cutoff,
            });
        }
        if self.abs_control_gain > 0.0 && self.abs_control_cutoff <= 0.0 {
            return Err(StabilizerError::InvalidSetting {
                name: "abs_control_cutoff",
                value: self.abs_control_cutoff,
            });
        }
        Ok(())
    }
}

fn non_negative(value: f32) -> bool {
    value.is_finite() && value >= 0.0
}

fn positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

fn unknown(key: &'static str, value: &str) -> StabilizerError {
    StabilizerError::UnknownOption {
        key,
        value: value.to_string(),
    }
}
