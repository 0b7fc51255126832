//! Crash recovery detector.
//!
//! Watches for rotation the pilot did not ask for while the mixer is out of
//! headroom. Divergence is judged per axis, the phase is shared by the
//! whole controller:
//!
//! ```text
//! Inactive --diverging--> Detecting --held for delay--> Active
//!     ^                       |                            |
//!     +------- calm ----------+---- recovered / disarm ----+
//! ```
//!
//! With a zero delay `Inactive` goes straight to `Active` on the first
//! diverging tick.

use crate::axis::{Axis, AxisArray};
use crate::level::{Attitude, LevelController, RollPitchTrims};
use crate::profile::{CrashRecoveryMode, CrashSettings};
use bincode::{Decode, Encode};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum CrashPhase {
    #[default]
    Inactive,
    /// Divergence seen, waiting for it to persist.
    Detecting { since_us: u64 },
    /// Recovery overrides the axes. `since_us` is when divergence was first seen.
    Active { since_us: u64 },
}

/// What the detector needs to know about one axis this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashSample {
    /// Rate derivative, deg/s².
    pub delta: f32,
    pub error_rate: f32,
    /// Pilot rate setpoint, before any leveling.
    pub setpoint: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct CrashRecovery {
    mode: CrashRecoveryMode,
    phase: CrashPhase,
    time_limit_us: u64,
    delay_us: u64,
    recovery_angle: f32,
    recovery_rate: f32,
    dterm_threshold: f32,
    gyro_threshold: f32,
    setpoint_threshold: f32,
    limit_yaw: f32,
    diverging: AxisArray<bool>,
    disarm_requested: bool,
}

impl CrashRecovery {
    pub fn new(settings: &CrashSettings) -> Self {
        Self {
            mode: settings.mode,
            phase: CrashPhase::Inactive,
            time_limit_us: settings.time_ms as u64 * 1000,
            delay_us: settings.delay_ms as u64 * 1000,
            recovery_angle: settings.recovery_angle,
            recovery_rate: settings.recovery_rate,
            dterm_threshold: settings.dthreshold * 1000.0,
            gyro_threshold: settings.gthreshold,
            setpoint_threshold: settings.setpoint_threshold,
            limit_yaw: settings.limit_yaw,
            diverging: AxisArray::default(),
            disarm_requested: false,
        }
    }

    pub fn phase(&self) -> CrashPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, CrashPhase::Active { .. })
    }

    pub fn beep_requested(&self) -> bool {
        self.mode == CrashRecoveryMode::Beep && self.is_active()
    }

    /// Latched until the next reset.
    pub fn disarm_requested(&self) -> bool {
        self.disarm_requested
    }

    pub fn reset(&mut self) {
        self.phase = CrashPhase::Inactive;
        self.diverging = AxisArray::default();
        self.disarm_requested = false;
    }

    /// Leaves `Active` once the recovery timed out or the craft calmed down,
    /// provided it is close to level again.
    pub fn check_recovered(
        &mut self,
        now_us: u64,
        saturation: f32,
        gyro: &AxisArray<f32>,
        attitude: Option<&Attitude>,
        trims: &RollPitchTrims,
    ) {
        let CrashPhase::Active { since_us } = self.phase else {
            return;
        };
        let timed_out = now_us.saturating_sub(since_us) > self.time_limit_us;
        let settled =
            saturation < 1.0 && gyro.iter().all(|(_, rate)| rate.abs() < self.recovery_rate);
        if !(timed_out || settled) {
            return;
        }
        // without an attitude estimate there is nothing to wait for
        let level = match attitude {
            Some(attitude) => [Axis::Roll, Axis::Pitch]
                .into_iter()
                .all(|axis| attitude.trimmed(axis, trims).abs() < self.recovery_angle),
            None => true,
        };
        if level {
            self.phase = CrashPhase::Inactive;
        }
    }

    /// Recovery setpoint and error for `axis` while `Active`: roll and pitch
    /// fly back to level, yaw error is limited.
    #[allow(clippy::too_many_arguments)]
    pub fn override_axis(
        &self,
        axis: Axis,
        setpoint: f32,
        error_rate: f32,
        gyro: f32,
        attitude: Option<&Attitude>,
        trims: &RollPitchTrims,
        level: &LevelController,
    ) -> (f32, f32) {
        if axis.is_yaw() {
            return (setpoint, error_rate.clamp(-self.limit_yaw, self.limit_yaw));
        }
        match attitude {
            Some(attitude) => {
                let recovery = level.recovery_setpoint(axis, attitude, trims);
                (recovery, recovery - gyro)
            }
            None => (setpoint, error_rate),
        }
    }

    pub fn observe(&mut self, axis: Axis, sample: &CrashSample, saturation: f32) {
        self.diverging[axis] = saturation >= 1.0
            && sample.delta.abs() > self.dterm_threshold
            && sample.error_rate.abs() > self.gyro_threshold
            && sample.setpoint.abs() < self.setpoint_threshold;
    }

    /// Commits what [`CrashRecovery::observe`] saw on all axes this tick.
    pub fn finish_tick(&mut self, now_us: u64, armed: bool, detection_allowed: bool) {
        let diverging = self.diverging.0.iter().any(|d| *d);
        self.diverging = AxisArray::default();

        if self.mode == CrashRecoveryMode::Off || !armed || !detection_allowed {
            if matches!(self.phase, CrashPhase::Detecting { .. }) {
                self.phase = CrashPhase::Inactive;
            }
            return;
        }

        match self.phase {
            CrashPhase::Inactive if diverging => {
                if self.mode == CrashRecoveryMode::Disarm {
                    self.disarm_requested = true;
                } else if self.delay_us == 0 {
                    self.phase = CrashPhase::Active { since_us: now_us };
                } else {
                    self.phase = CrashPhase::Detecting { since_us: now_us };
                }
            }
            CrashPhase::Detecting { since_us } => {
                if !diverging {
                    self.phase = CrashPhase::Inactive;
                } else if now_us.saturating_sub(since_us) >= self.delay_us {
                    self.phase = CrashPhase::Active { since_us };
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::LevelSettings;

    const TICK_US: u64 = 8000;

    fn settings(mode: CrashRecoveryMode, delay_ms: u16) -> CrashSettings {
        CrashSettings {
            mode,
            delay_ms,
            ..CrashSettings::default()
        }
    }

    fn violent() -> CrashSample {
        CrashSample {
            delta: -200_000.0,
            error_rate: -1600.0,
            setpoint: 0.0,
        }
    }

    fn tick(crash: &mut CrashRecovery, now_us: u64, sample: &CrashSample, saturation: f32) {
        crash.observe(Axis::Roll, sample, saturation);
        crash.finish_tick(now_us, true, true);
    }

    #[test]
    fn zero_delay_activates_on_first_diverging_tick() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        assert!(!crash.is_active());
        tick(&mut crash, 0, &violent(), 1.2);
        assert_eq!(crash.phase(), CrashPhase::Active { since_us: 0 });
        assert!(crash.is_active());
        assert!(!crash.beep_requested());
    }

    #[test]
    fn needs_saturation_and_divergence() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        tick(&mut crash, 0, &violent(), 0.5);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
        let calm = CrashSample {
            delta: 0.0,
            error_rate: 0.0,
            setpoint: 0.0,
        };
        tick(&mut crash, TICK_US, &calm, 1.5);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
        let commanded = CrashSample {
            setpoint: 600.0,
            ..violent()
        };
        tick(&mut crash, 2 * TICK_US, &commanded, 1.5);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
    }

    #[test]
    fn dwell_must_be_sustained() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 20));
        tick(&mut crash, 0, &violent(), 1.2);
        assert_eq!(crash.phase(), CrashPhase::Detecting { since_us: 0 });
        tick(&mut crash, TICK_US, &violent(), 1.2);
        assert!(!crash.is_active());
        tick(&mut crash, 2 * TICK_US, &violent(), 0.3);
        assert_eq!(crash.phase(), CrashPhase::Inactive);

        for n in 3..=6 {
            tick(&mut crash, n * TICK_US, &violent(), 1.2);
        }
        assert_eq!(crash.phase(), CrashPhase::Active { since_us: 3 * TICK_US });
    }

    #[test]
    fn off_mode_never_detects() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::Off, 0));
        tick(&mut crash, 0, &violent(), 2.0);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
    }

    #[test]
    fn guard_and_disarm_block_detection() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        crash.observe(Axis::Pitch, &violent(), 2.0);
        crash.finish_tick(0, true, false);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
        crash.observe(Axis::Pitch, &violent(), 2.0);
        crash.finish_tick(TICK_US, false, true);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
    }

    #[test]
    fn disarm_mode_requests_disarm_instead_of_recovering() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::Disarm, 0));
        tick(&mut crash, 0, &violent(), 1.2);
        assert!(!crash.is_active());
        assert!(crash.disarm_requested());
        crash.reset();
        assert!(!crash.disarm_requested());
    }

    #[test]
    fn beep_mode_recovers_and_beeps() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::Beep, 0));
        tick(&mut crash, 0, &violent(), 1.2);
        assert!(crash.is_active());
        assert!(crash.beep_requested());
    }

    #[test]
    fn exits_after_timeout_when_level() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        tick(&mut crash, 0, &violent(), 1.2);
        let spinning = AxisArray::new(3000.0, 0.0, 0.0);
        let level = Attitude::default();
        let trims = RollPitchTrims::default();

        crash.check_recovered(500_000, 1.2, &spinning, Some(&level), &trims);
        assert!(crash.is_active());
        let tilted = Attitude { roll: 45.0, pitch: 0.0 };
        crash.check_recovered(504_000, 1.2, &spinning, Some(&tilted), &trims);
        assert!(crash.is_active());
        crash.check_recovered(504_000, 1.2, &spinning, Some(&level), &trims);
        assert_eq!(crash.phase(), CrashPhase::Inactive);
    }

    #[test]
    fn exits_early_once_settled() {
        let mut crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        tick(&mut crash, 0, &violent(), 1.2);
        let slow = AxisArray::new(20.0, -30.0, 10.0);
        crash.check_recovered(TICK_US, 1.2, &slow, None, &RollPitchTrims::default());
        assert!(crash.is_active());
        crash.check_recovered(2 * TICK_US, 0.4, &slow, None, &RollPitchTrims::default());
        assert!(!crash.is_active());
    }

    #[test]
    fn override_levels_roll_and_limits_yaw() {
        let crash = CrashRecovery::new(&settings(CrashRecoveryMode::On, 0));
        let level = LevelController::new(&LevelSettings::default());
        let attitude = Attitude { roll: 20.0, pitch: 0.0 };
        let trims = RollPitchTrims::default();

        let (sp, err) = crash.override_axis(Axis::Roll, 0.0, -900.0, 900.0, Some(&attitude), &trims, &level);
        assert_eq!(sp, -100.0);
        assert_eq!(err, -1000.0);

        let (sp, err) = crash.override_axis(Axis::Yaw, 0.0, -900.0, 900.0, Some(&attitude), &trims, &level);
        assert_eq!(sp, 0.0);
        assert_eq!(err, -200.0);

        let (_, err) = crash.override_axis(Axis::Pitch, 10.0, -50.0, 60.0, None, &trims, &level);
        assert_eq!(err, -50.0);
    }
}
