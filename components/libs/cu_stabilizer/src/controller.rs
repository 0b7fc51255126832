use crate::axis::{Axis, AxisArray};
use crate::crash::{CrashPhase, CrashRecovery, CrashSample};
use crate::error::StabilizerResult;
use crate::feedforward::FeedForward;
use crate::filters::{DtermFilterChain, FilterStage};
use crate::iterm::ItermAccumulator;
use crate::level::{Attitude, ControlLaw, FlightModeFlags, LevelController, RollPitchTrims};
use crate::profile::{DtermSource, PidProfile};
use crate::timing::LoopTiming;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

const PTERM_SCALE: f32 = 0.032029;
const ITERM_SCALE: f32 = 0.244381;
const DTERM_SCALE: f32 = 0.000529;
const FEEDFORWARD_SCALE: f32 = 0.013754;

/// No crash detection for this long after a level mode is engaged.
const CRASH_DETECTION_LEVEL_GUARD_US: u64 = 1_000_000;

/// Per-axis output of a tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct AxisOutput {
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub f: f32,
    /// Clamped P+I+D+F, what the mixer consumes.
    pub sum: f32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct PidOutputs {
    pub axes: AxisArray<AxisOutput>,
    pub crash_recovery_active: bool,
    pub beep_requested: bool,
    pub disarm_requested: bool,
}

/// Everything the collaborators hand in for one tick. Rates in deg/s.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct ControlInputs {
    pub setpoint_rate: AxisArray<f32>,
    /// Stick position, -1..=1.
    pub rc_deflection: AxisArray<f32>,
    pub gyro_rate: AxisArray<f32>,
    /// `None` without an accelerometer, which disables leveling.
    pub attitude: Option<Attitude>,
    pub modes: FlightModeFlags,
    /// Mixer saturation: 0 all headroom left, above 1 over-saturated.
    pub motor_mix_range: f32,
    /// Throttle stick, 0..=1.
    pub throttle: f32,
    /// Throttle PID attenuation applied to P and D.
    pub tpa_factor: f32,
}

impl Default for ControlInputs {
    fn default() -> Self {
        Self {
            setpoint_rate: AxisArray::default(),
            rc_deflection: AxisArray::default(),
            gyro_rate: AxisArray::default(),
            attitude: Some(Attitude::default()),
            modes: FlightModeFlags::default(),
            motor_mix_range: 0.0,
            throttle: 0.0,
            tpa_factor: 1.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Coefficients {
    kp: f32,
    ki: f32,
    kd: f32,
    kf: f32,
}

/// Runtime state of one axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct AxisState {
    pub output: AxisOutput,
    dterm_filter: DtermFilterChain,
    /// Last D input before filtering.
    previous_dterm_raw: f32,
    previous_dterm_input: f32,
    /// Last setpoint after acceleration limiting.
    previous_setpoint: f32,
    p_lowpass: FilterStage,
}

impl AxisState {
    fn new(axis: Axis, profile: &PidProfile, timing: LoopTiming) -> Self {
        let p_lowpass = if axis.is_yaw() {
            FilterStage::pt1(profile.yaw_lowpass_hz, timing)
        } else {
            FilterStage::Bypass
        };
        Self {
            output: AxisOutput::default(),
            dterm_filter: DtermFilterChain::new(&profile.dterm, timing),
            previous_dterm_raw: 0.0,
            previous_dterm_input: 0.0,
            previous_setpoint: 0.0,
            p_lowpass,
        }
    }
}

/// Replaces non-finite inputs with the last finite value seen.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
struct InputGuard {
    last: ControlInputs,
}

impl InputGuard {
    fn new() -> Self {
        Self {
            last: ControlInputs::default(),
        }
    }

    fn sanitize(&mut self, raw: &ControlInputs) -> ControlInputs {
        let last = &mut self.last;
        let mut clean = *raw;
        for axis in Axis::ALL {
            clean.setpoint_rate[axis] =
                finite_or_last(&mut last.setpoint_rate[axis], raw.setpoint_rate[axis]);
            clean.rc_deflection[axis] =
                finite_or_last(&mut last.rc_deflection[axis], raw.rc_deflection[axis]);
            clean.gyro_rate[axis] = finite_or_last(&mut last.gyro_rate[axis], raw.gyro_rate[axis]);
        }
        clean.attitude = match raw.attitude {
            Some(attitude) => {
                let previous = last.attitude.get_or_insert_with(Attitude::default);
                Some(Attitude {
                    roll: finite_or_last(&mut previous.roll, attitude.roll),
                    pitch: finite_or_last(&mut previous.pitch, attitude.pitch),
                })
            }
            None => None,
        };
        clean.motor_mix_range = finite_or_last(&mut last.motor_mix_range, raw.motor_mix_range);
        clean.throttle = finite_or_last(&mut last.throttle, raw.throttle);
        clean.tpa_factor = finite_or_last(&mut last.tpa_factor, raw.tpa_factor);
        clean
    }
}

fn finite_or_last(last: &mut f32, value: f32) -> f32 {
    if value.is_finite() {
        *last = value;
    }
    *last
}

/// Keeps a term representable: NaN collapses to 0, infinities saturate.
fn finite(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(f32::MIN, f32::MAX)
    }
}

/// Everything the controller mutates across ticks. Snapshot it with
/// [`PidController::state`], bring it back with [`PidController::restore_state`].
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct ControllerState {
    axes: AxisArray<AxisState>,
    iterm: ItermAccumulator,
    feedforward: FeedForward,
    crash: CrashRecovery,
    guard: InputGuard,
    level_mode_since_us: Option<u64>,
}

impl ControllerState {
    fn new(profile: &PidProfile, timing: LoopTiming) -> Self {
        Self {
            axes: AxisArray::new(
                AxisState::new(Axis::Roll, profile, timing),
                AxisState::new(Axis::Pitch, profile, timing),
                AxisState::new(Axis::Yaw, profile, timing),
            ),
            iterm: ItermAccumulator::new(profile, timing),
            feedforward: FeedForward::new(profile.feed_forward_transition, timing),
            crash: CrashRecovery::new(&profile.crash),
            guard: InputGuard::new(),
            level_mode_since_us: None,
        }
    }
}

/// Attitude stabilization controller: owns the active profile and every
/// piece of per-axis state, invoked once per control tick.
#[derive(Debug, Clone)]
pub struct PidController {
    profile: PidProfile,
    timing: LoopTiming,
    coefficients: AxisArray<Coefficients>,
    max_setpoint_step: AxisArray<f32>,
    level: LevelController,
    state: ControllerState,
}

impl PidController {
    pub fn new(profile: PidProfile, timing: LoopTiming) -> StabilizerResult<Self> {
        profile.validate()?;
        timing.validate()?;
        let state = ControllerState::new(&profile, timing);
        Ok(Self {
            coefficients: coefficients(&profile),
            max_setpoint_step: max_setpoint_step(&profile, timing),
            level: LevelController::new(&profile.level),
            state,
            profile,
            timing,
        })
    }

    /// Swaps in a new profile or loop period. Relax and absolute control
    /// restart from scratch and outputs read zero until the next tick; the
    /// integrators are kept, clamped to the new limit. The new D filters start
    /// settled on the last D input so a steady craft sees no derivative.
    pub fn init(&mut self, profile: PidProfile, timing: LoopTiming) -> StabilizerResult<()> {
        profile.validate()?;
        timing.validate()?;

        let mut state = ControllerState::new(&profile, timing);
        state.iterm.carry_over(&self.state.iterm);
        state.feedforward.carry_over(&self.state.feedforward);
        for axis in Axis::ALL {
            let previous = &self.state.axes[axis];
            let fresh = &mut state.axes[axis];
            fresh.previous_dterm_raw = previous.previous_dterm_raw;
            fresh.previous_dterm_input = fresh.dterm_filter.prime(previous.previous_dterm_raw);
            fresh.previous_setpoint = previous.previous_setpoint;
        }
        state.guard = self.state.guard;
        state.level_mode_since_us = self.state.level_mode_since_us;

        self.coefficients = coefficients(&profile);
        self.max_setpoint_step = max_setpoint_step(&profile, timing);
        self.level = LevelController::new(&profile.level);
        self.state = state;
        self.profile = profile;
        self.timing = timing;
        Ok(())
    }

    pub fn profile(&self) -> &PidProfile {
        &self.profile
    }

    pub fn timing(&self) -> LoopTiming {
        self.timing
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn restore_state(&mut self, state: ControllerState) {
        self.state = state;
    }

    /// Back to the power-up state under the current profile.
    pub fn reset(&mut self) {
        self.state = ControllerState::new(&self.profile, self.timing);
    }

    pub fn is_crash_recovery_active(&self) -> bool {
        self.state.crash.is_active()
    }

    pub fn crash_phase(&self) -> CrashPhase {
        self.state.crash.phase()
    }

    /// Integrator value of `axis`, including while its output is gated.
    pub fn iterm(&self, axis: Axis) -> f32 {
        self.state.iterm.value(axis)
    }

    /// Outputs of the last tick.
    pub fn outputs(&self) -> PidOutputs {
        PidOutputs {
            axes: self.state.axes.map(|axis| axis.output),
            crash_recovery_active: self.state.crash.is_active(),
            beep_requested: self.state.crash.beep_requested(),
            disarm_requested: self.state.crash.disarm_requested(),
        }
    }

    /// Runs one control tick. Never fails: bad inputs are sanitized and every
    /// output is bounded.
    pub fn tick(&mut self, inputs: &ControlInputs, trims: &RollPitchTrims, now_us: u64) -> PidOutputs {
        let inputs = self.state.guard.sanitize(inputs);
        let modes = inputs.modes;
        self.track_level_mode(&modes, now_us);

        if !modes.armed {
            self.state.iterm.reset();
            self.state.crash.reset();
        }
        if modes.armed && modes.stabilization {
            self.run(&inputs, trims, now_us);
        } else {
            self.track_history(&inputs);
            for axis in Axis::ALL {
                self.state.axes[axis].output = AxisOutput::default();
            }
        }
        self.outputs()
    }

    fn run(&mut self, inputs: &ControlInputs, trims: &RollPitchTrims, now_us: u64) {
        let attitude = inputs.attitude.as_ref();
        let saturation = inputs.motor_mix_range;
        let frequency = self.timing.frequency();
        let dterm_source = self.profile.dterm.source;

        self.state.iterm.update_anti_gravity(inputs.throttle);
        self.state.iterm.rotate(&inputs.gyro_rate);
        self.state
            .crash
            .check_recovered(now_us, saturation, &inputs.gyro_rate, attitude, trims);
        let recovering = self.state.crash.is_active();

        let horizon_strength = match attitude {
            Some(attitude) if inputs.modes.horizon_mode && !inputs.modes.angle_mode => {
                self.level.horizon_strength(&inputs.rc_deflection, attitude)
            }
            _ => 0.0,
        };

        for axis in Axis::ALL {
            let law = ControlLaw::select(&inputs.modes, axis, attitude);
            let gains = self.coefficients[axis];
            let gyro = inputs.gyro_rate[axis];
            let deflection = inputs.rc_deflection[axis];

            let pilot_setpoint = self.limit_setpoint(axis, inputs.setpoint_rate[axis]);
            let mut setpoint = self.level.setpoint(
                law,
                axis,
                pilot_setpoint,
                deflection,
                attitude,
                trims,
                horizon_strength,
            );
            let mut rate_error = setpoint - gyro;

            if recovering {
                (setpoint, rate_error) = self.state.crash.override_axis(
                    axis, setpoint, rate_error, gyro, attitude, trims, &self.level,
                );
                self.state.iterm.reset_axis(axis);
            }

            let mut iterm_error_rate = if recovering {
                rate_error
            } else {
                self.state.iterm.relax(axis, setpoint, gyro, rate_error)
            };
            let correction =
                self.state
                    .iterm
                    .absolute_control(axis, setpoint, gyro, inputs.modes.airmode);
            let error_rate = rate_error + correction;
            iterm_error_rate += correction;

            let axis_state = &mut self.state.axes[axis];

            let p = finite(axis_state.p_lowpass.apply(gains.kp * error_rate * inputs.tpa_factor));

            let i = if law.holds_iterm() {
                0.0
            } else {
                self.state.iterm.integrate(axis, gains.ki, iterm_error_rate, saturation)
            };

            let dterm_input = match dterm_source {
                DtermSource::Measurement => gyro,
                DtermSource::Error => rate_error,
            };
            let filtered = axis_state.dterm_filter.apply(dterm_input);
            let derivative = (filtered - axis_state.previous_dterm_input) * frequency;
            axis_state.previous_dterm_raw = dterm_input;
            axis_state.previous_dterm_input = filtered;
            let delta = match dterm_source {
                DtermSource::Measurement => -derivative,
                DtermSource::Error => derivative,
            };
            let d = if law.zeroes_dterm() {
                0.0
            } else {
                finite(gains.kd * delta * inputs.tpa_factor)
            };

            let f = finite(self.state.feedforward.compute(
                axis,
                pilot_setpoint,
                deflection,
                gains.kf,
                law.feeds_forward(),
            ));

            let limit = self.profile.sum_limit(axis);
            let sum = finite(p + i + d + f).clamp(-limit, limit);
            axis_state.output = AxisOutput { p, i, d, f, sum };

            let sample = CrashSample {
                delta,
                error_rate: rate_error,
                setpoint: inputs.setpoint_rate[axis],
            };
            self.state.crash.observe(axis, &sample, saturation);
        }

        let detection_allowed = self.crash_detection_allowed(now_us);
        self.state
            .crash
            .finish_tick(now_us, inputs.modes.armed, detection_allowed);
    }

    /// Keeps derivative, feed-forward and acceleration limit history current
    /// while outputs are gated, so re-enabling does not kick.
    fn track_history(&mut self, inputs: &ControlInputs) {
        for axis in Axis::ALL {
            let setpoint = self.limit_setpoint(axis, inputs.setpoint_rate[axis]);
            self.state.feedforward.track(axis, setpoint);
            let gyro = inputs.gyro_rate[axis];
            let dterm_input = match self.profile.dterm.source {
                DtermSource::Measurement => gyro,
                DtermSource::Error => setpoint - gyro,
            };
            let axis_state = &mut self.state.axes[axis];
            axis_state.previous_dterm_raw = dterm_input;
            axis_state.previous_dterm_input = axis_state.dterm_filter.apply(dterm_input);
        }
    }

    fn limit_setpoint(&mut self, axis: Axis, setpoint: f32) -> f32 {
        let max_step = self.max_setpoint_step[axis];
        let previous = &mut self.state.axes[axis].previous_setpoint;
        let limited = if max_step > 0.0 {
            setpoint.clamp(*previous - max_step, *previous + max_step)
        } else {
            setpoint
        };
        *previous = limited;
        limited
    }

    fn track_level_mode(&mut self, modes: &FlightModeFlags, now_us: u64) {
        if modes.level_mode() {
            self.state.level_mode_since_us.get_or_insert(now_us);
        } else {
            self.state.level_mode_since_us = None;
        }
    }

    fn crash_detection_allowed(&self, now_us: u64) -> bool {
        match self.state.level_mode_since_us {
            Some(since) => now_us.saturating_sub(since) >= CRASH_DETECTION_LEVEL_GUARD_US,
            None => true,
        }
    }
}

fn coefficients(profile: &PidProfile) -> AxisArray<Coefficients> {
    profile.pid.map(|gains| Coefficients {
        kp: PTERM_SCALE * gains.p,
        ki: ITERM_SCALE * gains.i,
        kd: DTERM_SCALE * gains.d,
        kf: FEEDFORWARD_SCALE * gains.f / 100.0,
    })
}

fn max_setpoint_step(profile: &PidProfile, timing: LoopTiming) -> AxisArray<f32> {
    let dt = timing.dt();
    let roll_pitch = profile.rate_accel_limit * 100.0 * dt;
    AxisArray::new(roll_pitch, roll_pitch, profile.yaw_rate_accel_limit * 100.0 * dt)
}
