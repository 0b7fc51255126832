//! Integral accumulator and the guards applied on its way in.
//!
//! Per axis and per tick the controller runs, in this order: relax on the
//! error rate, absolute control correction, then [`ItermAccumulator::integrate`]
//! which applies the saturation guard, the anti-gravity accelerator and the
//! final limit. Rotation and anti-gravity run once per tick before the axes.

use crate::axis::{Axis, AxisArray};
use crate::filters::{Pt1Filter, Pt3Filter};
use crate::profile::{AntiGravityMode, ItermRelaxMode, ItermRelaxType, PidProfile};
use crate::timing::LoopTiming;
use bincode::{Decode, Encode};

/// Setpoint high-pass magnitude, deg/s, at which relax stops all integration.
pub const ITERM_RELAX_SETPOINT_THRESHOLD: f32 = 30.0;

const ANTI_GRAVITY_THROTTLE_CUTOFF_HZ: f32 = 15.0;
const ANTI_GRAVITY_STEP_HOLD_US: u32 = 100_000;

/// Temporary integral boost on fast throttle moves.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct AntiGravity {
    mode: AntiGravityMode,
    gain: f32,
    threshold: f32,
    throttle_lpf: Pt1Filter,
    previous_throttle: f32,
    ticks_per_100ms: f32,
    hold_ticks: u32,
    remaining: u32,
}

impl AntiGravity {
    pub fn new(profile: &PidProfile, timing: LoopTiming) -> Self {
        Self {
            mode: profile.anti_gravity_mode,
            gain: profile.iterm_accelerator_gain,
            threshold: profile.iterm_throttle_threshold,
            throttle_lpf: Pt1Filter::new(ANTI_GRAVITY_THROTTLE_CUTOFF_HZ, timing.dt()),
            previous_throttle: 0.0,
            ticks_per_100ms: ANTI_GRAVITY_STEP_HOLD_US as f32 / timing.period_us as f32,
            hold_ticks: timing.ticks_for(ANTI_GRAVITY_STEP_HOLD_US),
            remaining: 0,
        }
    }

    /// Feeds the throttle (0..=1) of this tick and returns the I accelerator.
    pub fn update(&mut self, throttle: f32) -> f32 {
        match self.mode {
            AntiGravityMode::Smooth => {
                let hpf = throttle - self.throttle_lpf.apply(throttle);
                1.0 + hpf.abs() * 0.01 * (self.gain - 1000.0)
            }
            AntiGravityMode::Step => {
                // per mille of throttle travel per 100 ms
                let velocity =
                    (throttle - self.previous_throttle).abs() * 1000.0 * self.ticks_per_100ms;
                self.previous_throttle = throttle;
                if velocity > self.threshold {
                    self.remaining = self.hold_ticks;
                }
                if self.remaining > 0 {
                    self.remaining -= 1;
                    self.gain / 1000.0
                } else {
                    1.0
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.throttle_lpf.reset();
        self.previous_throttle = 0.0;
        self.remaining = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct ItermAccumulator {
    iterm: AxisArray<f32>,
    limit: f32,
    /// 0 disables the saturation guard.
    windup_point_inv: f32,
    dt: f32,
    relax_mode: ItermRelaxMode,
    relax_type: ItermRelaxType,
    relax_lpf: AxisArray<Pt1Filter>,
    /// Expected setpoint the craft is still catching up to.
    relax_reference: AxisArray<Pt3Filter>,
    rotation: bool,
    ac_gain: f32,
    ac_limit: f32,
    ac_error_limit: f32,
    ac_lpf: AxisArray<Pt1Filter>,
    axis_error: AxisArray<f32>,
    anti_gravity: AntiGravity,
    accelerator: f32,
}

impl ItermAccumulator {
    pub fn new(profile: &PidProfile, timing: LoopTiming) -> Self {
        let dt = timing.dt();
        let windup_point_inv = if profile.iterm_windup_point_percent >= 100 {
            0.0
        } else {
            1.0 / (1.0 - profile.iterm_windup_point_percent as f32 / 100.0)
        };
        Self {
            iterm: AxisArray::default(),
            limit: profile.iterm_limit,
            windup_point_inv,
            dt,
            relax_mode: profile.iterm_relax,
            relax_type: profile.iterm_relax_type,
            relax_lpf: AxisArray::splat(Pt1Filter::new(profile.iterm_relax_cutoff, dt)),
            relax_reference: AxisArray::splat(Pt3Filter::new(profile.iterm_relax_cutoff, dt)),
            rotation: profile.iterm_rotation,
            ac_gain: profile.abs_control_gain,
            ac_limit: profile.abs_control_limit,
            ac_error_limit: profile.abs_control_error_limit,
            ac_lpf: AxisArray::splat(Pt1Filter::new(profile.abs_control_cutoff, dt)),
            axis_error: AxisArray::default(),
            anti_gravity: AntiGravity::new(profile, timing),
            accelerator: 1.0,
        }
    }

    /// Takes over the accumulated I of `previous`, clamped to the new limit.
    pub fn carry_over(&mut self, previous: &ItermAccumulator) {
        for axis in Axis::ALL {
            self.iterm[axis] = previous.iterm[axis].clamp(-self.limit, self.limit);
        }
    }

    pub fn value(&self, axis: Axis) -> f32 {
        self.iterm[axis]
    }

    pub fn values(&self) -> AxisArray<f32> {
        self.iterm
    }

    /// Attitude drift held by absolute control, degrees.
    pub fn axis_error(&self, axis: Axis) -> f32 {
        self.axis_error[axis]
    }

    pub fn accelerator(&self) -> f32 {
        self.accelerator
    }

    /// Drops everything integrated so far, on disarm.
    pub fn reset(&mut self) {
        self.iterm = AxisArray::default();
        self.axis_error = AxisArray::default();
        for axis in Axis::ALL {
            self.relax_lpf[axis].reset();
            self.relax_reference[axis].reset();
            self.ac_lpf[axis].reset();
        }
        self.anti_gravity.reset();
        self.accelerator = 1.0;
    }

    pub fn reset_axis(&mut self, axis: Axis) {
        self.iterm[axis] = 0.0;
    }

    pub fn update_anti_gravity(&mut self, throttle: f32) -> f32 {
        self.accelerator = self.anti_gravity.update(throttle);
        self.accelerator
    }

    /// Keeps I and the absolute control error attached to the airframe while
    /// it rotates. `gyro` in deg/s.
    pub fn rotate(&mut self, gyro: &AxisArray<f32>) {
        let ac_active = self.ac_gain > 0.0;
        if !self.rotation && !ac_active {
            return;
        }
        let rotation = gyro.map(|rate| rate.to_radians() * self.dt);
        if ac_active {
            rotate_vector(&mut self.axis_error, &rotation);
        }
        if self.rotation {
            rotate_vector(&mut self.iterm, &rotation);
            for axis in Axis::ALL {
                self.iterm[axis] = self.iterm[axis].clamp(-self.limit, self.limit);
            }
        }
    }

    /// Scales the error rate fed to the integrator while the setpoint moves fast.
    ///
    /// The setpoint variant measures how far the setpoint sits from a third
    /// order lag of itself, taken before this tick's sample, so a step counts
    /// at its full height on the tick it happens. The gyro variant keeps the
    /// error inside a band around a first order lag of the setpoint.
    pub fn relax(&mut self, axis: Axis, setpoint: f32, gyro: f32, error_rate: f32) -> f32 {
        if !self.relax_mode.applies_to(axis) {
            return error_rate;
        }
        let setpoint_lpf = match self.relax_type {
            ItermRelaxType::Setpoint => {
                let filter = &mut self.relax_reference[axis];
                let lagged = filter.output();
                filter.apply(setpoint);
                lagged
            }
            ItermRelaxType::Gyro => self.relax_lpf[axis].apply(setpoint),
        };
        let setpoint_hpf = (setpoint - setpoint_lpf).abs();

        let iterm = self.iterm[axis];
        let decreasing = (iterm > 0.0 && error_rate < 0.0) || (iterm < 0.0 && error_rate > 0.0);
        if self.relax_mode.increment_only() && decreasing {
            return error_rate;
        }

        match self.relax_type {
            ItermRelaxType::Setpoint if setpoint_hpf < ITERM_RELAX_SETPOINT_THRESHOLD => {
                error_rate * (1.0 - setpoint_hpf / ITERM_RELAX_SETPOINT_THRESHOLD)
            }
            ItermRelaxType::Setpoint => 0.0,
            ItermRelaxType::Gyro => deadband(setpoint_lpf - gyro, setpoint_hpf),
        }
    }

    /// Correction pulling the craft back to the commanded attitude, deg/s.
    /// Only integrates drift while airmode holds authority.
    pub fn absolute_control(&mut self, axis: Axis, setpoint: f32, gyro: f32, airmode: bool) -> f32 {
        if self.ac_gain <= 0.0 {
            return 0.0;
        }
        let drift_rate = self.ac_lpf[axis].apply(setpoint - gyro);
        if !airmode {
            return 0.0;
        }
        self.axis_error[axis] = (self.axis_error[axis] + drift_rate * self.dt)
            .clamp(-self.ac_error_limit, self.ac_error_limit);
        (self.axis_error[axis] * self.ac_gain).clamp(-self.ac_limit, self.ac_limit)
    }

    /// Integrates one tick of `error_rate`. Growth of |I| is attenuated as the
    /// mixer saturation passes the windup point; shrinking is never held back.
    pub fn integrate(&mut self, axis: Axis, ki: f32, error_rate: f32, saturation: f32) -> f32 {
        let current = self.iterm[axis];
        let mut step = ki * error_rate * self.dt * self.accelerator;
        if step * current >= 0.0 {
            step *= self.windup_factor(saturation);
        }
        self.iterm[axis] = (current + step).clamp(-self.limit, self.limit);
        self.iterm[axis]
    }

    fn windup_factor(&self, saturation: f32) -> f32 {
        if self.windup_point_inv == 0.0 {
            return 1.0;
        }
        ((1.0 - saturation) * self.windup_point_inv).clamp(0.0, 1.0)
    }
}

fn deadband(value: f32, band: f32) -> f32 {
    if value.abs() < band {
        0.0
    } else if value >= 0.0 {
        value - band
    } else {
        value + band
    }
}

/// Small-angle rotation of `v` by the per-axis angles in `rotation`, radians.
fn rotate_vector(v: &mut AxisArray<f32>, rotation: &AxisArray<f32>) {
    for i in 0..3 {
        let i1 = (i + 1) % 3;
        let i2 = (i + 2) % 3;
        let rotated = v.0[i1] + v.0[i2] * rotation.0[i];
        v.0[i2] -= v.0[i1] * rotation.0[i];
        v.0[i1] = rotated;
    }
}
