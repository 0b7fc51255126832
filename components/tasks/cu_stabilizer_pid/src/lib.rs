#![doc = include_str!("../README.md")]

use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use cu29::clock::{CuDuration, RobotClock, Tov};
use cu29::config::ComponentConfig;
use cu29::cutask::{CuMsg, CuTask, Freezable};
use cu29::{input_msg, output_msg, CuError, CuResult};
use cu29_log_derive::debug;
use cu_stabilizer::{
    Axis, AxisArray, AxisOutput, ControlInputs, ControllerState, CrashRecoveryMode, ItermRelaxMode,
    ItermRelaxType, LoopTiming, PidController, PidOutputs, PidProfile, RollPitchTrims,
    StabilizerError,
};
use serde::Serialize;
use std::str::FromStr;

/// Everything the stabilizer needs for one tick, assembled upstream from the
/// receiver, the gyro, the attitude estimator and the mixer.
#[derive(Debug, Default, Clone, Encode, Decode, Serialize)]
pub struct StabilizerInputPayload {
    pub inputs: ControlInputs,
    pub trims: RollPitchTrims,
}

/// Per-axis corrections for the mixer plus the crash recovery requests.
#[derive(Debug, Default, Clone, PartialEq, Encode, Decode, Serialize)]
pub struct StabilizerOutputPayload {
    pub axes: AxisArray<AxisOutput>,
    pub crash_recovery_active: bool,
    pub beep_requested: bool,
    pub disarm_requested: bool,
}

impl From<PidOutputs> for StabilizerOutputPayload {
    fn from(outputs: PidOutputs) -> Self {
        Self {
            axes: outputs.axes,
            crash_recovery_active: outputs.crash_recovery_active,
            beep_requested: outputs.beep_requested,
            disarm_requested: outputs.disarm_requested,
        }
    }
}

/// Copper task running the attitude stabilization loop, once per gyro/PID tick.
pub struct CuStabilizerPid {
    controller: PidController,
    recovering: bool,
    disarm_reported: bool,
}

impl CuStabilizerPid {
    pub fn controller(&self) -> &PidController {
        &self.controller
    }

    fn report_crash_transitions(&mut self, outputs: &PidOutputs) {
        if outputs.crash_recovery_active != self.recovering {
            self.recovering = outputs.crash_recovery_active;
            if self.recovering {
                debug!("Stabilizer: crash detected, recovering");
            } else {
                debug!("Stabilizer: crash recovery over");
            }
        }
        if outputs.disarm_requested && !self.disarm_reported {
            debug!("Stabilizer: crash detected, requesting disarm");
        }
        self.disarm_reported = outputs.disarm_requested;
    }
}

impl<'cl> CuTask<'cl> for CuStabilizerPid {
    type Input = input_msg!('cl, StabilizerInputPayload);
    type Output = output_msg!('cl, StabilizerOutputPayload);

    fn new(config: Option<&ComponentConfig>) -> CuResult<Self>
    where
        Self: Sized,
    {
        let (profile, timing) = match config {
            Some(config) => profile_from_config(config)?,
            None => (PidProfile::default(), LoopTiming::default()),
        };
        let controller = PidController::new(profile, timing).map_err(|err| {
            let message = err.to_string();
            debug!("Stabilizer: rejected configuration: {}", &message);
            CuError::from(format!("Invalid stabilizer configuration: {message}"))
        })?;
        debug!(
            "Stabilizer: running at {}us, sum limits {}/{}",
            timing.period_us,
            controller.profile().pid_sum_limit,
            controller.profile().pid_sum_limit_yaw
        );
        Ok(Self {
            controller,
            recovering: false,
            disarm_reported: false,
        })
    }

    fn process(
        &mut self,
        clock: &RobotClock,
        input: Self::Input,
        output: Self::Output,
    ) -> CuResult<()> {
        let Some(payload) = input.payload() else {
            output.clear_payload();
            return Ok(());
        };
        let tov = match input.metadata.tov {
            Tov::Time(single) => single,
            _ => clock.now(),
        };
        let CuDuration(now_ns) = tov;

        let outputs = self
            .controller
            .tick(&payload.inputs, &payload.trims, now_ns / 1_000);
        self.report_crash_transitions(&outputs);

        output.metadata.set_status(format!(
            "{:>6.1} {:>6.1} {:>6.1}",
            outputs.axes[Axis::Roll].sum,
            outputs.axes[Axis::Pitch].sum,
            outputs.axes[Axis::Yaw].sum
        ));
        output.set_payload(outputs.into());
        Ok(())
    }

    fn stop(&mut self, _clock: &RobotClock) -> CuResult<()> {
        self.controller.reset();
        self.recovering = false;
        self.disarm_reported = false;
        Ok(())
    }
}

/// Store/Restore the whole controller state, filters and integrators included.
impl Freezable for CuStabilizerPid {
    fn freeze<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.controller.state(), encoder)?;
        Encode::encode(&self.recovering, encoder)?;
        Encode::encode(&self.disarm_reported, encoder)?;
        Ok(())
    }

    fn thaw<D: Decoder>(&mut self, decoder: &mut D) -> Result<(), DecodeError> {
        let state: ControllerState = Decode::decode(decoder)?;
        self.controller.restore_state(state);
        self.recovering = Decode::decode(decoder)?;
        self.disarm_reported = Decode::decode(decoder)?;
        Ok(())
    }
}

const GAIN_KEYS: [[&str; 4]; 3] = [
    ["roll_p", "roll_i", "roll_d", "roll_f"],
    ["pitch_p", "pitch_i", "pitch_d", "pitch_f"],
    ["yaw_p", "yaw_i", "yaw_d", "yaw_f"],
];

/// Builds the profile from an optional RON `profile` string, then applies the
/// flat per-key overrides on top.
fn profile_from_config(config: &ComponentConfig) -> CuResult<(PidProfile, LoopTiming)> {
    let mut profile = match config.get::<String>("profile") {
        Some(text) => PidProfile::from_ron(&text).map_err(to_cu_error)?,
        None => PidProfile::default(),
    };

    for (gains, keys) in profile.pid.0.iter_mut().zip(GAIN_KEYS) {
        let [p, i, d, f] = keys;
        gains.p = getcfg(config, p, gains.p);
        gains.i = getcfg(config, i, gains.i);
        gains.d = getcfg(config, d, gains.d);
        gains.f = getcfg(config, f, gains.f);
    }
    profile.pid_sum_limit = getcfg(config, "pid_sum_limit", profile.pid_sum_limit);
    profile.pid_sum_limit_yaw = getcfg(config, "pid_sum_limit_yaw", profile.pid_sum_limit_yaw);
    profile.iterm_limit = getcfg(config, "iterm_limit", profile.iterm_limit);
    profile.abs_control_gain = getcfg(config, "abs_control_gain", profile.abs_control_gain);

    if let Some(mode) = getopt::<CrashRecoveryMode>(config, "crash_recovery")? {
        profile.crash.mode = mode;
    }
    if let Some(mode) = getopt::<ItermRelaxMode>(config, "iterm_relax")? {
        profile.iterm_relax = mode;
    }
    if let Some(kind) = getopt::<ItermRelaxType>(config, "iterm_relax_type")? {
        profile.iterm_relax_type = kind;
    }

    let timing = match config.get::<u32>("loop_period_us") {
        Some(period_us) => LoopTiming::from_period_us(period_us),
        None => LoopTiming::default(),
    };
    Ok((profile, timing))
}

fn getcfg(config: &ComponentConfig, key: &str, default: f32) -> f32 {
    if let Some(value) = config.get::<f64>(key) {
        value as f32
    } else {
        default
    }
}

fn getopt<T>(config: &ComponentConfig, key: &str) -> CuResult<Option<T>>
where
    T: FromStr<Err = StabilizerError>,
{
    config
        .get::<String>(key)
        .map(|value| value.parse::<T>())
        .transpose()
        .map_err(to_cu_error)
}

fn to_cu_error(err: StabilizerError) -> CuError {
    CuError::from(format!("Invalid stabilizer configuration: {err}"))
}
