#![doc = include_str!("../README.md")]

pub mod axis;
pub mod controller;
pub mod crash;
pub mod error;
pub mod feedforward;
pub mod filters;
pub mod iterm;
pub mod level;
pub mod profile;
pub mod timing;

pub use axis::{Axis, AxisArray};
pub use controller::{AxisOutput, ControlInputs, ControllerState, PidController, PidOutputs};
pub use crash::CrashPhase;
pub use error::{StabilizerError, StabilizerResult};
pub use level::{Attitude, FlightModeFlags, RollPitchTrims};
pub use profile::{
    AntiGravityMode, CrashRecoveryMode, CrashSettings, DtermFilterSettings, DtermLowpassType,
    DtermSource, ItermRelaxMode, ItermRelaxType, LevelSettings, PidGains, PidProfile,
};
pub use timing::LoopTiming;
