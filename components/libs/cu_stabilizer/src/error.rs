use crate::axis::Axis;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StabilizerError {
    #[error("Loop period must be greater than zero")]
    ZeroLoopPeriod,

    #[error("Gain '{term}' on {axis} must be finite and non-negative, got {value}")]
    InvalidGain {
        axis: Axis,
        term: &'static str,
        value: f32,
    },

    #[error("PID sum limit '{name}' must be finite and positive, got {value}")]
    InvalidSumLimit { name: &'static str, value: f32 },

    #[error("Iterm limit must be finite and positive, got {0}")]
    InvalidItermLimit(f32),

    #[error("Iterm windup point must be within 1..=100 percent, got {0}")]
    InvalidWindupPoint(u8),

    #[error("Setting '{name}' is out of range: {value}")]
    InvalidSetting { name: &'static str, value: f32 },

    #[error("Unknown value '{value}' for '{key}'")]
    UnknownOption { key: &'static str, value: String },

    #[error("Profile parse error: {0}")]
    ProfileParse(String),
}

pub type StabilizerResult<T> = Result<T, StabilizerError>;
