use crate::error::{StabilizerError, StabilizerResult};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Nominal period of the control tick, fixed between two `init` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct LoopTiming {
    pub period_us: u32,
}

impl LoopTiming {
    pub const fn from_period_us(period_us: u32) -> Self {
        Self { period_us }
    }

    pub fn validate(&self) -> StabilizerResult<()> {
        if self.period_us == 0 {
            return Err(StabilizerError::ZeroLoopPeriod);
        }
        Ok(())
    }

    /// Tick period in seconds.
    pub fn dt(&self) -> f32 {
        self.period_us as f32 * 1e-6
    }

    /// Tick rate in Hz.
    pub fn frequency(&self) -> f32 {
        1.0 / self.dt()
    }

    pub fn nyquist_hz(&self) -> f32 {
        self.frequency() / 2.0
    }

    /// Whole ticks covering `duration_us`, at least one.
    pub fn ticks_for(&self, duration_us: u32) -> u32 {
        duration_us.div_ceil(self.period_us).max(1)
    }
}

impl Default for LoopTiming {
    fn default() -> Self {
        // 125 Hz PID loop
        Self::from_period_us(8000)
    }
}
