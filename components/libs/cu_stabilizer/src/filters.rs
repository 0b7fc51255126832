//! Filtering primitives for the derivative path and the auxiliary
//! lowpasses (iterm relax, absolute control, anti-gravity, yaw P).
//!
//! A stage whose cutoff is zero, or which cannot be represented at the
//! current tick rate, collapses to [`FilterStage::Bypass`] so the tick path
//! never branches on configuration.

use crate::profile::{DtermFilterSettings, DtermLowpassType};
use crate::timing::LoopTiming;
use bincode::{Decode, Encode};
use std::f32::consts::{FRAC_1_SQRT_2, PI};

/// Gain of a first order lowpass with `cutoff_hz` sampled every `dt` seconds.
pub fn pt1_gain(cutoff_hz: f32, dt: f32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    dt / (rc + dt)
}

/// Q of a notch centered on `center_hz` whose lower -3 dB edge sits at `cutoff_hz`.
pub fn notch_q(center_hz: f32, cutoff_hz: f32) -> f32 {
    center_hz * cutoff_hz / (center_hz * center_hz - cutoff_hz * cutoff_hz)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Pt1Filter {
    state: f32,
    k: f32,
}

impl Pt1Filter {
    pub fn new(cutoff_hz: f32, dt: f32) -> Self {
        Self {
            state: 0.0,
            k: pt1_gain(cutoff_hz, dt),
        }
    }

    pub fn apply(&mut self, input: f32) -> f32 {
        self.state += self.k * (input - self.state);
        self.state
    }

    pub fn output(&self) -> f32 {
        self.state
    }

    /// Settles on `input` as if it had been held forever.
    pub fn prime(&mut self, input: f32) -> f32 {
        self.state = input;
        input
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }
}

/// Three PT1 stages in series on one cutoff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Pt3Filter {
    stages: [Pt1Filter; 3],
}

impl Pt3Filter {
    pub fn new(cutoff_hz: f32, dt: f32) -> Self {
        Self {
            stages: [Pt1Filter::new(cutoff_hz, dt); 3],
        }
    }

    pub fn apply(&mut self, input: f32) -> f32 {
        self.stages
            .iter_mut()
            .fold(input, |signal, stage| stage.apply(signal))
    }

    pub fn output(&self) -> f32 {
        self.stages[2].output()
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}

/// Second order section, transposed direct form II.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct BiquadFilter {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
}

impl BiquadFilter {
    pub fn lowpass(cutoff_hz: f32, timing: LoopTiming) -> Self {
        let (sn, cs) = omega(cutoff_hz, timing).sin_cos();
        let alpha = sn / (2.0 * FRAC_1_SQRT_2);
        let b1 = 1.0 - cs;
        let b0 = b1 * 0.5;
        Self::normalized(b0, b1, b0, -2.0 * cs, 1.0 - alpha, 1.0 + alpha)
    }

    pub fn notch(center_hz: f32, cutoff_hz: f32, timing: LoopTiming) -> Self {
        let (sn, cs) = omega(center_hz, timing).sin_cos();
        let alpha = sn / (2.0 * notch_q(center_hz, cutoff_hz));
        Self::normalized(1.0, -2.0 * cs, 1.0, -2.0 * cs, 1.0 - alpha, 1.0 + alpha)
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a1: f32, a2: f32, a0: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
        }
    }

    pub fn apply(&mut self, input: f32) -> f32 {
        let result = self.b0 * input + self.x1;
        self.x1 = self.b1 * input - self.a1 * result + self.x2;
        self.x2 = self.b2 * input - self.a2 * result;
        result
    }

    /// Loads the delay line with the steady state reached under a constant
    /// `input` and returns the matching output.
    pub fn prime(&mut self, input: f32) -> f32 {
        let output = input * (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2);
        self.x2 = self.b2 * input - self.a2 * output;
        self.x1 = self.b1 * input - self.a1 * output + self.x2;
        output
    }
}

fn omega(freq_hz: f32, timing: LoopTiming) -> f32 {
    2.0 * PI * freq_hz * timing.dt()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub enum FilterStage {
    #[default]
    Bypass,
    Pt1(Pt1Filter),
    Biquad(BiquadFilter),
}

impl FilterStage {
    /// PT1 stage, bypassed when `cutoff_hz` is zero.
    pub fn pt1(cutoff_hz: f32, timing: LoopTiming) -> Self {
        if cutoff_hz > 0.0 {
            FilterStage::Pt1(Pt1Filter::new(cutoff_hz, timing.dt()))
        } else {
            FilterStage::Bypass
        }
    }

    /// Lowpass of the requested family, bypassed at zero or at/above Nyquist.
    pub fn lowpass(kind: DtermLowpassType, cutoff_hz: f32, timing: LoopTiming) -> Self {
        if cutoff_hz <= 0.0 || cutoff_hz >= timing.nyquist_hz() {
            return FilterStage::Bypass;
        }
        match kind {
            DtermLowpassType::Pt1 => FilterStage::Pt1(Pt1Filter::new(cutoff_hz, timing.dt())),
            DtermLowpassType::Biquad => FilterStage::Biquad(BiquadFilter::lowpass(cutoff_hz, timing)),
        }
    }

    /// Notch; a center above Nyquist is pulled down to Nyquist when the
    /// cutoff still fits below it.
    pub fn notch(center_hz: f32, cutoff_hz: f32, timing: LoopTiming) -> Self {
        let nyquist = timing.nyquist_hz();
        let center_hz = if center_hz <= nyquist {
            center_hz
        } else if cutoff_hz < nyquist {
            nyquist
        } else {
            0.0
        };
        if center_hz <= 0.0 || cutoff_hz <= 0.0 || cutoff_hz >= center_hz {
            return FilterStage::Bypass;
        }
        FilterStage::Biquad(BiquadFilter::notch(center_hz, cutoff_hz, timing))
    }

    pub fn apply(&mut self, input: f32) -> f32 {
        match self {
            FilterStage::Bypass => input,
            FilterStage::Pt1(filter) => filter.apply(input),
            FilterStage::Biquad(filter) => filter.apply(input),
        }
    }

    pub fn prime(&mut self, input: f32) -> f32 {
        match self {
            FilterStage::Bypass => input,
            FilterStage::Pt1(filter) => filter.prime(input),
            FilterStage::Biquad(filter) => filter.prime(input),
        }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, FilterStage::Bypass)
    }
}

/// Notch, then first lowpass, then second lowpass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Encode, Decode)]
pub struct DtermFilterChain {
    notch: FilterStage,
    lowpass: FilterStage,
    lowpass2: FilterStage,
}

impl DtermFilterChain {
    pub fn new(settings: &DtermFilterSettings, timing: LoopTiming) -> Self {
        let lowpass2 = if settings.lowpass2_hz < timing.nyquist_hz() {
            FilterStage::pt1(settings.lowpass2_hz, timing)
        } else {
            FilterStage::Bypass
        };
        Self {
            notch: FilterStage::notch(settings.notch_hz, settings.notch_cutoff_hz, timing),
            lowpass: FilterStage::lowpass(settings.lowpass_type, settings.lowpass_hz, timing),
            lowpass2,
        }
    }

    pub fn apply(&mut self, input: f32) -> f32 {
        let notched = self.notch.apply(input);
        let filtered = self.lowpass.apply(notched);
        self.lowpass2.apply(filtered)
    }

    /// Starts every stage from the steady state of a constant `input`,
    /// returning the chain output for it.
    pub fn prime(&mut self, input: f32) -> f32 {
        let notched = self.notch.prime(input);
        let filtered = self.lowpass.prime(notched);
        self.lowpass2.prime(filtered)
    }

    pub fn is_bypass(&self) -> bool {
        self.notch.is_bypass() && self.lowpass.is_bypass() && self.lowpass2.is_bypass()
    }
}
