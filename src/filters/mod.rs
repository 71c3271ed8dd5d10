// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Scalar and grid smoothing primitives for the frame processing chain.

use std::f32::consts::PI;

use float_cmp::approx_eq;

use crate::frame::Grid;

/// Butterworth-ish default resonance for the low-pass sections.
pub const DEFAULT_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// One-pole smoothing coefficient for a cutoff frequency.
///
/// Returns `a` for the recurrence `y += a * (x - y)`, clamped into `[0, 1]`.
/// A zero cutoff freezes the filter output.
#[must_use]
pub fn one_pole_coeff(cutoff_hz: f32, sample_rate_hz: f32) -> f32 {
    debug_assert!(sample_rate_hz > 0.0);
    if cutoff_hz <= 0.0 {
        return 0.0;
    }
    (1.0 - (-2.0 * PI * cutoff_hz / sample_rate_hz).exp()).clamp(0.0, 1.0)
}

/// Single-pole low-pass filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnePole {
    coeff: f32,
    state: f32,
}

impl OnePole {
    #[must_use]
    pub const fn new(coeff: f32) -> Self {
        Self { coeff, state: 0.0 }
    }

    #[must_use]
    pub fn from_hz(cutoff_hz: f32, sample_rate_hz: f32) -> Self {
        Self::new(one_pole_coeff(cutoff_hz, sample_rate_hz))
    }

    pub fn set_coeff(&mut self, coeff: f32) {
        debug_assert!((0.0..=1.0).contains(&coeff));
        self.coeff = coeff;
    }

    /// Prime the filter so that it outputs `value` for constant input.
    pub fn reset(&mut self, value: f32) {
        self.state = value;
    }

    pub fn process(&mut self, input: f32) -> f32 {
        self.state += self.coeff * (input - self.state);
        self.state
    }

    #[must_use]
    pub const fn output(&self) -> f32 {
        self.state
    }
}

/// Biquad low-pass section (transposed direct form II).
///
/// Coefficients follow the usual cookbook derivation: `w = 2*pi*fc/fs`,
/// `alpha = sin(w) / (2*q)`, all terms normalized by `a0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    s1: f32,
    s2: f32,
}

impl Biquad {
    /// Unit gain section that passes input through unchanged.
    #[must_use]
    pub const fn passthrough() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            s1: 0.0,
            s2: 0.0,
        }
    }

    #[must_use]
    pub fn lowpass(cutoff_hz: f32, sample_rate_hz: f32, q: f32) -> Self {
        let mut filter = Self::passthrough();
        filter.set_lowpass(cutoff_hz, sample_rate_hz, q);
        filter
    }

    pub fn set_lowpass(&mut self, cutoff_hz: f32, sample_rate_hz: f32, q: f32) {
        debug_assert!(sample_rate_hz > 0.0);
        debug_assert!(q > 0.0);
        // Staying well below Nyquist keeps the section stable.
        let cutoff_hz = cutoff_hz.clamp(0.001, sample_rate_hz * 0.45);
        let w = 2.0 * PI * cutoff_hz / sample_rate_hz;
        let (sin_w, cos_w) = w.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        self.b0 = (1.0 - cos_w) * 0.5 / a0;
        self.b1 = (1.0 - cos_w) / a0;
        self.b2 = (1.0 - cos_w) * 0.5 / a0;
        self.a1 = -2.0 * cos_w / a0;
        self.a2 = (1.0 - alpha) / a0;
        debug_assert!(approx_eq!(
            f32,
            self.b0 + self.b1 + self.b2,
            1.0 + self.a1 + self.a2,
            epsilon = 1e-4
        ));
    }

    /// Prime the filter so that it outputs `value` for constant input.
    pub fn reset(&mut self, value: f32) {
        self.s1 = value * (self.b1 - self.a1 + self.b2 - self.a2);
        self.s2 = value * (self.b2 - self.a2);
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let output = self.b0 * input + self.s1;
        self.s1 = self.b1 * input - self.a1 * output + self.s2;
        self.s2 = self.b2 * input - self.a2 * output;
        output
    }
}

/// 3x3 binomial blur with border replication.
///
/// `source` and `target` must have the same size and must not alias.
pub fn smooth_3x3(source: &Grid, target: &mut Grid) {
    debug_assert_eq!(source.size(), target.size());
    let width = source.width() as isize;
    let height = source.height() as isize;
    let clamped = |x: isize, y: isize| {
        source.get(
            x.clamp(0, width - 1) as usize,
            y.clamp(0, height - 1) as usize,
        )
    };
    for y in 0..height {
        for x in 0..width {
            let sum = clamped(x - 1, y - 1)
                + 2.0 * clamped(x, y - 1)
                + clamped(x + 1, y - 1)
                + 2.0 * clamped(x - 1, y)
                + 4.0 * clamped(x, y)
                + 2.0 * clamped(x + 1, y)
                + clamped(x - 1, y + 1)
                + 2.0 * clamped(x, y + 1)
                + clamped(x + 1, y + 1);
            target.set(x as usize, y as usize, sum / 16.0);
        }
    }
}
