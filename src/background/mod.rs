// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Adaptive per-cell pressure baseline.
//!
//! Thermal drift and mechanical relaxation move the resting level of every
//! cell over minutes. The baseline follows that drift with an asymmetric
//! one-pole filter per cell: falling input is tracked at the configured
//! cutoff, rising input almost not at all. Cells under a known touch are
//! frozen completely so that held notes are never absorbed, no matter how
//! long they last.

use crate::{
    filters::one_pole_coeff,
    frame::{Grid, GridSize},
};

/// Rising cutoff for cells without touch mass.
const BASE_RISING_HZ: f32 = 0.01;

/// Rising cutoff reduction per unit of touch template mass.
///
/// Sized so that even the faintest trackable touch drives the rising
/// cutoff all the way to zero.
const RISING_SUPPRESSION_HZ_PER_MASS: f32 = 10.0;

/// Default cutoff while the signal falls below the baseline.
pub const DEFAULT_FALLING_CUTOFF_HZ: f32 = 0.125;

#[derive(Debug)]
pub struct BackgroundTracker {
    background: Grid,
    falling_coeff: f32,
    sample_rate_hz: f32,
    primed: bool,
}

impl BackgroundTracker {
    #[must_use]
    pub fn new(size: GridSize, sample_rate_hz: f32) -> Self {
        debug_assert!(sample_rate_hz > 0.0);
        Self {
            background: Grid::new(size),
            falling_coeff: one_pole_coeff(DEFAULT_FALLING_CUTOFF_HZ, sample_rate_hz),
            sample_rate_hz,
            primed: false,
        }
    }

    pub fn set_falling_cutoff_hz(&mut self, cutoff_hz: f32) {
        self.falling_coeff = one_pole_coeff(cutoff_hz, self.sample_rate_hz);
    }

    /// Advance the baseline by one frame.
    ///
    /// `touch_mass` carries the summed template contributions of the
    /// currently tracked touches and suppresses the rising cutoff cell by
    /// cell. The first frame after construction or reset primes the
    /// baseline directly.
    pub fn update(&mut self, frame: &Grid, touch_mass: &Grid) {
        debug_assert_eq!(frame.size(), self.background.size());
        debug_assert_eq!(touch_mass.size(), self.background.size());
        if !self.primed {
            self.background.copy_from(frame);
            self.primed = true;
            return;
        }
        let falling_coeff = self.falling_coeff;
        let sample_rate_hz = self.sample_rate_hz;
        for ((state, input), mass) in self
            .background
            .as_mut_slice()
            .iter_mut()
            .zip(frame.as_slice())
            .zip(touch_mass.as_slice())
        {
            let coeff = if *input > *state {
                let rising_hz =
                    (BASE_RISING_HZ - RISING_SUPPRESSION_HZ_PER_MASS * *mass).max(0.0);
                one_pole_coeff(rising_hz, sample_rate_hz)
            } else {
                falling_coeff
            };
            *state += coeff * (*input - *state);
        }
    }

    #[must_use]
    pub const fn background(&self) -> &Grid {
        &self.background
    }

    /// Forget the baseline. The next frame primes it again.
    pub fn reset(&mut self) {
        self.primed = false;
    }
}
