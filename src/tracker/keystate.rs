// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Per-key filtering layer between raw peaks and touch births.
//!
//! Key states exist independently of touches. They smooth whatever peak
//! lands nearest their cell each frame and provide the hysteresis that
//! keeps borderline peaks from flickering touches in and out.

/// Filter coefficient for peaks right at the on threshold.
const ALPHA_MIN: f32 = 0.1;

/// Filter coefficient for peaks at or above the override pressure.
const ALPHA_MAX: f32 = 0.6;

/// Fraction removed from the filtered values on frames without a peak.
const DECAY: f32 = 0.25;

/// Frames a key stays blocked for new births after its touch died.
pub(super) const KEY_SETTLE_FRAMES: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub(super) struct KeyState {
    z: f32,
    dz: f32,
    template_dist: f32,
    x: f32,
    y: f32,
    frames_since_reset: u32,
}

impl KeyState {
    pub(super) const fn new() -> Self {
        Self {
            z: 0.0,
            dz: 0.0,
            template_dist: 1.0,
            x: 0.0,
            y: 0.0,
            // Keys are born settled, only touch deaths block them.
            frames_since_reset: KEY_SETTLE_FRAMES,
        }
    }

    /// Pull the filtered values toward a peak observed at this key.
    ///
    /// `confidence` in `[0, 1]` selects the filter speed, strong peaks
    /// update the state faster than barely-over-threshold ones.
    pub(super) fn feed(&mut self, x: f32, y: f32, z: f32, template_dist: f32, confidence: f32) {
        let alpha = ALPHA_MIN + (ALPHA_MAX - ALPHA_MIN) * confidence.clamp(0.0, 1.0);
        let slope = z - self.z;
        self.dz += alpha * (slope - self.dz);
        self.z += alpha * slope;
        self.template_dist += alpha * (template_dist - self.template_dist);
        self.x = x;
        self.y = y;
        self.tick();
    }

    /// No peak landed here this frame.
    pub(super) fn decay(&mut self) {
        self.z *= 1.0 - DECAY;
        self.dz *= 1.0 - DECAY;
        self.tick();
    }

    /// Clear the state and block births for [`KEY_SETTLE_FRAMES`].
    pub(super) fn reset(&mut self) {
        *self = Self {
            frames_since_reset: 0,
            ..Self::new()
        };
    }

    fn tick(&mut self) {
        self.frames_since_reset = self.frames_since_reset.saturating_add(1);
    }

    pub(super) const fn z(&self) -> f32 {
        self.z
    }

    pub(super) const fn dz(&self) -> f32 {
        self.dz
    }

    pub(super) const fn template_dist(&self) -> f32 {
        self.template_dist
    }

    pub(super) const fn x(&self) -> f32 {
        self.x
    }

    pub(super) const fn y(&self) -> f32 {
        self.y
    }

    pub(super) const fn is_settled(&self) -> bool {
        self.frames_since_reset >= KEY_SETTLE_FRAMES
    }
}
