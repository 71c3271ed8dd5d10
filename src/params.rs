// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Runtime configuration of the tracking chain.

use serde::{Deserialize, Serialize};

use crate::frame::GridSize;

/// Hard capacity of the touch slot pool.
///
/// Emitted touch frames always carry this many slots. The configurable
/// `max_touches` only limits how many of them may be active at once.
pub const MAX_TOUCH_SLOTS: usize = 16;

/// Tunable parameters of the touch tracker.
///
/// All fields have working defaults, so hosts can deserialize partial
/// configurations. Out-of-range values are brought back into their
/// supported ranges by [`TrackerParams::clamped`] when applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Upper bound of concurrently tracked touches.
    pub max_touches: usize,
    /// Pressure below which an active touch starts releasing.
    pub z_thresh: f32,
    /// Cutoff in Hz for smoothing the reported touch positions.
    pub lopass: f32,
    /// Cutoff in Hz for smoothing the reported touch pressure.
    pub lopass_z: f32,
    /// Falling cutoff in Hz of the background baseline.
    pub background_filter_freq: f32,
    /// Largest template distance still accepted as a plausible touch.
    pub template_thresh: f32,
    /// Report key centers instead of continuous positions.
    pub quantize: bool,
    /// Allocate touch slots round-robin instead of lowest-first.
    pub rotate: bool,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_touches: 4,
            z_thresh: 0.01,
            lopass: 100.0,
            lopass_z: 50.0,
            background_filter_freq: 0.125,
            template_thresh: 0.3,
            quantize: false,
            rotate: false,
        }
    }
}

impl TrackerParams {
    /// Clamp all fields into their supported ranges.
    #[must_use]
    pub fn clamped(self) -> Self {
        let Self {
            max_touches,
            z_thresh,
            lopass,
            lopass_z,
            background_filter_freq,
            template_thresh,
            quantize,
            rotate,
        } = self;
        Self {
            max_touches: max_touches.clamp(1, MAX_TOUCH_SLOTS),
            z_thresh: z_thresh.clamp(1e-4, 0.5),
            lopass: lopass.clamp(1.0, 500.0),
            lopass_z: lopass_z.clamp(1.0, 500.0),
            background_filter_freq: background_filter_freq.clamp(0.0, 10.0),
            template_thresh: template_thresh.clamp(0.01, 2.0),
            quantize,
            rotate,
        }
    }
}

/// Geometry and timing of a surface hardware variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceProfile {
    /// Taxel grid delivered by the sensor.
    pub sensor: GridSize,
    /// Playing surface layout in keys.
    pub keys: GridSize,
    /// Nominal frame rate of the sensor scan.
    pub frame_rate_hz: f32,
    /// Outermost sensor columns per side that carry no pressure data.
    pub guard_columns: usize,
}

impl SurfaceProfile {
    /// The production surface: 64x8 taxels mapped onto 30x5 keys at 1 kHz.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            sensor: GridSize::new(64, 8),
            keys: GridSize::new(30, 5),
            frame_rate_hz: 1000.0,
            guard_columns: 1,
        }
    }

    /// The half-width hardware revision, a single sensor board at 500 Hz.
    ///
    /// Only the tracking chain supports this geometry. The wire unpacker
    /// is tied to the two-board transport of the standard surface.
    #[must_use]
    pub const fn compact() -> Self {
        Self {
            sensor: GridSize::new(32, 8),
            keys: GridSize::new(15, 5),
            frame_rate_hz: 500.0,
            guard_columns: 1,
        }
    }

    #[must_use]
    pub fn key_col_at(&self, x: f32) -> usize {
        let col = (x * self.keys.width as f32 / self.sensor.width as f32).floor();
        (col.max(0.0) as usize).min(self.keys.width - 1)
    }

    #[must_use]
    pub fn key_row_at(&self, y: f32) -> usize {
        let row = (y * self.keys.height as f32 / self.sensor.height as f32).floor();
        (row.max(0.0) as usize).min(self.keys.height - 1)
    }

    /// Center of a key column in sensor coordinates.
    #[must_use]
    pub fn key_center_x(&self, col: usize) -> f32 {
        debug_assert!(col < self.keys.width);
        (col as f32 + 0.5) * self.sensor.width as f32 / self.keys.width as f32
    }

    /// Center of a key row in sensor coordinates.
    #[must_use]
    pub fn key_center_y(&self, row: usize) -> f32 {
        debug_assert!(row < self.keys.height);
        (row as f32 + 0.5) * self.sensor.height as f32 / self.keys.height as f32
    }
}
