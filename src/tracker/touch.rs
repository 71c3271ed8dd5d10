// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Touch records emitted once per processed frame.

use crate::params::MAX_TOUCH_SLOTS;

/// Frames a releasing touch takes to ramp its pressure down to zero.
pub const TOUCH_RELEASE_FRAMES: u32 = 16;

/// Discrete key cell on the playing surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, derive_more::Display)]
#[display("({col}, {row})")]
pub struct KeyPosition {
    pub col: u8,
    pub row: u8,
}

/// Lifecycle stage of a touch slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TouchPhase {
    /// The slot is free.
    #[default]
    Off,
    /// The touch follows the sensor signal.
    Active,
    /// The touch ramps its pressure down after losing the signal.
    Releasing,
}

impl TouchPhase {
    #[must_use]
    pub const fn is_off(self) -> bool {
        matches!(self, Self::Off)
    }

    /// Active or releasing. Alive touches hold a key claim.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !self.is_off()
    }
}

/// One slot of an emitted touch frame.
///
/// `age` counts the frames since birth and is zero exactly while the
/// slot is [`TouchPhase::Off`]. Positions are sensor coordinates unless
/// the tracker is configured to quantize them onto key centers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TouchSample {
    pub phase: TouchPhase,
    pub key: KeyPosition,
    pub x: f32,
    pub y: f32,
    /// Filtered pressure.
    pub z: f32,
    /// Frame-to-frame pressure slope, the velocity proxy.
    pub dz: f32,
    pub age: u32,
    /// Shape mismatch against the calibrated template, lower is better.
    pub template_dist: f32,
}

impl TouchSample {
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.phase.is_alive()
    }
}

/// Fixed-capacity set of touch slots, one record per slot.
pub type TouchFrame = [TouchSample; MAX_TOUCH_SLOTS];
