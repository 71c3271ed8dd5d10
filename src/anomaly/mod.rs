// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Gate against non-physical frame-to-frame jumps.
//!
//! The sensor occasionally delivers corrupted frames after carrier
//! hiccups, with energy smeared across the whole surface. Real pressure
//! changes are band-limited, so a large sum of absolute differences
//! between consecutive frames marks a glitch. Rejected frames are handed
//! to diagnostics and the filter re-enters its settling window, since one
//! glitch is usually followed by a short burst of them.

use crate::frame::{Grid, GridSize};

/// Frames passed through after a reset or glitch before the gate arms.
pub const DEFAULT_STARTUP_FRAMES: u32 = 50;

/// Largest plausible sum of absolute per-cell differences between
/// consecutive frames.
pub const DEFAULT_MAX_FRAME_DIFF: f32 = 2.0;

/// Details of a rejected frame, for diagnostics sinks.
#[derive(Debug, Clone)]
pub struct GlitchReport {
    /// Value of the settling counter when the glitch was detected.
    pub startup_counter: u32,
    /// Sum of absolute differences that tripped the gate.
    pub frame_diff: f32,
    pub previous: Grid,
    pub frame: Grid,
}

#[derive(Debug)]
pub enum Verdict {
    Forward,
    Glitch(Box<GlitchReport>),
}

impl Verdict {
    #[must_use]
    pub const fn is_forward(&self) -> bool {
        matches!(self, Self::Forward)
    }
}

#[derive(Debug)]
pub struct AnomalyFilter {
    startup_frames: u32,
    max_frame_diff: f32,
    startup_counter: u32,
    previous: Grid,
    has_previous: bool,
    glitch_count: u64,
}

impl AnomalyFilter {
    #[must_use]
    pub fn new(size: GridSize) -> Self {
        Self::with_limits(size, DEFAULT_STARTUP_FRAMES, DEFAULT_MAX_FRAME_DIFF)
    }

    #[must_use]
    pub fn with_limits(size: GridSize, startup_frames: u32, max_frame_diff: f32) -> Self {
        debug_assert!(max_frame_diff > 0.0);
        Self {
            startup_frames,
            max_frame_diff,
            startup_counter: 0,
            previous: Grid::new(size),
            has_previous: false,
            glitch_count: 0,
        }
    }

    /// Decide whether a frame is forwarded into the processing chain.
    ///
    /// The reference frame is updated from every inspected frame, glitch
    /// or not, so a repeated identical frame never trips the gate.
    pub fn inspect(&mut self, frame: &Grid) -> Verdict {
        debug_assert_eq!(frame.size(), self.previous.size());
        if !self.has_previous {
            self.previous.copy_from(frame);
            self.has_previous = true;
            self.startup_counter = 1;
            return Verdict::Forward;
        }
        let frame_diff = frame.sum_abs_diff(&self.previous);
        let verdict = if self.startup_counter < self.startup_frames {
            self.startup_counter += 1;
            Verdict::Forward
        } else if frame_diff < self.max_frame_diff {
            Verdict::Forward
        } else {
            let report = GlitchReport {
                startup_counter: self.startup_counter,
                frame_diff,
                previous: self.previous.clone(),
                frame: frame.clone(),
            };
            self.glitch_count += 1;
            self.startup_counter = 0;
            log::warn!(
                "Rejecting glitched frame: diff = {frame_diff}, limit = {limit}",
                limit = self.max_frame_diff
            );
            Verdict::Glitch(Box::new(report))
        };
        self.previous.copy_from(frame);
        verdict
    }

    /// Whether the gate is still in its settling window.
    #[must_use]
    pub const fn is_settling(&self) -> bool {
        self.startup_counter < self.startup_frames
    }

    #[must_use]
    pub const fn glitch_count(&self) -> u64 {
        self.glitch_count
    }

    /// Forget the reference frame and re-enter the settling window.
    pub fn reset(&mut self) {
        self.startup_counter = 0;
        self.has_previous = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: f32) -> Grid {
        let mut grid = Grid::new(GridSize::new(4, 4));
        grid.fill(value);
        grid
    }

    #[test]
    fn settling_frames_pass_through() {
        let mut filter = AnomalyFilter::with_limits(GridSize::new(4, 4), 3, 2.0);
        let low = uniform(0.0);
        let high = uniform(1.0);
        // Diff of 16.0 per alternation, far beyond the limit.
        assert!(filter.inspect(&low).is_forward());
        assert!(filter.inspect(&high).is_forward());
        assert!(filter.inspect(&low).is_forward());
        assert!(!filter.is_settling());
        assert!(!filter.inspect(&high).is_forward());
    }

    #[test]
    fn static_input_never_glitches() {
        let mut filter = AnomalyFilter::with_limits(GridSize::new(4, 4), 2, 2.0);
        let frame = uniform(0.5);
        for _ in 0..100 {
            assert!(filter.inspect(&frame).is_forward());
        }
        assert_eq!(0, filter.glitch_count());
    }

    #[test]
    fn glitch_reenters_the_settling_window() {
        let mut filter = AnomalyFilter::with_limits(GridSize::new(4, 4), 2, 2.0);
        let low = uniform(0.0);
        let high = uniform(1.0);
        assert!(filter.inspect(&low).is_forward());
        assert!(filter.inspect(&low).is_forward());
        assert!(!filter.inspect(&high).is_forward());
        assert!(filter.is_settling());
        // Still settling, the next jump passes through again.
        assert!(filter.inspect(&low).is_forward());
    }

    #[test]
    fn report_captures_both_frames() {
        let mut filter = AnomalyFilter::with_limits(GridSize::new(4, 4), 1, 2.0);
        let low = uniform(0.0);
        let high = uniform(1.0);
        let _ = filter.inspect(&low);
        let Verdict::Glitch(report) = filter.inspect(&high) else {
            panic!("expected a glitch");
        };
        assert_eq!(low, report.previous);
        assert_eq!(high, report.frame);
        assert!((report.frame_diff - 16.0).abs() < 1e-6);
        assert_eq!(1, report.startup_counter);
    }

    #[test]
    fn reference_frame_updates_even_on_glitch() {
        let mut filter = AnomalyFilter::with_limits(GridSize::new(4, 4), 1, 2.0);
        let low = uniform(0.0);
        let high = uniform(1.0);
        let _ = filter.inspect(&low);
        let _ = filter.inspect(&high);
        // The glitched frame became the reference, repeating it is clean.
        for _ in 0..10 {
            assert!(filter.inspect(&high).is_forward());
        }
        assert_eq!(1, filter.glitch_count());
    }
}
