// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! The per-frame processing chain.
//!
//! [`SurfacePipeline`] strings the stages together: anomaly gate,
//! normalization, smoothing, background subtraction, touch tracking and
//! zone routing. It is synchronous and single-threaded. Hosts either call
//! [`SurfacePipeline::process_frame`] directly or hand the pipeline to a
//! [`thread::ProcessThread`] fed from the transport callback.
//!
//! While the calibrator is collecting, frames are consumed by it instead
//! of the tracking chain and the touch output stays silent.

use std::time::{Duration, Instant};

use crate::{
    anomaly::{AnomalyFilter, GlitchReport, Verdict},
    background::BackgroundTracker,
    calibrate::{CalibrationPhase, Calibrator, ExportError, ImportError},
    filters::smooth_3x3,
    frame::Grid,
    params::{SurfaceProfile, TrackerParams, MAX_TOUCH_SLOTS},
    tracker::{Tracker, TouchFrame, TouchSample, TrackerStats},
    zone::{ZoneEvent, ZoneMap, ZoneRouter},
};

pub mod thread;


/// Consumer of processed touch frames.
///
/// Invoked synchronously once per processed frame, from whichever thread
/// drives the pipeline. Implementations must not block.
pub trait TouchFrameSink {
    fn deliver(&mut self, frame: &TouchFrame, events: &[ZoneEvent]);
}

impl<F> TouchFrameSink for F
where
    F: FnMut(&TouchFrame, &[ZoneEvent]),
{
    fn deliver(&mut self, frame: &TouchFrame, events: &[ZoneEvent]) {
        self(frame, events);
    }
}

/// Receiver of rejected-frame reports, for optional persistence or
/// inspection.
pub trait DiagnosticsSink {
    fn glitch(&mut self, report: &GlitchReport);
}

impl<F> DiagnosticsSink for F
where
    F: FnMut(&GlitchReport),
{
    fn glitch(&mut self, report: &GlitchReport) {
        self(report);
    }
}

/// Frame accounting of a pipeline instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    /// Frames that passed the anomaly gate.
    pub frames_processed: u64,
    /// Subset of processed frames consumed by calibration collection.
    pub calibration_frames: u64,
    /// Frames rejected by the anomaly gate.
    pub glitch_frames: u64,
    /// Longest observed gap between consecutive frames.
    pub max_frame_gap: Duration,
}

#[derive(Debug)]
pub struct SurfacePipeline {
    profile: SurfaceProfile,
    anomaly: AnomalyFilter,
    calibrator: Calibrator,
    background: BackgroundTracker,
    tracker: Tracker,
    router: ZoneRouter,
    normalized: Grid,
    smoothed: Grid,
    working: Grid,
    /// Zone events accumulate here until the next delivery, so control
    /// operations can queue note-offs between frames.
    events: Vec<ZoneEvent>,
    stats: PipelineStats,
    last_frame_at: Option<Instant>,
}

impl SurfacePipeline {
    #[must_use]
    pub fn new(profile: SurfaceProfile, params: TrackerParams) -> Self {
        let params = params.clamped();
        let size = profile.sensor;
        let mut background = BackgroundTracker::new(size, profile.frame_rate_hz);
        background.set_falling_cutoff_hz(params.background_filter_freq);
        Self {
            profile,
            anomaly: AnomalyFilter::new(size),
            calibrator: Calibrator::new(size, profile.guard_columns),
            background,
            tracker: Tracker::new(profile, params),
            router: ZoneRouter::new(profile, ZoneMap::full_surface(profile.keys)),
            normalized: Grid::new(size),
            smoothed: Grid::new(size),
            working: Grid::new(size),
            events: Vec::new(),
            stats: PipelineStats::default(),
            last_frame_at: None,
        }
    }

    /// Run one sensor frame through the chain.
    ///
    /// Exactly one of three things happens: the frame is rejected and
    /// reported to `diagnostics`, consumed by a running calibration
    /// collection (with a silent touch frame delivered), or tracked and
    /// delivered to `touches` together with the zone events it produced.
    pub fn process_frame(
        &mut self,
        frame: &Grid,
        touches: &mut impl TouchFrameSink,
        diagnostics: &mut impl DiagnosticsSink,
    ) {
        self.note_frame_gap();
        match self.anomaly.inspect(frame) {
            Verdict::Forward => {}
            Verdict::Glitch(report) => {
                self.stats.glitch_frames += 1;
                diagnostics.glitch(&report);
                return;
            }
        }
        self.stats.frames_processed += 1;

        if self.calibrator.is_collecting() {
            self.calibrator.process_frame(frame);
            self.stats.calibration_frames += 1;
            if !self.calibrator.is_collecting() {
                // Collection just ended. The normalize map changed, so the
                // baseline has to re-prime from the next frame.
                self.background.reset();
            }
            let silent = [TouchSample::default(); MAX_TOUCH_SLOTS];
            touches.deliver(&silent, &self.events);
            self.events.clear();
            return;
        }

        self.normalized.copy_from(frame);
        self.calibrator.apply_normalize_map(&mut self.normalized);
        smooth_3x3(&self.normalized, &mut self.smoothed);
        self.background.update(&self.smoothed, self.tracker.touch_mass());
        self.working.copy_from(&self.smoothed);
        self.working.sub_floor_zero(self.background.background());

        let frame_out = *self.tracker.process_frame(&mut self.working, &self.calibrator);
        self.router.route(&frame_out, &mut self.events);
        touches.deliver(&frame_out, &self.events);
        self.events.clear();
    }

    /// Start the interactive calibration procedure.
    ///
    /// All touches are dropped and their notes silenced; subsequent frames
    /// feed the collection until it finishes or is cancelled.
    pub fn begin_calibration(&mut self) {
        self.tracker.reset();
        self.router.silence(&mut self.events);
        self.calibrator.begin();
    }

    /// Abandon a running collection, keeping previously finished data.
    pub fn cancel_calibration(&mut self) {
        self.calibrator.cancel();
        self.background.reset();
    }

    /// Install persisted calibration data.
    ///
    /// A running collection is aborted on success. On failure the live
    /// calibration is left untouched.
    pub fn import_calibration(&mut self, bytes: &[u8]) -> Result<(), ImportError> {
        self.calibrator.import(bytes)?;
        self.tracker.reset();
        self.background.reset();
        Ok(())
    }

    pub fn export_calibration(&self) -> Result<Vec<u8>, ExportError> {
        self.calibrator.export()
    }

    #[must_use]
    pub const fn calibration_phase(&self) -> CalibrationPhase {
        self.calibrator.phase()
    }

    #[must_use]
    pub fn calibration_progress(&self) -> f32 {
        self.calibrator.progress()
    }

    #[must_use]
    pub const fn has_calibration(&self) -> bool {
        self.calibrator.has_calibration()
    }

    pub fn set_params(&mut self, params: TrackerParams) {
        let params = params.clamped();
        self.background
            .set_falling_cutoff_hz(params.background_filter_freq);
        self.tracker.set_params(params);
    }

    #[must_use]
    pub const fn params(&self) -> TrackerParams {
        self.tracker.params()
    }

    /// Replace the zone layout. Note-offs for sounding notes are delivered
    /// with the next processed frame.
    pub fn set_zone_map(&mut self, map: ZoneMap) {
        self.router.set_map(map, &mut self.events);
    }

    #[must_use]
    pub const fn zone_map(&self) -> &ZoneMap {
        self.router.map()
    }

    #[must_use]
    pub const fn profile(&self) -> SurfaceProfile {
        self.profile
    }

    #[must_use]
    pub const fn stats(&self) -> PipelineStats {
        self.stats
    }

    #[must_use]
    pub const fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    /// Drop all tracking state and re-enter the anomaly settling window.
    /// Calibration data and counters are kept.
    pub fn reset(&mut self) {
        self.anomaly.reset();
        self.background.reset();
        self.tracker.reset();
        self.router.silence(&mut self.events);
        self.last_frame_at = None;
    }

    fn note_frame_gap(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            let gap = now.duration_since(last);
            if gap > self.stats.max_frame_gap {
                self.stats.max_frame_gap = gap;
            }
        }
        self.last_frame_at = Some(now);
    }
}
