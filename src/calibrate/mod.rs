// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Two-stage surface calibration.
//!
//! Stage one builds a per-cell normalize map that evens out the
//! mechanical sensitivity differences across the surface. Stage two
//! collects a table of touch template kernels, one per calibration bin,
//! that describes what a real touch looks like at that spot. Both stages
//! are driven by the user sweeping a finger over the surface while the
//! calibrator watches the frame stream.
//!
//! The whole procedure is an explicit state machine advanced one frame at
//! a time. There is no hidden shared state, cancellation simply swaps the
//! phase back to [`CalibrationPhase::Idle`] between two frames.

use std::mem;

use crate::{
    filters::smooth_3x3,
    frame::{peak, Grid, GridSize},
};

pub mod blob;
pub use blob::{ExportError, ImportError};

#[cfg(test)]
mod tests;

/// Samples every cell must accumulate before the normalize map is final.
pub const NORM_MAP_SAMPLES: u32 = 2048;

/// Distinct visits every bin needs before the template table is final.
pub const PASSES_TO_CALIBRATE: u32 = 2;

/// Template kernels cover `2 * TEMPLATE_RADIUS + 1` cells per axis.
pub const TEMPLATE_RADIUS: usize = 2;
pub const TEMPLATE_SIZE: usize = 2 * TEMPLATE_RADIUS + 1;

/// Length of each silence window used to estimate the touch threshold.
const NOISE_WINDOW_FRAMES: u32 = 1000;

/// Frames discarded between the two collection stages.
const SETTLE_FRAMES: u32 = 1000;

/// Cells count as touched while their smoothed value exceeds this
/// fraction of the frame peak.
const ACTIVE_CELL_RATIO: f32 = 0.125;

const NORM_CLAMP_MIN: f32 = 0.125;
const NORM_CLAMP_MAX: f32 = 3.0;

/// Touch threshold as a multiple of the mean silent frame peak.
const NOISE_THRESHOLD_RATIO: f32 = 4.0;

/// The second silence window raises the estimate by this factor, the
/// surface is warmer and noisier by then.
const SECOND_WINDOW_SCALE: f32 = 1.5;

/// Even a perfectly silent rig needs a positive threshold.
const MIN_TOUCH_THRESHOLD: f32 = 0.005;

/// Default threshold before any noise window has run.
const DEFAULT_TOUCH_THRESHOLD: f32 = 0.01;

/// Samples a bin must collect in one stay before it counts as a visit.
const MIN_SAMPLES_PER_VISIT: u32 = 4;

/// Radius of the built-in conical fallback template.
const CONE_RADIUS: f32 = 2.5;

/// Externally visible calibration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    MeasureNoise,
    CollectNormalizeMap,
    Settle,
    CollectTemplates,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum AfterNoise {
    NormalizeMap,
    Templates,
}

#[derive(Debug)]
enum Phase {
    Idle,
    MeasureNoise {
        frames_left: u32,
        peak_sum: f32,
        next: AfterNoise,
    },
    CollectNormalizeMap(NormMapAccumulator),
    Settle {
        frames_left: u32,
    },
    CollectTemplates(TemplateAccumulator),
    Done,
}

/// Placement of the template bins on the sensor.
///
/// Bins sit on integer cells, restricted to the interior where a full
/// kernel fits without leaving the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BinLayout {
    origin: usize,
    bins: GridSize,
}

impl BinLayout {
    fn for_sensor(size: GridSize) -> Self {
        debug_assert!(size.width > 2 * TEMPLATE_RADIUS);
        debug_assert!(size.height > 2 * TEMPLATE_RADIUS);
        Self {
            origin: TEMPLATE_RADIUS,
            bins: GridSize::new(
                size.width - 2 * TEMPLATE_RADIUS,
                size.height - 2 * TEMPLATE_RADIUS,
            ),
        }
    }

    fn nearest_bin(self, x: f32, y: f32) -> usize {
        let bin_x = (x.round() as isize - self.origin as isize).clamp(0, self.bins.width as isize - 1);
        let bin_y =
            (y.round() as isize - self.origin as isize).clamp(0, self.bins.height as isize - 1);
        bin_y as usize * self.bins.width + bin_x as usize
    }

    /// Sensor cell at the center of a bin.
    fn bin_center(self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.bins.cell_count());
        (
            index % self.bins.width + self.origin,
            index / self.bins.width + self.origin,
        )
    }
}

#[derive(Debug)]
struct NormMapAccumulator {
    sums: Grid,
    counts: Vec<u32>,
}

impl NormMapAccumulator {
    fn new(size: GridSize) -> Self {
        Self {
            sums: Grid::new(size),
            counts: vec![0; size.cell_count()],
        }
    }

    fn accumulate(&mut self, frame: &Grid, smoothed: &Grid, frame_peak: f32, interior_x: (usize, usize)) {
        let cutoff = frame_peak * ACTIVE_CELL_RATIO;
        let width = frame.width();
        for y in 0..frame.height() {
            for x in interior_x.0..interior_x.1 {
                if smoothed.get(x, y) > cutoff {
                    self.sums.add(x, y, frame.get(x, y) / frame_peak);
                    self.counts[y * width + x] += 1;
                }
            }
        }
    }

    fn is_complete(&self, interior_x: (usize, usize), width: usize, height: usize) -> bool {
        for y in 0..height {
            for x in interior_x.0..interior_x.1 {
                if self.counts[y * width + x] < NORM_MAP_SAMPLES {
                    return false;
                }
            }
        }
        true
    }

    fn completion(&self, interior_x: (usize, usize), width: usize, height: usize) -> f32 {
        let mut done = 0u64;
        let mut cells = 0u64;
        for y in 0..height {
            for x in interior_x.0..interior_x.1 {
                done += u64::from(self.counts[y * width + x].min(NORM_MAP_SAMPLES));
                cells += 1;
            }
        }
        if cells == 0 {
            return 0.0;
        }
        done as f32 / (cells * u64::from(NORM_MAP_SAMPLES)) as f32
    }

    /// Invert the mean ratios into the final normalize map.
    fn finalize(self, interior_x: (usize, usize)) -> Grid {
        let Self { sums, counts } = self;
        let size = sums.size();
        let mut map = Grid::new(size);
        map.fill(1.0);
        let mut gain_sum = 0.0;
        let mut gain_count = 0u32;
        for y in 0..size.height {
            for x in interior_x.0..interior_x.1 {
                let count = counts[y * size.width + x];
                debug_assert!(count >= NORM_MAP_SAMPLES);
                let mean_ratio = sums.get(x, y) / count as f32;
                if mean_ratio > f32::EPSILON {
                    let gain = 1.0 / mean_ratio;
                    map.set(x, y, gain);
                    gain_sum += gain;
                    gain_count += 1;
                }
            }
        }
        if gain_count > 0 {
            let global_mean = gain_sum / gain_count as f32;
            for y in 0..size.height {
                for x in interior_x.0..interior_x.1 {
                    let normalized = (map.get(x, y) / global_mean).clamp(NORM_CLAMP_MIN, NORM_CLAMP_MAX);
                    map.set(x, y, normalized);
                }
            }
        }
        map
    }
}

#[derive(Debug)]
struct TemplateAccumulator {
    layout: BinLayout,
    min_env: Vec<Grid>,
    sums: Vec<Grid>,
    visits: Vec<u32>,
    total_samples: Vec<u32>,
    current_bin: Option<usize>,
    current_visit_samples: u32,
    sample: Grid,
}

impl TemplateAccumulator {
    fn new(layout: BinLayout) -> Self {
        let kernel_size = GridSize::new(TEMPLATE_SIZE, TEMPLATE_SIZE);
        let bin_count = layout.bins.cell_count();
        let mut min_template = Grid::new(kernel_size);
        min_template.fill(f32::INFINITY);
        Self {
            layout,
            min_env: vec![min_template; bin_count],
            sums: vec![Grid::new(kernel_size); bin_count],
            visits: vec![0; bin_count],
            total_samples: vec![0; bin_count],
            current_bin: None,
            current_visit_samples: 0,
            sample: Grid::new(kernel_size),
        }
    }

    /// Record one accepted frame whose refined peak fell into `bin`.
    fn observe(&mut self, bin: usize, signal: &Grid, peak_x: f32, peak_y: f32) {
        if self.current_bin != Some(bin) {
            self.close_visit();
            self.current_bin = Some(bin);
        }
        for ky in 0..TEMPLATE_SIZE {
            for kx in 0..TEMPLATE_SIZE {
                let sx = peak_x + kx as f32 - TEMPLATE_RADIUS as f32;
                let sy = peak_y + ky as f32 - TEMPLATE_RADIUS as f32;
                self.sample.set(kx, ky, signal.sample_bilinear(sx, sy));
            }
        }
        if self.sample.normalize_peak() <= 0.0 {
            return;
        }
        self.min_env[bin].min_with(&self.sample);
        self.sums[bin].add_scaled(&self.sample, 1.0);
        self.total_samples[bin] += 1;
        self.current_visit_samples += 1;
    }

    /// The finger left the surface or moved on, close the running visit.
    fn close_visit(&mut self) {
        if let Some(bin) = self.current_bin.take() {
            if self.current_visit_samples >= MIN_SAMPLES_PER_VISIT {
                self.visits[bin] += 1;
            }
        }
        self.current_visit_samples = 0;
    }

    fn is_complete(&self) -> bool {
        self.visits.iter().all(|visits| *visits >= PASSES_TO_CALIBRATE)
    }

    fn completion(&self) -> f32 {
        let done: u32 = self
            .visits
            .iter()
            .map(|visits| (*visits).min(PASSES_TO_CALIBRATE))
            .sum();
        done as f32 / (self.visits.len() as u32 * PASSES_TO_CALIBRATE) as f32
    }

    /// Mean kernels per bin, peak-normalized.
    fn finalize(self) -> Vec<Grid> {
        let Self {
            layout,
            min_env,
            sums,
            total_samples,
            ..
        } = self;
        let mut kernels = Vec::with_capacity(sums.len());
        let mut worst_divergence = 0.0f32;
        let mut worst_bin = 0;
        for (index, (mut kernel, samples)) in sums.into_iter().zip(total_samples).enumerate() {
            debug_assert!(samples > 0);
            kernel.scale(1.0 / samples as f32);
            kernel.normalize_peak();
            // Divergence between the mean kernel and the minimum envelope
            // reveals inconsistent touches during collection.
            let divergence = kernel.rms_difference(&min_env[index]);
            if divergence > worst_divergence {
                worst_divergence = divergence;
                worst_bin = index;
            }
            kernels.push(kernel);
        }
        let (worst_x, worst_y) = layout.bin_center(worst_bin);
        log::debug!(
            "Template collection divergence peaks at bin ({worst_x}, {worst_y}): {worst_divergence}"
        );
        kernels
    }
}

/// Builds and serves the normalize map and the touch template table.
#[derive(Debug)]
pub struct Calibrator {
    size: GridSize,
    interior_x: (usize, usize),
    layout: BinLayout,
    phase: Phase,
    normalize_map: Grid,
    has_normalize_map: bool,
    kernels: Option<Vec<Grid>>,
    default_template: Grid,
    touch_threshold: f32,
    normalized: Grid,
    smoothed: Grid,
}

impl Calibrator {
    #[must_use]
    pub fn new(size: GridSize, guard_columns: usize) -> Self {
        debug_assert!(guard_columns * 2 < size.width);
        let mut normalize_map = Grid::new(size);
        normalize_map.fill(1.0);
        Self {
            size,
            interior_x: (guard_columns, size.width - guard_columns),
            layout: BinLayout::for_sensor(size),
            phase: Phase::Idle,
            normalize_map,
            has_normalize_map: false,
            kernels: None,
            default_template: conical_template(),
            touch_threshold: DEFAULT_TOUCH_THRESHOLD,
            normalized: Grid::new(size),
            smoothed: Grid::new(size),
        }
    }

    /// Restart the calibration procedure from the first noise window.
    ///
    /// Previously finished calibration data stays in effect until the
    /// corresponding stage replaces it.
    pub fn begin(&mut self) {
        log::info!("Starting surface calibration");
        self.phase = Phase::MeasureNoise {
            frames_left: NOISE_WINDOW_FRAMES,
            peak_sum: 0.0,
            next: AfterNoise::NormalizeMap,
        };
    }

    /// Abort the procedure and discard all partial accumulators.
    ///
    /// Finished calibration data is kept.
    pub fn cancel(&mut self) {
        if self.is_collecting() {
            log::info!("Cancelling surface calibration");
        }
        self.phase = Phase::Idle;
    }

    #[must_use]
    pub const fn phase(&self) -> CalibrationPhase {
        match self.phase {
            Phase::Idle => CalibrationPhase::Idle,
            Phase::MeasureNoise { .. } => CalibrationPhase::MeasureNoise,
            Phase::CollectNormalizeMap(_) => CalibrationPhase::CollectNormalizeMap,
            Phase::Settle { .. } => CalibrationPhase::Settle,
            Phase::CollectTemplates(_) => CalibrationPhase::CollectTemplates,
            Phase::Done => CalibrationPhase::Done,
        }
    }

    /// Whether frames are currently consumed by the calibrator.
    #[must_use]
    pub const fn is_collecting(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Done)
    }

    #[must_use]
    pub const fn has_calibration(&self) -> bool {
        self.kernels.is_some()
    }

    #[must_use]
    pub const fn has_normalize_map(&self) -> bool {
        self.has_normalize_map
    }

    /// Completion ratio of the current phase, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f32 {
        match &self.phase {
            Phase::Idle => 0.0,
            Phase::Done => 1.0,
            Phase::MeasureNoise { frames_left, .. } => {
                1.0 - *frames_left as f32 / NOISE_WINDOW_FRAMES as f32
            }
            Phase::Settle { frames_left } => 1.0 - *frames_left as f32 / SETTLE_FRAMES as f32,
            Phase::CollectNormalizeMap(accumulator) => {
                accumulator.completion(self.interior_x, self.size.width, self.size.height)
            }
            Phase::CollectTemplates(accumulator) => accumulator.completion(),
        }
    }

    /// Advance the state machine by one raw frame.
    ///
    /// Only does work while a collection phase is running.
    pub fn process_frame(&mut self, frame: &Grid) {
        debug_assert_eq!(frame.size(), self.size);
        let phase = mem::replace(&mut self.phase, Phase::Idle);
        self.phase = self.step(phase, frame);
    }

    fn step(&mut self, phase: Phase, frame: &Grid) -> Phase {
        match phase {
            Phase::Idle => Phase::Idle,
            Phase::Done => Phase::Done,
            Phase::MeasureNoise {
                frames_left,
                peak_sum,
                next,
            } => {
                let (_, _, frame_peak) = frame.max_cell();
                let peak_sum = peak_sum + frame_peak.max(0.0);
                let frames_left = frames_left - 1;
                if frames_left > 0 {
                    return Phase::MeasureNoise {
                        frames_left,
                        peak_sum,
                        next,
                    };
                }
                let mean_peak = peak_sum / NOISE_WINDOW_FRAMES as f32;
                let estimate = mean_peak * NOISE_THRESHOLD_RATIO;
                match next {
                    AfterNoise::NormalizeMap => {
                        self.touch_threshold = estimate.max(MIN_TOUCH_THRESHOLD);
                        log::info!(
                            "Noise window finished, touch threshold {threshold}",
                            threshold = self.touch_threshold
                        );
                        Phase::CollectNormalizeMap(NormMapAccumulator::new(self.size))
                    }
                    AfterNoise::Templates => {
                        self.touch_threshold = (estimate * SECOND_WINDOW_SCALE)
                            .max(self.touch_threshold)
                            .max(MIN_TOUCH_THRESHOLD);
                        log::info!(
                            "Second noise window finished, touch threshold {threshold}",
                            threshold = self.touch_threshold
                        );
                        Phase::CollectTemplates(TemplateAccumulator::new(self.layout))
                    }
                }
            }
            Phase::CollectNormalizeMap(mut accumulator) => {
                let (_, _, frame_peak) = frame.max_cell();
                if frame_peak > self.touch_threshold {
                    smooth_3x3(frame, &mut self.smoothed);
                    accumulator.accumulate(frame, &self.smoothed, frame_peak, self.interior_x);
                }
                if accumulator.is_complete(self.interior_x, self.size.width, self.size.height) {
                    self.normalize_map = accumulator.finalize(self.interior_x);
                    self.has_normalize_map = true;
                    log::info!("Normalize map finished");
                    Phase::Settle {
                        frames_left: SETTLE_FRAMES,
                    }
                } else {
                    Phase::CollectNormalizeMap(accumulator)
                }
            }
            Phase::Settle { frames_left } => {
                let frames_left = frames_left - 1;
                if frames_left == 0 {
                    Phase::MeasureNoise {
                        frames_left: NOISE_WINDOW_FRAMES,
                        peak_sum: 0.0,
                        next: AfterNoise::Templates,
                    }
                } else {
                    Phase::Settle { frames_left }
                }
            }
            Phase::CollectTemplates(mut accumulator) => {
                self.normalized.copy_from(frame);
                self.normalized.multiply(&self.normalize_map);
                smooth_3x3(&self.normalized, &mut self.smoothed);
                let (peak_x, peak_y, frame_peak) = self.smoothed.max_cell();
                if frame_peak > self.touch_threshold {
                    let refined = peak::refine(&self.smoothed, peak_x, peak_y);
                    let bin = self.layout.nearest_bin(refined.x, refined.y);
                    accumulator.observe(bin, &self.smoothed, refined.x, refined.y);
                } else {
                    accumulator.close_visit();
                }
                if accumulator.is_complete() {
                    self.kernels = Some(accumulator.finalize());
                    log::info!("Template table finished");
                    Phase::Done
                } else {
                    Phase::CollectTemplates(accumulator)
                }
            }
        }
    }

    #[must_use]
    pub const fn normalize_map(&self) -> &Grid {
        &self.normalize_map
    }

    #[must_use]
    pub const fn touch_threshold(&self) -> f32 {
        self.touch_threshold
    }

    pub fn apply_normalize_map(&self, frame: &mut Grid) {
        if self.has_normalize_map {
            frame.multiply(&self.normalize_map);
        }
    }

    /// Write the touch template for a sensor position into `out`.
    ///
    /// With a finished table this bilinearly blends the four surrounding
    /// bins, otherwise the built-in conical template is used. `out` must
    /// be a [`TEMPLATE_SIZE`] square grid.
    pub fn template_into(&self, x: f32, y: f32, out: &mut Grid) {
        debug_assert_eq!(out.size(), GridSize::new(TEMPLATE_SIZE, TEMPLATE_SIZE));
        let Some(kernels) = &self.kernels else {
            out.copy_from(&self.default_template);
            return;
        };
        let bins = self.layout.bins;
        let bin_x = (x - self.layout.origin as f32).clamp(0.0, (bins.width - 1) as f32);
        let bin_y = (y - self.layout.origin as f32).clamp(0.0, (bins.height - 1) as f32);
        let x0 = bin_x.floor() as usize;
        let y0 = bin_y.floor() as usize;
        let x1 = (x0 + 1).min(bins.width - 1);
        let y1 = (y0 + 1).min(bins.height - 1);
        let fx = bin_x - x0 as f32;
        let fy = bin_y - y0 as f32;
        out.fill(0.0);
        out.add_scaled(&kernels[y0 * bins.width + x0], (1.0 - fx) * (1.0 - fy));
        out.add_scaled(&kernels[y0 * bins.width + x1], fx * (1.0 - fy));
        out.add_scaled(&kernels[y1 * bins.width + x0], (1.0 - fx) * fy);
        out.add_scaled(&kernels[y1 * bins.width + x1], fx * fy);
    }

    /// Pressure compensation for the interpolation loss between bins.
    #[must_use]
    pub fn z_adjust(&self, x: f32) -> f32 {
        if self.kernels.is_none() {
            return 1.0;
        }
        let frac = x - x.floor();
        1.414 - 0.5 * (frac - 0.5).abs()
    }

    /// Serialize the finished calibration into an opaque blob.
    pub fn export(&self) -> Result<Vec<u8>, ExportError> {
        let Some(kernels) = &self.kernels else {
            return Err(ExportError::NoCalibration);
        };
        Ok(blob::encode(
            &self.normalize_map,
            kernels,
            self.layout.bins,
            TEMPLATE_SIZE,
            self.touch_threshold,
        )?)
    }

    /// Replace the live calibration with a previously exported blob.
    ///
    /// A running collection is aborted. On any validation error the live
    /// data stays untouched.
    pub fn import(&mut self, bytes: &[u8]) -> Result<(), ImportError> {
        let decoded = blob::decode(bytes, self.size, self.layout.bins, TEMPLATE_SIZE)?;
        self.cancel();
        self.normalize_map = decoded.normalize_map;
        self.has_normalize_map = true;
        self.kernels = Some(decoded.kernels);
        self.touch_threshold = decoded.touch_threshold.max(MIN_TOUCH_THRESHOLD);
        self.phase = Phase::Done;
        log::info!("Imported calibration data");
        Ok(())
    }
}

/// Radially symmetric fallback template for uncalibrated surfaces.
fn conical_template() -> Grid {
    let mut template = Grid::new(GridSize::new(TEMPLATE_SIZE, TEMPLATE_SIZE));
    for y in 0..TEMPLATE_SIZE {
        for x in 0..TEMPLATE_SIZE {
            let dx = x as f32 - TEMPLATE_RADIUS as f32;
            let dy = y as f32 - TEMPLATE_RADIUS as f32;
            let radius = (dx * dx + dy * dy).sqrt();
            template.set(x, y, (1.0 - radius / CONE_RADIUS).max(0.0));
        }
    }
    template
}
