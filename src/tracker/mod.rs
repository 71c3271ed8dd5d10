// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Touch lifecycle tracking on background-subtracted frames.
//!
//! The tracker consumes one residual frame per tick and maintains a
//! bounded pool of touch slots. Existing touches are updated first, in
//! descending pressure order, and each one removes its own template mass
//! from the residual before the next touch looks at it. Whatever pressure
//! remains feeds the per-key hysteresis layer from which new touches are
//! born.
//!
//! A touch claims its key exclusively for as long as it is alive. Release
//! is graceful: instead of cutting off at the release decision, pressure
//! ramps down linearly over [`TOUCH_RELEASE_FRAMES`] frames so downstream
//! consumers see a plausible note tail.

use crate::{
    calibrate::{Calibrator, TEMPLATE_RADIUS, TEMPLATE_SIZE},
    filters::{one_pole_coeff, Biquad, OnePole, DEFAULT_Q},
    frame::{peak, Grid, GridSize},
    params::{SurfaceProfile, TrackerParams, MAX_TOUCH_SLOTS},
};

mod keystate;
use keystate::KeyState;

mod touch;
pub use touch::{KeyPosition, TouchFrame, TouchPhase, TouchSample, TOUCH_RELEASE_FRAMES};

#[cfg(test)]
mod tests;

/// Gap between the on and off pressure thresholds.
const THRESHOLD_HYSTERESIS: f32 = 0.002;

/// Presses above this multiple of the on threshold bypass the template
/// shape check. Palms and edge contacts match no template but are
/// unambiguously real.
const OVERRIDE_FACTOR: f32 = 5.0;

/// Radius in sensor cells within which alive touches suppress new peaks.
const INHIBIT_RADIUS: f32 = 4.0;

/// Fraction of a touch's pressure projected as suppression at its center.
const INHIBIT_SCALE: f32 = 0.5;

/// Peaks below this fraction of the off threshold are ignored outright.
const CANDIDATE_FLOOR_RATIO: f32 = 0.5;

/// Distance in sensor cells a touch must penetrate into a neighboring key
/// before it migrates there. Keeps a touch wobbling around a key border
/// from retriggering the note every frame.
const KEY_MIGRATION_MARGIN: f32 = 0.25;

/// Provider of the expected touch footprint per surface position.
pub trait TemplateSource {
    /// Write the expected touch footprint at a sensor position into `out`,
    /// a [`TEMPLATE_SIZE`] square grid.
    fn template_into(&self, x: f32, y: f32, out: &mut Grid);

    /// Pressure correction factor at a sensor position.
    fn z_adjust(&self, x: f32) -> f32;
}

impl TemplateSource for Calibrator {
    fn template_into(&self, x: f32, y: f32, out: &mut Grid) {
        Calibrator::template_into(self, x, y, out);
    }

    fn z_adjust(&self, x: f32) -> f32 {
        Calibrator::z_adjust(self, x)
    }
}

/// Running totals of touch lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub births: u64,
    pub releases: u64,
    pub steals: u64,
}

#[derive(Debug, Clone)]
struct TouchSlot {
    phase: TouchPhase,
    /// Claimed key cell index while alive.
    key: usize,
    /// Raw sub-pixel peak position.
    x: f32,
    y: f32,
    /// Smoothed position as reported downstream.
    x_smooth: f32,
    y_smooth: f32,
    x_filter: Biquad,
    y_filter: Biquad,
    z_filter: OnePole,
    /// Filtered pressure, the release ramp value while releasing.
    z: f32,
    dz: f32,
    template_dist: f32,
    age: u32,
    release_slope: f32,
    release_frames_left: u32,
}

impl TouchSlot {
    const fn empty() -> Self {
        Self {
            phase: TouchPhase::Off,
            key: 0,
            x: 0.0,
            y: 0.0,
            x_smooth: 0.0,
            y_smooth: 0.0,
            x_filter: Biquad::passthrough(),
            y_filter: Biquad::passthrough(),
            z_filter: OnePole::new(0.0),
            z: 0.0,
            dz: 0.0,
            template_dist: 0.0,
            age: 0,
            release_slope: 0.0,
            release_frames_left: 0,
        }
    }
}

/// Refined residual peak assigned to its nearest key.
#[derive(Debug, Clone, Copy)]
struct PeakCandidate {
    x: f32,
    y: f32,
    z: f32,
    key: usize,
    template_dist: f32,
}

/// The touch state machine.
#[derive(Debug)]
pub struct Tracker {
    profile: SurfaceProfile,
    params: TrackerParams,
    z_coeff: f32,
    slots: Vec<TouchSlot>,
    keys: Vec<KeyState>,
    /// Slot index currently claiming each key cell.
    key_owner: Vec<Option<usize>>,
    frame_out: TouchFrame,
    /// Template mass of all alive touches, consumed by the background
    /// tracker to freeze the baseline under fingers.
    touch_mass: Grid,
    template: Grid,
    sample: Grid,
    peaks: Vec<PeakCandidate>,
    order: Vec<usize>,
    birth_keys: Vec<usize>,
    next_slot: usize,
    stats: TrackerStats,
}

impl Tracker {
    #[must_use]
    pub fn new(profile: SurfaceProfile, params: TrackerParams) -> Self {
        let params = params.clamped();
        let template_size = GridSize::new(TEMPLATE_SIZE, TEMPLATE_SIZE);
        Self {
            profile,
            params,
            z_coeff: one_pole_coeff(params.lopass_z, profile.frame_rate_hz),
            slots: vec![TouchSlot::empty(); MAX_TOUCH_SLOTS],
            keys: vec![KeyState::new(); profile.keys.cell_count()],
            key_owner: vec![None; profile.keys.cell_count()],
            frame_out: [TouchSample::default(); MAX_TOUCH_SLOTS],
            touch_mass: Grid::new(profile.sensor),
            template: Grid::new(template_size),
            sample: Grid::new(template_size),
            peaks: Vec::new(),
            order: Vec::new(),
            birth_keys: Vec::new(),
            next_slot: 0,
            stats: TrackerStats::default(),
        }
    }

    #[must_use]
    pub const fn params(&self) -> TrackerParams {
        self.params
    }

    /// Apply new parameters to the running tracker.
    ///
    /// Values are clamped into their supported ranges first. Slots beyond
    /// a reduced `max_touches` lose their touch immediately.
    pub fn set_params(&mut self, params: TrackerParams) {
        let params = params.clamped();
        self.z_coeff = one_pole_coeff(params.lopass_z, self.profile.frame_rate_hz);
        for slot in &mut self.slots {
            slot.x_filter
                .set_lowpass(params.lopass, self.profile.frame_rate_hz, DEFAULT_Q);
            slot.y_filter
                .set_lowpass(params.lopass, self.profile.frame_rate_hz, DEFAULT_Q);
            slot.z_filter.set_coeff(self.z_coeff);
        }
        for index in params.max_touches..self.slots.len() {
            if self.slots[index].phase.is_alive() {
                self.free_slot(index);
            }
        }
        if self.next_slot >= params.max_touches {
            self.next_slot = 0;
        }
        self.params = params;
    }

    /// Advance the tracker by one residual frame.
    ///
    /// `working` must already have the background subtracted. It is
    /// consumed as scratch space: every alive touch removes its template
    /// mass from it during the pass.
    pub fn process_frame(
        &mut self,
        working: &mut Grid,
        templates: &impl TemplateSource,
    ) -> &TouchFrame {
        debug_assert_eq!(working.size(), self.profile.sensor);
        self.update_touches(working, templates);
        self.detect_births(working, templates);
        self.refresh_touch_mass(templates);
        self.emit_frame()
    }

    /// Template mass of all alive touches, refreshed every frame.
    #[must_use]
    pub const fn touch_mass(&self) -> &Grid {
        &self.touch_mass
    }

    #[must_use]
    pub fn alive_touches(&self) -> usize {
        self.slots.iter().filter(|slot| slot.phase.is_alive()).count()
    }

    #[must_use]
    pub const fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Drop all touches and key states. Counters are kept.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = TouchSlot::empty();
        }
        for state in &mut self.keys {
            *state = KeyState::new();
        }
        for owner in &mut self.key_owner {
            *owner = None;
        }
        self.touch_mass.fill(0.0);
        self.next_slot = 0;
    }

    fn on_threshold(&self) -> f32 {
        self.params.z_thresh + THRESHOLD_HYSTERESIS
    }

    fn key_index_at(&self, x: f32, y: f32) -> usize {
        self.profile.key_row_at(y) * self.profile.keys.width + self.profile.key_col_at(x)
    }

    /// Whether a position lies more than [`KEY_MIGRATION_MARGIN`] sensor
    /// cells outside the given key cell.
    fn outside_key_margin(&self, key: usize, x: f32, y: f32) -> bool {
        let col = key % self.profile.keys.width;
        let row = key / self.profile.keys.width;
        let cell_width = self.profile.sensor.width as f32 / self.profile.keys.width as f32;
        let cell_height = self.profile.sensor.height as f32 / self.profile.keys.height as f32;
        let left = col as f32 * cell_width - KEY_MIGRATION_MARGIN;
        let right = (col + 1) as f32 * cell_width + KEY_MIGRATION_MARGIN;
        let top = row as f32 * cell_height - KEY_MIGRATION_MARGIN;
        let bottom = (row + 1) as f32 * cell_height + KEY_MIGRATION_MARGIN;
        x < left || x > right || y < top || y > bottom
    }

    fn update_touches(&mut self, working: &mut Grid, templates: &impl TemplateSource) {
        // Strongest first so confident touches claim their mass before
        // weaker neighbors look at the residual.
        self.order.clear();
        for index in 0..self.slots.len() {
            if self.slots[index].phase.is_alive() {
                self.order.push(index);
            }
        }
        self.order
            .sort_by(|&a, &b| self.slots[b].z.total_cmp(&self.slots[a].z));
        for position in 0..self.order.len() {
            let index = self.order[position];
            self.update_touch(index, working, templates);
        }
    }

    fn update_touch(&mut self, index: usize, working: &mut Grid, templates: &impl TemplateSource) {
        if matches!(self.slots[index].phase, TouchPhase::Releasing) {
            self.decay_release(index, working, templates);
            return;
        }
        let seed_x = clamp_cell(self.slots[index].x, self.profile.sensor.width);
        let seed_y = clamp_cell(self.slots[index].y, self.profile.sensor.height);
        let (peak_x, peak_y) = peak::search_local_max(working, seed_x, seed_y);
        let refined = peak::refine(working, peak_x, peak_y);
        let raw_z = refined.z.max(0.0);

        // Migration to another key is only allowed into a free cell, and
        // only once the position clears the current key by the margin.
        let candidate_key = self.key_index_at(refined.x, refined.y);
        let current_key = self.slots[index].key;
        if candidate_key != current_key
            && self.key_owner[candidate_key].is_none()
            && self.outside_key_margin(current_key, refined.x, refined.y)
        {
            self.key_owner[current_key] = None;
            self.key_owner[candidate_key] = Some(index);
            self.slots[index].key = candidate_key;
        }

        let template_dist = self.template_distance(working, refined.x, refined.y, templates);
        let z_sample = raw_z * templates.z_adjust(refined.x);
        let inhibit = self.inhibit_at(refined.x, refined.y, Some(index));
        let off_threshold = self.params.z_thresh;
        let override_z = self.on_threshold() * OVERRIDE_FACTOR;
        let template_thresh = self.params.template_thresh;

        let slot = &mut self.slots[index];
        let z_previous = slot.z;
        slot.z = slot.z_filter.process(z_sample);
        slot.dz = slot.z - z_previous;
        slot.x = refined.x;
        slot.y = refined.y;
        slot.x_smooth = slot.x_filter.process(refined.x);
        slot.y_smooth = slot.y_filter.process(refined.y);
        slot.template_dist = template_dist;
        slot.age += 1;

        let lost_pressure = slot.z < off_threshold;
        let lost_shape = template_dist > template_thresh && slot.z < override_z;
        let suppressed = inhibit > slot.z;
        if lost_pressure || lost_shape || suppressed {
            self.begin_release(index);
        }

        // Remove this touch's mass so weaker touches and new candidates
        // only see the remaining pressure.
        let (x, y) = (self.slots[index].x, self.slots[index].y);
        templates.template_into(x, y, &mut self.template);
        working.add_scaled_kernel(&self.template, x, y, -raw_z);
    }

    fn begin_release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert!(matches!(slot.phase, TouchPhase::Active));
        debug_assert!(slot.z > 0.0);
        slot.phase = TouchPhase::Releasing;
        slot.release_slope = slot.z / TOUCH_RELEASE_FRAMES as f32;
        slot.release_frames_left = TOUCH_RELEASE_FRAMES - 1;
        slot.z = (slot.z - slot.release_slope).max(0.0);
        slot.dz = -slot.release_slope;
        self.stats.releases += 1;
        log::debug!("Touch in slot {index} releasing");
    }

    fn decay_release(&mut self, index: usize, working: &mut Grid, templates: &impl TemplateSource) {
        if self.slots[index].release_frames_left == 0 {
            self.free_slot(index);
            return;
        }
        let slot = &mut self.slots[index];
        slot.z = (slot.z - slot.release_slope).max(0.0);
        slot.dz = -slot.release_slope;
        slot.age += 1;
        slot.release_frames_left -= 1;
        let (x, y, z) = (slot.x, slot.y, slot.z);
        templates.template_into(x, y, &mut self.template);
        working.add_scaled_kernel(&self.template, x, y, -z);
    }

    /// Free a slot and block its key for the settle window.
    fn free_slot(&mut self, index: usize) {
        let key = self.slots[index].key;
        if self.key_owner[key] == Some(index) {
            self.key_owner[key] = None;
        }
        self.keys[key].reset();
        self.slots[index] = TouchSlot::empty();
    }

    /// Suppression projected at a position by all alive touches except
    /// `exclude`, a cone falling off linearly with distance.
    fn inhibit_at(&self, x: f32, y: f32, exclude: Option<usize>) -> f32 {
        let mut inhibit: f32 = 0.0;
        for (index, slot) in self.slots.iter().enumerate() {
            if exclude == Some(index) || !slot.phase.is_alive() {
                continue;
            }
            let dx = slot.x - x;
            let dy = slot.y - y;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance >= INHIBIT_RADIUS {
                continue;
            }
            inhibit = inhibit.max(slot.z * INHIBIT_SCALE * (1.0 - distance / INHIBIT_RADIUS));
        }
        inhibit
    }

    /// Shape mismatch between the signal around a position and the
    /// expected template there. Zero is a perfect match.
    fn template_distance(
        &mut self,
        signal: &Grid,
        x: f32,
        y: f32,
        templates: &impl TemplateSource,
    ) -> f32 {
        templates.template_into(x, y, &mut self.template);
        for ky in 0..TEMPLATE_SIZE {
            for kx in 0..TEMPLATE_SIZE {
                let sx = x + kx as f32 - TEMPLATE_RADIUS as f32;
                let sy = y + ky as f32 - TEMPLATE_RADIUS as f32;
                self.sample.set(kx, ky, signal.sample_bilinear(sx, sy).max(0.0));
            }
        }
        if self.sample.normalize_peak() <= 0.0 {
            return 1.0;
        }
        self.sample.rms_difference(&self.template)
    }

    fn detect_births(&mut self, working: &Grid, templates: &impl TemplateSource) {
        self.collect_peaks(working, templates);
        self.tick_keys();
        self.collect_birth_candidates();
        for position in 0..self.birth_keys.len() {
            let key = self.birth_keys[position];
            let (x, y, z) = {
                let state = &self.keys[key];
                (state.x(), state.y(), state.z())
            };
            // Re-checked per candidate so births earlier in this frame
            // already suppress their neighborhood.
            if self.inhibit_at(x, y, None) >= z {
                continue;
            }
            self.try_birth(key);
        }
    }

    fn collect_peaks(&mut self, working: &Grid, templates: &impl TemplateSource) {
        self.peaks.clear();
        let floor = self.params.z_thresh * CANDIDATE_FLOOR_RATIO;
        for y in 0..working.height() {
            for x in 0..working.width() {
                if working.get(x, y) <= floor || !is_local_max(working, x, y) {
                    continue;
                }
                let refined = peak::refine(working, x, y);
                let z = (refined.z * templates.z_adjust(refined.x)).max(0.0);
                if z <= floor {
                    continue;
                }
                let key = self.key_index_at(refined.x, refined.y);
                let template_dist = self.template_distance(working, refined.x, refined.y, templates);
                let candidate = PeakCandidate {
                    x: refined.x,
                    y: refined.y,
                    z,
                    key,
                    template_dist,
                };
                // One candidate per key, the strongest wins.
                if let Some(existing) = self.peaks.iter_mut().find(|peak| peak.key == key) {
                    if candidate.z > existing.z {
                        *existing = candidate;
                    }
                } else {
                    self.peaks.push(candidate);
                }
            }
        }
    }

    fn tick_keys(&mut self) {
        let on = self.on_threshold();
        let override_z = on * OVERRIDE_FACTOR;
        for (key, state) in self.keys.iter_mut().enumerate() {
            match self.peaks.iter().find(|peak| peak.key == key) {
                Some(peak) => {
                    let confidence = ((peak.z - on) / (override_z - on)).clamp(0.0, 1.0);
                    state.feed(peak.x, peak.y, peak.z, peak.template_dist, confidence);
                }
                None => state.decay(),
            }
        }
    }

    fn collect_birth_candidates(&mut self) {
        let on = self.on_threshold();
        let override_z = on * OVERRIDE_FACTOR;
        self.birth_keys.clear();
        for key in 0..self.keys.len() {
            let state = &self.keys[key];
            if state.z() <= on || !state.is_settled() || self.key_owner[key].is_some() {
                continue;
            }
            if state.template_dist() >= self.params.template_thresh && state.z() <= override_z {
                continue;
            }
            self.birth_keys.push(key);
        }
        self.birth_keys
            .sort_by(|&a, &b| self.keys[b].z().total_cmp(&self.keys[a].z()));
    }

    fn try_birth(&mut self, key: usize) {
        let slot_index = if let Some(free) = self.find_free_slot() {
            free
        } else {
            let Some(weakest) = self.weakest_slot() else {
                return;
            };
            if self.keys[key].z() <= self.slots[weakest].z {
                return;
            }
            let stolen_key = self.slots[weakest].key;
            log::debug!("Stealing touch slot {weakest} from key index {stolen_key}");
            self.free_slot(weakest);
            self.stats.steals += 1;
            weakest
        };
        let (x, y, z, dz, template_dist) = {
            let state = &self.keys[key];
            (state.x(), state.y(), state.z(), state.dz(), state.template_dist())
        };
        let mut x_filter = Biquad::lowpass(self.params.lopass, self.profile.frame_rate_hz, DEFAULT_Q);
        x_filter.reset(x);
        let mut y_filter = Biquad::lowpass(self.params.lopass, self.profile.frame_rate_hz, DEFAULT_Q);
        y_filter.reset(y);
        let mut z_filter = OnePole::new(self.z_coeff);
        z_filter.reset(z);
        self.slots[slot_index] = TouchSlot {
            phase: TouchPhase::Active,
            key,
            x,
            y,
            x_smooth: x,
            y_smooth: y,
            x_filter,
            y_filter,
            z_filter,
            z,
            dz,
            template_dist,
            age: 1,
            release_slope: 0.0,
            release_frames_left: 0,
        };
        self.key_owner[key] = Some(slot_index);
        if self.params.rotate {
            self.next_slot = (slot_index + 1) % self.params.max_touches;
        }
        self.stats.births += 1;
        log::debug!("Touch born in slot {slot_index} at key index {key}");
    }

    fn find_free_slot(&self) -> Option<usize> {
        let limit = self.params.max_touches;
        if self.params.rotate {
            (0..limit)
                .map(|offset| (self.next_slot + offset) % limit)
                .find(|&index| self.slots[index].phase.is_off())
        } else {
            (0..limit).find(|&index| self.slots[index].phase.is_off())
        }
    }

    fn weakest_slot(&self) -> Option<usize> {
        (0..self.params.max_touches)
            .filter(|&index| self.slots[index].phase.is_alive())
            .min_by(|&a, &b| self.slots[a].z.total_cmp(&self.slots[b].z))
    }

    fn refresh_touch_mass(&mut self, templates: &impl TemplateSource) {
        self.touch_mass.fill(0.0);
        for index in 0..self.slots.len() {
            if !self.slots[index].phase.is_alive() {
                continue;
            }
            let (x, y, z) = (self.slots[index].x, self.slots[index].y, self.slots[index].z);
            templates.template_into(x, y, &mut self.template);
            self.touch_mass.add_scaled_kernel(&self.template, x, y, z);
        }
    }

    fn emit_frame(&mut self) -> &TouchFrame {
        let key_width = self.profile.keys.width;
        for (slot, sample) in self.slots.iter().zip(self.frame_out.iter_mut()) {
            if !slot.phase.is_alive() {
                *sample = TouchSample::default();
                continue;
            }
            let col = slot.key % key_width;
            let row = slot.key / key_width;
            let (x, y) = if self.params.quantize {
                (self.profile.key_center_x(col), self.profile.key_center_y(row))
            } else {
                (slot.x_smooth, slot.y_smooth)
            };
            *sample = TouchSample {
                phase: slot.phase,
                key: KeyPosition {
                    col: col as u8,
                    row: row as u8,
                },
                x,
                y,
                z: slot.z,
                dz: slot.dz,
                age: slot.age,
                template_dist: slot.template_dist,
            };
        }
        &self.frame_out
    }
}

fn clamp_cell(value: f32, len: usize) -> usize {
    debug_assert!(len > 0);
    (value.round().max(0.0) as usize).min(len - 1)
}

/// A cell at least as large as all its direct neighbors.
fn is_local_max(grid: &Grid, x: usize, y: usize) -> bool {
    let value = grid.get(x, y);
    let x_min = x.saturating_sub(1);
    let x_max = (x + 1).min(grid.width() - 1);
    let y_min = y.saturating_sub(1);
    let y_max = (y + 1).min(grid.height() - 1);
    for ny in y_min..=y_max {
        for nx in x_min..=x_max {
            if (nx, ny) == (x, y) {
                continue;
            }
            if grid.get(nx, ny) > value {
                return false;
            }
        }
    }
    true
}
