// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Mapping of tracked touches onto musical zones.
//!
//! A [`ZoneMap`] tiles the key grid with rectangular zones, each producing
//! either grid notes or controller values. The [`ZoneRouter`] consumes the
//! per-frame touch slots and emits note on/continue/off transitions,
//! including the synthetic note-off when a slot is stolen for a stronger
//! contact or hops to a neighboring key.

use smol_str::SmolStr;

use crate::{
    frame::GridSize,
    params::{SurfaceProfile, MAX_TOUCH_SLOTS},
    tracker::{KeyPosition, TouchFrame, TouchSample},
};

#[cfg(test)]
mod tests;

/// Start note of the built-in full-surface layout.
const DEFAULT_START_NOTE: NoteNumber = NoteNumber::new(36);

/// Per-row interval (fourths) of the built-in layout.
const DEFAULT_ROW_INTERVAL: u8 = 5;

const VELOCITY_SCALE: f32 = 8.0;
const VELOCITY_FLOOR: f32 = 0.05;

/// MIDI-style note number in the range `0..=127`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[repr(transparent)]
pub struct NoteNumber(u8);

impl NoteNumber {
    /// Highest representable note.
    pub const MAX: Self = Self(127);

    /// Builds a note number, saturating at the top of the range.
    #[must_use]
    pub const fn new(number: u8) -> Self {
        if number > Self::MAX.0 {
            Self::MAX
        } else {
            Self(number)
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    const fn clamped(value: u16) -> Self {
        if value > Self::MAX.0 as u16 {
            Self::MAX
        } else {
            Self(value as u8)
        }
    }
}

/// Rectangle in key-grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneRect {
    pub col: u8,
    pub row: u8,
    pub width: u8,
    pub height: u8,
}

impl ZoneRect {
    #[must_use]
    pub const fn contains(&self, key: KeyPosition) -> bool {
        key.col >= self.col
            && (key.col as u16) < self.col as u16 + self.width as u16
            && key.row >= self.row
            && (key.row as u16) < self.row as u16 + self.height as u16
    }

    const fn intersects(&self, other: Self) -> bool {
        (self.col as u16) < other.col as u16 + other.width as u16
            && (other.col as u16) < self.col as u16 + self.width as u16
            && (self.row as u16) < other.row as u16 + other.height as u16
            && (other.row as u16) < self.row as u16 + self.height as u16
    }
}

/// What a zone turns touches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// Note grid sounding `start_note + col + row * row_interval`,
    /// with offsets counted from the zone's own origin.
    NoteGrid {
        start_note: NoteNumber,
        row_interval: u8,
    },
    /// Continuous strip reporting the touch position on a controller number.
    ControllerStrip { controller: u8 },
}

/// A named rectangular region of the key grid.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: SmolStr,
    pub rect: ZoneRect,
    pub kind: ZoneKind,
}

impl Zone {
    /// Note sounded at `key`, if this zone is a note grid containing it.
    #[must_use]
    pub fn note_at(&self, key: KeyPosition) -> Option<NoteNumber> {
        if !self.rect.contains(key) {
            return None;
        }
        match self.kind {
            ZoneKind::NoteGrid {
                start_note,
                row_interval,
            } => Some(grid_note(self.rect, start_note, row_interval, key)),
            ZoneKind::ControllerStrip { .. } => None,
        }
    }
}

/// Invalid zone layout.
#[derive(Debug, thiserror::Error)]
pub enum ZoneMapError {
    #[error("zone \"{name}\" has no keys")]
    EmptyZone { name: SmolStr },

    #[error("zone \"{name}\" exceeds the key grid")]
    OutOfBounds { name: SmolStr },

    #[error("zones \"{first}\" and \"{second}\" overlap")]
    Overlap { first: SmolStr, second: SmolStr },
}

/// A validated, non-overlapping set of zones over a key grid.
#[derive(Debug, Clone)]
pub struct ZoneMap {
    keys: GridSize,
    zones: Vec<Zone>,
}

impl ZoneMap {
    pub fn new(keys: GridSize, zones: Vec<Zone>) -> Result<Self, ZoneMapError> {
        for (index, zone) in zones.iter().enumerate() {
            if zone.rect.width == 0 || zone.rect.height == 0 {
                return Err(ZoneMapError::EmptyZone {
                    name: zone.name.clone(),
                });
            }
            if zone.rect.col as usize + zone.rect.width as usize > keys.width
                || zone.rect.row as usize + zone.rect.height as usize > keys.height
            {
                return Err(ZoneMapError::OutOfBounds {
                    name: zone.name.clone(),
                });
            }
            for earlier in &zones[..index] {
                if zone.rect.intersects(earlier.rect) {
                    return Err(ZoneMapError::Overlap {
                        first: earlier.name.clone(),
                        second: zone.name.clone(),
                    });
                }
            }
        }
        Ok(Self { keys, zones })
    }

    /// A single note grid covering every key.
    #[must_use]
    pub fn full_surface(keys: GridSize) -> Self {
        let zone = Zone {
            name: SmolStr::new_static("full surface"),
            rect: ZoneRect {
                col: 0,
                row: 0,
                width: keys.width as u8,
                height: keys.height as u8,
            },
            kind: ZoneKind::NoteGrid {
                start_note: DEFAULT_START_NOTE,
                row_interval: DEFAULT_ROW_INTERVAL,
            },
        };
        Self {
            keys,
            zones: vec![zone],
        }
    }

    #[must_use]
    pub const fn keys(&self) -> GridSize {
        self.keys
    }

    #[must_use]
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    #[must_use]
    pub fn zone_at(&self, key: KeyPosition) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.rect.contains(key))
    }
}

/// Musical event derived from the touch stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneEvent {
    NoteOn {
        slot: usize,
        note: NoteNumber,
        /// Velocity in the interval [0, 1], derived from the attack slope.
        velocity: f32,
    },
    NoteContinue {
        slot: usize,
        note: NoteNumber,
        /// Position in sensor coordinates.
        x: f32,
        /// Position in sensor coordinates.
        y: f32,
        /// Pressure in the interval [0, 1].
        pressure: f32,
    },
    NoteOff {
        slot: usize,
        note: NoteNumber,
    },
    ControlChange {
        slot: usize,
        controller: u8,
        /// Position along the strip in the interval [0, 1].
        value: f32,
    },
}

#[derive(Debug, Clone, Copy)]
struct SoundingNote {
    key: KeyPosition,
    note: NoteNumber,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    sounding: Option<SoundingNote>,
    last_age: u32,
}

/// Turns per-frame touch slots into zone events.
///
/// Events are appended to the vector passed to [`route`](Self::route);
/// clearing it between frames is the caller's business.
#[derive(Debug)]
pub struct ZoneRouter {
    profile: SurfaceProfile,
    map: ZoneMap,
    slots: [SlotState; MAX_TOUCH_SLOTS],
}

impl ZoneRouter {
    #[must_use]
    pub fn new(profile: SurfaceProfile, map: ZoneMap) -> Self {
        debug_assert_eq!(profile.keys, map.keys);
        Self {
            profile,
            map,
            slots: [SlotState::default(); MAX_TOUCH_SLOTS],
        }
    }

    #[must_use]
    pub const fn map(&self) -> &ZoneMap {
        &self.map
    }

    /// Replaces the layout, silencing everything first.
    pub fn set_map(&mut self, map: ZoneMap, events: &mut Vec<ZoneEvent>) {
        debug_assert_eq!(self.profile.keys, map.keys);
        self.silence(events);
        self.map = map;
    }

    /// Emits a note-off for every sounding note and forgets all slot state.
    pub fn silence(&mut self, events: &mut Vec<ZoneEvent>) {
        for (slot_index, state) in self.slots.iter_mut().enumerate() {
            if let Some(sounding) = state.sounding.take() {
                events.push(ZoneEvent::NoteOff {
                    slot: slot_index,
                    note: sounding.note,
                });
            }
            state.last_age = 0;
        }
    }

    pub fn route(&mut self, frame: &TouchFrame, events: &mut Vec<ZoneEvent>) {
        for (slot_index, sample) in frame.iter().enumerate() {
            let state = &mut self.slots[slot_index];
            if !sample.is_alive() {
                if let Some(sounding) = state.sounding.take() {
                    events.push(ZoneEvent::NoteOff {
                        slot: slot_index,
                        note: sounding.note,
                    });
                }
                state.last_age = 0;
                continue;
            }
            // A slot that restarts its age without an off frame was stolen.
            let reborn = state.last_age > 0 && sample.age <= state.last_age;
            let key_changed = state
                .sounding
                .is_some_and(|sounding| sounding.key != sample.key);
            if reborn || key_changed {
                if let Some(sounding) = state.sounding.take() {
                    events.push(ZoneEvent::NoteOff {
                        slot: slot_index,
                        note: sounding.note,
                    });
                }
            }
            state.last_age = sample.age;
            let Some(zone) = self.map.zone_at(sample.key) else {
                if let Some(sounding) = state.sounding.take() {
                    events.push(ZoneEvent::NoteOff {
                        slot: slot_index,
                        note: sounding.note,
                    });
                }
                continue;
            };
            match zone.kind {
                ZoneKind::NoteGrid {
                    start_note,
                    row_interval,
                } => {
                    if let Some(sounding) = state.sounding {
                        events.push(ZoneEvent::NoteContinue {
                            slot: slot_index,
                            note: sounding.note,
                            x: sample.x,
                            y: sample.y,
                            pressure: sample.z,
                        });
                    } else {
                        let note = grid_note(zone.rect, start_note, row_interval, sample.key);
                        events.push(ZoneEvent::NoteOn {
                            slot: slot_index,
                            note,
                            velocity: note_on_velocity(sample),
                        });
                        state.sounding = Some(SoundingNote {
                            key: sample.key,
                            note,
                        });
                    }
                }
                ZoneKind::ControllerStrip { controller } => {
                    // Crossing from a note grid into a strip ends the note.
                    if let Some(sounding) = state.sounding.take() {
                        events.push(ZoneEvent::NoteOff {
                            slot: slot_index,
                            note: sounding.note,
                        });
                    }
                    let key_x = sample.x * self.profile.keys.width as f32
                        / self.profile.sensor.width as f32;
                    let value = ((key_x - f32::from(zone.rect.col)) / f32::from(zone.rect.width))
                        .clamp(0.0, 1.0);
                    events.push(ZoneEvent::ControlChange {
                        slot: slot_index,
                        controller,
                        value,
                    });
                }
            }
        }
    }
}

fn note_on_velocity(sample: &TouchSample) -> f32 {
    (sample.dz * VELOCITY_SCALE).clamp(VELOCITY_FLOOR, 1.0)
}

fn grid_note(rect: ZoneRect, start_note: NoteNumber, row_interval: u8, key: KeyPosition) -> NoteNumber {
    debug_assert!(rect.contains(key));
    let col_offset = u16::from(key.col - rect.col);
    let row_offset = u16::from(key.row - rect.row);
    let note = u16::from(start_note.value()) + col_offset + row_offset * u16::from(row_interval);
    NoteNumber::clamped(note)
}
