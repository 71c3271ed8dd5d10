// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

use float_cmp::approx_eq;

use super::*;
use crate::tracker::TouchPhase;

const PROFILE: SurfaceProfile = SurfaceProfile::standard();

fn full_router() -> ZoneRouter {
    ZoneRouter::new(PROFILE, ZoneMap::full_surface(PROFILE.keys))
}

fn touch(key: (u8, u8), age: u32, z: f32) -> TouchSample {
    let (col, row) = key;
    TouchSample {
        phase: TouchPhase::Active,
        key: KeyPosition { col, row },
        x: PROFILE.key_center_x(col as usize),
        y: PROFILE.key_center_y(row as usize),
        z,
        dz: 0.05,
        age,
        template_dist: 0.1,
    }
}

fn frame_with(slot: usize, sample: TouchSample) -> TouchFrame {
    let mut frame = [TouchSample::default(); MAX_TOUCH_SLOTS];
    frame[slot] = sample;
    frame
}

fn empty_frame() -> TouchFrame {
    [TouchSample::default(); MAX_TOUCH_SLOTS]
}

fn note_grid(name: &str, col: u8, row: u8, width: u8, height: u8) -> Zone {
    Zone {
        name: name.into(),
        rect: ZoneRect {
            col,
            row,
            width,
            height,
        },
        kind: ZoneKind::NoteGrid {
            start_note: NoteNumber::new(60),
            row_interval: 5,
        },
    }
}

#[test]
fn full_surface_note_layout() {
    let map = ZoneMap::full_surface(PROFILE.keys);
    let zone = &map.zones()[0];
    let note = |col, row| {
        zone.note_at(KeyPosition { col, row })
            .expect("key inside the zone")
            .value()
    };
    assert_eq!(36, note(0, 0));
    assert_eq!(37, note(1, 0));
    assert_eq!(41, note(0, 1));
    assert_eq!(85, note(29, 4));
}

#[test]
fn touch_lifecycle_emits_on_continue_off() {
    let mut router = full_router();
    let mut events = Vec::new();

    router.route(&frame_with(0, touch((4, 2), 1, 0.2)), &mut events);
    assert_eq!(1, events.len());
    let ZoneEvent::NoteOn {
        slot,
        note,
        velocity,
    } = events[0]
    else {
        panic!("expected a note on");
    };
    assert_eq!(0, slot);
    assert_eq!(NoteNumber::new(50), note);
    assert!(velocity > 0.0 && velocity <= 1.0);

    events.clear();
    router.route(&frame_with(0, touch((4, 2), 2, 0.3)), &mut events);
    assert_eq!(1, events.len());
    let ZoneEvent::NoteContinue { note, pressure, .. } = events[0] else {
        panic!("expected a note continue");
    };
    assert_eq!(NoteNumber::new(50), note);
    assert!(approx_eq!(f32, 0.3, pressure));

    // The release ramp keeps the note sounding with decaying pressure.
    events.clear();
    let mut releasing = touch((4, 2), 3, 0.05);
    releasing.phase = TouchPhase::Releasing;
    router.route(&frame_with(0, releasing), &mut events);
    assert!(matches!(events[0], ZoneEvent::NoteContinue { .. }));

    events.clear();
    router.route(&empty_frame(), &mut events);
    assert_eq!(
        vec![ZoneEvent::NoteOff {
            slot: 0,
            note: NoteNumber::new(50),
        }],
        events
    );
}

#[test]
fn key_change_retriggers_the_note() {
    let mut router = full_router();
    let mut events = Vec::new();
    router.route(&frame_with(0, touch((4, 2), 1, 0.2)), &mut events);

    events.clear();
    router.route(&frame_with(0, touch((5, 2), 2, 0.2)), &mut events);
    assert_eq!(2, events.len());
    assert_eq!(
        ZoneEvent::NoteOff {
            slot: 0,
            note: NoteNumber::new(50),
        },
        events[0]
    );
    let ZoneEvent::NoteOn { note, .. } = events[1] else {
        panic!("expected a note on");
    };
    assert_eq!(NoteNumber::new(51), note);
}

#[test]
fn age_reset_without_an_off_frame_retriggers() {
    let mut router = full_router();
    let mut events = Vec::new();
    for age in 1..=5 {
        router.route(&frame_with(0, touch((4, 2), age, 0.2)), &mut events);
    }

    // The slot was stolen for a stronger contact elsewhere.
    events.clear();
    router.route(&frame_with(0, touch((20, 1), 1, 0.4)), &mut events);
    assert_eq!(2, events.len());
    assert_eq!(
        ZoneEvent::NoteOff {
            slot: 0,
            note: NoteNumber::new(50),
        },
        events[0]
    );
    let ZoneEvent::NoteOn { note, .. } = events[1] else {
        panic!("expected a note on");
    };
    assert_eq!(NoteNumber::new(61), note);
}

#[test]
fn touches_outside_every_zone_are_ignored() {
    let map = ZoneMap::new(PROFILE.keys, vec![note_grid("left", 0, 0, 4, 5)])
        .expect("valid map");
    let mut router = ZoneRouter::new(PROFILE, map);
    let mut events = Vec::new();

    router.route(&frame_with(0, touch((10, 0), 1, 0.2)), &mut events);
    assert!(events.is_empty());

    router.route(&frame_with(0, touch((2, 0), 2, 0.2)), &mut events);
    assert!(matches!(events[0], ZoneEvent::NoteOn { .. }));

    // Sliding out of the zone silences the note.
    events.clear();
    router.route(&frame_with(0, touch((4, 0), 3, 0.2)), &mut events);
    assert_eq!(
        vec![ZoneEvent::NoteOff {
            slot: 0,
            note: NoteNumber::new(62),
        }],
        events
    );
}

#[test]
fn controller_strip_reports_normalized_position() {
    let strip = Zone {
        name: "strip".into(),
        rect: ZoneRect {
            col: 0,
            row: 0,
            width: 30,
            height: 1,
        },
        kind: ZoneKind::ControllerStrip { controller: 1 },
    };
    let map = ZoneMap::new(PROFILE.keys, vec![strip]).expect("valid map");
    let mut router = ZoneRouter::new(PROFILE, map);
    let mut events = Vec::new();

    let mut sample = touch((15, 0), 1, 0.2);
    sample.x = 32.0;
    router.route(&frame_with(0, sample), &mut events);
    assert_eq!(1, events.len());
    let ZoneEvent::ControlChange {
        slot,
        controller,
        value,
    } = events[0]
    else {
        panic!("expected a control change");
    };
    assert_eq!((0, 1), (slot, controller));
    assert!(approx_eq!(f32, 0.5, value, epsilon = 1e-6));

    // Strips have no note to silence.
    events.clear();
    router.route(&empty_frame(), &mut events);
    assert!(events.is_empty());
}

#[test]
fn map_validation_rejects_bad_layouts() {
    assert!(matches!(
        ZoneMap::new(PROFILE.keys, vec![note_grid("empty", 0, 0, 0, 5)]),
        Err(ZoneMapError::EmptyZone { .. })
    ));
    assert!(matches!(
        ZoneMap::new(PROFILE.keys, vec![note_grid("wide", 0, 0, 31, 5)]),
        Err(ZoneMapError::OutOfBounds { .. })
    ));
    assert!(matches!(
        ZoneMap::new(
            PROFILE.keys,
            vec![note_grid("a", 0, 0, 10, 5), note_grid("b", 9, 0, 10, 5)],
        ),
        Err(ZoneMapError::Overlap { .. })
    ));
    let map = ZoneMap::new(
        PROFILE.keys,
        vec![note_grid("a", 0, 0, 10, 5), note_grid("b", 10, 0, 10, 5)],
    )
    .expect("valid map");
    assert_eq!(2, map.zones().len());
}

#[test]
fn notes_saturate_at_the_top_of_the_range() {
    assert_eq!(NoteNumber::MAX, NoteNumber::new(200));
    let zone = Zone {
        name: "high".into(),
        rect: ZoneRect {
            col: 0,
            row: 0,
            width: 30,
            height: 5,
        },
        kind: ZoneKind::NoteGrid {
            start_note: NoteNumber::new(120),
            row_interval: 12,
        },
    };
    let note = zone
        .note_at(KeyPosition { col: 29, row: 4 })
        .expect("key inside the zone");
    assert_eq!(NoteNumber::MAX, note);
}

#[test]
fn set_map_silences_sounding_notes() {
    let mut router = full_router();
    let mut events = Vec::new();
    router.route(&frame_with(0, touch((4, 2), 1, 0.2)), &mut events);

    events.clear();
    router.set_map(ZoneMap::full_surface(PROFILE.keys), &mut events);
    assert_eq!(
        vec![ZoneEvent::NoteOff {
            slot: 0,
            note: NoteNumber::new(50),
        }],
        events
    );

    // The held touch retriggers under the new map.
    events.clear();
    router.route(&frame_with(0, touch((4, 2), 2, 0.2)), &mut events);
    assert!(matches!(events[0], ZoneEvent::NoteOn { .. }));
}
