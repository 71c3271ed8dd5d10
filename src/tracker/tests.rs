// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

use float_cmp::approx_eq;

use super::*;

const PROFILE: SurfaceProfile = SurfaceProfile::standard();

fn templates() -> Calibrator {
    Calibrator::new(PROFILE.sensor, PROFILE.guard_columns)
}

fn default_tracker() -> Tracker {
    Tracker::new(PROFILE, TrackerParams::default())
}

fn add_bump(grid: &mut Grid, center_x: f32, center_y: f32, amplitude: f32) {
    const SIGMA: f32 = 1.2;
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let dx = x as f32 - center_x;
            let dy = y as f32 - center_y;
            let value = amplitude * (-(dx * dx + dy * dy) / (2.0 * SIGMA * SIGMA)).exp();
            grid.add(x, y, value);
        }
    }
}

fn run_frame(tracker: &mut Tracker, templates: &Calibrator, bumps: &[(f32, f32, f32)]) -> TouchFrame {
    let mut working = Grid::new(PROFILE.sensor);
    for &(x, y, amplitude) in bumps {
        add_bump(&mut working, x, y, amplitude);
    }
    *tracker.process_frame(&mut working, templates)
}

fn assert_exclusive_keys(frame: &TouchFrame) {
    for (index, sample) in frame.iter().enumerate() {
        if !sample.is_alive() {
            continue;
        }
        for other in &frame[index + 1..] {
            if other.is_alive() {
                assert_ne!(sample.key, other.key);
            }
        }
    }
}

// The end-to-end contract: a static bump is picked up within a few
// frames, tracked with stable position and monotone age, and released
// over exactly the fixed ramp length once the pressure vanishes.
#[test]
fn single_bump_lifecycle() {
    let templates = templates();
    let mut tracker = default_tracker();
    let mut born_frame = None;
    let mut final_age = 0;
    for frame_index in 1u32..=50 {
        let frame = run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.5)]);
        assert_exclusive_keys(&frame);
        let sample = frame[0];
        if born_frame.is_none() && sample.is_alive() {
            born_frame = Some(frame_index);
        }
        if let Some(born) = born_frame {
            assert_eq!(TouchPhase::Active, sample.phase);
            assert!((sample.x - 32.0).abs() < 0.2);
            assert!((sample.y - 4.0).abs() < 0.2);
            assert_eq!(frame_index - born + 1, sample.age);
            final_age = sample.age;
        }
    }
    let born = born_frame.expect("touch is born");
    assert!(born <= 3, "born at frame {born}");
    assert_eq!(50 - born + 1, final_age);

    // Lifting the finger starts the linear release ramp.
    let mut releasing_frames = 0u32;
    let mut last_z = f32::INFINITY;
    let mut died = false;
    for _ in 0..100 {
        let frame = run_frame(&mut tracker, &templates, &[]);
        let sample = frame[0];
        match sample.phase {
            TouchPhase::Active => {
                assert_eq!(0, releasing_frames, "went active again after releasing");
            }
            TouchPhase::Releasing => {
                releasing_frames += 1;
                assert!(sample.z <= last_z);
                last_z = sample.z;
            }
            TouchPhase::Off => {
                assert_eq!(0, sample.age);
                died = true;
                break;
            }
        }
    }
    assert!(died, "touch never died");
    assert_eq!(TOUCH_RELEASE_FRAMES, releasing_frames);

    let stats = tracker.stats();
    assert_eq!(1, stats.births);
    assert_eq!(1, stats.releases);
    assert_eq!(0, stats.steals);
}

#[test]
fn merged_bumps_on_one_key_make_one_touch() {
    let templates = templates();
    let mut tracker = default_tracker();
    for _ in 0..20 {
        let frame = run_frame(
            &mut tracker,
            &templates,
            &[(32.0, 4.0, 0.4), (33.0, 4.0, 0.4)],
        );
        assert_exclusive_keys(&frame);
        assert!(tracker.alive_touches() <= 1);
    }
    assert_eq!(1, tracker.alive_touches());
    let frame = run_frame(
        &mut tracker,
        &templates,
        &[(32.0, 4.0, 0.4), (33.0, 4.0, 0.4)],
    );
    assert_eq!(KeyPosition { col: 15, row: 2 }, frame[0].key);
}

#[test]
fn weak_peak_near_strong_touch_is_inhibited() {
    let templates = templates();
    let mut tracker = default_tracker();
    for _ in 0..20 {
        run_frame(&mut tracker, &templates, &[(30.0, 4.0, 0.5)]);
    }
    assert_eq!(1, tracker.alive_touches());
    // A second, much weaker bump three cells away stays below the cone
    // of suppression projected by the strong touch.
    for _ in 0..30 {
        let frame = run_frame(
            &mut tracker,
            &templates,
            &[(30.0, 4.0, 0.5), (33.0, 4.0, 0.02)],
        );
        assert_eq!(1, tracker.alive_touches());
        assert_eq!(KeyPosition { col: 14, row: 2 }, frame[0].key);
    }
}

#[test]
fn steal_replaces_the_weakest_touch() {
    let templates = templates();
    let mut tracker = Tracker::new(
        PROFILE,
        TrackerParams {
            max_touches: 1,
            ..Default::default()
        },
    );
    for _ in 0..10 {
        run_frame(&mut tracker, &templates, &[(10.0, 4.0, 0.1)]);
    }
    assert_eq!(1, tracker.alive_touches());

    // A stronger candidate arrives while the pool is exhausted.
    let frame = run_frame(
        &mut tracker,
        &templates,
        &[(10.0, 4.0, 0.1), (40.0, 4.0, 0.4)],
    );
    assert_eq!(1, tracker.alive_touches());
    let sample = frame[0];
    assert_eq!(KeyPosition { col: 18, row: 2 }, sample.key);
    assert_eq!(1, sample.age);
    let stats = tracker.stats();
    assert_eq!(2, stats.births);
    assert_eq!(1, stats.steals);
}

#[test]
fn hysteresis_holds_a_touch_between_off_and_on() {
    let templates = templates();
    let mut tracker = default_tracker();
    // Between the thresholds nothing is born.
    for _ in 0..10 {
        let frame = run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.011)]);
        assert!(frame.iter().all(|sample| !sample.is_alive()));
    }
    // Above the on threshold a touch is born quickly.
    let mut born_frame = None;
    for frame_index in 1u32..=20 {
        let frame = run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.03)]);
        if born_frame.is_none() && frame[0].is_alive() {
            born_frame = Some(frame_index);
        }
    }
    assert!(born_frame.expect("touch is born") <= 3);
    // Dropping back between the thresholds keeps it alive.
    for _ in 0..40 {
        let frame = run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.011)]);
        assert_eq!(TouchPhase::Active, frame[0].phase);
    }
    // Only falling below the off threshold releases it.
    let mut releasing_frames = 0u32;
    for _ in 0..100 {
        let frame = run_frame(&mut tracker, &templates, &[]);
        match frame[0].phase {
            TouchPhase::Releasing => releasing_frames += 1,
            TouchPhase::Off => break,
            TouchPhase::Active => {}
        }
    }
    assert_eq!(TOUCH_RELEASE_FRAMES, releasing_frames);
}

#[test]
fn quantize_reports_key_centers() {
    let templates = templates();
    let mut tracker = Tracker::new(
        PROFILE,
        TrackerParams {
            quantize: true,
            ..Default::default()
        },
    );
    for _ in 0..10 {
        let frame = run_frame(&mut tracker, &templates, &[(32.3, 4.3, 0.5)]);
        let sample = frame[0];
        if !sample.is_alive() {
            continue;
        }
        assert_eq!(KeyPosition { col: 15, row: 2 }, sample.key);
        assert!(approx_eq!(f32, sample.x, PROFILE.key_center_x(15), epsilon = 1e-3));
        assert!(approx_eq!(f32, sample.y, PROFILE.key_center_y(2), epsilon = 1e-3));
    }
    assert_eq!(1, tracker.alive_touches());
}

// Wobbling around a key border must not retrigger the note downstream:
// the key only changes once the position clears the border by the
// migration margin.
#[test]
fn key_border_wobble_does_not_migrate() {
    let templates = templates();
    let mut tracker = default_tracker();
    // Settle left of the column border at x = 32.0.
    let mut key = KeyPosition::default();
    for _ in 0..6 {
        let frame = run_frame(&mut tracker, &templates, &[(31.5, 4.0, 0.5)]);
        key = frame[0].key;
    }
    assert_eq!(1, tracker.alive_touches());
    assert_eq!(KeyPosition { col: 14, row: 2 }, key);

    let mut migrations = 0u32;
    for frame_index in 0..40 {
        let x = if frame_index % 2 == 0 { 32.1 } else { 31.9 };
        let frame = run_frame(&mut tracker, &templates, &[(x, 4.0, 0.5)]);
        assert_eq!(TouchPhase::Active, frame[0].phase);
        if frame[0].key != key {
            migrations += 1;
            key = frame[0].key;
        }
    }
    assert_eq!(0, migrations, "key flipped {migrations} times at the border");

    // A decisive move past the margin migrates, exactly once.
    for _ in 0..5 {
        let frame = run_frame(&mut tracker, &templates, &[(32.7, 4.0, 0.5)]);
        if frame[0].key != key {
            migrations += 1;
            key = frame[0].key;
        }
    }
    assert_eq!(1, migrations);
    assert_eq!(KeyPosition { col: 15, row: 2 }, key);
}

#[test]
fn rotate_cycles_slot_allocation() {
    let templates = templates();
    let mut tracker = Tracker::new(
        PROFILE,
        TrackerParams {
            rotate: true,
            ..Default::default()
        },
    );
    for _ in 0..5 {
        run_frame(&mut tracker, &templates, &[(10.0, 4.0, 0.3)]);
    }
    assert_eq!(1, tracker.alive_touches());
    for _ in 0..60 {
        run_frame(&mut tracker, &templates, &[]);
    }
    assert_eq!(0, tracker.alive_touches());
    // The next touch lands in the following slot.
    for _ in 0..5 {
        run_frame(&mut tracker, &templates, &[(40.0, 4.0, 0.3)]);
    }
    let frame = run_frame(&mut tracker, &templates, &[(40.0, 4.0, 0.3)]);
    assert!(!frame[0].is_alive());
    assert!(frame[1].is_alive());

    // Without rotation the first slot is reused.
    let mut tracker = default_tracker();
    for _ in 0..5 {
        run_frame(&mut tracker, &templates, &[(10.0, 4.0, 0.3)]);
    }
    for _ in 0..60 {
        run_frame(&mut tracker, &templates, &[]);
    }
    for _ in 0..5 {
        run_frame(&mut tracker, &templates, &[(40.0, 4.0, 0.3)]);
    }
    let frame = run_frame(&mut tracker, &templates, &[(40.0, 4.0, 0.3)]);
    assert!(frame[0].is_alive());
    assert!(!frame[1].is_alive());
}

#[test]
fn shrinking_the_pool_drops_excess_touches() {
    let templates = templates();
    let mut tracker = default_tracker();
    for _ in 0..10 {
        run_frame(
            &mut tracker,
            &templates,
            &[(10.0, 4.0, 0.3), (40.0, 4.0, 0.3)],
        );
    }
    assert_eq!(2, tracker.alive_touches());
    tracker.set_params(TrackerParams {
        max_touches: 1,
        ..Default::default()
    });
    assert_eq!(1, tracker.alive_touches());
    let frame = run_frame(
        &mut tracker,
        &templates,
        &[(10.0, 4.0, 0.3), (40.0, 4.0, 0.3)],
    );
    assert!(!frame[1].is_alive());
    assert!(tracker.alive_touches() <= 1);
}

#[test]
#[allow(clippy::float_cmp)]
fn touch_mass_follows_alive_touches() {
    let templates = templates();
    let mut tracker = default_tracker();
    for _ in 0..20 {
        run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.5)]);
    }
    let (x, y, value) = tracker.touch_mass().max_cell();
    assert_eq!((32, 4), (x, y));
    assert!(value > 0.3);
    assert!(tracker.touch_mass().sum() > 1.0);

    for _ in 0..80 {
        run_frame(&mut tracker, &templates, &[]);
    }
    assert_eq!(0, tracker.alive_touches());
    assert_eq!(0.0, tracker.touch_mass().sum());
}

#[test]
fn reset_clears_all_touches() {
    let templates = templates();
    let mut tracker = default_tracker();
    for _ in 0..10 {
        run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.5)]);
    }
    assert_eq!(1, tracker.alive_touches());
    tracker.reset();
    assert_eq!(0, tracker.alive_touches());
    // The key is immediately available again.
    let mut born = false;
    for _ in 0..3 {
        let frame = run_frame(&mut tracker, &templates, &[(32.0, 4.0, 0.5)]);
        born |= frame[0].is_alive();
    }
    assert!(born);
}
