// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

use float_cmp::approx_eq;

use super::*;

const SENSOR: GridSize = GridSize::new(64, 8);
const GUARD_COLUMNS: usize = 1;

fn gaussian_frame(center_x: f32, center_y: f32, amplitude: f32, sigma: f32) -> Grid {
    let mut grid = Grid::new(SENSOR);
    for y in 0..SENSOR.height {
        for x in 0..SENSOR.width {
            let dx = x as f32 - center_x;
            let dy = y as f32 - center_y;
            let value = amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            grid.set(x, y, value);
        }
    }
    grid
}

fn uniform_frame(value: f32) -> Grid {
    let mut grid = Grid::new(SENSOR);
    grid.fill(value);
    grid
}

fn feed_repeated(calibrator: &mut Calibrator, frame: &Grid, count: u32) {
    for _ in 0..count {
        calibrator.process_frame(frame);
    }
}

fn template_grid() -> Grid {
    Grid::new(GridSize::new(TEMPLATE_SIZE, TEMPLATE_SIZE))
}

#[test]
#[allow(clippy::float_cmp)]
fn idle_ignores_frames() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    feed_repeated(&mut calibrator, &uniform_frame(0.5), 10);
    assert_eq!(CalibrationPhase::Idle, calibrator.phase());
    assert!(!calibrator.is_collecting());
    assert!(!calibrator.has_normalize_map());
    assert!(!calibrator.has_calibration());
    assert_eq!(0.0, calibrator.progress());
}

#[test]
fn bin_layout_covers_the_interior() {
    let layout = BinLayout::for_sensor(SENSOR);
    assert_eq!(GridSize::new(60, 4), layout.bins);
    assert_eq!((2, 2), layout.bin_center(0));
    assert_eq!((61, 5), layout.bin_center(239));
    // Positions outside the interior clamp to the border bins.
    assert_eq!(0, layout.nearest_bin(0.2, 0.3));
    assert_eq!(239, layout.nearest_bin(63.8, 7.9));
    assert_eq!(2 * 60 + 30, layout.nearest_bin(32.0, 4.0));
}

#[test]
fn noise_window_sets_threshold_from_mean_peak() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();
    assert_eq!(CalibrationPhase::MeasureNoise, calibrator.phase());
    let noise = uniform_frame(0.002);
    feed_repeated(&mut calibrator, &noise, NOISE_WINDOW_FRAMES);
    assert_eq!(CalibrationPhase::CollectNormalizeMap, calibrator.phase());
    // Mean peak 0.002 scaled by the threshold ratio.
    assert!(approx_eq!(
        f32,
        calibrator.touch_threshold(),
        0.008,
        epsilon = 1e-5
    ));
}

#[test]
#[allow(clippy::float_cmp)]
fn silent_noise_window_keeps_the_minimum_threshold() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();
    feed_repeated(&mut calibrator, &Grid::new(SENSOR), NOISE_WINDOW_FRAMES);
    assert_eq!(MIN_TOUCH_THRESHOLD, calibrator.touch_threshold());
}

#[test]
#[allow(clippy::float_cmp)]
fn progress_advances_through_the_noise_window() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();
    assert_eq!(0.0, calibrator.progress());
    let silent = Grid::new(SENSOR);
    feed_repeated(&mut calibrator, &silent, NOISE_WINDOW_FRAMES / 4);
    assert_eq!(0.25, calibrator.progress());
    feed_repeated(&mut calibrator, &silent, NOISE_WINDOW_FRAMES / 4);
    assert_eq!(0.5, calibrator.progress());
}

#[test]
fn cancel_discards_partial_collection() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();
    feed_repeated(&mut calibrator, &Grid::new(SENSOR), 10);
    assert!(calibrator.is_collecting());
    calibrator.cancel();
    assert_eq!(CalibrationPhase::Idle, calibrator.phase());
    assert!(!calibrator.has_normalize_map());
    assert!(!calibrator.has_calibration());
}

#[test]
#[allow(clippy::float_cmp)]
fn uncalibrated_template_is_conical() {
    let calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    let mut template = template_grid();
    calibrator.template_into(10.0, 3.0, &mut template);
    assert_eq!(1.0, template.get(TEMPLATE_RADIUS, TEMPLATE_RADIUS));
    // Corner cells lie beyond the cone radius.
    assert_eq!(0.0, template.get(0, 0));
    assert_eq!(0.0, template.get(TEMPLATE_SIZE - 1, TEMPLATE_SIZE - 1));
    // Directly adjacent cells still carry weight.
    assert!(template.get(TEMPLATE_RADIUS + 1, TEMPLATE_RADIUS) > 0.5);
    assert_eq!(1.0, calibrator.z_adjust(10.0));
    assert_eq!(1.0, calibrator.z_adjust(10.5));
}

#[test]
fn uncalibrated_normalize_map_is_identity() {
    let calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    let mut frame = gaussian_frame(20.0, 4.0, 0.5, 1.5);
    let original = frame.clone();
    calibrator.apply_normalize_map(&mut frame);
    assert_eq!(original, frame);
}

#[test]
fn export_without_calibration_fails() {
    let calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    assert!(matches!(calibrator.export(), Err(ExportError::NoCalibration)));
}

// Drives the whole procedure front to back: two silence windows, a
// normalize map from uniform pressure, and a template table from one
// synthetic touch per bin. Runs a few thousand small frames.
#[test]
#[allow(clippy::float_cmp)]
fn full_calibration_builds_map_and_templates() {
    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();

    // First silence window.
    let silent = Grid::new(SENSOR);
    feed_repeated(&mut calibrator, &silent, NOISE_WINDOW_FRAMES);
    assert_eq!(CalibrationPhase::CollectNormalizeMap, calibrator.phase());

    // Uniform pressure accumulates every interior cell in parallel.
    let pressed = uniform_frame(0.5);
    feed_repeated(&mut calibrator, &pressed, NORM_MAP_SAMPLES);
    assert_eq!(CalibrationPhase::Settle, calibrator.phase());
    assert!(calibrator.has_normalize_map());
    // Uniform input means uniform sensitivity, the map must be flat.
    for y in 0..SENSOR.height {
        for x in GUARD_COLUMNS..SENSOR.width - GUARD_COLUMNS {
            assert!(approx_eq!(
                f32,
                calibrator.normalize_map().get(x, y),
                1.0,
                epsilon = 1e-4
            ));
        }
    }

    // Settling gap and second silence window.
    feed_repeated(&mut calibrator, &silent, SETTLE_FRAMES);
    assert_eq!(CalibrationPhase::MeasureNoise, calibrator.phase());
    feed_repeated(&mut calibrator, &silent, NOISE_WINDOW_FRAMES);
    assert_eq!(CalibrationPhase::CollectTemplates, calibrator.phase());

    // Touch every bin center twice, row by row.
    const TOUCH_SIGMA: f32 = 1.5;
    let layout = BinLayout::for_sensor(SENSOR);
    for _pass in 0..PASSES_TO_CALIBRATE {
        for bin in 0..layout.bins.cell_count() {
            let (center_x, center_y) = layout.bin_center(bin);
            let touch = gaussian_frame(center_x as f32, center_y as f32, 0.5, TOUCH_SIGMA);
            feed_repeated(&mut calibrator, &touch, MIN_SAMPLES_PER_VISIT);
        }
    }
    // Lifting the finger closes the final visit.
    calibrator.process_frame(&silent);
    assert_eq!(CalibrationPhase::Done, calibrator.phase());
    assert!(calibrator.has_calibration());
    assert_eq!(1.0, calibrator.progress());

    // Collected templates are peak-normalized with the peak at the center.
    let mut template = template_grid();
    calibrator.template_into(32.0, 4.0, &mut template);
    let (peak_x, peak_y, peak) = template.max_cell();
    assert_eq!((TEMPLATE_RADIUS, TEMPLATE_RADIUS), (peak_x, peak_y));
    assert!(approx_eq!(f32, peak, 1.0, epsilon = 1e-3));
    // The synthetic touch is radially symmetric, so its template must be.
    assert!(approx_eq!(
        f32,
        template.get(TEMPLATE_RADIUS - 1, TEMPLATE_RADIUS),
        template.get(TEMPLATE_RADIUS + 1, TEMPLATE_RADIUS),
        epsilon = 0.05
    ));
    // Beyond shape: the whole kernel reproduces the injected touch. The
    // peak-normalized mean of identical Gaussian presses is the Gaussian
    // itself, sampled at integer offsets from the bin center.
    let mut expected = template_grid();
    for y in 0..TEMPLATE_SIZE {
        for x in 0..TEMPLATE_SIZE {
            let dx = x as f32 - TEMPLATE_RADIUS as f32;
            let dy = y as f32 - TEMPLATE_RADIUS as f32;
            let value = (-(dx * dx + dy * dy) / (2.0 * TOUCH_SIGMA * TOUCH_SIGMA)).exp();
            expected.set(x, y, value);
        }
    }
    assert!(
        template.rms_difference(&expected) < 0.02,
        "collected template diverges from the injected kernel: rms {}",
        template.rms_difference(&expected)
    );

    // Pressure compensation follows the fractional x position.
    assert!(approx_eq!(f32, calibrator.z_adjust(32.0), 1.164, epsilon = 1e-3));
    assert!(approx_eq!(f32, calibrator.z_adjust(32.5), 1.414, epsilon = 1e-3));

    // A finished calibration survives an export/import round trip.
    let blob = calibrator.export().unwrap();
    let mut restored = Calibrator::new(SENSOR, GUARD_COLUMNS);
    restored.import(&blob).unwrap();
    assert_eq!(CalibrationPhase::Done, restored.phase());
    assert!(restored.has_calibration());
    assert_eq!(calibrator.touch_threshold(), restored.touch_threshold());
    let mut restored_template = template_grid();
    restored.template_into(32.0, 4.0, &mut restored_template);
    assert_eq!(template, restored_template);
}

#[test]
#[allow(clippy::float_cmp)]
fn import_validates_the_blob() {
    let map = {
        let mut map = Grid::new(SENSOR);
        map.fill(1.25);
        map
    };
    let layout = BinLayout::for_sensor(SENSOR);
    let kernel = {
        let mut kernel = template_grid();
        kernel.fill(0.5);
        kernel.set(TEMPLATE_RADIUS, TEMPLATE_RADIUS, 1.0);
        kernel
    };
    let kernels = vec![kernel.clone(); layout.bins.cell_count()];
    let blob = blob::encode(&map, &kernels, layout.bins, TEMPLATE_SIZE, 0.02).unwrap();

    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.import(&blob).unwrap();
    assert!(calibrator.has_normalize_map());
    assert!(calibrator.has_calibration());
    assert_eq!(0.02, calibrator.touch_threshold());
    let mut template = template_grid();
    calibrator.template_into(2.0, 2.0, &mut template);
    assert_eq!(kernel, template);

    // Truncated payloads are rejected without touching the live data.
    let mut fresh = Calibrator::new(SENSOR, GUARD_COLUMNS);
    assert!(matches!(
        fresh.import(&blob[..blob.len() / 2]),
        Err(ImportError::Malformed(_))
    ));
    assert!(!fresh.has_calibration());

    // Unknown versions are rejected up front. The version is the first
    // little-endian u32 of the encoding.
    let mut wrong_version = blob.clone();
    wrong_version[0] = 99;
    assert!(matches!(
        fresh.import(&wrong_version),
        Err(ImportError::UnsupportedVersion { version: 99 })
    ));

    // Blobs recorded for another sensor shape never apply.
    let small = GridSize::new(32, 8);
    let small_layout = BinLayout::for_sensor(small);
    let small_map = {
        let mut map = Grid::new(small);
        map.fill(1.0);
        map
    };
    let small_kernels = vec![kernel; small_layout.bins.cell_count()];
    let small_blob = blob::encode(
        &small_map,
        &small_kernels,
        small_layout.bins,
        TEMPLATE_SIZE,
        0.02,
    )
    .unwrap();
    assert!(matches!(
        fresh.import(&small_blob),
        Err(ImportError::SensorShapeMismatch { .. })
    ));
    assert!(!fresh.has_calibration());
}

#[test]
fn import_aborts_a_running_collection() {
    let map = {
        let mut map = Grid::new(SENSOR);
        map.fill(1.0);
        map
    };
    let layout = BinLayout::for_sensor(SENSOR);
    let kernels = vec![template_grid(); layout.bins.cell_count()];
    let blob = blob::encode(&map, &kernels, layout.bins, TEMPLATE_SIZE, 0.02).unwrap();

    let mut calibrator = Calibrator::new(SENSOR, GUARD_COLUMNS);
    calibrator.begin();
    feed_repeated(&mut calibrator, &Grid::new(SENSOR), 10);
    assert!(calibrator.is_collecting());
    calibrator.import(&blob).unwrap();
    assert_eq!(CalibrationPhase::Done, calibrator.phase());
    assert!(!calibrator.is_collecting());
}
