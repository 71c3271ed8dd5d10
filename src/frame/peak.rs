// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Sub-pixel peak location on pressure grids.
//!
//! A local maximum found on the integer grid is refined with a 2nd-order
//! Taylor expansion of the pressure surface around the cell. The linear
//! system is tiny (2x2, symmetric) and solved in closed form.

use super::Grid;

/// Rows at the top/bottom edge where only the x offset is refined.
///
/// The vertical neighborhood is truncated there and the 2D fit would
/// systematically pull peaks off the surface.
const EDGE_ROWS: usize = 2;

/// Curvatures flatter than this are treated as degenerate.
const CURVATURE_EPSILON: f32 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinedPeak {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Maximum cell within the 3x3 neighborhood of a seed position.
///
/// Ties resolve to the seed itself, then row-major order. The neighborhood
/// is clamped at the grid borders.
#[must_use]
pub fn search_local_max(grid: &Grid, seed_x: usize, seed_y: usize) -> (usize, usize) {
    debug_assert!(grid.size().contains(seed_x, seed_y));
    let mut best = (seed_x, seed_y);
    let mut best_value = grid.get(seed_x, seed_y);
    let x_min = seed_x.saturating_sub(1);
    let x_max = (seed_x + 1).min(grid.width() - 1);
    let y_min = seed_y.saturating_sub(1);
    let y_max = (seed_y + 1).min(grid.height() - 1);
    for y in y_min..=y_max {
        for x in x_min..=x_max {
            let value = grid.get(x, y);
            if value > best_value {
                best_value = value;
                best = (x, y);
            }
        }
    }
    best
}

/// Refine an integer peak cell to a sub-pixel position and pressure.
///
/// Within [`EDGE_ROWS`] of the top/bottom edge only the x offset is
/// refined. Offsets are clamped to +/-0.5 cells so a refined peak never
/// leaves its cell.
#[must_use]
pub fn refine(grid: &Grid, peak_x: usize, peak_y: usize) -> RefinedPeak {
    debug_assert!(grid.size().contains(peak_x, peak_y));
    // The x derivatives need both horizontal neighbors.
    let x = peak_x.clamp(1, grid.width() - 2);
    let y = peak_y;
    let near_edge = y < EDGE_ROWS || y + EDGE_ROWS >= grid.height();
    if near_edge {
        return refine_x_only(grid, x, y);
    }
    debug_assert!(y >= 1 && y + 1 < grid.height());
    let center = grid.get(x, y);
    let dx = (grid.get(x + 1, y) - grid.get(x - 1, y)) * 0.5;
    let dy = (grid.get(x, y + 1) - grid.get(x, y - 1)) * 0.5;
    let dxx = grid.get(x + 1, y) - 2.0 * center + grid.get(x - 1, y);
    let dyy = grid.get(x, y + 1) - 2.0 * center + grid.get(x, y - 1);
    let dxy = (grid.get(x + 1, y + 1) - grid.get(x + 1, y - 1) - grid.get(x - 1, y + 1)
        + grid.get(x - 1, y - 1))
        * 0.25;
    let det = dxx * dyy - dxy * dxy;
    // The expansion only describes a maximum while the Hessian is
    // negative definite.
    if dxx >= -CURVATURE_EPSILON || det <= CURVATURE_EPSILON {
        return refine_x_only(grid, x, y);
    }
    let offset_x = ((dxy * dy - dyy * dx) / det).clamp(-0.5, 0.5);
    let offset_y = ((dxy * dx - dxx * dy) / det).clamp(-0.5, 0.5);
    let z = center
        + dx * offset_x
        + dy * offset_y
        + 0.5 * (dxx * offset_x * offset_x + 2.0 * dxy * offset_x * offset_y + dyy * offset_y * offset_y);
    RefinedPeak {
        x: x as f32 + offset_x,
        y: y as f32 + offset_y,
        z,
    }
}

fn refine_x_only(grid: &Grid, x: usize, y: usize) -> RefinedPeak {
    debug_assert!(x >= 1 && x + 1 < grid.width());
    let center = grid.get(x, y);
    let dx = (grid.get(x + 1, y) - grid.get(x - 1, y)) * 0.5;
    let dxx = grid.get(x + 1, y) - 2.0 * center + grid.get(x - 1, y);
    if dxx >= -CURVATURE_EPSILON {
        return RefinedPeak {
            x: x as f32,
            y: y as f32,
            z: center,
        };
    }
    let offset_x = (-dx / dxx).clamp(-0.5, 0.5);
    RefinedPeak {
        x: x as f32 + offset_x,
        y: y as f32,
        z: center + dx * offset_x + 0.5 * dxx * offset_x * offset_x,
    }
}
