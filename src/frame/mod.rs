// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

pub mod peak;


/// Dimensions of a 2D cell grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, Serialize, Deserialize)]
#[display("{width}x{height}")]
pub struct GridSize {
    pub width: usize,
    pub height: usize,
}

impl GridSize {
    #[must_use]
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub const fn cell_count(self) -> usize {
        self.width * self.height
    }

    #[must_use]
    pub const fn contains(self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }
}

/// Owned, fixed-size 2D grid of pressure values.
///
/// Row-major storage. The dimensions are fixed at construction and all
/// binary operations require both operands to have the same size.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    size: GridSize,
    cells: Box<[f32]>,
}

impl Grid {
    #[must_use]
    pub fn new(size: GridSize) -> Self {
        Self {
            size,
            cells: vec![0.0; size.cell_count()].into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn size(&self) -> GridSize {
        self.size
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.size.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.size.height
    }

    fn index_of(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.size.contains(x, y));
        y * self.size.width + x
    }

    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.cells[self.index_of(x, y)]
    }

    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        let index = self.index_of(x, y);
        self.cells[index] = value;
    }

    pub fn add(&mut self, x: usize, y: usize, value: f32) {
        let index = self.index_of(x, y);
        self.cells[index] += value;
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.cells
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.cells
    }

    pub fn fill(&mut self, value: f32) {
        self.cells.fill(value);
    }

    pub fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!(self.size, other.size);
        self.cells.copy_from_slice(&other.cells);
    }

    /// Position and value of the maximum cell.
    ///
    /// Ties resolve to the first cell in row-major order.
    #[must_use]
    pub fn max_cell(&self) -> (usize, usize, f32) {
        let mut max_index = 0;
        let mut max_value = f32::MIN;
        for (index, value) in self.cells.iter().enumerate() {
            if *value > max_value {
                max_value = *value;
                max_index = index;
            }
        }
        (
            max_index % self.size.width,
            max_index / self.size.width,
            max_value,
        )
    }

    #[must_use]
    pub fn sum(&self) -> f32 {
        self.cells.iter().sum()
    }

    #[must_use]
    pub fn mean(&self) -> f32 {
        self.sum() / self.size.cell_count() as f32
    }

    #[must_use]
    pub fn sum_abs_diff(&self, other: &Self) -> f32 {
        debug_assert_eq!(self.size, other.size);
        self.cells
            .iter()
            .zip(other.cells.iter())
            .map(|(a, b)| (a - b).abs())
            .sum()
    }

    /// Root-mean-square difference between two equally sized grids.
    #[must_use]
    pub fn rms_difference(&self, other: &Self) -> f32 {
        debug_assert_eq!(self.size, other.size);
        let sum: f32 = self
            .cells
            .iter()
            .zip(other.cells.iter())
            .map(|(a, b)| {
                let diff = a - b;
                diff * diff
            })
            .sum();
        (sum / self.size.cell_count() as f32).sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for cell in &mut self.cells {
            *cell *= factor;
        }
    }

    /// Cell-wise multiplication, e.g. for applying a normalization map.
    pub fn multiply(&mut self, other: &Self) {
        debug_assert_eq!(self.size, other.size);
        for (cell, factor) in self.cells.iter_mut().zip(other.cells.iter()) {
            *cell *= *factor;
        }
    }

    /// Cell-wise `self += other * scale`.
    pub fn add_scaled(&mut self, other: &Self, scale: f32) {
        debug_assert_eq!(self.size, other.size);
        for (cell, add) in self.cells.iter_mut().zip(other.cells.iter()) {
            *cell += *add * scale;
        }
    }

    /// Cell-wise minimum of both grids.
    pub fn min_with(&mut self, other: &Self) {
        debug_assert_eq!(self.size, other.size);
        for (cell, min) in self.cells.iter_mut().zip(other.cells.iter()) {
            *cell = cell.min(*min);
        }
    }

    /// Cell-wise subtraction, clamped at zero.
    pub fn sub_floor_zero(&mut self, other: &Self) {
        debug_assert_eq!(self.size, other.size);
        for (cell, sub) in self.cells.iter_mut().zip(other.cells.iter()) {
            *cell = (*cell - *sub).max(0.0);
        }
    }

    pub fn clamp_values(&mut self, min: f32, max: f32) {
        debug_assert!(min <= max);
        for cell in &mut self.cells {
            *cell = cell.clamp(min, max);
        }
    }

    /// Bilinearly interpolated value at a continuous position.
    ///
    /// Positions outside the grid are clamped to the border cells.
    #[must_use]
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.size.width - 1) as f32);
        let y = y.clamp(0.0, (self.size.height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.size.width - 1);
        let y1 = (y0 + 1).min(self.size.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
        let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Accumulate a scaled kernel anchored at the rounded center position.
    ///
    /// Kernel cells that fall outside the grid are skipped. The kernel
    /// dimensions must be odd so that it has an unambiguous center cell.
    pub fn add_scaled_kernel(&mut self, kernel: &Self, center_x: f32, center_y: f32, scale: f32) {
        debug_assert_eq!(kernel.width() % 2, 1);
        debug_assert_eq!(kernel.height() % 2, 1);
        let anchor_x = center_x.round() as isize - (kernel.width() / 2) as isize;
        let anchor_y = center_y.round() as isize - (kernel.height() / 2) as isize;
        for ky in 0..kernel.height() {
            let gy = anchor_y + ky as isize;
            if gy < 0 || gy >= self.size.height as isize {
                continue;
            }
            for kx in 0..kernel.width() {
                let gx = anchor_x + kx as isize;
                if gx < 0 || gx >= self.size.width as isize {
                    continue;
                }
                self.add(gx as usize, gy as usize, kernel.get(kx, ky) * scale);
            }
        }
    }

    /// Scale the grid so that its maximum cell becomes 1.
    ///
    /// Returns the previous maximum. Grids without a positive maximum are
    /// left unchanged.
    pub fn normalize_peak(&mut self) -> f32 {
        let (_, _, peak) = self.max_cell();
        if peak > 0.0 {
            self.scale(1.0 / peak);
        }
        peak
    }
}

/// One full sensor frame with its wire sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedFrame {
    pub seq: u16,
    pub grid: Grid,
}

/// Recycle frame grids to minimize allocations.
///
/// Grids returned by [`GridRecycler::fetch`] contain unspecified values and
/// must be overwritten completely by the caller.
#[derive(Debug)]
pub struct GridRecycler {
    size: GridSize,
    recycled: Vec<Grid>,
}

impl GridRecycler {
    #[must_use]
    pub const fn new(size: GridSize) -> Self {
        Self {
            size,
            recycled: Vec::new(),
        }
    }

    #[must_use]
    pub fn fetch(&mut self) -> Grid {
        self.recycled.pop().unwrap_or_else(|| Grid::new(self.size))
    }

    pub fn recycle(&mut self, grid: Grid) {
        debug_assert_eq!(grid.size(), self.size);
        self.recycled.push(grid);
    }
}
