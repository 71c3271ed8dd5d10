// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Opaque persistence format for finished calibration data.
//!
//! The blob is a versioned, flat serialization of the normalize map and
//! the per-bin template kernels. Hosts store it wherever they like and
//! hand it back verbatim. Every shape property is validated on import, a
//! blob from a different hardware variant never replaces live data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Grid, GridSize};

const BLOB_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Malformed(#[from] bincode::Error),

    #[error("Unsupported calibration blob version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("Sensor shape mismatch: blob {blob}, surface {surface}")]
    SensorShapeMismatch { blob: GridSize, surface: GridSize },

    #[error("Template table shape mismatch: blob {blob}, surface {expected}")]
    TemplateShapeMismatch { blob: GridSize, expected: GridSize },

    #[error("Payload length mismatch: expected {expected} values, found {found}")]
    PayloadLength { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No finished calibration to export")]
    NoCalibration,

    #[error(transparent)]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobData {
    version: u32,
    sensor_width: u32,
    sensor_height: u32,
    bins_width: u32,
    bins_height: u32,
    template_size: u32,
    touch_threshold: f32,
    normalize_map: Vec<f32>,
    kernels: Vec<f32>,
}

#[derive(Debug)]
pub(super) struct DecodedCalibration {
    pub(super) normalize_map: Grid,
    pub(super) kernels: Vec<Grid>,
    pub(super) touch_threshold: f32,
}

pub(super) fn encode(
    normalize_map: &Grid,
    kernels: &[Grid],
    bins: GridSize,
    template_size: usize,
    touch_threshold: f32,
) -> Result<Vec<u8>, bincode::Error> {
    debug_assert_eq!(bins.cell_count(), kernels.len());
    let mut kernel_values = Vec::with_capacity(kernels.len() * template_size * template_size);
    for kernel in kernels {
        debug_assert_eq!(kernel.width(), template_size);
        debug_assert_eq!(kernel.height(), template_size);
        kernel_values.extend_from_slice(kernel.as_slice());
    }
    let data = BlobData {
        version: BLOB_VERSION,
        sensor_width: normalize_map.width() as u32,
        sensor_height: normalize_map.height() as u32,
        bins_width: bins.width as u32,
        bins_height: bins.height as u32,
        template_size: template_size as u32,
        touch_threshold,
        normalize_map: normalize_map.as_slice().to_vec(),
        kernels: kernel_values,
    };
    bincode::serialize(&data)
}

pub(super) fn decode(
    bytes: &[u8],
    surface: GridSize,
    bins: GridSize,
    template_size: usize,
) -> Result<DecodedCalibration, ImportError> {
    let data: BlobData = bincode::deserialize(bytes)?;
    if data.version != BLOB_VERSION {
        return Err(ImportError::UnsupportedVersion {
            version: data.version,
        });
    }
    let blob_surface = GridSize::new(data.sensor_width as usize, data.sensor_height as usize);
    if blob_surface != surface {
        return Err(ImportError::SensorShapeMismatch {
            blob: blob_surface,
            surface,
        });
    }
    let blob_bins = GridSize::new(data.bins_width as usize, data.bins_height as usize);
    if blob_bins != bins || data.template_size as usize != template_size {
        return Err(ImportError::TemplateShapeMismatch {
            blob: blob_bins,
            expected: bins,
        });
    }
    if data.normalize_map.len() != surface.cell_count() {
        return Err(ImportError::PayloadLength {
            expected: surface.cell_count(),
            found: data.normalize_map.len(),
        });
    }
    let kernel_cells = template_size * template_size;
    let expected_kernel_values = bins.cell_count() * kernel_cells;
    if data.kernels.len() != expected_kernel_values {
        return Err(ImportError::PayloadLength {
            expected: expected_kernel_values,
            found: data.kernels.len(),
        });
    }
    let mut normalize_map = Grid::new(surface);
    normalize_map
        .as_mut_slice()
        .copy_from_slice(&data.normalize_map);
    let kernel_size = GridSize::new(template_size, template_size);
    let kernels = data
        .kernels
        .chunks_exact(kernel_cells)
        .map(|values| {
            let mut kernel = Grid::new(kernel_size);
            kernel.as_mut_slice().copy_from_slice(values);
            kernel
        })
        .collect();
    Ok(DecodedCalibration {
        normalize_map,
        kernels,
        touch_threshold: data.touch_threshold,
    })
}
