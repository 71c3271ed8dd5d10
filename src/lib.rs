// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = include_str!("../README.md")]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(rustdoc::broken_intra_doc_links)]
// Repetitions of module/type names occur frequently when using many
// modules for keeping the size of the source files handy. Often
// types have the same name as their parent module.
#![allow(clippy::module_name_repetitions)]
// Repeating the type name in `..Default::default()` expressions
// is not needed since the context is obvious.
#![allow(clippy::default_trait_access)]

use smol_str::SmolStr;

pub mod anomaly;
pub mod background;
pub mod calibrate;
pub mod filters;
pub mod frame;
pub mod params;
pub mod pipeline;
pub mod tracker;
pub mod unpacker;
pub mod zone;

pub use crate::{
    anomaly::{AnomalyFilter, GlitchReport},
    background::BackgroundTracker,
    calibrate::{CalibrationPhase, Calibrator, ExportError, ImportError},
    frame::{Grid, GridSize, SequencedFrame},
    params::{SurfaceProfile, TrackerParams, MAX_TOUCH_SLOTS},
    pipeline::{DiagnosticsSink, SurfacePipeline, TouchFrameSink},
    tracker::{TouchFrame, TouchPhase, TouchSample, Tracker},
    unpacker::{Endpoint, Unpacker},
    zone::{Zone, ZoneEvent, ZoneMap, ZoneRouter},
};

/// Static naming of a supported surface hardware variant.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceDescriptor {
    pub vendor_name: SmolStr,
    pub product_name: SmolStr,
    pub profile: SurfaceProfile,
}

/// The production hardware this crate is built around.
pub const STANDARD_SURFACE_DESCRIPTOR: SurfaceDescriptor = SurfaceDescriptor {
    vendor_name: SmolStr::new_static("Madrona Labs"),
    product_name: SmolStr::new_static("Soundplane Model A"),
    profile: SurfaceProfile::standard(),
};
