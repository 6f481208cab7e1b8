//! nbarsmooth: edge-preserving daily NBAR reflectance reconstruction
//!
//! Turns noisy, irregularly sampled MODIS/VIIRS/OLCI surface reflectance into
//! smooth, gap-filled daily series. Directional effects are removed first by a
//! per-pixel kernel-driven BRDF inversion; the isotropic series are then
//! smoothed by an iteratively reweighted tridiagonal regulariser that keeps
//! genuine step changes (fires, disturbance) sharp.
//!
//! The crate is a pure numerical core: product download, raster I/O and
//! reprojection belong to the caller.

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandCube, MultiBandCube, NbarError, NbarResult, QualityMask, Raster, Reflectance, Sensor,
    SensorConfig, ViewGeometry, NO_DATA,
};

pub use crate::core::{
    EdgePreservingSolver, MultiBandSmoother, PipelineConfig, TileInputs, TileOutput, TilePipeline,
};
