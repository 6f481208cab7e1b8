//! Core NBAR processing modules

pub mod banded;
pub mod brdf;
pub mod composite;
pub mod edges;
pub mod kernels;
pub mod multiband;
pub mod pipeline;
pub mod quality;
pub mod regularise;
pub mod tdma;

// Re-export main types
pub use banded::BandedSystem;
pub use brdf::{BandFit, BrdfCorrection, BrdfInverter, BrdfParams, InversionOutcome};
pub use composite::{DailyCompositor, ProcessingWindow};
pub use edges::{EdgeRefinementParams, EdgeRefiner, StepTest};
pub use kernels::{KernelModel, KernelParams, KernelTriplet};
pub use multiband::{share_weights, MultiBandSmoother, MultiBandSolution};
pub use pipeline::{InversionStats, PipelineConfig, TileInputs, TileOutput, TilePipeline};
pub use quality::{QualityParams, QualityScreener};
pub use regularise::{BandSolution, EdgeMode, EdgePreservingSolver, RegularisationParams, StepDirection};
