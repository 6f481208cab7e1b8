//! Tile processing pipeline
//!
//! Quality screening, kernel evaluation, per-pixel BRDF inversion and
//! multi-band edge-preserving smoothing of one daily reflectance tile,
//! processed in square spatial blocks to bound memory. The smoothness alpha
//! is taken over the whole tile, so the block size does not change results.

use crate::core::brdf::{BrdfCorrection, BrdfInverter, BrdfParams, InversionOutcome};
use crate::core::composite::{DailyCompositor, ProcessingWindow};
use crate::core::edges::EdgeRefinementParams;
use crate::core::kernels::{KernelModel, KernelParams};
use crate::core::multiband::{MultiBandSmoother, MultiBandSolution};
use crate::core::quality::{QualityParams, QualityScreener};
use crate::core::regularise::{EdgePreservingSolver, RegularisationParams};
use crate::types::{check_dim, MultiBandCube, NbarError, NbarResult, QualityMask, Sensor, ViewGeometry};
use ndarray::{s, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Degenerate-fit fraction above which a block is reported as degraded
const DEGENERATE_WARN_FRACTION: f64 = 0.5;

/// Full processing configuration for one sensor tile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sensor: Sensor,
    pub window: ProcessingWindow,
    /// Side length of the square spatial blocks
    pub block_size: usize,
    /// Compute the per-band uncertainty cube
    pub with_uncertainty: bool,
    pub quality: QualityParams,
    pub kernels: KernelParams,
    pub brdf: BrdfParams,
    pub regularisation: RegularisationParams,
    pub edges: EdgeRefinementParams,
}

impl PipelineConfig {
    pub fn new(sensor: Sensor, window: ProcessingWindow) -> Self {
        Self {
            sensor,
            window,
            block_size: 64,
            with_uncertainty: true,
            quality: QualityParams::default(),
            kernels: KernelParams::default(),
            brdf: BrdfParams::default(),
            regularisation: RegularisationParams::default(),
            edges: EdgeRefinementParams::default(),
        }
    }

    pub fn validate(&self) -> NbarResult<()> {
        if self.block_size == 0 {
            return Err(NbarError::Config("Block size must be positive".to_string()));
        }
        if self.window.n_days == 0 {
            return Err(NbarError::Config("Processing window is empty".to_string()));
        }
        self.sensor.config().validate()
    }
}

/// Daily observations of one tile
#[derive(Debug, Clone)]
pub struct TileInputs {
    /// Reflectance [day, band, row, col]
    pub reflectance: MultiBandCube,
    /// Product QA flags [day, row, col], true = good retrieval
    pub qa: QualityMask,
    pub geometry: ViewGeometry,
}

impl TileInputs {
    fn block(&self, rows: Range<usize>, cols: Range<usize>) -> Self {
        let cut = |a: &Array3<f64>| a.slice(s![.., rows.clone(), cols.clone()]).to_owned();
        Self {
            reflectance: self.reflectance.slice(s![.., .., rows.clone(), cols.clone()]).to_owned(),
            qa: self.qa.slice(s![.., rows.clone(), cols.clone()]).to_owned(),
            geometry: ViewGeometry {
                vza: cut(&self.geometry.vza),
                sza: cut(&self.geometry.sza),
                raa: cut(&self.geometry.raa),
            },
        }
    }
}

/// Counts of per-band BRDF fit outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InversionStats {
    pub unconstrained: usize,
    pub constrained: usize,
    pub degenerate: usize,
}

impl InversionStats {
    pub fn record(&mut self, outcome: InversionOutcome) {
        match outcome {
            InversionOutcome::Unconstrained => self.unconstrained += 1,
            InversionOutcome::Constrained => self.constrained += 1,
            InversionOutcome::Degenerate { .. } => self.degenerate += 1,
        }
    }

    pub fn merge(&mut self, other: &InversionStats) {
        self.unconstrained += other.unconstrained;
        self.constrained += other.constrained;
        self.degenerate += other.degenerate;
    }

    pub fn total(&self) -> usize {
        self.unconstrained + self.constrained + self.degenerate
    }

    pub fn degenerate_fraction(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.degenerate as f64 / self.total() as f64
        }
    }
}

/// Products of one processed tile
#[derive(Debug, Clone)]
pub struct TileOutput {
    /// Isotropic-corrected observations [day, band, row, col], zero where unusable
    pub iso: MultiBandCube,
    /// BRDF fit RMSE [band, row, col]
    pub rmse: Array3<f64>,
    /// Smoothed daily reflectance [day, band, row, col]
    pub smoothed: MultiBandCube,
    pub uncertainty: Option<MultiBandCube>,
    /// Shared edge weights [day, row, col]
    pub weights: Array3<f64>,
    pub converged: Array2<bool>,
    pub step_score: Array2<f64>,
    pub stats: InversionStats,
}

impl TileOutput {
    fn empty(n_t: usize, n_bands: usize, rows: usize, cols: usize, with_uncertainty: bool) -> Self {
        Self {
            iso: Array4::zeros((n_t, n_bands, rows, cols)),
            rmse: Array3::zeros((n_bands, rows, cols)),
            smoothed: Array4::zeros((n_t, n_bands, rows, cols)),
            uncertainty: with_uncertainty.then(|| Array4::zeros((n_t, n_bands, rows, cols))),
            weights: Array3::ones((n_t, rows, cols)),
            converged: Array2::from_elem((rows, cols), false),
            step_score: Array2::zeros((rows, cols)),
            stats: InversionStats::default(),
        }
    }

    fn insert_correction(&mut self, block: BlockCorrection, r: Range<usize>, c: Range<usize>) {
        self.iso.slice_mut(s![.., .., r.clone(), c.clone()]).assign(&block.iso);
        self.rmse.slice_mut(s![.., r, c]).assign(&block.rmse);
        self.stats.merge(&block.stats);
    }

    fn insert_smoothing(&mut self, block: MultiBandSolution, r: Range<usize>, c: Range<usize>) {
        self.smoothed.slice_mut(s![.., .., r.clone(), c.clone()]).assign(&block.solution);
        if let (Some(full), Some(part)) = (self.uncertainty.as_mut(), block.uncertainty.as_ref()) {
            full.slice_mut(s![.., .., r.clone(), c.clone()]).assign(part);
        }
        self.weights.slice_mut(s![.., r.clone(), c.clone()]).assign(&block.weights);
        self.converged.slice_mut(s![r.clone(), c.clone()]).assign(&block.converged);
        self.step_score.slice_mut(s![r, c]).assign(&block.score);
    }
}

/// BRDF-corrected observations of one block
#[derive(Debug, Clone)]
pub struct BlockCorrection {
    /// [day, band, row, col], zero where unusable
    pub iso: MultiBandCube,
    /// [band, row, col]
    pub rmse: Array3<f64>,
    pub stats: InversionStats,
}

/// End-to-end processor for one sensor's daily tiles
pub struct TilePipeline {
    config: PipelineConfig,
    screener: QualityScreener,
    kernels: KernelModel,
    inverter: BrdfInverter,
    smoother: MultiBandSmoother,
}

impl TilePipeline {
    pub fn new(config: PipelineConfig) -> NbarResult<Self> {
        config.validate()?;
        let solver = EdgePreservingSolver::with_params(config.regularisation.clone(), config.edges.clone());
        Ok(Self {
            screener: QualityScreener::with_params(config.quality.clone()),
            kernels: KernelModel::with_params(config.kernels),
            inverter: BrdfInverter::with_params(config.brdf.clone()),
            smoother: MultiBandSmoother::with_solver(config.sensor.config(), solver)?,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Compositor onto this pipeline's daily window
    pub fn compositor(&self) -> DailyCompositor {
        DailyCompositor::new(self.config.window)
    }

    /// Process a whole tile block by block
    pub fn process(&self, inputs: &TileInputs) -> NbarResult<TileOutput> {
        let (n_t, n_bands, rows, cols) = inputs.reflectance.dim();
        check_dim("days", self.config.window.n_days, n_t)?;
        check_dim("bands", self.smoother.sensor().n_bands, n_bands)?;
        check_dim("QA flags", (n_t, rows, cols), inputs.qa.dim())?;
        inputs.geometry.validate((n_t, rows, cols))?;

        let blocks = self.blocks(rows, cols);
        log::info!(
            "Processing {} tile {}x{} from {} ({} days) in {} blocks",
            self.config.sensor,
            rows,
            cols,
            self.config.window.start,
            n_t,
            blocks.len()
        );

        let mut output = TileOutput::empty(n_t, n_bands, rows, cols, self.config.with_uncertainty);
        for (i, (r, c)) in blocks.iter().enumerate() {
            log::debug!("Correcting block {}: rows {:?}, cols {:?}", i, r, c);
            let block = self.correct_block(&inputs.block(r.clone(), c.clone()))?;
            output.insert_correction(block, r.clone(), c.clone());
        }

        // one alpha per band for the whole tile so block boundaries do not show
        let alphas = self.smoother.band_alphas(output.iso.view())?;
        log::info!("Smoothness alpha per band: {:?}", alphas);

        for (i, (r, c)) in blocks.into_iter().enumerate() {
            log::debug!("Smoothing block {}: rows {:?}, cols {:?}", i, r, c);
            let iso = output.iso.slice(s![.., .., r.clone(), c.clone()]);
            let smooth = self
                .smoother
                .smooth_with_alpha(iso, self.config.with_uncertainty, &alphas)?;
            output.insert_smoothing(smooth, r, c);
        }

        log::info!(
            "Tile done: {} band fits ({} constrained, {} degenerate)",
            output.stats.total(),
            output.stats.constrained,
            output.stats.degenerate
        );
        Ok(output)
    }

    /// Quality screening and BRDF correction of one block held in memory
    pub fn correct_block(&self, inputs: &TileInputs) -> NbarResult<BlockCorrection> {
        let sensor = self.smoother.sensor();
        let mask = self.screener.build_mask(&inputs.reflectance, &inputs.qa, sensor)?;
        let masked = self.screener.apply_mask(&inputs.reflectance, &mask)?;
        let kernels = self.kernels.kernel_cube(&inputs.geometry)?;

        let (iso, rmse, stats) = self.correct_brdf(&masked, &mask, &kernels)?;
        if stats.degenerate_fraction() > DEGENERATE_WARN_FRACTION {
            log::warn!(
                "{} of {} band fits degenerate; too few usable observations",
                stats.degenerate,
                stats.total()
            );
        }
        Ok(BlockCorrection { iso, rmse, stats })
    }

    /// Per-pixel BRDF inversion of a masked [day, band, row, col] cube
    pub fn correct_brdf(
        &self,
        masked: &MultiBandCube,
        mask: &QualityMask,
        kernels: &Array4<f64>,
    ) -> NbarResult<(MultiBandCube, Array3<f64>, InversionStats)> {
        let (n_t, n_bands, rows, cols) = masked.dim();
        check_dim("quality mask", (n_t, rows, cols), mask.dim())?;
        check_dim("kernel cube", (n_t, 3, rows, cols), kernels.dim())?;

        let coords: Vec<(usize, usize)> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .collect();

        let correct_pixel = |&(r, c): &(usize, usize)| -> NbarResult<(usize, usize, BrdfCorrection)> {
            let qa = mask.slice(s![.., r, c]);
            let refl = masked.slice(s![.., .., r, c]);
            let k = kernels.slice(s![.., .., r, c]).reversed_axes();
            self.inverter.correct(qa, refl, k).map(|out| (r, c, out))
        };

        #[cfg(feature = "parallel")]
        let results: NbarResult<Vec<_>> = {
            use rayon::prelude::*;
            coords.par_iter().map(correct_pixel).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let results: NbarResult<Vec<_>> = coords.iter().map(correct_pixel).collect();

        let mut iso = Array4::zeros((n_t, n_bands, rows, cols));
        let mut rmse = Array3::zeros((n_bands, rows, cols));
        let mut stats = InversionStats::default();
        for (r, c, out) in results? {
            iso.slice_mut(s![.., .., r, c]).assign(&out.iso);
            rmse.slice_mut(s![.., r, c]).assign(&out.band_rmse);
            for fit in &out.fits {
                stats.record(fit.outcome);
            }
        }

        log::debug!(
            "BRDF inversion of {} pixels: {} unconstrained, {} constrained, {} degenerate",
            rows * cols,
            stats.unconstrained,
            stats.constrained,
            stats.degenerate
        );
        Ok((iso, rmse, stats))
    }

    fn blocks(&self, rows: usize, cols: usize) -> Vec<(Range<usize>, Range<usize>)> {
        let size = self.config.block_size;
        let mut blocks = Vec::new();
        for r0 in (0..rows).step_by(size) {
            for c0 in (0..cols).step_by(size) {
                blocks.push((r0..(r0 + size).min(rows), c0..(c0 + size).min(cols)));
            }
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(n_days: usize) -> ProcessingWindow {
        ProcessingWindow::new(chrono::NaiveDate::from_ymd_opt(2019, 6, 1).unwrap(), n_days).unwrap()
    }

    #[test]
    fn test_blocks_cover_tile() {
        let mut config = PipelineConfig::new(Sensor::Olci, window(10));
        config.block_size = 4;
        let pipeline = TilePipeline::new(config).unwrap();
        let blocks = pipeline.blocks(10, 5);
        assert_eq!(blocks.len(), 6);
        let covered: usize = blocks.iter().map(|(r, c)| r.len() * c.len()).sum();
        assert_eq!(covered, 50);
        assert_eq!(blocks.last().unwrap(), &(8..10, 4..5));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let mut config = PipelineConfig::new(Sensor::Modis, window(10));
        config.block_size = 0;
        assert!(TilePipeline::new(config).is_err());
    }

    #[test]
    fn test_stats_fraction() {
        let mut stats = InversionStats::default();
        assert_eq!(stats.degenerate_fraction(), 0.0);
        stats.record(InversionOutcome::Unconstrained);
        stats.record(InversionOutcome::Degenerate { n_valid: 1 });
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.degenerate_fraction(), 0.5);
    }
}
