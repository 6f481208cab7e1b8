//! Edge-preserving temporal regularisation of a single band
//!
//! Each pixel's daily series is smoothed with a first-difference penalty whose
//! per-step strength is adapted over a few reweighting passes: steep changes in
//! the current solution lower the local weight so genuine steps are not smeared.
//! A robust step test then either confirms one sharp edge or leaves the
//! adapted weights as they are, and the series is solved one final time.

use crate::core::banded::BandedSystem;
use crate::core::edges::{EdgeRefinementParams, EdgeRefiner, StepTest};
use crate::types::{check_dim, BandCube, NbarError, NbarResult};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Which sign of change may relax the smoothness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDirection {
    /// Only drops (e.g. burn scars) form edges
    Decrease,
    /// Only rises form edges
    Increase,
    /// Any change may form an edge
    Both,
}

/// Regularisation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularisationParams {
    /// Multiplier on the mean observation count giving the smoothness alpha
    pub alpha_scale: f64,
    pub alpha_min: f64,
    pub alpha_max: f64,
    /// Gaussian weight temperature as a fraction of alpha
    pub temperature_factor: f64,
    /// Reweighting passes
    pub max_iterations: usize,
    /// Passes before convergence may be declared
    pub min_iterations: usize,
    /// Summed relative weight change below which a pixel has converged
    pub convergence_tolerance: f64,
    /// A weight below this marks a saturated edge and converges the pixel
    pub saturation_weight: f64,
    /// Smallest weight kept on any smoothness link
    pub weight_floor: f64,
    pub direction: StepDirection,
    /// Steps dropped at both ends of the uncertainty layer
    pub uncertainty_margin: usize,
}

impl Default for RegularisationParams {
    fn default() -> Self {
        Self {
            alpha_scale: 1.0,
            alpha_min: 20.0,
            alpha_max: 250.0,
            temperature_factor: 0.6,
            max_iterations: 5,
            min_iterations: 3,
            convergence_tolerance: 1e-2,
            saturation_weight: 0.1,
            weight_floor: 1e-6,
            direction: StepDirection::Decrease,
            uncertainty_margin: 20,
        }
    }
}

/// How the smoothness weights of a solve are obtained
#[derive(Debug, Clone, Copy)]
pub enum EdgeMode<'a> {
    /// Derive weights by iterative reweighting and the step test
    Derive,
    /// Use the supplied [time, row, col] weights as they are
    Fixed(ArrayView3<'a, f64>),
}

/// Result of smoothing one band
#[derive(Debug, Clone)]
pub struct BandSolution {
    /// Smoothed series [time, row, col]
    pub smoothed: BandCube,
    /// Smoothness weights used for the final solve
    pub weights: Array3<f64>,
    pub converged: Array2<bool>,
    /// Weight rebuilds per pixel, counting the rebuild after the step test;
    /// zero when weights were supplied
    pub iterations: Array2<usize>,
    /// Step test outcome; absent when weights were supplied
    pub step_test: Option<StepTest>,
    /// Inverse-operator diagonal, when requested
    pub inverse_diagonal: Option<Array3<f64>>,
    pub alpha: f64,
}

impl BandSolution {
    /// Step-test score map, zero when weights were supplied
    pub fn step_score(&self) -> Array2<f64> {
        match &self.step_test {
            Some(test) => test.score.clone(),
            None => Array2::zeros(self.converged.dim()),
        }
    }
}

/// Edge-preserving single-band smoother
pub struct EdgePreservingSolver {
    params: RegularisationParams,
    refiner: EdgeRefiner,
}

impl EdgePreservingSolver {
    pub fn new() -> Self {
        Self::with_params(RegularisationParams::default(), EdgeRefinementParams::default())
    }

    pub fn with_params(params: RegularisationParams, edge_params: EdgeRefinementParams) -> Self {
        Self {
            params,
            refiner: EdgeRefiner::with_params(edge_params),
        }
    }

    pub fn params(&self) -> &RegularisationParams {
        &self.params
    }

    /// Copy of this solver constrained to another step direction
    pub fn with_direction(&self, direction: StepDirection) -> Self {
        let mut params = self.params.clone();
        params.direction = direction;
        Self::with_params(params, self.refiner.params().clone())
    }

    /// Smoothness alpha from the tile's mean observation count
    pub fn alpha_for(&self, n_obs: &Array2<f64>) -> NbarResult<f64> {
        let mean = n_obs.mean().ok_or_else(|| {
            NbarError::Config("Cannot smooth a tile with no pixels".to_string())
        })?;
        Ok((self.params.alpha_scale * mean).clamp(self.params.alpha_min, self.params.alpha_max))
    }

    /// Smooth one band [time, row, col]; positive values are observations
    ///
    /// Alpha comes from the mean observation count of `refl` itself.
    pub fn solve_band(
        &self,
        refl: ArrayView3<f64>,
        mode: EdgeMode<'_>,
        with_uncertainty: bool,
    ) -> NbarResult<BandSolution> {
        let alpha = self.alpha_for(&observation_counts(refl))?;
        self.solve_band_with_alpha(refl, mode, with_uncertainty, alpha)
    }

    /// Smooth one band with a given alpha, e.g. one computed over a whole tile
    /// when `refl` is only a block of it
    pub fn solve_band_with_alpha(
        &self,
        refl: ArrayView3<f64>,
        mode: EdgeMode<'_>,
        with_uncertainty: bool,
        alpha: f64,
    ) -> NbarResult<BandSolution> {
        let (n_t, rows, cols) = refl.dim();
        if self.params.min_iterations > self.params.max_iterations {
            return Err(NbarError::Config(format!(
                "min_iterations {} exceeds max_iterations {}",
                self.params.min_iterations, self.params.max_iterations
            )));
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(NbarError::Config(format!("Invalid smoothness alpha {}", alpha)));
        }

        let n_obs = observation_counts(refl);
        let mut system = BandedSystem::from_observations(refl, alpha)?;

        let (weights, converged, iterations, step_test) = match mode {
            EdgeMode::Derive => {
                log::info!(
                    "Edge-preserving solve of {}x{}x{} series (alpha = {:.1}, direction {:?})",
                    n_t,
                    rows,
                    cols,
                    alpha,
                    self.params.direction
                );
                let (mut weights, converged, mut iterations) = self.reweight(&mut system, &n_obs)?;
                let test = self.refiner.refine(&mut weights, refl)?;
                // every pixel is rebuilt once more with the refined weights
                iterations.mapv_inplace(|n| n + 1);
                (weights, converged, iterations, Some(test))
            }
            EdgeMode::Fixed(w) => {
                check_dim("supplied weights", (n_t, rows, cols), w.dim())?;
                log::debug!("Solving {}x{}x{} series with supplied weights", n_t, rows, cols);
                (
                    w.to_owned(),
                    Array2::from_elem((rows, cols), true),
                    Array2::zeros((rows, cols)),
                    None,
                )
            }
        };

        system.reweight_all(weights.view())?;
        let mut smoothed = system.solve()?;
        zero_empty_pixels(&mut smoothed, &n_obs);

        let inverse_diagonal = if with_uncertainty {
            let mut inv = system.inverse_diagonal(self.params.uncertainty_margin)?;
            zero_empty_pixels(&mut inv, &n_obs);
            Some(inv)
        } else {
            None
        };

        Ok(BandSolution {
            smoothed,
            weights,
            converged,
            iterations,
            step_test,
            inverse_diagonal,
            alpha,
        })
    }

    /// Iteratively adapt the weights; returns (weights, converged, iterations)
    fn reweight(
        &self,
        system: &mut BandedSystem,
        n_obs: &Array2<f64>,
    ) -> NbarResult<(Array3<f64>, Array2<bool>, Array2<usize>)> {
        let (_, rows, cols) = system.dim();
        let alpha = system.alpha();
        let temperature = self.params.temperature_factor * alpha;

        let mut x = system.solve()?;
        zero_empty_pixels(&mut x, n_obs);

        let mut converged = Array2::from_elem((rows, cols), false);
        let mut iterations = Array2::<usize>::zeros((rows, cols));
        let mut prev: Option<Array3<f64>> = None;

        for i in 0..self.params.max_iterations {
            let w = self.edge_weights(x.view(), n_obs, alpha, temperature);

            let active = converged.mapv(|c| !c);
            system.reweight(w.view(), active.view())?;
            Zip::from(&mut iterations).and(&active).for_each(|n, &on| {
                if on {
                    *n += 1;
                }
            });

            x = system.solve()?;
            zero_empty_pixels(&mut x, n_obs);

            if i >= self.params.min_iterations {
                if let Some(prev) = &prev {
                    self.update_convergence(&mut converged, w.view(), prev.view());
                }
            }
            log::debug!(
                "Reweighting pass {}: {} of {} pixels converged",
                i + 1,
                converged.iter().filter(|&&c| c).count(),
                rows * cols
            );
            prev = Some(w);
        }

        let weights = match prev {
            Some(w) => w,
            None => self.edge_weights(x.view(), n_obs, alpha, temperature),
        };
        Ok((weights, converged, iterations))
    }

    /// Gaussian edge weights from the scaled time gradient of `x`
    pub fn edge_weights(
        &self,
        x: ArrayView3<f64>,
        n_obs: &Array2<f64>,
        alpha: f64,
        temperature: f64,
    ) -> Array3<f64> {
        let mut w = Array3::zeros(x.dim());
        let params = &self.params;
        let zip = Zip::from(w.lanes_mut(Axis(0)))
            .and(x.lanes(Axis(0)))
            .and(n_obs);

        let weigh = |w: ArrayViewMut1<f64>, x: ArrayView1<f64>, &n: &f64| {
            weight_lane(params, w, x, n, alpha, temperature);
        };

        #[cfg(feature = "parallel")]
        {
            zip.par_for_each(weigh);
        }
        #[cfg(not(feature = "parallel"))]
        {
            zip.for_each(weigh);
        }
        w
    }

    fn update_convergence(&self, converged: &mut Array2<bool>, w: ArrayView3<f64>, prev: ArrayView3<f64>) {
        let tol = self.params.convergence_tolerance;
        let saturation = self.params.saturation_weight;
        Zip::from(converged)
            .and(w.lanes(Axis(0)))
            .and(prev.lanes(Axis(0)))
            .for_each(|c, w, prev| {
                if *c {
                    return;
                }
                let change: f64 = w
                    .iter()
                    .zip(prev.iter())
                    .map(|(a, b)| ((a - b) / b).abs())
                    .sum::<f64>()
                    + 1e-6;
                let saturated = w.iter().any(|&v| v < saturation);
                *c = change < tol || saturated;
            });
    }
}

impl Default for EdgePreservingSolver {
    fn default() -> Self {
        Self::new()
    }
}

fn weight_lane(
    params: &RegularisationParams,
    mut w: ArrayViewMut1<f64>,
    x: ArrayView1<f64>,
    n_obs: f64,
    alpha: f64,
    temperature: f64,
) {
    if n_obs <= 0.0 {
        w.fill(1.0);
        return;
    }

    let n = x.len();
    let scale = alpha * alpha;
    for t in 0..n {
        // central differences inside, one-sided at the ends
        let g = if n < 2 {
            0.0
        } else if t == 0 {
            x[1] - x[0]
        } else if t == n - 1 {
            x[n - 1] - x[n - 2]
        } else {
            0.5 * (x[t + 1] - x[t - 1])
        };
        let g = match params.direction {
            StepDirection::Decrease => g.min(0.0),
            StepDirection::Increase => g.max(0.0),
            StepDirection::Both => g,
        } * scale;
        w[t] = (-g * g / temperature).exp();
    }

    let rescale = n_obs / w.sum();
    w.mapv_inplace(|v| {
        let v = v * rescale;
        if v.is_nan() {
            1.0
        } else {
            v.clamp(params.weight_floor, 1.0)
        }
    });
}

/// Positive samples per pixel of a [time, row, col] cube
fn observation_counts(refl: ArrayView3<f64>) -> Array2<f64> {
    refl.fold_axis(Axis(0), 0.0, |&n, &y| if y > 0.0 { n + 1.0 } else { n })
}

fn zero_empty_pixels(cube: &mut Array3<f64>, n_obs: &Array2<f64>) {
    Zip::from(cube.lanes_mut(Axis(0))).and(n_obs).for_each(|mut lane, &n| {
        if n <= 0.0 {
            lane.fill(0.0);
        }
    });
}
