//! Per-band BRDF inversion and isotropic correction
//!
//! Reflectance is modelled as `k_iso * f_iso + k_vol * f_vol + k_geo * f_geo`.
//! The fit is an ordinary least-squares solve; physically implausible
//! coefficients trigger a box-constrained re-solve. The corrected series keeps
//! only the isotropic part of each observation by subtracting the fitted
//! volumetric and geometric contributions.

use crate::types::{check_dim, NbarResult};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Number of kernel coefficients (isotropic, volumetric, geometric)
pub const N_KERNELS: usize = 3;

/// BRDF inversion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrdfParams {
    /// Lower bound applied to every coefficient
    pub lower_bound: f64,
    /// Upper bound applied to every coefficient
    pub upper_bound: f64,
    /// Minimum valid observations for a determined fit
    pub min_samples: usize,
}

impl Default for BrdfParams {
    fn default() -> Self {
        Self {
            lower_bound: 0.0,
            upper_bound: 0.6,
            min_samples: N_KERNELS,
        }
    }
}

/// How a band's fit was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InversionOutcome {
    /// Ordinary least squares within bounds
    Unconstrained,
    /// Ordinary solution violated the bounds; bounded re-solve used
    Constrained,
    /// Too few valid samples or no solution; band substituted with zeros
    Degenerate { n_valid: usize },
}

impl InversionOutcome {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, InversionOutcome::Degenerate { .. })
    }
}

/// Fitted kernel weights for one band
#[derive(Debug, Clone, PartialEq)]
pub struct BandFit {
    pub coefficients: [f64; N_KERNELS],
    pub rmse: f64,
    pub n_valid: usize,
    pub outcome: InversionOutcome,
}

impl BandFit {
    fn degenerate(n_valid: usize) -> Self {
        Self {
            coefficients: [0.0; N_KERNELS],
            rmse: 0.0,
            n_valid,
            outcome: InversionOutcome::Degenerate { n_valid },
        }
    }
}

/// Isotropic-corrected observations of one pixel
#[derive(Debug, Clone)]
pub struct BrdfCorrection {
    /// Isotropic reflectance [nObs, nBands], zero where unusable
    pub iso: Array2<f64>,
    /// Fit RMSE per band
    pub band_rmse: Array1<f64>,
    pub fits: Vec<BandFit>,
}

impl BrdfCorrection {
    pub fn n_degenerate(&self) -> usize {
        self.fits.iter().filter(|f| f.outcome.is_degenerate()).count()
    }
}

/// Linear kernel-model inverter
#[derive(Debug, Clone, Default)]
pub struct BrdfInverter {
    params: BrdfParams,
}

impl BrdfInverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: BrdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BrdfParams {
        &self.params
    }

    /// Correct every band of one pixel's observation sequence
    ///
    /// * `qa` - usable-observation flags [nObs]
    /// * `refl` - reflectance [nObs, nBands]
    /// * `kernels` - kernel matrix [3, nObs]
    pub fn correct(
        &self,
        qa: ArrayView1<bool>,
        refl: ArrayView2<f64>,
        kernels: ArrayView2<f64>,
    ) -> NbarResult<BrdfCorrection> {
        let (n_obs, n_bands) = refl.dim();
        check_dim("QA flags", n_obs, qa.len())?;
        check_dim("kernel matrix", (N_KERNELS, n_obs), kernels.dim())?;

        let mut iso = Array2::zeros((n_obs, n_bands));
        let mut band_rmse = Array1::zeros(n_bands);
        let mut fits = Vec::with_capacity(n_bands);

        for (band, y_all) in refl.axis_iter(Axis(1)).enumerate() {
            let valid: Vec<usize> = (0..n_obs).filter(|&i| qa[i] && y_all[i] > 0.0).collect();

            let k = DMatrix::from_fn(valid.len(), N_KERNELS, |r, c| kernels[[c, valid[r]]]);
            let y = DVector::from_iterator(valid.len(), valid.iter().map(|&i| y_all[i]));

            let fit = self.fit_band(&k, &y);
            if !fit.outcome.is_degenerate() {
                for (row, &i) in valid.iter().enumerate() {
                    let anisotropic =
                        k[(row, 1)] * fit.coefficients[1] + k[(row, 2)] * fit.coefficients[2];
                    iso[[i, band]] = y[row] - anisotropic;
                }
                band_rmse[band] = fit.rmse;
            }
            fits.push(fit);
        }

        Ok(BrdfCorrection { iso, band_rmse, fits })
    }

    /// Fit the kernel weights for one band's valid samples
    pub fn fit_band(&self, k: &DMatrix<f64>, y: &DVector<f64>) -> BandFit {
        let n_valid = y.len();
        if n_valid < self.params.min_samples.max(N_KERNELS) {
            return BandFit::degenerate(n_valid);
        }

        let (x, outcome) = match least_squares(k, y) {
            Some(x) if self.within_bounds(&x) => (x, InversionOutcome::Unconstrained),
            Some(_) => match self.bounded_least_squares(k, y) {
                Some(x) => (x, InversionOutcome::Constrained),
                None => return BandFit::degenerate(n_valid),
            },
            None => return BandFit::degenerate(n_valid),
        };

        let residual = k * &x - y;
        let rmse = (residual.norm_squared() / n_valid as f64).sqrt();

        BandFit {
            coefficients: [x[0], x[1], x[2]],
            rmse,
            n_valid,
            outcome,
        }
    }

    fn within_bounds(&self, x: &DVector<f64>) -> bool {
        x.iter()
            .all(|&v| v >= self.params.lower_bound && v <= self.params.upper_bound)
    }

    /// Box-constrained least squares by active-set enumeration
    ///
    /// With three coefficients every combination of (free, at lower, at upper)
    /// is enumerated; the feasible candidate with the smallest residual is the
    /// global optimum of the convex problem.
    fn bounded_least_squares(&self, k: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
        let (lo, hi) = (self.params.lower_bound, self.params.upper_bound);
        let tol = 1e-12 * (hi - lo).abs().max(1.0);
        let mut best: Option<(f64, DVector<f64>)> = None;

        for code in 0..3usize.pow(N_KERNELS as u32) {
            // 0 = free, 1 = lower bound, 2 = upper bound
            let states: Vec<usize> = (0..N_KERNELS).map(|j| (code / 3usize.pow(j as u32)) % 3).collect();
            let free: Vec<usize> = (0..N_KERNELS).filter(|&j| states[j] == 0).collect();

            let mut x = DVector::zeros(N_KERNELS);
            for j in 0..N_KERNELS {
                x[j] = match states[j] {
                    1 => lo,
                    2 => hi,
                    _ => 0.0,
                };
            }

            if !free.is_empty() {
                let target = y - k * &x;
                let k_free = DMatrix::from_fn(k.nrows(), free.len(), |r, c| k[(r, free[c])]);
                let x_free = least_squares(&k_free, &target)?;
                if x_free.iter().any(|&v| v < lo - tol || v > hi + tol) {
                    continue;
                }
                for (c, &j) in free.iter().enumerate() {
                    x[j] = x_free[c].clamp(lo, hi);
                }
            }

            let cost = (k * &x - y).norm_squared();
            if best.as_ref().map_or(true, |(c, _)| cost < *c) {
                best = Some((cost, x));
            }
        }

        best.map(|(_, x)| x)
    }
}

/// Minimum-norm least-squares solution via SVD
fn least_squares(k: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = k.clone().svd(true, true);
    svd.solve(y, 1e-12).ok()
}
