//! Multi-band edge-preserving smoothing with shared edge weights
//!
//! Edges are derived on the sensor's reference bands only. With two references
//! each pixel adopts the edge field of the band with the stronger step score,
//! the other band's field is reset to all-ones there, and the element-wise
//! minimum becomes the shared field. Every band is then re-solved with it.

use crate::core::regularise::{BandSolution, EdgeMode, EdgePreservingSolver};
use crate::types::{check_dim, MultiBandCube, NbarError, NbarResult, SensorConfig};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

/// Smoothed multi-band tile
#[derive(Debug, Clone)]
pub struct MultiBandSolution {
    /// [time, band, row, col]
    pub solution: MultiBandCube,
    /// Per-band variance scaling of the inverse-operator diagonal, when requested
    pub uncertainty: Option<MultiBandCube>,
    /// Shared edge weights [time, row, col]
    pub weights: Array3<f64>,
    /// Position in the sensor's reference band list whose edges each pixel adopted
    pub selected: Array2<usize>,
    /// Step score of the adopted reference band
    pub score: Array2<f64>,
    /// All reference-band reweighting loops converged
    pub converged: Array2<bool>,
    /// Reference-band solves keyed by band index
    pub references: Vec<(usize, BandSolution)>,
}

/// Shares edge weights across the bands of one sensor
pub struct MultiBandSmoother {
    sensor: SensorConfig,
    solver: EdgePreservingSolver,
}

impl MultiBandSmoother {
    pub fn new(sensor: SensorConfig) -> NbarResult<Self> {
        Self::with_solver(sensor, EdgePreservingSolver::new())
    }

    pub fn with_solver(sensor: SensorConfig, solver: EdgePreservingSolver) -> NbarResult<Self> {
        sensor.validate()?;
        Ok(Self { sensor, solver })
    }

    pub fn sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    /// Per-band smoothness alpha from the observation counts of `iso`
    pub fn band_alphas(&self, iso: ArrayView4<f64>) -> NbarResult<Vec<f64>> {
        check_dim("band count", self.sensor.n_bands, iso.len_of(Axis(1)))?;
        iso.axis_iter(Axis(1))
            .map(|band| {
                let n_obs = band.fold_axis(Axis(0), 0.0, |&n, &y| if y > 0.0 { n + 1.0 } else { n });
                self.solver.alpha_for(&n_obs)
            })
            .collect()
    }

    /// Smooth an isotropic [time, band, row, col] cube
    pub fn smooth(&self, iso: ArrayView4<f64>, with_uncertainty: bool) -> NbarResult<MultiBandSolution> {
        let alphas = self.band_alphas(iso)?;
        self.smooth_with_alpha(iso, with_uncertainty, &alphas)
    }

    /// Smooth with one given alpha per band
    ///
    /// Lets a block of a larger tile be smoothed exactly as the whole tile would be.
    pub fn smooth_with_alpha(
        &self,
        iso: ArrayView4<f64>,
        with_uncertainty: bool,
        alphas: &[f64],
    ) -> NbarResult<MultiBandSolution> {
        let (n_t, n_bands, rows, cols) = iso.dim();
        check_dim("band count", self.sensor.n_bands, n_bands)?;
        check_dim("band alphas", n_bands, alphas.len())?;
        log::info!(
            "Smoothing {} tile: {} days, {} bands, {}x{} pixels, reference bands {:?}",
            self.sensor.name,
            n_t,
            n_bands,
            rows,
            cols,
            self.sensor.reference_bands
        );

        let mut references = Vec::with_capacity(self.sensor.reference_bands.len());
        for &band in &self.sensor.reference_bands {
            let unc = with_uncertainty && band == self.sensor.uncertainty_band;
            log::debug!("Deriving edges on reference band {}", band);
            let solution = self.solver.solve_band_with_alpha(
                iso.index_axis(Axis(1), band),
                EdgeMode::Derive,
                unc,
                alphas[band],
            )?;
            references.push((band, solution));
        }

        let (weights, selected, score) = match references.as_slice() {
            [(_, only)] => (
                only.weights.clone(),
                Array2::zeros((rows, cols)),
                only.step_score(),
            ),
            [(_, first), (_, second)] => {
                let first_score = first.step_score();
                let second_score = second.step_score();
                let (weights, selected) = share_weights(
                    first.weights.view(),
                    first_score.view(),
                    second.weights.view(),
                    second_score.view(),
                )?;
                let mut score = first_score;
                Zip::from(&mut score)
                    .and(&second_score)
                    .and(&selected)
                    .for_each(|s, &b, &sel| {
                        if sel == 1 {
                            *s = b;
                        }
                    });
                (weights, selected, score)
            }
            _ => {
                return Err(NbarError::Config(format!(
                    "{}: expected one or two reference bands",
                    self.sensor.name
                )))
            }
        };

        let mut converged = Array2::from_elem((rows, cols), true);
        for (_, reference) in &references {
            Zip::from(&mut converged)
                .and(&reference.converged)
                .for_each(|c, &r| *c = *c && r);
        }

        let mut solution = Array4::zeros((n_t, n_bands, rows, cols));
        for band in 0..n_bands {
            let fixed = self.solver.solve_band_with_alpha(
                iso.index_axis(Axis(1), band),
                EdgeMode::Fixed(weights.view()),
                false,
                alphas[band],
            )?;
            solution.index_axis_mut(Axis(1), band).assign(&fixed.smoothed);
        }

        let uncertainty = if with_uncertainty {
            let inv = references
                .iter()
                .find(|(band, _)| *band == self.sensor.uncertainty_band)
                .and_then(|(_, s)| s.inverse_diagonal.as_ref())
                .ok_or_else(|| {
                    NbarError::Processing(format!(
                        "No inverse diagonal from uncertainty band {}",
                        self.sensor.uncertainty_band
                    ))
                })?;
            Some(self.scale_uncertainty(inv.view()))
        } else {
            None
        };

        let n_edges = score.iter().filter(|&&s| s > 1.0).count();
        log::info!(
            "{} smoothing done: {} of {} pixels with a strong step score",
            self.sensor.name,
            n_edges,
            rows * cols
        );

        Ok(MultiBandSolution {
            solution,
            uncertainty,
            weights,
            selected,
            score,
            converged,
            references,
        })
    }

    fn scale_uncertainty(&self, inv: ArrayView3<f64>) -> MultiBandCube {
        let (n_t, rows, cols) = inv.dim();
        let mut out = Array4::zeros((n_t, self.sensor.n_bands, rows, cols));
        for (band, &variance) in self.sensor.obs_variance.iter().enumerate() {
            out.index_axis_mut(Axis(1), band).assign(&(&inv * variance));
        }
        out
    }
}

/// Combine two reference edge fields into one
///
/// Each pixel adopts the field with the higher score (ties go to the first);
/// the other field is treated as edge-free there and the element-wise minimum
/// is returned together with the index (0 or 1) of the adopted field.
pub fn share_weights(
    first: ArrayView3<f64>,
    first_score: ArrayView2<f64>,
    second: ArrayView3<f64>,
    second_score: ArrayView2<f64>,
) -> NbarResult<(Array3<f64>, Array2<usize>)> {
    let (n_t, rows, cols) = first.dim();
    check_dim("second reference weights", (n_t, rows, cols), second.dim())?;
    check_dim("first reference score", (rows, cols), first_score.dim())?;
    check_dim("second reference score", (rows, cols), second_score.dim())?;

    let mut shared = Array3::ones((n_t, rows, cols));
    let mut selected = Array2::zeros((rows, cols));

    Zip::from(shared.lanes_mut(Axis(0)))
        .and(&mut selected)
        .and(first.lanes(Axis(0)))
        .and(second.lanes(Axis(0)))
        .and(&first_score)
        .and(&second_score)
        .for_each(|mut out, sel, a, b, &sa, &sb| {
            let adopted = if sb > sa {
                *sel = 1;
                b
            } else {
                a
            };
            // the other field is all-ones here, so the minimum is the adopted field clipped at 1
            out.zip_mut_with(&adopted, |o: &mut f64, &w: &f64| *o = o.min(w));
        });

    Ok((shared, selected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sensor;
    use ndarray::array;

    #[test]
    fn test_share_weights_adopts_stronger_band() {
        let first = array![[[0.5, 1.0]], [[1.0, 0.3]]];
        let second = array![[[0.2, 0.9]], [[1.0, 1.0]]];
        let first_score = array![[0.4, 3.0]];
        let second_score = array![[2.0, 3.0]];

        let (w, sel) = share_weights(first.view(), first_score.view(), second.view(), second_score.view()).unwrap();
        assert_eq!(sel, array![[1, 0]]);
        // pixel 0 takes the second field, pixel 1 keeps the first on a tie
        assert_eq!(w[[0, 0, 0]], 0.2);
        assert_eq!(w[[1, 0, 0]], 1.0);
        assert_eq!(w[[0, 0, 1]], 1.0);
        assert_eq!(w[[1, 0, 1]], 0.3);
    }

    #[test]
    fn test_share_weights_never_exceeds_one() {
        let first = array![[[1.7, 0.4]], [[f64::MIN_POSITIVE, 1.0]]];
        let second = array![[[1.0, 2.5]], [[1.0, 0.05]]];
        let (w, sel) = share_weights(
            first.view(),
            array![[1.0, 0.0]].view(),
            second.view(),
            array![[0.5, 1.5]].view(),
        )
        .unwrap();
        assert_eq!(sel, array![[0, 1]]);
        assert_eq!(w, array![[[1.0, 1.0]], [[f64::MIN_POSITIVE, 0.05]]]);
    }

    #[test]
    fn test_band_alphas_follow_each_band() {
        let smoother = MultiBandSmoother::new(Sensor::Olci.config()).unwrap();
        let mut iso = Array4::from_elem((120, 4, 1, 2), 0.2);
        // band 1 observed on every fourth day only
        for t in 0..120 {
            if t % 4 != 0 {
                iso[[t, 1, 0, 0]] = 0.0;
                iso[[t, 1, 0, 1]] = 0.0;
            }
        }
        iso.index_axis_mut(Axis(1), 2).fill(0.0);
        let alphas = smoother.band_alphas(iso.view()).unwrap();
        assert_eq!(alphas, vec![120.0, 30.0, 20.0, 120.0]);

        assert!(matches!(
            smoother.smooth_with_alpha(iso.view(), false, &alphas[..3]),
            Err(NbarError::ShapeMismatch { .. })
        ));
        let out = smoother.smooth_with_alpha(iso.view(), false, &alphas).unwrap();
        assert_eq!(out.references[0].1.alpha, 120.0);
    }

    #[test]
    fn test_wrong_band_count_fails() {
        let smoother = MultiBandSmoother::new(Sensor::Olci.config()).unwrap();
        let iso = Array4::from_elem((10, 3, 1, 1), 0.2);
        assert!(matches!(
            smoother.smooth(iso.view(), false),
            Err(NbarError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_sensor_rejected() {
        let mut sensor = Sensor::Modis.config();
        sensor.obs_variance.pop();
        assert!(MultiBandSmoother::new(sensor).is_err());
    }
}
