use crate::core::tdma;
use crate::types::{check_dim, NbarError, NbarResult};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};

/// Per-pixel tridiagonal normal equations of the weighted smoothing problem
///
/// For every pixel the system is the minimiser of
/// `sum_t I(t) (x_t - y_t)^2 + alpha * sum_t w_t (x_{t+1} - x_t)^2`,
/// i.e. `(I_obs + alpha * D^T W D) x = y` with `D` the first-difference
/// operator. The main diagonal is the smoothness term plus the observation
/// indicator, so it never falls below the smoothness term alone.
#[derive(Debug, Clone)]
pub struct BandedSystem {
    pub lower: Array3<f64>,
    pub diag: Array3<f64>,
    pub upper: Array3<f64>,
    pub rhs: Array3<f64>,
    indicator: Array3<f64>,
    alpha: f64,
}

impl BandedSystem {
    /// Unweighted system for a [time, row, col] series; positive values are observations
    pub fn from_observations(refl: ArrayView3<f64>, alpha: f64) -> NbarResult<Self> {
        let (n_t, rows, cols) = refl.dim();
        if n_t < 2 {
            return Err(NbarError::Config(format!(
                "Smoothing needs at least two time steps, got {}",
                n_t
            )));
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(NbarError::Config(format!("Invalid smoothness alpha: {}", alpha)));
        }

        let indicator = refl.mapv(|y| if y > 0.0 { 1.0 } else { 0.0 });
        let rhs = refl.mapv(|y| if y > 0.0 { y } else { 0.0 });

        let mut system = Self {
            lower: Array3::zeros((n_t - 1, rows, cols)),
            diag: Array3::zeros((n_t, rows, cols)),
            upper: Array3::zeros((n_t - 1, rows, cols)),
            rhs,
            indicator,
            alpha,
        };
        let ones = Array3::ones((n_t, rows, cols));
        system.reweight_all(ones.view())?;
        Ok(system)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.diag.dim()
    }

    /// Observation count per pixel
    pub fn n_obs(&self) -> Array2<f64> {
        self.indicator.sum_axis(Axis(0))
    }

    /// Rebuild every pixel's smoothness term with the weights `[time, row, col]`
    pub fn reweight_all(&mut self, weights: ArrayView3<f64>) -> NbarResult<usize> {
        let (_, rows, cols) = self.dim();
        let active = Array2::from_elem((rows, cols), true);
        self.reweight(weights, active.view())
    }

    /// Rebuild the smoothness term of the pixels flagged in `active`
    ///
    /// `weights[t]` scales the penalty on the step between `t` and `t + 1`;
    /// the last time slice is unused. Returns the number of rebuilt pixels.
    pub fn reweight(&mut self, weights: ArrayView3<f64>, active: ArrayView2<bool>) -> NbarResult<usize> {
        let (n_t, rows, cols) = self.dim();
        check_dim("weights", (n_t, rows, cols), weights.dim())?;
        check_dim("active pixels", (rows, cols), active.dim())?;

        let alpha = self.alpha;
        let zip = Zip::from(self.lower.lanes_mut(Axis(0)))
            .and(self.diag.lanes_mut(Axis(0)))
            .and(self.upper.lanes_mut(Axis(0)))
            .and(self.indicator.lanes(Axis(0)))
            .and(weights.lanes(Axis(0)))
            .and(&active);

        let rebuild = |a: ArrayViewMut1<f64>,
                       b: ArrayViewMut1<f64>,
                       c: ArrayViewMut1<f64>,
                       obs: ArrayView1<f64>,
                       w: ArrayView1<f64>,
                       &on: &bool| {
            if on {
                weighted_lane(alpha, w, obs, a, b, c);
            }
        };

        #[cfg(feature = "parallel")]
        {
            zip.par_for_each(rebuild);
        }
        #[cfg(not(feature = "parallel"))]
        {
            zip.for_each(rebuild);
        }

        Ok(active.iter().filter(|&&on| on).count())
    }

    /// Solve all pixel systems
    pub fn solve(&self) -> NbarResult<Array3<f64>> {
        tdma::solve_batched(self.lower.view(), self.diag.view(), self.upper.view(), self.rhs.view())
    }

    /// Inverse-operator diagonal for the interior time steps
    pub fn inverse_diagonal(&self, margin: usize) -> NbarResult<Array3<f64>> {
        tdma::inverse_diagonal(self.lower.view(), self.diag.view(), self.upper.view(), margin)
    }
}

/// Fill one pixel's bands from `alpha * D^T W D + diag(obs)`
fn weighted_lane(
    alpha: f64,
    w: ArrayView1<f64>,
    obs: ArrayView1<f64>,
    mut lower: ArrayViewMut1<f64>,
    mut diag: ArrayViewMut1<f64>,
    mut upper: ArrayViewMut1<f64>,
) {
    let n = diag.len();
    for t in 0..n {
        let mut s = 0.0;
        if t > 0 {
            s += w[t - 1];
        }
        if t + 1 < n {
            s += w[t];
        }
        diag[t] = alpha * s + obs[t];
    }
    for t in 0..n - 1 {
        lower[t] = -alpha * w[t];
        upper[t] = -alpha * w[t];
    }
}
