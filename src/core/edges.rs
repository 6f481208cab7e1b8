//! Step confirmation for edge-preserving smoothing
//!
//! After reweighting, the most relaxed smoothness link inside a central search
//! window is a step candidate. The observations immediately before and after
//! it are compared with a robust z-score: the change in medians divided by
//! the summed scaled median absolute deviations. Confirmed steps get a single
//! sharp edge; everything else is smoothed fully.

use crate::types::{check_dim, NbarResult};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Step search and test parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRefinementParams {
    /// First time index searched for the minimum weight
    pub search_start: usize,
    /// Last time index searched (inclusive)
    pub search_end: usize,
    /// Samples taken on each side of the candidate
    pub half_window: usize,
    /// Valid samples required on each side
    pub min_support: usize,
    /// MAD to standard deviation factor
    pub mad_scale: f64,
    /// Scores above this confirm a step
    pub score_threshold: f64,
    /// Weight placed on a confirmed step
    pub edge_weight: f64,
}

impl Default for EdgeRefinementParams {
    fn default() -> Self {
        Self {
            search_start: 30,
            search_end: 60,
            half_window: 16,
            min_support: 4,
            mad_scale: 1.426,
            score_threshold: 1.0,
            edge_weight: 0.01,
        }
    }
}

/// Per-pixel outcome of the step test
#[derive(Debug, Clone)]
pub struct StepTest {
    /// Robust step score, 0 where the test could not be made
    pub score: Array2<f64>,
    /// Time index of the step candidate
    pub index: Array2<usize>,
    /// Enough valid samples on both sides of the candidate
    pub supported: Array2<bool>,
    /// Step confirmed and weights rewritten
    pub confirmed: Array2<bool>,
}

impl StepTest {
    fn empty(rows: usize, cols: usize) -> Self {
        Self {
            score: Array2::zeros((rows, cols)),
            index: Array2::zeros((rows, cols)),
            supported: Array2::from_elem((rows, cols), false),
            confirmed: Array2::from_elem((rows, cols), false),
        }
    }
}

pub struct EdgeRefiner {
    params: EdgeRefinementParams,
}

impl EdgeRefiner {
    pub fn new() -> Self {
        Self {
            params: EdgeRefinementParams::default(),
        }
    }

    pub fn with_params(params: EdgeRefinementParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EdgeRefinementParams {
        &self.params
    }

    /// Inclusive candidate range for a series of `n_t` steps
    ///
    /// The configured window is narrowed so that a full half-window of
    /// samples fits on both sides; `None` when nothing remains.
    pub fn search_range(&self, n_t: usize) -> Option<(usize, usize)> {
        let hw = self.params.half_window;
        if n_t < 2 * hw + 1 {
            return None;
        }
        let lo = self.params.search_start.max(hw);
        let hi = self.params.search_end.min(n_t - hw - 1);
        (lo <= hi).then_some((lo, hi))
    }

    /// Test each pixel for a step and rewrite the weights where one is confirmed
    ///
    /// Pixels without a confirmed step keep their weights untouched.
    pub fn refine(&self, weights: &mut Array3<f64>, refl: ArrayView3<f64>) -> NbarResult<StepTest> {
        let (n_t, rows, cols) = refl.dim();
        check_dim("weights", (n_t, rows, cols), weights.dim())?;

        let mut test = StepTest::empty(rows, cols);
        let Some((lo, hi)) = self.search_range(n_t) else {
            log::warn!(
                "Series of {} steps is too short for a {}-sample step test; skipping edge refinement",
                n_t,
                self.params.half_window
            );
            return Ok(test);
        };

        let params = &self.params;
        let zip = Zip::from(weights.lanes_mut(Axis(0)))
            .and(refl.lanes(Axis(0)))
            .and(&mut test.score)
            .and(&mut test.index)
            .and(&mut test.supported)
            .and(&mut test.confirmed);

        let refine_pixel = |w: ArrayViewMut1<f64>,
                            y: ArrayView1<f64>,
                            score: &mut f64,
                            index: &mut usize,
                            supported: &mut bool,
                            confirmed: &mut bool| {
            let outcome = test_pixel(params, w, y, lo, hi);
            *score = outcome.score;
            *index = outcome.index;
            *supported = outcome.supported;
            *confirmed = outcome.confirmed;
        };

        #[cfg(feature = "parallel")]
        {
            zip.par_for_each(refine_pixel);
        }
        #[cfg(not(feature = "parallel"))]
        {
            zip.for_each(refine_pixel);
        }

        let n_confirmed = test.confirmed.iter().filter(|&&c| c).count();
        log::debug!(
            "Step test over indices {}..={}: {} of {} pixels confirmed",
            lo,
            hi,
            n_confirmed,
            rows * cols
        );
        Ok(test)
    }
}

impl Default for EdgeRefiner {
    fn default() -> Self {
        Self::new()
    }
}

struct PixelOutcome {
    score: f64,
    index: usize,
    supported: bool,
    confirmed: bool,
}

fn test_pixel(
    params: &EdgeRefinementParams,
    mut w: ArrayViewMut1<f64>,
    y: ArrayView1<f64>,
    lo: usize,
    hi: usize,
) -> PixelOutcome {
    let mut idx = lo;
    for t in lo..=hi {
        if w[t] < w[idx] || w[idx].is_nan() {
            idx = t;
        }
    }

    let hw = params.half_window;
    let pre: Vec<f64> = y.slice(ndarray::s![idx - hw..idx]).iter().copied().filter(|&v| v > 0.0).collect();
    let post: Vec<f64> = y
        .slice(ndarray::s![idx + 1..idx + 1 + hw])
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .collect();

    let supported = pre.len() >= params.min_support && post.len() >= params.min_support;
    if !supported {
        return PixelOutcome {
            score: 0.0,
            index: idx,
            supported,
            confirmed: false,
        };
    }

    let score = robust_step_score(&pre, &post, params.mad_scale);
    let confirmed = score > params.score_threshold;
    if confirmed {
        w.fill(1.0);
        w[idx] = params.edge_weight;
    }

    PixelOutcome {
        score,
        index: idx,
        supported,
        confirmed,
    }
}

/// Robust z-score of the change between two samples
///
/// `|median(post) - median(pre)| / (k * MAD(pre) + k * MAD(post))`. A change
/// between two noiseless plateaus scores infinity; no change scores 0.
pub fn robust_step_score(pre: &[f64], post: &[f64], mad_scale: f64) -> f64 {
    let med_pre = median(pre);
    let med_post = median(post);
    let change = (med_post - med_pre).abs();
    let spread = mad_scale * mad(pre, med_pre) + mad_scale * mad(post, med_post);

    if change == 0.0 || change.is_nan() {
        0.0
    } else if spread == 0.0 {
        f64::INFINITY
    } else {
        change / spread
    }
}

/// Median of a sample; NaN when empty
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        0.5 * (sorted[mid - 1] + sorted[mid])
    }
}

fn mad(values: &[f64], center: f64) -> f64 {
    let dev: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_step_score_plateaus() {
        let pre = vec![0.3; 16];
        let post = vec![0.1; 16];
        assert_eq!(robust_step_score(&pre, &post, 1.426), f64::INFINITY);
        assert_eq!(robust_step_score(&pre, &pre, 1.426), 0.0);
    }

    #[test]
    fn test_step_score_noisy_no_change() {
        let pre = [0.20, 0.22, 0.18, 0.21, 0.19];
        let post = [0.21, 0.19, 0.20, 0.22, 0.18];
        assert!(robust_step_score(&pre, &post, 1.426) < 1.0);
    }

    #[test]
    fn test_search_range_clipping() {
        let refiner = EdgeRefiner::new();
        assert_eq!(refiner.search_range(120), Some((30, 60)));
        assert_eq!(refiner.search_range(60), Some((30, 43)));
        assert_eq!(refiner.search_range(40), None);
        assert_eq!(refiner.search_range(20), None);
    }

    #[test]
    fn test_confirmed_step_rewrites_weights() {
        let n_t = 90;
        let mut refl = Array3::zeros((n_t, 1, 1));
        let mut w = Array3::ones((n_t, 1, 1));
        for t in 0..n_t {
            refl[[t, 0, 0]] = if t < 45 { 0.3 } else { 0.1 };
        }
        w[[44, 0, 0]] = 0.2;
        w[[45, 0, 0]] = 0.4;
        w[[10, 0, 0]] = 0.05; // outside the search window

        let test = EdgeRefiner::new().refine(&mut w, refl.view()).unwrap();
        assert!(test.confirmed[[0, 0]]);
        assert_eq!(test.index[[0, 0]], 44);
        assert_eq!(w[[44, 0, 0]], 0.01);
        assert_eq!(w[[10, 0, 0]], 1.0);
        assert_eq!(w[[45, 0, 0]], 1.0);
    }

    #[test]
    fn test_insufficient_support_keeps_weights() {
        let n_t = 90;
        let mut refl = Array3::zeros((n_t, 1, 1));
        // only three observations after the candidate
        for t in 20..45 {
            refl[[t, 0, 0]] = 0.3;
        }
        for t in 46..49 {
            refl[[t, 0, 0]] = 0.1;
        }
        let mut w = Array3::from_elem((n_t, 1, 1), 0.5);
        w[[44, 0, 0]] = 0.2;
        let before = w.clone();

        let test = EdgeRefiner::new().refine(&mut w, refl.view()).unwrap();
        assert!(!test.supported[[0, 0]]);
        assert!(!test.confirmed[[0, 0]]);
        assert_eq!(test.score[[0, 0]], 0.0);
        assert_eq!(w, before);
    }
}
