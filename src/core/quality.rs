use crate::types::{
    check_dim, MultiBandCube, NbarResult, QualityMask, SensorConfig, NO_DATA,
};
use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

/// Quality screening parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityParams {
    /// Observations with NDVI at or below this value are flagged as snow
    pub snow_ndvi_threshold: f64,
    /// Apply the NDVI snow filter
    pub mask_snow: bool,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            snow_ndvi_threshold: 0.0,
            mask_snow: true,
        }
    }
}

/// Combines product QA flags with spectral screening into a usable-observation mask
pub struct QualityScreener {
    params: QualityParams,
}

impl QualityScreener {
    pub fn new() -> Self {
        Self {
            params: QualityParams::default(),
        }
    }

    pub fn with_params(params: QualityParams) -> Self {
        Self { params }
    }

    /// Build the quality mask [time, row, col]
    ///
    /// An observation is usable when the product QA flag is set, it is not
    /// snow (NDVI above threshold) and the sensor's blue band is positive.
    pub fn build_mask(
        &self,
        refl: &MultiBandCube,
        qa_flags: &QualityMask,
        sensor: &SensorConfig,
    ) -> NbarResult<QualityMask> {
        sensor.validate()?;
        let (n_t, n_bands, rows, cols) = refl.dim();
        check_dim("reflectance bands", sensor.n_bands, n_bands)?;
        check_dim("QA flags", (n_t, rows, cols), qa_flags.dim())?;

        let red = refl.index_axis(Axis(1), sensor.red_band);
        let nir = refl.index_axis(Axis(1), sensor.nir_band);
        let blue = refl.index_axis(Axis(1), sensor.blue_band);
        let threshold = self.params.snow_ndvi_threshold;
        let mask_snow = self.params.mask_snow;

        let mut mask = qa_flags.clone();
        Zip::from(&mut mask)
            .and(&red)
            .and(&nir)
            .and(&blue)
            .for_each(|usable, &r, &n, &b| {
                let snow = mask_snow && ndvi(r, n) <= threshold;
                *usable = *usable && !snow && b > 0.0;
            });

        let n_usable = mask.iter().filter(|&&m| m).count();
        log::info!(
            "Quality screening kept {} of {} observations ({:.1}%)",
            n_usable,
            mask.len(),
            100.0 * n_usable as f64 / mask.len().max(1) as f64
        );
        Ok(mask)
    }

    /// Copy of the cube with every band of unusable observations set to `NO_DATA`
    pub fn apply_mask(&self, refl: &MultiBandCube, mask: &QualityMask) -> NbarResult<MultiBandCube> {
        let (n_t, _, rows, cols) = refl.dim();
        check_dim("quality mask", (n_t, rows, cols), mask.dim())?;

        let mut masked = refl.clone();
        for mut band in masked.axis_iter_mut(Axis(1)) {
            Zip::from(&mut band).and(mask).for_each(|v, &usable| {
                if !usable {
                    *v = NO_DATA;
                }
            });
        }
        Ok(masked)
    }
}

impl Default for QualityScreener {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalised difference vegetation index; NaN when both bands are zero
pub fn ndvi(red: f64, nir: f64) -> f64 {
    (nir - red) / (nir + red)
}
