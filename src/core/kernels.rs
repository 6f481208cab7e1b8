//! BRDF kernel model
//!
//! Semi-empirical linear kernels used by the MODIS BRDF/Albedo product:
//! RossThick for volumetric scattering and the reciprocal LiSparse kernel for
//! geometric-optical (shadowing) scattering. Both vanish at nadir illumination
//! and view, so the isotropic coefficient is the nadir-equivalent reflectance.

use crate::types::{check_dim, NbarResult, ViewGeometry};
use ndarray::{s, Array2, Array4, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

/// Crown shape parameters for the LiSparse kernel
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelParams {
    /// Crown height to vertical radius ratio (h/b)
    pub hb: f64,
    /// Vertical to horizontal crown radius ratio (b/r)
    pub br: f64,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self { hb: 2.0, br: 1.0 }
    }
}

/// Kernel values for one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelTriplet {
    pub isotropic: f64,
    pub volumetric: f64,
    pub geometric: f64,
}

/// Evaluates RossThick / LiSparse-R kernels from sun-view geometry
#[derive(Debug, Clone, Default)]
pub struct KernelModel {
    params: KernelParams,
}

impl KernelModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: KernelParams) -> Self {
        Self { params }
    }

    /// Kernels for a single geometry, angles in degrees
    pub fn evaluate(&self, vza: f64, sza: f64, raa: f64) -> KernelTriplet {
        let tv = vza.to_radians();
        let ts = sza.to_radians();
        let phi = raa.to_radians();

        KernelTriplet {
            isotropic: 1.0,
            volumetric: ross_thick(tv, ts, phi),
            geometric: li_sparse_reciprocal(tv, ts, phi, self.params.hb, self.params.br),
        }
    }

    /// Kernel matrix [3, nObs] for a single pixel's observation sequence
    pub fn kernel_matrix(&self, vza: &[f64], sza: &[f64], raa: &[f64]) -> NbarResult<Array2<f64>> {
        check_dim("sza observations", vza.len(), sza.len())?;
        check_dim("raa observations", vza.len(), raa.len())?;

        let mut k = Array2::zeros((3, vza.len()));
        for (i, ((&v, &s), &r)) in vza.iter().zip(sza).zip(raa).enumerate() {
            let t = self.evaluate(v, s, r);
            k[[0, i]] = t.isotropic;
            k[[1, i]] = t.volumetric;
            k[[2, i]] = t.geometric;
        }
        Ok(k)
    }

    /// Kernel cube [time, 3, row, col] for a whole tile
    pub fn kernel_cube(&self, geometry: &ViewGeometry) -> NbarResult<Array4<f64>> {
        let (n_t, rows, cols) = geometry.dim();
        geometry.validate((n_t, rows, cols))?;
        log::debug!("Computing BRDF kernels for {}x{}x{} observations", n_t, rows, cols);

        let mut cube = Array4::zeros((n_t, 3, rows, cols));
        cube.index_axis_mut(Axis(1), 0).fill(1.0);

        let (mut vol, mut geo) = cube.multi_slice_mut((s![.., 1, .., ..], s![.., 2, .., ..]));

        Zip::from(&mut vol)
            .and(&mut geo)
            .and(&geometry.vza)
            .and(&geometry.sza)
            .and(&geometry.raa)
            .for_each(|kv, kg, &v, &s, &r| {
                let t = self.evaluate(v, s, r);
                *kv = t.volumetric;
                *kg = t.geometric;
            });

        Ok(cube)
    }
}

fn ross_thick(tv: f64, ts: f64, phi: f64) -> f64 {
    let cos_xi = (ts.cos() * tv.cos() + ts.sin() * tv.sin() * phi.cos()).clamp(-1.0, 1.0);
    let xi = cos_xi.acos();
    ((FRAC_PI_2 - xi) * cos_xi + xi.sin()) / (ts.cos() + tv.cos()) - FRAC_PI_4
}

fn li_sparse_reciprocal(tv: f64, ts: f64, phi: f64, hb: f64, br: f64) -> f64 {
    // equivalent sphere angles
    let tv = (br * tv.tan()).atan();
    let ts = (br * ts.tan()).atan();

    let sec_v = 1.0 / tv.cos();
    let sec_s = 1.0 / ts.cos();
    let cos_xi = ts.cos() * tv.cos() + ts.sin() * tv.sin() * phi.cos();

    let d2 = ts.tan().powi(2) + tv.tan().powi(2) - 2.0 * ts.tan() * tv.tan() * phi.cos();
    let cross = ts.tan() * tv.tan() * phi.sin();
    let cos_t = (hb * (d2.max(0.0) + cross * cross).sqrt() / (sec_s + sec_v)).clamp(-1.0, 1.0);
    let t = cos_t.acos();

    let overlap = (t - t.sin() * cos_t) * (sec_s + sec_v) / PI;
    overlap - sec_s - sec_v + 0.5 * (1.0 + cos_xi) * sec_s * sec_v
}
