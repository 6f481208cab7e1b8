use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// Reflectance value in physical units (0..1)
pub type Reflectance = f64;

/// Single-band time series cube [time, row, col]
pub type BandCube = Array3<Reflectance>;

/// Multi-band time series cube [time, band, row, col]
pub type MultiBandCube = Array4<Reflectance>;

/// Per-pixel quality mask [time, row, col], true = usable
pub type QualityMask = Array3<bool>;

/// Per-pixel scalar raster [row, col]
pub type Raster = Array2<f64>;

/// Sentinel written over unusable observations before inversion
pub const NO_DATA: Reflectance = -1.0e4;

/// Sun/view geometry for every observation, angles in degrees [time, row, col]
#[derive(Debug, Clone)]
pub struct ViewGeometry {
    pub vza: Array3<f64>,
    pub sza: Array3<f64>,
    /// Relative azimuth (view azimuth - sun azimuth)
    pub raa: Array3<f64>,
}

impl ViewGeometry {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.vza.dim()
    }

    /// Check that all three angle cubes share the expected shape
    pub fn validate(&self, expected: (usize, usize, usize)) -> NbarResult<()> {
        for (what, arr) in [("vza", &self.vza), ("sza", &self.sza), ("raa", &self.raa)] {
            if arr.dim() != expected {
                return Err(NbarError::ShapeMismatch {
                    what: what.to_string(),
                    expected: format!("{:?}", expected),
                    found: format!("{:?}", arr.dim()),
                });
            }
        }
        Ok(())
    }
}

/// Supported reflectance sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    Modis,
    Viirs,
    Olci,
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Modis => write!(f, "MODIS"),
            Sensor::Viirs => write!(f, "VIIRS"),
            Sensor::Olci => write!(f, "OLCI"),
        }
    }
}

impl std::str::FromStr for Sensor {
    type Err = NbarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MODIS" => Ok(Sensor::Modis),
            "VIIRS" => Ok(Sensor::Viirs),
            "OLCI" => Ok(Sensor::Olci),
            _ => Err(NbarError::Config(format!("Unknown sensor: {}", s))),
        }
    }
}

impl Sensor {
    /// Built-in configuration for this sensor
    pub fn config(&self) -> SensorConfig {
        match self {
            Sensor::Modis | Sensor::Viirs => SensorConfig {
                name: self.to_string(),
                n_bands: 7,
                reference_bands: vec![1, 4],
                uncertainty_band: 4,
                obs_variance: [0.004, 0.015, 0.003, 0.004, 0.013, 0.010, 0.006]
                    .iter()
                    .map(|s| s * s)
                    .collect(),
                red_band: 0,
                nir_band: 1,
                blue_band: 2,
            },
            Sensor::Olci => SensorConfig {
                name: self.to_string(),
                n_bands: 4,
                reference_bands: vec![3],
                uncertainty_band: 3,
                obs_variance: [0.004, 0.003, 0.004, 0.015].iter().map(|s| s * s).collect(),
                red_band: 2,
                nir_band: 3,
                blue_band: 0,
            },
        }
    }
}

/// Per-sensor band layout and observation noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub n_bands: usize,
    /// Bands whose edge-weight fields are derived and shared (one or two)
    pub reference_bands: Vec<usize>,
    /// Band whose solve provides the inverse-operator diagonal
    pub uncertainty_band: usize,
    /// Observation variance per band
    pub obs_variance: Vec<f64>,
    pub red_band: usize,
    pub nir_band: usize,
    /// Band that must be strictly positive for an observation to be usable
    pub blue_band: usize,
}

impl SensorConfig {
    pub fn validate(&self) -> NbarResult<()> {
        if self.obs_variance.len() != self.n_bands {
            return Err(NbarError::Config(format!(
                "{}: {} variance constants for {} bands",
                self.name,
                self.obs_variance.len(),
                self.n_bands
            )));
        }
        if self.reference_bands.is_empty() || self.reference_bands.len() > 2 {
            return Err(NbarError::Config(format!(
                "{}: expected one or two reference bands, got {}",
                self.name,
                self.reference_bands.len()
            )));
        }
        let bands = self
            .reference_bands
            .iter()
            .chain([&self.uncertainty_band, &self.red_band, &self.nir_band, &self.blue_band]);
        for &band in bands {
            if band >= self.n_bands {
                return Err(NbarError::Config(format!(
                    "{}: band index {} out of range for {} bands",
                    self.name, band, self.n_bands
                )));
            }
        }
        if !self.reference_bands.contains(&self.uncertainty_band) {
            return Err(NbarError::Config(format!(
                "{}: uncertainty band {} is not a reference band",
                self.name, self.uncertainty_band
            )));
        }
        Ok(())
    }
}

/// Error types for NBAR processing
#[derive(Debug, thiserror::Error)]
pub enum NbarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: String,
        expected: String,
        found: String,
    },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Result type for NBAR operations
pub type NbarResult<T> = Result<T, NbarError>;

/// Fail fast when an array does not have the expected dimensions
pub(crate) fn check_dim<D: std::fmt::Debug + PartialEq>(
    what: &str,
    expected: D,
    found: D,
) -> NbarResult<()> {
    if expected != found {
        return Err(NbarError::ShapeMismatch {
            what: what.to_string(),
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sensor_configs_are_valid() {
        for sensor in [Sensor::Modis, Sensor::Viirs, Sensor::Olci] {
            let cfg = sensor.config();
            assert!(cfg.validate().is_ok(), "{} config invalid", sensor);
        }
        let modis = Sensor::Modis.config();
        assert_eq!(modis.reference_bands, vec![1, 4]);
        assert!((modis.obs_variance[1] - 0.015 * 0.015).abs() < 1e-15);
    }

    #[test]
    fn test_sensor_from_str() {
        assert_eq!("olci".parse::<Sensor>().unwrap(), Sensor::Olci);
        assert!("landsat".parse::<Sensor>().is_err());
    }

    #[test]
    fn test_invalid_sensor_config() {
        let mut cfg = Sensor::Olci.config();
        cfg.reference_bands = vec![7];
        assert!(matches!(cfg.validate(), Err(NbarError::Config(_))));
    }
}
