#![allow(dead_code)]

use std::cell::Cell;

use dendro_core::error::EstimationError;
use dendro_core::estimator::{
    EstimatorFactory, EstimatorValue, PhotonFluxEstimator, RawSensitivity, MODEL_KEY,
    SENSITIVITY_KEY, ZERO_LEVEL_KEY,
};
use dendro_nwb::MemoryFile;
use ndarray::{Array1, Array3};
use serde_json::{json, Map, Value};

/// Volume in storage order (time, x, y) where each value encodes its own index.
pub fn indexed_volume(frames: usize, width: usize, height: usize) -> Array3<f64> {
    Array3::from_shape_fn((frames, width, height), |(t, x, y)| {
        (t * 100 + x * 10 + y) as f64
    })
}

pub fn series_attributes(neurodata_type: &str) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("neurodata_type".to_string(), json!(neurodata_type));
    attributes.insert("rate".to_string(), json!(30.0));
    attributes
}

/// A file with one `TwoPhotonSeries` per entry, keyed by group path.
pub fn imaging_file(series: &[(&str, Array3<f64>)]) -> MemoryFile {
    let mut file = MemoryFile::new("memory://session.nwb");
    for (path, data) in series {
        file.insert_group(path, series_attributes("TwoPhotonSeries"));
        file.insert_dataset(&format!("{path}/data"), data.clone().into_dyn(), Map::new());
    }
    file
}

/// Deterministic estimator: fixed calibration, and either a constant flux or
/// `(movie - zero_level) / sensitivity`.
pub struct MockEstimatorFactory {
    pub sensitivity: f64,
    pub zero_level: f64,
    pub constant_flux: Option<f64>,
    failing_calls: Vec<usize>,
    calls: Cell<usize>,
}

impl MockEstimatorFactory {
    pub fn new(sensitivity: f64, zero_level: f64) -> Self {
        Self {
            sensitivity,
            zero_level,
            constant_flux: None,
            failing_calls: Vec::new(),
            calls: Cell::new(0),
        }
    }

    pub fn with_constant_flux(mut self, value: f64) -> Self {
        self.constant_flux = Some(value);
        self
    }

    /// The `call`-th estimator created (0-based) fails during sensitivity estimation.
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.failing_calls.push(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl EstimatorFactory for MockEstimatorFactory {
    fn name(&self) -> &str {
        "mock"
    }

    fn create(&self, movie: &Array3<f64>) -> Result<Box<dyn PhotonFluxEstimator>, EstimationError> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        Ok(Box::new(MockEstimator {
            movie: movie.clone(),
            sensitivity: self.sensitivity,
            zero_level: self.zero_level,
            constant_flux: self.constant_flux,
            fail: self.failing_calls.contains(&call),
        }))
    }
}

struct MockEstimator {
    movie: Array3<f64>,
    sensitivity: f64,
    zero_level: f64,
    constant_flux: Option<f64>,
    fail: bool,
}

impl PhotonFluxEstimator for MockEstimator {
    fn compute_sensitivity(&mut self) -> Result<RawSensitivity, EstimationError> {
        if self.fail {
            return Err(EstimationError::Backend("fit did not converge".to_string()));
        }
        let mut raw = RawSensitivity::new();
        raw.insert(
            MODEL_KEY.to_string(),
            EstimatorValue::Object {
                type_name: "PoissonGainModel".to_string(),
            },
        );
        raw.insert(
            SENSITIVITY_KEY.to_string(),
            EstimatorValue::Float32(self.sensitivity as f32),
        );
        raw.insert(
            ZERO_LEVEL_KEY.to_string(),
            EstimatorValue::Float64(self.zero_level),
        );
        raw.insert(
            "counts".to_string(),
            EstimatorValue::Array(Array1::from(vec![1.0, 2.0, 3.0]).into_dyn()),
        );
        Ok(raw)
    }

    fn compute_photon_flux(&mut self) -> Result<Array3<f64>, EstimationError> {
        Ok(match self.constant_flux {
            Some(value) => Array3::from_elem(self.movie.raw_dim(), value),
            None => self
                .movie
                .mapv(|v| (v - self.zero_level) / self.sensitivity),
        })
    }
}
