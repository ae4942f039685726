use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use ndarray::{Array3, ArrayD, ArrayView3, ArrayViewD, Ix3, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EstimationError;

pub const MODEL_KEY: &str = "model";
pub const SENSITIVITY_KEY: &str = "sensitivity";
pub const ZERO_LEVEL_KEY: &str = "zero_level";

/// A value produced by the external estimator, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum EstimatorValue {
    Float64(f64),
    Float32(f32),
    Int64(i64),
    UInt64(u64),
    Bool(bool),
    Text(String),
    Array(ArrayD<f64>),
    /// Any other runtime object, known only by its type name.
    Object { type_name: String },
}

impl EstimatorValue {
    pub fn type_name(&self) -> &str {
        match self {
            EstimatorValue::Float64(_) => "float64",
            EstimatorValue::Float32(_) => "float32",
            EstimatorValue::Int64(_) => "int64",
            EstimatorValue::UInt64(_) => "uint64",
            EstimatorValue::Bool(_) => "bool",
            EstimatorValue::Text(_) => "str",
            EstimatorValue::Array(_) => "ndarray",
            EstimatorValue::Object { type_name } => type_name,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EstimatorValue::Float64(v) => Some(*v),
            EstimatorValue::Float32(v) => Some(f64::from(*v)),
            EstimatorValue::Int64(v) => Some(*v as f64),
            EstimatorValue::UInt64(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn into_json(self) -> Value {
        match self {
            EstimatorValue::Bool(flag) => Value::Bool(flag),
            EstimatorValue::Text(text) => Value::String(text),
            EstimatorValue::Array(array) => array_to_json(array.view()),
            EstimatorValue::Object { type_name } => Value::String(type_name),
            numeric => json_f64(numeric.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

pub type RawSensitivity = BTreeMap<String, EstimatorValue>;

/// Capability of the external photon-flux estimator bound to one movie.
pub trait PhotonFluxEstimator {
    fn compute_sensitivity(&mut self) -> Result<RawSensitivity, EstimationError>;
    fn compute_photon_flux(&mut self) -> Result<Array3<f64>, EstimationError>;
}

/// Builds an estimator for a (time, height, width) movie.
pub trait EstimatorFactory {
    fn name(&self) -> &str;
    fn create(&self, movie: &Array3<f64>) -> Result<Box<dyn PhotonFluxEstimator>, EstimationError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub sensitivity: f64,
    pub zero_level: f64,
}

impl Calibration {
    /// Zero or non-finite calibration constants are rejected rather than propagated.
    pub fn from_raw(raw: &RawSensitivity) -> Result<Self, EstimationError> {
        let sensitivity = raw_scalar(raw, SENSITIVITY_KEY)?;
        let zero_level = raw_scalar(raw, ZERO_LEVEL_KEY)?;
        if sensitivity == 0.0 {
            return Err(EstimationError::ZeroSensitivity);
        }
        Ok(Self {
            sensitivity,
            zero_level,
        })
    }
}

fn raw_scalar(raw: &RawSensitivity, key: &'static str) -> Result<f64, EstimationError> {
    let value = raw
        .get(key)
        .ok_or(EstimationError::MissingMetric(key))?
        .as_f64()
        .ok_or(EstimationError::NonScalarMetric(key))?;
    if !value.is_finite() {
        return Err(EstimationError::NonFinite { metric: key, value });
    }
    Ok(value)
}

/// Estimator output converted to plain JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SensitivityResult {
    values: Map<String, Value>,
}

impl SensitivityResult {
    /// `model` becomes its type name, arrays become nested lists and every
    /// numeric scalar becomes a plain float.
    pub fn normalize(raw: RawSensitivity) -> Self {
        let values = raw
            .into_iter()
            .map(|(key, value)| {
                let json = if key == MODEL_KEY {
                    Value::String(value.type_name().to_string())
                } else {
                    value.into_json()
                };
                (key, json)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

/// Non-finite floats have no JSON form and are written as `null`.
pub fn json_f64(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Nested-list rendition of an n-dimensional array.
pub fn array_to_json(array: ArrayViewD<'_, f64>) -> Value {
    if array.ndim() == 0 {
        return array.iter().next().map(|&v| json_f64(v)).unwrap_or(Value::Null);
    }
    Value::Array(array.outer_iter().map(array_to_json).collect())
}

pub struct Estimate {
    pub sensitivity: SensitivityResult,
    pub calibration: Calibration,
    pub photon_flux: Array3<f64>,
}

/// Fails when any pixel of the (time, y, x) movie is NaN or infinite.
pub fn ensure_finite_movie(movie: ArrayView3<'_, f64>) -> Result<(), EstimationError> {
    let mut bad = movie.indexed_iter().filter(|(_, value)| !value.is_finite());
    let Some(((frame, row, col), _)) = bad.next() else {
        return Ok(());
    };
    Err(EstimationError::NonFiniteMovie {
        count: 1 + bad.count(),
        first: [frame, row, col],
    })
}

/// Runs both estimator operations on `movie` and normalizes the sensitivity output.
pub fn run_estimator(
    factory: &dyn EstimatorFactory,
    movie: &Array3<f64>,
) -> Result<Estimate, EstimationError> {
    ensure_finite_movie(movie.view())?;
    let mut estimator = factory.create(movie)?;

    let raw = estimator.compute_sensitivity()?;
    let calibration = Calibration::from_raw(&raw)?;
    debug!(
        estimator = factory.name(),
        sensitivity = calibration.sensitivity,
        zero_level = calibration.zero_level,
        "sensitivity estimated"
    );

    let photon_flux = estimator.compute_photon_flux()?;
    if photon_flux.shape() != movie.shape() {
        return Err(EstimationError::ShapeMismatch {
            expected: movie.shape().to_vec(),
            actual: photon_flux.shape().to_vec(),
        });
    }

    Ok(Estimate {
        sensitivity: SensitivityResult::normalize(raw),
        calibration,
        photon_flux,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct ArrayPayload {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct EstimatorResponse {
    sensitivity: Map<String, Value>,
    photon_flux: ArrayPayload,
}

/// Runs an external estimator executable.
///
/// The movie is written as `{"shape": [t, h, w], "data": [...]}` to a request
/// file whose path is appended to the command line; the program prints
/// `{"sensitivity": {...}, "photon_flux": {"shape": [...], "data": [...]}}`.
#[derive(Debug, Clone)]
pub struct CommandEstimatorFactory {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandEstimatorFactory {
    pub fn from_command(command: &[String], scratch_dir: PathBuf) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch_dir,
        })
    }

    fn invoke(&self, movie: &Array3<f64>) -> Result<EstimatorResponse, EstimationError> {
        let backend = |message: String| EstimationError::Backend(message);

        let request = ArrayPayload {
            shape: movie.shape().to_vec(),
            data: movie.iter().copied().collect(),
        };
        let request_path = self
            .scratch_dir
            .join(format!("photon-flux-request-{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec(&request).map_err(|err| backend(err.to_string()))?;
        std::fs::write(&request_path, body)
            .map_err(|err| backend(format!("cannot write {}: {err}", request_path.display())))?;

        info!(program = %self.program, frames = movie.shape()[0], "running estimator");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request_path)
            .output();
        discard_request(&request_path);
        let output = output.map_err(|err| backend(format!("cannot run {}: {err}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(backend(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| backend(format!("malformed estimator output: {err}")))
    }
}

fn discard_request(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "request file already removed");
        }
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove request file"),
    }
}

impl EstimatorFactory for CommandEstimatorFactory {
    fn name(&self) -> &str {
        &self.program
    }

    fn create(&self, movie: &Array3<f64>) -> Result<Box<dyn PhotonFluxEstimator>, EstimationError> {
        let response = self.invoke(movie)?;

        let mut sensitivity = RawSensitivity::new();
        for (key, value) in response.sensitivity {
            let decoded = decode_value(&value).ok_or_else(|| {
                EstimationError::Backend(format!("cannot decode estimator value '{key}'"))
            })?;
            sensitivity.insert(key, decoded);
        }

        let ArrayPayload { shape, data } = response.photon_flux;
        let photon_flux = ArrayD::from_shape_vec(IxDyn(&shape), data)
            .ok()
            .and_then(|array| array.into_dimensionality::<Ix3>().ok())
            .ok_or_else(|| {
                EstimationError::Backend(format!("photon_flux payload has invalid shape {shape:?}"))
            })?;

        Ok(Box::new(CommandEstimator {
            sensitivity,
            photon_flux,
        }))
    }
}

struct CommandEstimator {
    sensitivity: RawSensitivity,
    photon_flux: Array3<f64>,
}

impl PhotonFluxEstimator for CommandEstimator {
    fn compute_sensitivity(&mut self) -> Result<RawSensitivity, EstimationError> {
        Ok(self.sensitivity.clone())
    }

    fn compute_photon_flux(&mut self) -> Result<Array3<f64>, EstimationError> {
        Ok(self.photon_flux.clone())
    }
}

/// Decodes the JSON form of an estimator value.
///
/// `{"__class__": "Name"}` stands for an opaque object, nested numeric lists
/// for arrays and `null` for NaN.
pub fn decode_value(value: &Value) -> Option<EstimatorValue> {
    match value {
        Value::Null => Some(EstimatorValue::Float64(f64::NAN)),
        Value::Bool(flag) => Some(EstimatorValue::Bool(*flag)),
        Value::String(text) => Some(EstimatorValue::Text(text.clone())),
        Value::Number(n) => Some(match (n.as_i64(), n.as_u64()) {
            (Some(v), _) => EstimatorValue::Int64(v),
            (None, Some(v)) => EstimatorValue::UInt64(v),
            _ => EstimatorValue::Float64(n.as_f64()?),
        }),
        Value::Array(_) => nested_to_array(value).map(EstimatorValue::Array),
        Value::Object(map) => {
            let type_name = map.get("__class__")?.as_str()?;
            Some(EstimatorValue::Object {
                type_name: type_name.to_string(),
            })
        }
    }
}

fn nested_to_array(value: &Value) -> Option<ArrayD<f64>> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut data = Vec::new();
    collect_leaves(value, 0, &shape, &mut data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).ok()
}

fn collect_leaves(value: &Value, depth: usize, shape: &[usize], out: &mut Vec<f64>) -> Option<()> {
    if depth == shape.len() {
        out.push(match value {
            Value::Null => f64::NAN,
            other => other.as_f64()?,
        });
        return Some(());
    }
    let items = value.as_array()?;
    if items.len() != shape[depth] {
        return None;
    }
    for item in items {
        collect_leaves(item, depth + 1, shape, out)?;
    }
    Some(())
}
