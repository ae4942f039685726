// crates/dendro-core/src/error.rs

use dendro_nwb::NwbError;
use thiserror::Error;

/// Failure to resolve the imaging series a run should process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeriesLookupError {
    #[error("{}", not_found_message(.requested.as_deref(), .available))]
    NotFound {
        requested: Option<String>,
        available: Vec<String>,
    },

    #[error("multiple imaging series found, specify one of: {}", .available.join(", "))]
    Ambiguous { available: Vec<String> },
}

fn not_found_message(requested: Option<&str>, available: &[String]) -> String {
    match requested {
        Some(path) if available.is_empty() => {
            format!("imaging series '{path}' not found; the file contains no imaging series")
        }
        Some(path) => format!(
            "imaging series '{path}' not found; available: {}",
            available.join(", ")
        ),
        None => "no imaging series found in file".to_string(),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("frame index {index} is out of range for a series with {total} frames")]
    FrameOutOfRange { index: usize, total: usize },

    #[error("frame selection is empty")]
    NoFrames,

    #[error("crop_edges must have 4 entries [top, bottom, left, right], got {0}")]
    CropLength(usize),

    #[error("cropping {crop} pixels along the {axis} axis leaves nothing of {extent}")]
    CropTooLarge {
        axis: &'static str,
        crop: usize,
        extent: usize,
    },

    #[error("imaging data must be (time, x, y), found shape {0:?}")]
    Rank(Vec<usize>),
}

/// Failure inside, or around, the external photon-flux estimator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("estimator failed: {0}")]
    Backend(String),

    #[error("estimator result is missing '{0}'")]
    MissingMetric(&'static str),

    #[error("estimator result '{0}' is not a scalar number")]
    NonScalarMetric(&'static str),

    #[error("estimated {metric} is not finite ({value})")]
    NonFinite { metric: &'static str, value: f64 },

    #[error("estimated sensitivity is zero; photon flux cannot be normalized")]
    ZeroSensitivity,

    #[error("selected movie has {count} non-finite values, first at (frame, row, col) {first:?}")]
    NonFiniteMovie {
        count: usize,
        first: [usize; 3],
    },

    #[error("{0} frames cannot describe temporal noise, at least 2 are required")]
    TooFewFrames(usize),

    #[error("photon flux shape {actual:?} does not match the selected movie {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {name} is invalid: {message}")]
    Env { name: &'static str, message: String },
}

/// Invalid job definitions and submission failures.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("unknown app '{0}'")]
    UnknownApp(String),

    #[error("app '{app}' has no processor '{processor}'")]
    UnknownProcessor { app: String, processor: String },

    #[error("processor '{processor}' has no parameter '{name}'")]
    UnknownParameter { processor: String, name: String },

    #[error("parameter '{0}' is given more than once")]
    DuplicateParameter(String),

    #[error("parameter '{name}' must be {expected}, got {value}")]
    ParameterType {
        name: String,
        expected: &'static str,
        value: serde_json::Value,
    },

    #[error("parameter '{name}' must be one of [{}], got '{value}'", .options.join(", "))]
    ParameterOption {
        name: String,
        value: String,
        options: Vec<String>,
    },

    #[error("parameter '{name}' is out of range: {message}")]
    ParameterRange { name: String, message: String },

    #[error("{kind} file entry has an empty {field}")]
    EmptyFileField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} file '{name}' is declared more than once")]
    DuplicateFile { kind: &'static str, name: String },

    #[error("processor '{processor}' does not declare {kind} '{name}'")]
    UndeclaredFile {
        processor: String,
        kind: &'static str,
        name: String,
    },

    #[error("processor '{processor}' requires {kind} '{name}'")]
    MissingFile {
        processor: String,
        kind: &'static str,
        name: String,
    },

    #[error("invalid resource request: {0}")]
    Resources(String),

    #[error("service name must not be empty")]
    MissingServiceName,

    #[error("failed to write job spool {path}: {source}")]
    Spool {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Lookup(#[from] SeriesLookupError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Estimation(#[from] EstimationError),

    #[error("file access failed: {0}")]
    File(#[from] NwbError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid processor parameters: {0}")]
    Parameters(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("no series produced a result ({failures} failed)")]
    NoResults { failures: usize },

    #[error("output upload failed: {0}")]
    Upload(String),

    #[error("segmentation step '{step}' failed: {message}")]
    Segmentation { step: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
