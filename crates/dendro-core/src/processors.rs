use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::JobError;

pub const PHOTON_FLUX_APP: &str = "photon_flux";
pub const PHOTON_FLUX_PROCESSOR: &str = "photon_flux_processor";
pub const VOLUSEG_APP: &str = "voluseg";
pub const VOLUSEG_PROCESSOR: &str = "voluseg_processor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Float,
    Integer,
    Boolean,
    IntegerList,
}

impl ParameterKind {
    fn describe(self) -> &'static str {
        match self {
            ParameterKind::String => "a string",
            ParameterKind::Float => "a number",
            ParameterKind::Integer => "an integer",
            ParameterKind::Boolean => "a boolean",
            ParameterKind::IntegerList => "a list of non-negative integers",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Float => value.is_number(),
            ParameterKind::Integer => value.is_i64() || value.is_u64(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::IntegerList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_u64)),
        }
    }
}

/// One user-facing processor parameter. A `null` default marks it optional.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub default: Value,
    pub description: &'static str,
    #[serde(skip_serializing_if = "no_options")]
    pub options: &'static [&'static str],
}

fn no_options(options: &&'static [&'static str]) -> bool {
    options.is_empty()
}

impl ParameterSpec {
    fn new(name: &'static str, kind: ParameterKind, default: Value, description: &'static str) -> Self {
        Self {
            name,
            kind,
            default,
            description,
            options: &[],
        }
    }

    fn with_options(mut self, options: &'static [&'static str]) -> Self {
        self.options = options;
        self
    }

    pub fn is_optional(&self) -> bool {
        self.default.is_null()
    }

    pub fn check(&self, value: &Value) -> Result<(), JobError> {
        if value.is_null() && self.is_optional() {
            return Ok(());
        }
        if !self.kind.accepts(value) {
            return Err(JobError::ParameterType {
                name: self.name.to_string(),
                expected: self.kind.describe(),
                value: value.clone(),
            });
        }
        if let (Some(text), false) = (value.as_str(), self.options.is_empty()) {
            if !self.options.contains(&text) {
                return Err(JobError::ParameterOption {
                    name: self.name.to_string(),
                    value: text.to_string(),
                    options: self.options.iter().map(|o| o.to_string()).collect(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSlot {
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub label: &'static str,
    pub image: &'static str,
    pub executable: &'static str,
    pub inputs: Vec<FileSlot>,
    pub outputs: Vec<FileSlot>,
    pub parameters: Vec<ParameterSpec>,
}

impl ProcessorDescriptor {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Checks user-supplied `(name, value)` pairs against this processor's schema.
    pub fn validate_parameters<'a, I>(&self, parameters: I) -> Result<(), JobError>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        self.resolve_parameters(parameters).map(|_| ())
    }

    /// Validated parameters with every omitted parameter set to its default.
    pub fn resolve_parameters<'a, I>(&self, parameters: I) -> Result<Map<String, Value>, JobError>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut seen = BTreeSet::new();
        let mut resolved = Map::new();

        for (name, value) in parameters {
            let spec = self.parameter(name).ok_or_else(|| JobError::UnknownParameter {
                processor: self.name.to_string(),
                name: name.to_string(),
            })?;
            if !seen.insert(name) {
                return Err(JobError::DuplicateParameter(name.to_string()));
            }
            spec.check(value)?;
            resolved.insert(name.to_string(), value.clone());
        }

        for spec in &self.parameters {
            resolved
                .entry(spec.name.to_string())
                .or_insert_with(|| spec.default.clone());
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppSpec {
    pub app_name: &'static str,
    pub description: &'static str,
    pub processors: Vec<ProcessorDescriptor>,
}

impl AppSpec {
    pub fn processor(&self, name: &str) -> Option<&ProcessorDescriptor> {
        self.processors.iter().find(|p| p.name == name)
    }
}

static APPS: Lazy<Vec<AppSpec>> = Lazy::new(|| vec![photon_flux_app(), voluseg_app()]);

pub fn all_apps() -> &'static [AppSpec] {
    APPS.as_slice()
}

pub fn find_app(app_name: &str) -> Option<&'static AppSpec> {
    all_apps().iter().find(|app| app.app_name == app_name)
}

pub fn find_processor(
    app_name: &str,
    processor_name: &str,
) -> Result<&'static ProcessorDescriptor, JobError> {
    let app = find_app(app_name).ok_or_else(|| JobError::UnknownApp(app_name.to_string()))?;
    app.processor(processor_name)
        .ok_or_else(|| JobError::UnknownProcessor {
            app: app_name.to_string(),
            processor: processor_name.to_string(),
        })
}

/// The registry rendered as a JSON document.
pub fn registry_json() -> Value {
    json!({ "apps": all_apps() })
}

fn input_slot(description: &'static str) -> FileSlot {
    FileSlot {
        name: "input",
        description,
    }
}

fn output_slot(description: &'static str) -> FileSlot {
    FileSlot {
        name: "output",
        description,
    }
}

fn photon_flux_app() -> AppSpec {
    use ParameterKind::{Boolean, IntegerList};

    AppSpec {
        app_name: PHOTON_FLUX_APP,
        description: "Run Photon Flux Estimation for two photon imaging data.",
        processors: vec![ProcessorDescriptor {
            name: PHOTON_FLUX_PROCESSOR,
            description: "Run Photon Flux Estimation for two photon imaging data.",
            label: PHOTON_FLUX_PROCESSOR,
            image: "ghcr.io/catalystneuro/dendro-photon_flux_estimator:latest",
            executable: "/app/main.py",
            inputs: vec![input_slot("Input NWB file in .nwb.lindi.json (LINDI) format")],
            outputs: vec![output_slot("Output data in .json format")],
            parameters: vec![
                ParameterSpec::new(
                    "series_path",
                    ParameterKind::String,
                    Value::Null,
                    "Path to the multiphoton series to process",
                ),
                ParameterSpec::new(
                    "subset_frames",
                    IntegerList,
                    Value::Null,
                    "Indices of frames to use for sensitivity estimation",
                ),
                ParameterSpec::new(
                    "crop_edges",
                    IntegerList,
                    Value::Null,
                    "Number of pixels to crop from each edge of the frames: [top, bottom, left, right]",
                ),
                ParameterSpec::new(
                    "process_all_series",
                    Boolean,
                    json!(false),
                    "Process every imaging series when no series path is given",
                ),
            ],
        }],
    }
}

fn voluseg_app() -> AppSpec {
    use ParameterKind::{Boolean, Float, Integer};

    AppSpec {
        app_name: VOLUSEG_APP,
        description: "Voluseg processors",
        processors: vec![ProcessorDescriptor {
            name: VOLUSEG_PROCESSOR,
            description: "Run Voluseg for volumetric segmentation.",
            label: VOLUSEG_PROCESSOR,
            image: "ghcr.io/catalystneuro/dendro-voluseg:latest",
            executable: "/app/main.py",
            inputs: vec![input_slot("Input NWB file in .nwb or .nwb.lindi.tar format")],
            outputs: vec![output_slot("Output embedding in .lindi.tar format")],
            parameters: vec![
                ParameterSpec::new(
                    "detrending",
                    ParameterKind::String,
                    json!("standard"),
                    "Type of detrending: 'standard', 'robust', or 'none'",
                )
                .with_options(&["standard", "robust", "none"]),
                ParameterSpec::new(
                    "registration",
                    ParameterKind::String,
                    json!("medium"),
                    "Quality of registration: 'high', 'medium', 'low' or 'none'",
                )
                .with_options(&["high", "medium", "low", "none"]),
                ParameterSpec::new(
                    "registration_restrict",
                    ParameterKind::String,
                    json!(""),
                    "Restrict registration (e.g. 1x1x1x1x1x1x0x0x0x1x1x0)",
                ),
                ParameterSpec::new("diam_cell", Float, json!(6.0), "Cell diameter in microns"),
                ParameterSpec::new("ds", Integer, json!(2), "Spatial coarse-graining in x-y dimension"),
                ParameterSpec::new(
                    "planes_pad",
                    Integer,
                    json!(0),
                    "Number of planes to pad the volume with for robust registration",
                ),
                ParameterSpec::new(
                    "planes_packed",
                    Boolean,
                    json!(false),
                    "Packed planes in each volume (for single plane imaging with packed planes)",
                ),
                ParameterSpec::new(
                    "parallel_clean",
                    Boolean,
                    json!(true),
                    "Parallelization of final cleaning (True is fast but memory intensive)",
                ),
                ParameterSpec::new(
                    "parallel_volume",
                    Boolean,
                    json!(true),
                    "Parallelization of mean-volume computation (True is fast but memory intensive)",
                ),
                ParameterSpec::new(
                    "save_volume",
                    Boolean,
                    json!(false),
                    "Save registered volumes after segmentation (True keeps a copy of the volumes)",
                ),
                ParameterSpec::new(
                    "type_timepoints",
                    ParameterKind::String,
                    json!("dff"),
                    "Type of timepoints to use for cell detection: 'dff', 'periodic' or 'custom'",
                )
                .with_options(&["dff", "periodic", "custom"]),
                ParameterSpec::new(
                    "type_mask",
                    ParameterKind::String,
                    json!("geomean"),
                    "Type of volume averaging for mask: 'mean', 'geomean' or 'max'",
                )
                .with_options(&["mean", "geomean", "max"]),
                ParameterSpec::new(
                    "timepoints",
                    Integer,
                    json!(1000),
                    "Number ('dff', 'periodic') or vector ('custom') of timepoints for segmentation",
                ),
                ParameterSpec::new(
                    "f_hipass",
                    Float,
                    json!(0.0),
                    "Frequency (Hz) for high-pass filtering of cell timeseries",
                ),
                ParameterSpec::new("f_volume", Float, json!(2.0), "Imaging frequency in Hz"),
                ParameterSpec::new(
                    "n_cells_block",
                    Integer,
                    json!(316),
                    "Number of cells in a block. Small number is fast but can lead to blocky output",
                ),
                ParameterSpec::new(
                    "n_colors",
                    Integer,
                    json!(1),
                    "Number of brain colors (2 in two-color volumes)",
                ),
                ParameterSpec::new("res_x", Float, json!(0.40625), "X resolution in microns"),
                ParameterSpec::new("res_y", Float, json!(0.40625), "Y resolution in microns"),
                ParameterSpec::new("res_z", Float, json!(5.0), "Z resolution in microns"),
                ParameterSpec::new(
                    "t_baseline",
                    Integer,
                    json!(300),
                    "Interval for baseline calculation in seconds",
                ),
                ParameterSpec::new(
                    "t_section",
                    Float,
                    json!(0.01),
                    "Exposure time in seconds for slice acquisition",
                ),
                ParameterSpec::new(
                    "thr_mask",
                    Float,
                    json!(0.5),
                    "Threshold for volume mask: 0 < thr <= 1 (probability) or thr > 1 (intensity)",
                ),
                ParameterSpec::new("ext", ParameterKind::String, json!(".nwb"), "File extension"),
                ParameterSpec::new(
                    "dim_order",
                    ParameterKind::String,
                    json!("xyz"),
                    "Dimensions order. Examples: 'zyx', 'xyz'",
                ),
                ParameterSpec::new("remote", Boolean, json!(true), "Remote file"),
                ParameterSpec::new(
                    "output_to_nwb",
                    Boolean,
                    json!(true),
                    "Save results to a new NWB file",
                ),
            ],
        }],
    }
}
