use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{JobError, ProcessorError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detrending {
    #[default]
    Standard,
    Robust,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registration {
    High,
    #[default]
    Medium,
    Low,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimepointsType {
    #[default]
    Dff,
    Periodic,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    Mean,
    #[default]
    Geomean,
    Max,
}

/// User-facing voluseg parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolusegParams {
    pub detrending: Detrending,
    pub registration: Registration,
    pub registration_restrict: String,
    /// Cell diameter in microns.
    pub diam_cell: f64,
    pub ds: u32,
    pub planes_pad: u32,
    pub planes_packed: bool,
    pub parallel_clean: bool,
    pub parallel_volume: bool,
    pub save_volume: bool,
    pub type_timepoints: TimepointsType,
    pub type_mask: MaskType,
    pub timepoints: u64,
    pub f_hipass: f64,
    /// Imaging frequency in Hz.
    pub f_volume: f64,
    pub n_cells_block: u32,
    pub n_colors: u32,
    pub res_x: f64,
    pub res_y: f64,
    pub res_z: f64,
    pub t_baseline: u32,
    pub t_section: f64,
    pub thr_mask: f64,
    pub ext: String,
    pub dim_order: String,
    pub remote: bool,
    pub output_to_nwb: bool,
}

impl Default for VolusegParams {
    fn default() -> Self {
        Self {
            detrending: Detrending::Standard,
            registration: Registration::Medium,
            registration_restrict: String::new(),
            diam_cell: 6.0,
            ds: 2,
            planes_pad: 0,
            planes_packed: false,
            parallel_clean: true,
            parallel_volume: true,
            save_volume: false,
            type_timepoints: TimepointsType::Dff,
            type_mask: MaskType::Geomean,
            timepoints: 1000,
            f_hipass: 0.0,
            f_volume: 2.0,
            n_cells_block: 316,
            n_colors: 1,
            res_x: 0.40625,
            res_y: 0.40625,
            res_z: 5.0,
            t_baseline: 300,
            t_section: 0.01,
            thr_mask: 0.5,
            ext: ".nwb".to_string(),
            dim_order: "xyz".to_string(),
            remote: true,
            output_to_nwb: true,
        }
    }
}

impl VolusegParams {
    /// Parameters from a resolved parameter map; `null` entries keep their default.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, JobError> {
        let present: Map<String, Value> = parameters
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let params: Self = serde_json::from_value(Value::Object(present))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let positive = [
            ("diam_cell", self.diam_cell),
            ("f_volume", self.f_volume),
            ("res_x", self.res_x),
            ("res_y", self.res_y),
            ("res_z", self.res_z),
            ("t_section", self.t_section),
            ("thr_mask", self.thr_mask),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(range_error(name, format!("must be positive, got {value}")));
            }
        }
        if !(self.f_hipass.is_finite() && self.f_hipass >= 0.0) {
            return Err(range_error(
                "f_hipass",
                format!("must be non-negative, got {}", self.f_hipass),
            ));
        }

        let at_least_one = [
            ("ds", u64::from(self.ds)),
            ("n_cells_block", u64::from(self.n_cells_block)),
            ("n_colors", u64::from(self.n_colors)),
            ("t_baseline", u64::from(self.t_baseline)),
            ("timepoints", self.timepoints),
        ];
        for (name, value) in at_least_one {
            if value == 0 {
                return Err(range_error(name, "must be at least 1".to_string()));
            }
        }

        if self.dim_order.len() != 3
            || !["x", "y", "z"].iter().all(|axis| self.dim_order.contains(axis))
        {
            return Err(range_error(
                "dim_order",
                format!("must be a permutation of 'xyz', got '{}'", self.dim_order),
            ));
        }
        Ok(())
    }

    /// The full parameter dictionary handed to step 0.
    pub fn parameter_dictionary(
        &self,
        input_url: &str,
        dir_ants: &str,
        dir_output: &Path,
    ) -> Result<Map<String, Value>, ProcessorError> {
        let mut parameters = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        parameters.insert("dir_ants".to_string(), Value::from(dir_ants));
        parameters.insert("dir_input".to_string(), Value::from(input_url));
        parameters.insert(
            "dir_output".to_string(),
            Value::from(dir_output.display().to_string()),
        );
        Ok(parameters)
    }
}

fn range_error(name: &str, message: String) -> JobError {
    JobError::ParameterRange {
        name: name.to_string(),
        message,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationStep {
    ProcessVolumes,
    AlignVolumes,
    MaskVolumes,
    DetectCells,
    CleanCells,
}

impl SegmentationStep {
    pub const ALL: [SegmentationStep; 5] = [
        SegmentationStep::ProcessVolumes,
        SegmentationStep::AlignVolumes,
        SegmentationStep::MaskVolumes,
        SegmentationStep::DetectCells,
        SegmentationStep::CleanCells,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SegmentationStep::ProcessVolumes => "step1_process_volumes",
            SegmentationStep::AlignVolumes => "step2_align_volumes",
            SegmentationStep::MaskVolumes => "step3_mask_volumes",
            SegmentationStep::DetectCells => "step4_detect_cells",
            SegmentationStep::CleanCells => "step5_clean_cells",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SegmentationStep::ProcessVolumes => "Process volumes",
            SegmentationStep::AlignVolumes => "Align volumes",
            SegmentationStep::MaskVolumes => "Mask volumes",
            SegmentationStep::DetectCells => "Detect cells",
            SegmentationStep::CleanCells => "Clean cells",
        }
    }
}

pub const PROCESS_PARAMETERS_STEP: &str = "step0_process_parameters";

/// The volumetric segmentation library.
pub trait SegmentationBackend {
    /// Step 0: checks and persists the parameter dictionary, returning the
    /// parameters the later steps must use.
    fn process_parameters(&mut self, parameters: &Map<String, Value>) -> anyhow::Result<Map<String, Value>>;

    fn run_step(&mut self, step: SegmentationStep, parameters: &Map<String, Value>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationReport {
    pub parameters: Map<String, Value>,
    pub completed_steps: Vec<&'static str>,
}

pub fn run_segmentation(
    backend: &mut dyn SegmentationBackend,
    params: &VolusegParams,
    input_url: &str,
    dir_ants: &str,
    dir_output: &Path,
) -> Result<SegmentationReport, ProcessorError> {
    params.validate()?;
    let dictionary = params.parameter_dictionary(input_url, dir_ants, dir_output)?;

    let parameters =
        backend
            .process_parameters(&dictionary)
            .map_err(|err| ProcessorError::Segmentation {
                step: PROCESS_PARAMETERS_STEP,
                message: format!("{err:#}"),
            })?;
    let rendered = Value::Object(parameters.clone());
    info!(parameters = %rendered, "voluseg parameters processed");

    let mut completed_steps = Vec::with_capacity(SegmentationStep::ALL.len());
    for step in SegmentationStep::ALL {
        info!(step = step.name(), "{}...", step.label());
        backend
            .run_step(step, &parameters)
            .map_err(|err| ProcessorError::Segmentation {
                step: step.name(),
                message: format!("{err:#}"),
            })?;
        completed_steps.push(step.name());
    }

    Ok(SegmentationReport {
        parameters,
        completed_steps,
    })
}

/// Drives the segmentation steps through an external executable.
///
/// Each step runs as `<command> <step name> <parameters file>`. Step 0 reads
/// `parameters0.json` and must leave `parameters.json` in the output directory.
#[derive(Debug, Clone)]
pub struct CommandSegmentationBackend {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandSegmentationBackend {
    pub fn from_command(command: &[String], output_dir: PathBuf) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            output_dir,
        })
    }

    fn invoke(&self, step: &str, parameters_file: &Path) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(step)
            .arg(parameters_file)
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} {step} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn persisted_parameters_path(&self) -> PathBuf {
        self.output_dir.join("parameters.json")
    }
}

impl SegmentationBackend for CommandSegmentationBackend {
    fn process_parameters(&mut self, parameters: &Map<String, Value>) -> anyhow::Result<Map<String, Value>> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;
        let draft = self.output_dir.join("parameters0.json");
        fs::write(&draft, serde_json::to_vec_pretty(parameters)?)
            .with_context(|| format!("failed to write {}", draft.display()))?;

        self.invoke(PROCESS_PARAMETERS_STEP, &draft)?;

        let persisted = self.persisted_parameters_path();
        let text = fs::read_to_string(&persisted)
            .with_context(|| format!("failed to read {}", persisted.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn run_step(&mut self, step: SegmentationStep, _parameters: &Map<String, Value>) -> anyhow::Result<()> {
        self.invoke(step.name(), &self.persisted_parameters_path())
    }
}
