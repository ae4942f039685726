use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime settings shared by the processors and the job client.
///
/// Values come from an optional TOML file and are then overridden by
/// `DENDRO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Dendro service that receives submitted jobs; empty until configured.
    pub service_name: String,
    /// Directory where processors write their local output files.
    pub work_dir: PathBuf,
    /// Root of the local object store; uploads are discarded when unset.
    pub output_dir: Option<PathBuf>,
    pub output_file_name: String,
    /// Swap the two spatial axes so movies reach the estimator as (time, y, x).
    pub transpose_spatial_axes: bool,
    /// Executable (and leading arguments) of the photon-flux estimator.
    pub estimator_command: Vec<String>,
    /// Executable (and leading arguments) driving the voluseg steps.
    pub segmentation_command: Vec<String>,
    pub dir_ants: String,
    pub voluseg_output_dir: PathBuf,
    pub job_spool_dir: PathBuf,
    pub job_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            work_dir: PathBuf::from("."),
            output_dir: None,
            output_file_name: "output.json".to_string(),
            transpose_spatial_axes: true,
            estimator_command: Vec::new(),
            segmentation_command: Vec::new(),
            dir_ants: "/ants-2.5.3/bin/".to_string(),
            voluseg_output_dir: PathBuf::from("/tmp/voluseg_output"),
            job_spool_dir: PathBuf::from("jobs"),
            job_base_url: "https://dendro.vercel.app".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&text, &path.display().to_string())?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Applies `DENDRO_*` overrides resolved through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DENDRO_SERVICE_NAME") {
            self.service_name = value;
        }
        if let Some(value) = lookup("DENDRO_WORK_DIR") {
            self.work_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("DENDRO_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("DENDRO_OUTPUT_FILE_NAME") {
            self.output_file_name = value;
        }
        if let Some(value) = lookup("DENDRO_TRANSPOSE_SPATIAL_AXES") {
            self.transpose_spatial_axes = parse_bool("DENDRO_TRANSPOSE_SPATIAL_AXES", &value)?;
        }
        if let Some(value) = lookup("DENDRO_ESTIMATOR_COMMAND") {
            self.estimator_command = split_command(&value);
        }
        if let Some(value) = lookup("DENDRO_SEGMENTATION_COMMAND") {
            self.segmentation_command = split_command(&value);
        }
        if let Some(value) = lookup("DENDRO_DIR_ANTS") {
            self.dir_ants = value;
        }
        if let Some(value) = lookup("DENDRO_VOLUSEG_OUTPUT_DIR") {
            self.voluseg_output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("DENDRO_JOB_SPOOL_DIR") {
            self.job_spool_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("DENDRO_JOB_BASE_URL") {
            self.job_base_url = value;
        }
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(&self.output_file_name)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::Env {
            name,
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn split_command(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}
