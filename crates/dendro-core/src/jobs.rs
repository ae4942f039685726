use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::JobError;
use crate::photon_flux::PhotonFluxParams;
use crate::processors::{find_processor, ProcessorDescriptor, PHOTON_FLUX_PROCESSOR, VOLUSEG_PROCESSOR};
use crate::voluseg::VolusegParams;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInputFile {
    pub name: String,
    pub file_base_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutputFile {
    pub name: String,
    pub file_base_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub app_name: String,
    pub processor_name: String,
    pub input_files: Vec<JobInputFile>,
    pub output_files: Vec<JobOutputFile>,
    pub parameters: Vec<JobParameter>,
}

impl JobDefinition {
    pub fn new(app_name: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            processor_name: processor_name.into(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: &str, file_base_name: &str, url: &str) -> Self {
        self.input_files.push(JobInputFile {
            name: name.to_string(),
            file_base_name: file_base_name.to_string(),
            url: url.to_string(),
        });
        self
    }

    pub fn with_output(mut self, name: &str, file_base_name: &str) -> Self {
        self.output_files.push(JobOutputFile {
            name: name.to_string(),
            file_base_name: file_base_name.to_string(),
        });
        self
    }

    pub fn with_parameter(mut self, name: &str, value: Value) -> Self {
        self.parameters.push(JobParameter {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn input(&self, name: &str) -> Option<&JobInputFile> {
        self.input_files.iter().find(|file| file.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&JobOutputFile> {
        self.output_files.iter().find(|file| file.name == name)
    }

    pub fn processor(&self) -> Result<&'static ProcessorDescriptor, JobError> {
        find_processor(&self.app_name, &self.processor_name)
    }

    /// Parameters checked against the processor schema, with defaults filled in.
    pub fn resolved_parameters(&self) -> Result<Map<String, Value>, JobError> {
        self.processor()?.resolve_parameters(
            self.parameters
                .iter()
                .map(|parameter| (parameter.name.as_str(), &parameter.value)),
        )
    }

    pub fn validate(&self) -> Result<&'static ProcessorDescriptor, JobError> {
        let processor = self.processor()?;
        let parameters = self.resolved_parameters()?;
        match processor.name {
            PHOTON_FLUX_PROCESSOR => {
                PhotonFluxParams::from_parameters(&parameters)?;
            }
            VOLUSEG_PROCESSOR => {
                VolusegParams::from_parameters(&parameters)?;
            }
            _ => {}
        }

        check_files(
            processor,
            "input",
            self.input_files
                .iter()
                .map(|file| (file.name.as_str(), file.file_base_name.as_str(), Some(file.url.as_str()))),
            processor.inputs.iter().map(|slot| slot.name),
        )?;
        check_files(
            processor,
            "output",
            self.output_files
                .iter()
                .map(|file| (file.name.as_str(), file.file_base_name.as_str(), None)),
            processor.outputs.iter().map(|slot| slot.name),
        )?;
        Ok(processor)
    }
}

fn check_files<'a>(
    processor: &ProcessorDescriptor,
    kind: &'static str,
    files: impl Iterator<Item = (&'a str, &'a str, Option<&'a str>)>,
    declared: impl Iterator<Item = &'static str>,
) -> Result<(), JobError> {
    let declared: BTreeSet<&str> = declared.collect();
    let mut seen = BTreeSet::new();

    for (name, file_base_name, url) in files {
        let empty_field = if name.trim().is_empty() {
            Some("name")
        } else if file_base_name.trim().is_empty() {
            Some("fileBaseName")
        } else if url.is_some_and(|url| url.trim().is_empty()) {
            Some("url")
        } else {
            None
        };
        if let Some(field) = empty_field {
            return Err(JobError::EmptyFileField { kind, field });
        }
        if !declared.contains(name) {
            return Err(JobError::UndeclaredFile {
                processor: processor.name.to_string(),
                kind,
                name: name.to_string(),
            });
        }
        if !seen.insert(name) {
            return Err(JobError::DuplicateFile {
                kind,
                name: name.to_string(),
            });
        }
    }

    if let Some(missing) = declared.difference(&seen).next() {
        return Err(JobError::MissingFile {
            processor: processor.name.to_string(),
            kind,
            name: missing.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequiredResources {
    pub num_cpus: u32,
    pub num_gpus: u32,
    pub memory_gb: f64,
    pub time_sec: f64,
}

impl Default for JobRequiredResources {
    fn default() -> Self {
        Self {
            num_cpus: 2,
            num_gpus: 0,
            memory_gb: 4.0,
            time_sec: 3600.0,
        }
    }
}

impl JobRequiredResources {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.num_cpus == 0 {
            return Err(JobError::Resources("numCpus must be at least 1".to_string()));
        }
        if !(self.memory_gb.is_finite() && self.memory_gb > 0.0) {
            return Err(JobError::Resources(format!(
                "memoryGb must be positive, got {}",
                self.memory_gb
            )));
        }
        if !(self.time_sec.is_finite() && self.time_sec > 0.0) {
            return Err(JobError::Resources(format!(
                "timeSec must be positive, got {}",
                self.time_sec
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub service_name: String,
    pub job_definition: JobDefinition,
    pub required_resources: JobRequiredResources,
    #[serde(default)]
    pub target_compute_client_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skip_cache: bool,
}

impl JobSubmission {
    pub fn validate(&self) -> Result<&'static ProcessorDescriptor, JobError> {
        if self.service_name.trim().is_empty() {
            return Err(JobError::MissingServiceName);
        }
        self.required_resources.validate()?;
        self.job_definition.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub job_url: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Accepts job submissions on behalf of a Dendro service.
pub trait JobClient {
    fn submit(&self, submission: &JobSubmission) -> Result<JobHandle, JobError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpooledJob {
    #[serde(flatten)]
    pub handle: JobHandle,
    pub submission: JobSubmission,
}

/// Writes validated submissions to a spool directory, one JSON file per job,
/// for a dispatcher to hand over to the Dendro service.
#[derive(Debug, Clone)]
pub struct SpoolJobClient {
    spool_dir: PathBuf,
    base_url: String,
}

impl SpoolJobClient {
    pub fn new(spool_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            base_url: base_url.into(),
        }
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.spool_dir.join(format!("{job_id}.json"))
    }

    pub fn read_job(&self, job_id: Uuid) -> Result<SpooledJob, JobError> {
        let path = self.job_path(job_id);
        let text = fs::read_to_string(&path).map_err(|source| JobError::Spool {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl JobClient for SpoolJobClient {
    fn submit(&self, submission: &JobSubmission) -> Result<JobHandle, JobError> {
        let processor = submission.validate()?;

        let job_id = Uuid::new_v4();
        let handle = JobHandle {
            job_id,
            job_url: format!("{}/job/{job_id}", self.base_url.trim_end_matches('/')),
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
        };
        let spooled = SpooledJob {
            handle: handle.clone(),
            submission: submission.clone(),
        };

        let spool_error = |path: &PathBuf, source| JobError::Spool {
            path: path.display().to_string(),
            source,
        };
        fs::create_dir_all(&self.spool_dir).map_err(|source| spool_error(&self.spool_dir, source))?;
        let path = self.job_path(job_id);
        fs::write(&path, serde_json::to_vec_pretty(&spooled)?)
            .map_err(|source| spool_error(&path, source))?;

        info!(
            job_id = %job_id,
            service = %submission.service_name,
            processor = processor.name,
            "job submitted"
        );
        Ok(handle)
    }
}
