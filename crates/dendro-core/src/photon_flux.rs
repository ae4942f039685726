use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use dendro_nwb::HierarchicalFile;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::config::Settings;
use crate::error::{JobError, ProcessorError, SelectionError, SeriesLookupError};
use crate::estimator::{run_estimator, EstimatorFactory, SensitivityResult};
use crate::object_store::{ObjectStore, UploadReceipt};
use crate::selection::{extract_movie, CropEdges, FrameSelection, SelectionPlan};
use crate::series::{ImagingSeries, SeriesIndex};
use crate::statistics::aggregate;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhotonFluxParams {
    pub series_path: Option<String>,
    pub subset_frames: Option<Vec<usize>>,
    /// `[top, bottom, left, right]`
    pub crop_edges: Option<CropEdges>,
    pub process_all_series: bool,
}

impl PhotonFluxParams {
    pub fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, JobError> {
        let present: Map<String, Value> = parameters
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(present))?)
    }

    fn requested_path(&self) -> Option<&str> {
        self.series_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }

    pub fn mode(&self) -> RunMode {
        if self.requested_path().is_none() && self.process_all_series {
            RunMode::AllSeries
        } else {
            RunMode::Single
        }
    }

    fn targets<'a>(&self, index: &'a SeriesIndex) -> Result<Vec<&'a ImagingSeries>, SeriesLookupError> {
        match self.mode() {
            RunMode::AllSeries => index.all(),
            RunMode::Single => index.resolve(self.requested_path()).map(|series| vec![series]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Single,
    AllSeries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesFailure {
    pub series_path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhotonFluxRun {
    pub mode: RunMode,
    pub results: BTreeMap<String, SensitivityResult>,
    pub failures: Vec<SeriesFailure>,
}

impl PhotonFluxRun {
    /// A single-target run yields its record as is; an all-series run yields
    /// the records keyed by series path.
    pub fn to_document(&self) -> Result<Value, ProcessorError> {
        if self.results.is_empty() {
            return Err(ProcessorError::NoResults {
                failures: self.failures.len(),
            });
        }
        match self.mode {
            RunMode::Single => Ok(self
                .results
                .values()
                .next()
                .cloned()
                .map(SensitivityResult::into_value)
                .unwrap_or(Value::Null)),
            RunMode::AllSeries => Ok(Value::Object(
                self.results
                    .iter()
                    .map(|(path, record)| (path.clone(), record.clone().into_value()))
                    .collect(),
            )),
        }
    }
}

pub struct PhotonFluxProcessor<'a> {
    factory: &'a dyn EstimatorFactory,
    transpose: bool,
}

impl<'a> PhotonFluxProcessor<'a> {
    pub fn new(factory: &'a dyn EstimatorFactory, transpose: bool) -> Self {
        Self { factory, transpose }
    }

    pub fn run(
        &self,
        file: &dyn HierarchicalFile,
        params: &PhotonFluxParams,
    ) -> Result<PhotonFluxRun, ProcessorError> {
        let index = SeriesIndex::build(file);
        let targets = params.targets(&index)?;
        info!(
            file = file.location(),
            targets = targets.len(),
            mode = ?params.mode(),
            "resolved imaging series"
        );

        let plans = targets
            .into_iter()
            .map(|series| -> Result<_, SelectionError> {
                let selection = FrameSelection::resolve(
                    series.num_frames(),
                    params.subset_frames.as_deref(),
                    params.crop_edges,
                    self.transpose,
                );
                Ok((series, selection.plan(series.shape)?))
            })
            .collect::<Result<Vec<_>, SelectionError>>()?;

        let mut results = BTreeMap::new();
        let mut failures = Vec::new();
        for (series, plan) in plans {
            match self.process_series(file, series, &plan) {
                Ok(record) => {
                    info!(series = %series.path, "photon flux estimated");
                    results.insert(series.path.clone(), record);
                }
                Err(ProcessorError::Estimation(err)) => {
                    error!(series = %series.path, error = %err, "error processing series");
                    failures.push(SeriesFailure {
                        series_path: series.path.clone(),
                        message: err.to_string(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Ok(PhotonFluxRun {
            mode: params.mode(),
            results,
            failures,
        })
    }

    fn process_series(
        &self,
        file: &dyn HierarchicalFile,
        series: &ImagingSeries,
        plan: &SelectionPlan,
    ) -> Result<SensitivityResult, ProcessorError> {
        let movie = extract_movie(file, series, plan)?;
        info!(
            series = %series.path,
            frames = plan.frames.len(),
            shape = ?movie.shape(),
            estimator = self.factory.name(),
            "estimating photon flux"
        );
        let estimate = run_estimator(self.factory, &movie)?;
        Ok(aggregate(movie.view(), estimate)?)
    }
}

#[derive(Debug, Clone)]
pub struct PhotonFluxOutput {
    pub path: PathBuf,
    pub document: Value,
    pub receipt: UploadReceipt,
    pub failures: Vec<SeriesFailure>,
}

/// Runs the processor, writes the document to the configured output file and
/// uploads it under `output_key`.
pub fn run_photon_flux_job(
    file: &dyn HierarchicalFile,
    params: &PhotonFluxParams,
    factory: &dyn EstimatorFactory,
    settings: &Settings,
    store: &ObjectStore,
    output_key: &str,
) -> Result<PhotonFluxOutput, ProcessorError> {
    let run = PhotonFluxProcessor::new(factory, settings.transpose_spatial_axes).run(file, params)?;
    let document = run.to_document()?;

    let path = settings.output_path();
    fs::write(&path, serde_json::to_vec(&document)?)?;

    info!(path = %path.display(), key = output_key, "uploading output");
    let receipt = store
        .upload_file(&path, output_key)
        .map_err(|err| ProcessorError::Upload(format!("{err:#}")))?;
    info!(key = %receipt.key, "done uploading output");

    Ok(PhotonFluxOutput {
        path,
        document,
        receipt,
        failures: run.failures,
    })
}
