use std::collections::BTreeMap;

use dendro_nwb::{HierarchicalFile, Node};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SeriesLookupError;

/// NWB neurodata types treated as imaging series.
pub const IMAGING_SERIES_TYPES: &[&str] = &["TwoPhotonSeries", "OnePhotonSeries"];

const DATA_SUFFIX: &str = "/data";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagingSeries {
    /// Identity of the series, e.g. `acquisition/TwoPhotonSeries1`.
    pub path: String,
    /// Storage path of the (time, x, y) data array.
    pub data_path: String,
    pub neurodata_type: String,
    pub shape: [usize; 3],
    pub rate: Option<f64>,
}

impl ImagingSeries {
    pub fn num_frames(&self) -> usize {
        self.shape[0]
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Series identity from the storage path of its data array: the trailing
/// `/data` and the leading separator are dropped.
pub fn series_path_from_storage(storage_path: &str) -> String {
    let trimmed = storage_path.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(DATA_SUFFIX).unwrap_or(trimmed);
    trimmed.trim_start_matches('/').to_string()
}

/// Path-keyed index of the imaging series in one file, built once at open time.
#[derive(Debug, Clone, Default)]
pub struct SeriesIndex {
    series: BTreeMap<String, ImagingSeries>,
}

impl SeriesIndex {
    pub fn build(file: &dyn HierarchicalFile) -> Self {
        let mut series = BTreeMap::new();

        for node in file.nodes() {
            let Some(neurodata_type) = imaging_type(node) else {
                continue;
            };
            match describe_series(file, node, neurodata_type) {
                Some(entry) => {
                    debug!(series = %entry.path, shape = ?entry.shape, "found imaging series");
                    series.insert(entry.path.clone(), entry);
                }
                None => warn!(
                    group = %node.path,
                    neurodata_type,
                    "skipping imaging series without readable (time, x, y) data"
                ),
            }
        }

        Self { series }
    }

    pub fn from_series(entries: impl IntoIterator<Item = ImagingSeries>) -> Self {
        Self {
            series: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImagingSeries> {
        self.series.values()
    }

    pub fn get(&self, path: &str) -> Option<&ImagingSeries> {
        self.series.get(&series_path_from_storage(path))
    }

    /// Resolves exactly one series. A requested path must match; without one the
    /// file has to contain a single imaging series.
    pub fn resolve(&self, requested: Option<&str>) -> Result<&ImagingSeries, SeriesLookupError> {
        match requested {
            Some(path) => self.get(path).ok_or_else(|| SeriesLookupError::NotFound {
                requested: Some(path.to_string()),
                available: self.paths(),
            }),
            None => {
                let mut values = self.series.values();
                match (values.next(), values.next()) {
                    (Some(only), None) => Ok(only),
                    (None, _) => Err(SeriesLookupError::NotFound {
                        requested: None,
                        available: Vec::new(),
                    }),
                    (Some(_), Some(_)) => Err(SeriesLookupError::Ambiguous {
                        available: self.paths(),
                    }),
                }
            }
        }
    }

    /// Every series in path order; fails when there are none.
    pub fn all(&self) -> Result<Vec<&ImagingSeries>, SeriesLookupError> {
        if self.series.is_empty() {
            return Err(SeriesLookupError::NotFound {
                requested: None,
                available: Vec::new(),
            });
        }
        Ok(self.series.values().collect())
    }
}

fn imaging_type(node: &Node) -> Option<&str> {
    if !node.is_group() {
        return None;
    }
    node.neurodata_type()
        .filter(|kind| IMAGING_SERIES_TYPES.contains(kind))
}

fn describe_series(
    file: &dyn HierarchicalFile,
    node: &Node,
    neurodata_type: &str,
) -> Option<ImagingSeries> {
    let data_node = file.node(&format!("{}{}", node.path, DATA_SUFFIX))?;
    let info = data_node.dataset()?;
    info.numeric_dtype()?;
    let shape: [usize; 3] = info.shape.as_slice().try_into().ok()?;

    let rate = node.attribute_f64("rate").or_else(|| {
        file.node(&format!("{}/starting_time", node.path))
            .and_then(|starting_time| starting_time.attribute_f64("rate"))
    });

    Some(ImagingSeries {
        path: series_path_from_storage(&format!("/{}", data_node.path)),
        data_path: data_node.path.clone(),
        neurodata_type: neurodata_type.to_string(),
        shape,
        rate,
    })
}
