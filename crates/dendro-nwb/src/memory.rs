use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde_json::{Map, Value};

use crate::errors::NwbError;
use crate::model::{normalize_path, DatasetInfo, HierarchicalFile, Hyperslab, Node, NodeKind};

/// A file tree held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    location: String,
    nodes: BTreeMap<String, Node>,
    data: BTreeMap<String, ArrayD<f64>>,
}

impl MemoryFile {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, path: &str, attributes: Map<String, Value>) -> Self {
        self.insert_group(path, attributes);
        self
    }

    pub fn with_dataset(mut self, path: &str, data: ArrayD<f64>, attributes: Map<String, Value>) -> Self {
        self.insert_dataset(path, data, attributes);
        self
    }

    /// Adds a group; missing ancestors are created without attributes.
    pub fn insert_group(&mut self, path: &str, attributes: Map<String, Value>) {
        let path = normalize_path(path).to_string();
        self.ensure_ancestors(&path);
        self.nodes.insert(
            path.clone(),
            Node {
                path,
                kind: NodeKind::Group,
                attributes,
            },
        );
    }

    pub fn insert_dataset(&mut self, path: &str, data: ArrayD<f64>, attributes: Map<String, Value>) {
        let path = normalize_path(path).to_string();
        self.ensure_ancestors(&path);
        let shape = data.shape().to_vec();
        let info = DatasetInfo {
            chunks: shape.iter().map(|&extent| extent.max(1)).collect(),
            shape,
            dtype: "<f8".to_string(),
            fill_value: 0.0,
        };
        self.nodes.insert(
            path.clone(),
            Node {
                path: path.clone(),
                kind: NodeKind::Dataset(info),
                attributes,
            },
        );
        self.data.insert(path, data);
    }

    fn ensure_ancestors(&mut self, path: &str) {
        let mut prefix = String::new();
        let mut parts: Vec<&str> = path.split('/').collect();
        parts.pop();
        for part in parts {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.nodes.entry(prefix.clone()).or_insert_with(|| Node {
                path: prefix.clone(),
                kind: NodeKind::Group,
                attributes: Map::new(),
            });
        }
    }
}

impl HierarchicalFile for MemoryFile {
    fn location(&self) -> &str {
        &self.location
    }

    fn nodes(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(normalize_path(path))
    }

    fn read(&self, path: &str, selection: &Hyperslab) -> Result<ArrayD<f64>, NwbError> {
        let path = normalize_path(path);
        let data = match self.data.get(path) {
            Some(data) => data,
            None if self.nodes.contains_key(path) => {
                return Err(NwbError::NotADataset(path.to_string()))
            }
            None => return Err(NwbError::MissingObject(path.to_string())),
        };

        if selection.axes.len() != data.ndim() {
            return Err(NwbError::selection(
                path,
                format!("expected {} axes, got {}", data.ndim(), selection.axes.len()),
            ));
        }

        let mut per_axis = Vec::with_capacity(data.ndim());
        for (axis, axis_selection) in selection.axes.iter().enumerate() {
            let indices = axis_selection
                .resolve(data.shape()[axis])
                .map_err(|message| NwbError::selection(path, format!("axis {axis}: {message}")))?;
            per_axis.push(indices);
        }

        let out_shape: Vec<usize> = per_axis.iter().map(Vec::len).collect();
        Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |ix| {
            let source: Vec<usize> = (0..per_axis.len()).map(|axis| per_axis[axis][ix[axis]]).collect();
            data[IxDyn(&source)]
        }))
    }
}
