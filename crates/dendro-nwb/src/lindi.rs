use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, ZlibDecoder};
use ndarray::ArrayD;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::chunks::{self, ChunkData};
use crate::errors::NwbError;
use crate::model::{normalize_path, DatasetInfo, HierarchicalFile, Hyperslab, Node, NodeKind};
use crate::remote::{FileOpener, RemoteFile, UrlOpener};

#[derive(Debug, Deserialize)]
struct LindiDocument {
    refs: Map<String, Value>,
    #[serde(default)]
    templates: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct ChunkLayout {
    separator: char,
    compressor: Option<String>,
    filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Zlib,
    Gzip,
}

impl ChunkLayout {
    fn codec(&self, path: &str) -> Result<Option<Codec>, NwbError> {
        let unsupported = |reason: String| NwbError::UnsupportedLayout {
            path: path.to_string(),
            reason,
        };
        if let Some(filter) = self.filters.first() {
            return Err(unsupported(format!("chunk filter '{filter}' is not supported")));
        }
        match self.compressor.as_deref() {
            None => Ok(None),
            Some("zlib") => Ok(Some(Codec::Zlib)),
            Some("gzip") => Ok(Some(Codec::Gzip)),
            Some(other) => Err(unsupported(format!(
                "compressed chunks ({other}) are not supported"
            ))),
        }
    }
}

fn decompress(key: &str, codec: Codec, bytes: &[u8]) -> Result<Vec<u8>, NwbError> {
    let mut decoded = Vec::new();
    let result = match codec {
        Codec::Zlib => ZlibDecoder::new(bytes).read_to_end(&mut decoded),
        Codec::Gzip => GzDecoder::new(bytes).read_to_end(&mut decoded),
    };
    result.map_err(|err| NwbError::Chunk {
        key: key.to_string(),
        message: format!("{codec:?} stream is corrupt: {err}"),
    })?;
    Ok(decoded)
}

/// A LINDI reference document: an HDF5 tree rendered as zarr-style JSON with
/// inline or externally referenced chunks.
pub struct LindiFile {
    location: String,
    nodes: BTreeMap<String, Node>,
    layouts: HashMap<String, ChunkLayout>,
    refs: Map<String, Value>,
    templates: HashMap<String, String>,
    opener: Box<dyn FileOpener>,
}

impl std::fmt::Debug for LindiFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LindiFile")
            .field("location", &self.location)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl LindiFile {
    /// Opens a document from an `http(s)` URL, a `file://` URL or a local path.
    /// Chunk references resolve the same way.
    pub fn open(url: &str) -> Result<Self, NwbError> {
        let opener = UrlOpener::default();
        let source = opener.open(url)?;
        Self::from_remote(source.as_ref(), Box::new(opener))
    }

    pub fn from_remote(
        source: &dyn RemoteFile,
        opener: Box<dyn FileOpener>,
    ) -> Result<Self, NwbError> {
        let bytes = source.read_all()?;
        Self::from_slice(source.location(), &bytes, opener)
    }

    pub fn from_slice(
        location: &str,
        bytes: &[u8],
        opener: Box<dyn FileOpener>,
    ) -> Result<Self, NwbError> {
        let document: LindiDocument = serde_json::from_slice(bytes)?;

        let mut groups: Vec<String> = Vec::new();
        let mut arrays: Vec<(String, Value)> = Vec::new();
        let mut attributes: HashMap<String, Map<String, Value>> = HashMap::new();

        for (key, value) in &document.refs {
            let (parent, leaf) = split_key(key);
            match leaf {
                ".zgroup" => groups.push(parent.to_string()),
                ".zarray" => arrays.push((parent.to_string(), metadata_value(key, value)?)),
                ".zattrs" => {
                    let attrs = match metadata_value(key, value)? {
                        Value::Object(map) => map,
                        _ => {
                            return Err(NwbError::InvalidDocument(format!(
                                "'{key}' must hold a JSON object"
                            )))
                        }
                    };
                    attributes.insert(parent.to_string(), attrs);
                }
                _ => {}
            }
        }

        let mut nodes = BTreeMap::new();
        let mut layouts = HashMap::new();

        for path in groups {
            let attrs = attributes.remove(&path).unwrap_or_default();
            nodes.insert(
                path.clone(),
                Node {
                    path,
                    kind: NodeKind::Group,
                    attributes: attrs,
                },
            );
        }

        for (path, zarray) in arrays {
            let (info, layout) = parse_zarray(&path, &zarray)?;
            let attrs = attributes.remove(&path).unwrap_or_default();
            layouts.insert(path.clone(), layout);
            nodes.insert(
                path.clone(),
                Node {
                    path,
                    kind: NodeKind::Dataset(info),
                    attributes: attrs,
                },
            );
        }

        debug!(location, objects = nodes.len(), "indexed LINDI document");

        Ok(Self {
            location: location.to_string(),
            nodes,
            layouts,
            refs: document.refs,
            templates: document.templates,
            opener,
        })
    }

    fn chunk_key(&self, path: &str, layout: &ChunkLayout, coords: &[usize]) -> String {
        let suffix = if coords.is_empty() {
            "0".to_string()
        } else {
            coords
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(&layout.separator.to_string())
        };
        if path.is_empty() {
            suffix
        } else {
            format!("{path}/{suffix}")
        }
    }

    fn chunk_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, NwbError> {
        let Some(reference) = self.refs.get(key) else {
            return Ok(None);
        };

        match reference {
            Value::String(text) => match text.strip_prefix("base64:") {
                Some(encoded) => STANDARD
                    .decode(encoded)
                    .map(Some)
                    .map_err(|err| NwbError::Chunk {
                        key: key.to_string(),
                        message: err.to_string(),
                    }),
                None => Ok(Some(text.as_bytes().to_vec())),
            },
            Value::Array(parts) => {
                let url = parts
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| NwbError::Chunk {
                        key: key.to_string(),
                        message: "reference is missing its url".to_string(),
                    })?;
                let url = self.expand_templates(url);
                let file = self.opener.open(&url)?;
                match (parts.get(1).and_then(Value::as_u64), parts.get(2).and_then(Value::as_u64)) {
                    (Some(offset), Some(size)) => {
                        let size = usize::try_from(size).map_err(|_| NwbError::Chunk {
                            key: key.to_string(),
                            message: format!("size {size} does not fit in memory"),
                        })?;
                        file.read_range(offset, size).map(Some)
                    }
                    (None, None) if parts.len() == 1 => file.read_all().map(Some),
                    _ => Err(NwbError::Chunk {
                        key: key.to_string(),
                        message: "expected [url, offset, size]".to_string(),
                    }),
                }
            }
            other => Err(NwbError::Chunk {
                key: key.to_string(),
                message: format!("unsupported reference {other}"),
            }),
        }
    }

    fn expand_templates(&self, url: &str) -> String {
        let mut expanded = url.to_string();
        for (name, value) in &self.templates {
            expanded = expanded.replace(&format!("{{{{{name}}}}}"), value);
        }
        expanded
    }
}

impl HierarchicalFile for LindiFile {
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
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| NwbError::MissingObject(path.to_string()))?;
        let info = node
            .dataset()
            .ok_or_else(|| NwbError::NotADataset(path.to_string()))?;
        let dtype = info.numeric_dtype().ok_or_else(|| NwbError::UnsupportedDtype {
            path: path.to_string(),
            dtype: info.dtype.clone(),
        })?;
        let layout = self
            .layouts
            .get(path)
            .ok_or_else(|| NwbError::MissingObject(path.to_string()))?;
        let codec = layout.codec(path)?;

        let item_size = dtype.item_size();
        chunks::assemble(path, info, selection, |coords| -> Result<ChunkData, NwbError> {
            let key = self.chunk_key(path, layout, coords);
            let Some(bytes) = self.chunk_bytes(&key)? else {
                return Ok(None);
            };
            let bytes = match codec {
                Some(codec) => decompress(&key, codec, &bytes)?,
                None => bytes,
            };
            if bytes.len() % item_size != 0 {
                return Err(NwbError::Chunk {
                    key,
                    message: format!("{} bytes is not a multiple of {item_size}", bytes.len()),
                });
            }
            Ok(Some(bytes.chunks_exact(item_size).map(|raw| dtype.decode(raw)).collect()))
        })
    }
}

fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((parent, leaf)) => (normalize_path(parent), leaf),
        None => ("", key),
    }
}

/// Metadata entries may be stored either as JSON objects or as JSON-encoded strings.
fn metadata_value(key: &str, value: &Value) -> Result<Value, NwbError> {
    match value {
        Value::String(text) => serde_json::from_str(text).map_err(|err| {
            NwbError::InvalidDocument(format!("'{key}' is not valid JSON: {err}"))
        }),
        Value::Object(_) => Ok(value.clone()),
        other => Err(NwbError::InvalidDocument(format!(
            "'{key}' has unexpected value {other}"
        ))),
    }
}

fn parse_zarray(path: &str, zarray: &Value) -> Result<(DatasetInfo, ChunkLayout), NwbError> {
    let invalid = |field: &str| {
        NwbError::InvalidDocument(format!("'{path}/.zarray' has a missing or invalid '{field}'"))
    };

    let shape = usize_list(zarray.get("shape")).ok_or_else(|| invalid("shape"))?;
    let chunks = usize_list(zarray.get("chunks")).ok_or_else(|| invalid("chunks"))?;
    let dtype = match zarray.get("dtype") {
        Some(Value::String(code)) => code.clone(),
        Some(other) => other.to_string(),
        None => return Err(invalid("dtype")),
    };

    if let Some(order) = zarray.get("order").and_then(Value::as_str) {
        if order != "C" {
            return Err(NwbError::UnsupportedLayout {
                path: path.to_string(),
                reason: format!("memory order '{order}'"),
            });
        }
    }

    let fill_value = match zarray.get("fill_value") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => match s.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            _ => 0.0,
        },
        _ => 0.0,
    };

    let separator = match zarray.get("dimension_separator").and_then(Value::as_str) {
        Some("/") => '/',
        _ => '.',
    };

    let codec_id = |codec: &Value, fallback: &str| {
        codec
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string()
    };
    let compressor = match zarray.get("compressor") {
        None | Some(Value::Null) => None,
        Some(codec) => Some(codec_id(codec, "unknown")),
    };
    let filters: Vec<String> = match zarray.get("filters") {
        Some(Value::Array(filters)) => filters.iter().map(|f| codec_id(f, "filter")).collect(),
        _ => Vec::new(),
    };

    Ok((
        DatasetInfo {
            shape,
            chunks,
            dtype,
            fill_value,
        },
        ChunkLayout {
            separator,
            compressor,
            filters,
        },
    ))
}

fn usize_list(value: Option<&Value>) -> Option<Vec<usize>> {
    value?
        .as_array()?
        .iter()
        .map(|v| v.as_u64().and_then(|n| usize::try_from(n).ok()))
        .collect()
}
