use std::fmt;
use std::ops::Range;

use ndarray::ArrayD;
use serde_json::{Map, Value};

use crate::errors::NwbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    pub fn size(&self) -> usize {
        match self {
            ScalarKind::U8 | ScalarKind::I8 => 1,
            ScalarKind::U16 | ScalarKind::I16 => 2,
            ScalarKind::U32 | ScalarKind::I32 | ScalarKind::F32 => 4,
            ScalarKind::U64 | ScalarKind::I64 | ScalarKind::F64 => 8,
        }
    }
}

/// Element type of a stored array, parsed from a numpy-style type string (`<f4`, `|u1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub kind: ScalarKind,
    pub order: ByteOrder,
}

impl Dtype {
    pub fn parse(code: &str) -> Option<Self> {
        let mut chars = code.chars();
        let order = match chars.next()? {
            '<' | '|' | '=' => ByteOrder::Little,
            '>' => ByteOrder::Big,
            _ => return None,
        };
        let kind = match chars.as_str() {
            "u1" | "b1" => ScalarKind::U8,
            "i1" => ScalarKind::I8,
            "u2" => ScalarKind::U16,
            "i2" => ScalarKind::I16,
            "u4" => ScalarKind::U32,
            "i4" => ScalarKind::I32,
            "u8" => ScalarKind::U64,
            "i8" => ScalarKind::I64,
            "f4" => ScalarKind::F32,
            "f8" => ScalarKind::F64,
            _ => return None,
        };
        Some(Self { kind, order })
    }

    pub fn item_size(&self) -> usize {
        self.kind.size()
    }

    /// Decodes one element; `bytes` must hold exactly `item_size()` bytes.
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        let order = self.order;
        macro_rules! read {
            ($ty:ty) => {{
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                match order {
                    ByteOrder::Little => <$ty>::from_le_bytes(raw) as f64,
                    ByteOrder::Big => <$ty>::from_be_bytes(raw) as f64,
                }
            }};
        }

        match self.kind {
            ScalarKind::U8 => bytes[0] as f64,
            ScalarKind::I8 => bytes[0] as i8 as f64,
            ScalarKind::U16 => read!(u16),
            ScalarKind::I16 => read!(i16),
            ScalarKind::U32 => read!(u32),
            ScalarKind::I32 => read!(i32),
            ScalarKind::U64 => read!(u64),
            ScalarKind::I64 => read!(i64),
            ScalarKind::F32 => read!(f32),
            ScalarKind::F64 => read!(f64),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.order {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
        };
        let code = match self.kind {
            ScalarKind::U8 => "u1",
            ScalarKind::I8 => "i1",
            ScalarKind::U16 => "u2",
            ScalarKind::I16 => "i2",
            ScalarKind::U32 => "u4",
            ScalarKind::I32 => "i4",
            ScalarKind::U64 => "u8",
            ScalarKind::I64 => "i8",
            ScalarKind::F32 => "f4",
            ScalarKind::F64 => "f8",
        };
        write!(f, "{order}{code}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    /// Type string as stored; text and compound datasets keep their code but are not readable.
    pub dtype: String,
    pub fill_value: f64,
}

impl DatasetInfo {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numeric_dtype(&self) -> Option<Dtype> {
        Dtype::parse(&self.dtype)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Group,
    Dataset(DatasetInfo),
}

/// One named object of the file tree. Paths never carry a leading separator.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    pub attributes: Map<String, Value>,
}

impl Node {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }

    pub fn dataset(&self) -> Option<&DatasetInfo> {
        match &self.kind {
            NodeKind::Dataset(info) => Some(info),
            NodeKind::Group => None,
        }
    }

    pub fn neurodata_type(&self) -> Option<&str> {
        self.attributes.get("neurodata_type").and_then(Value::as_str)
    }

    pub fn attribute_f64(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(Value::as_f64)
    }
}

/// Selection along a single axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisSelection {
    All,
    Range(Range<usize>),
    Indices(Vec<usize>),
}

impl AxisSelection {
    /// Source indices selected on an axis of length `extent`, in output order.
    pub fn resolve(&self, extent: usize) -> Result<Vec<usize>, String> {
        match self {
            AxisSelection::All => Ok((0..extent).collect()),
            AxisSelection::Range(range) => {
                if range.start > range.end || range.end > extent {
                    return Err(format!(
                        "range {}..{} exceeds axis length {}",
                        range.start, range.end, extent
                    ));
                }
                Ok(range.clone().collect())
            }
            AxisSelection::Indices(indices) => {
                if let Some(bad) = indices.iter().find(|&&idx| idx >= extent) {
                    return Err(format!("index {bad} exceeds axis length {extent}"));
                }
                Ok(indices.clone())
            }
        }
    }
}

/// Per-axis selection over an n-dimensional dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub axes: Vec<AxisSelection>,
}

impl Hyperslab {
    pub fn new(axes: Vec<AxisSelection>) -> Self {
        Self { axes }
    }

    pub fn all(ndim: usize) -> Self {
        Self {
            axes: vec![AxisSelection::All; ndim],
        }
    }
}

/// Read access to a tree of named groups and datasets.
pub trait HierarchicalFile {
    fn location(&self) -> &str;

    /// Every object in the file, in path order.
    fn nodes(&self) -> Vec<&Node>;

    fn node(&self, path: &str) -> Option<&Node>;

    fn read(&self, path: &str, selection: &Hyperslab) -> Result<ArrayD<f64>, NwbError>;
}

/// Strips the leading separator the HDF5 convention puts on absolute paths.
pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}
