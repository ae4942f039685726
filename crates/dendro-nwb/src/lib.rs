pub mod errors;
pub mod lindi;
pub mod memory;
pub mod model;
pub mod remote;

mod chunks;

pub use errors::NwbError;
pub use lindi::LindiFile;
pub use memory::MemoryFile;
pub use model::{
    normalize_path, AxisSelection, ByteOrder, DatasetInfo, Dtype, HierarchicalFile, Hyperslab,
    Node, NodeKind, ScalarKind,
};
pub use remote::{
    BytesFile, FileOpener, HttpRangeFile, LocalRangeFile, RemoteFile, UrlOpener,
};

#[cfg(test)]
mod tests;
