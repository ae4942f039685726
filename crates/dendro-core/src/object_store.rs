use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

/// Where processor outputs end up once written locally.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    inner: ObjectStoreKind,
}

#[derive(Debug, Clone, Default)]
enum ObjectStoreKind {
    #[default]
    Noop,
    LocalDir(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub key: String,
    pub size_bytes: u64,
    pub blake3: String,
    /// False when the store discarded the bytes.
    pub stored: bool,
}

impl ObjectStore {
    pub fn noop() -> Self {
        ObjectStore {
            inner: ObjectStoreKind::Noop,
        }
    }

    pub fn local_dir(root: impl Into<PathBuf>) -> Self {
        ObjectStore {
            inner: ObjectStoreKind::LocalDir(root.into()),
        }
    }

    pub fn from_output_dir(output_dir: Option<&Path>) -> Self {
        match output_dir {
            Some(root) => Self::local_dir(root),
            None => Self::noop(),
        }
    }

    pub fn put_object(&self, key: &str, contents: &[u8]) -> Result<UploadReceipt> {
        let size_bytes = contents.len() as u64;
        let blake3 = blake3::hash(contents).to_hex().to_string();

        let root = match &self.inner {
            ObjectStoreKind::Noop => {
                warn!(key, size_bytes, "no output directory configured; object discarded");
                return Ok(UploadReceipt {
                    key: key.to_string(),
                    size_bytes,
                    blake3,
                    stored: false,
                });
            }
            ObjectStoreKind::LocalDir(root) => root,
        };

        let target = root.join(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create object directory {}", parent.display())
            })?;
        }
        fs::write(&target, contents)
            .with_context(|| format!("failed to write object {}", target.display()))?;

        info!(key, size_bytes, "stored output object");
        Ok(UploadReceipt {
            key: key.to_string(),
            size_bytes,
            blake3,
            stored: true,
        })
    }

    pub fn upload_file(&self, path: &Path, key: &str) -> Result<UploadReceipt> {
        let contents =
            fs::read(path).with_context(|| format!("failed to read output file {}", path.display()))?;
        self.put_object(key, &contents)
    }

    pub fn output_key(job_id: &str, file_base_name: &str) -> String {
        format!("outputs/{job_id}/{file_base_name}")
    }
}
