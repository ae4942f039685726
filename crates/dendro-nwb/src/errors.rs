use thiserror::Error;

#[derive(Debug, Error)]
pub enum NwbError {
    #[error("unsupported url '{url}': {reason}")]
    UnsupportedUrl { url: String, reason: String },

    #[error("I/O error reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error reading {url}: {message}")]
    Http { url: String, message: String },

    #[error("byte range {offset}+{len} is outside {location} ({size} bytes)")]
    RangeOutOfBounds {
        location: String,
        offset: u64,
        len: usize,
        size: u64,
    },

    #[error("invalid LINDI document: {0}")]
    InvalidDocument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no object at path '{0}'")]
    MissingObject(String),

    #[error("'{0}' is a group, not a dataset")]
    NotADataset(String),

    #[error("dataset '{path}' has unsupported dtype '{dtype}'")]
    UnsupportedDtype { path: String, dtype: String },

    #[error("dataset '{path}' is not readable: {reason}")]
    UnsupportedLayout { path: String, reason: String },

    #[error("selection on dataset '{path}' is invalid: {message}")]
    Selection { path: String, message: String },

    #[error("chunk '{key}' could not be decoded: {message}")]
    Chunk { key: String, message: String },
}

impl NwbError {
    pub(crate) fn io(location: impl Into<String>, source: std::io::Error) -> Self {
        NwbError::Io {
            location: location.into(),
            source,
        }
    }

    pub(crate) fn http(url: &str, message: impl Into<String>) -> Self {
        NwbError::Http {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn selection(path: &str, message: impl Into<String>) -> Self {
        NwbError::Selection {
            path: path.to_string(),
            message: message.into(),
        }
    }
}
