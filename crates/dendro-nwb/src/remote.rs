use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::debug;

use crate::errors::NwbError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Random-access byte source addressed by a URL.
pub trait RemoteFile {
    fn location(&self) -> &str;
    fn size(&self) -> Result<u64, NwbError>;
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, NwbError>;

    fn read_all(&self) -> Result<Vec<u8>, NwbError> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| NwbError::RangeOutOfBounds {
            location: self.location().to_string(),
            offset: 0,
            len: usize::MAX,
            size,
        })?;
        self.read_range(0, len)
    }
}

/// Resolves URLs found inside a document (chunk references) to byte sources.
pub trait FileOpener {
    fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, NwbError>;
}

/// Opens `http(s)` URLs as [`HttpRangeFile`]s sharing one client, and
/// everything else as local files.
#[derive(Debug, Clone, Default)]
pub struct UrlOpener {
    client: OnceCell<Client>,
}

impl UrlOpener {
    pub fn with_client(client: Client) -> Self {
        Self {
            client: OnceCell::with_value(client),
        }
    }
}

impl FileOpener for UrlOpener {
    fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, NwbError> {
        if is_http(url) {
            let client = self
                .client
                .get_or_try_init(http_client)
                .map_err(|err| NwbError::http(url, err.to_string()))?;
            return Ok(Box::new(HttpRangeFile::with_client(url, client.clone())?));
        }
        Ok(Box::new(LocalRangeFile::open(url)?))
    }
}

fn http_client() -> reqwest::Result<Client> {
    Client::builder().timeout(HTTP_TIMEOUT).build()
}

/// Remote file read with HTTP range requests. The size is fetched on first
/// use; ranges are validated by the server.
#[derive(Debug)]
pub struct HttpRangeFile {
    location: String,
    client: Client,
    size: OnceCell<u64>,
}

impl HttpRangeFile {
    pub fn open(url: &str) -> Result<Self, NwbError> {
        let client = http_client().map_err(|err| NwbError::http(url, err.to_string()))?;
        Self::with_client(url, client)
    }

    pub fn with_client(url: &str, client: Client) -> Result<Self, NwbError> {
        if !is_http(url) {
            return Err(NwbError::UnsupportedUrl {
                url: url.to_string(),
                reason: "expected an http or https url".to_string(),
            });
        }
        Ok(Self {
            location: url.to_string(),
            client,
            size: OnceCell::new(),
        })
    }

    fn fetch_size(&self) -> Result<u64, NwbError> {
        let response = self
            .client
            .head(&self.location)
            .send()
            .map_err(|err| NwbError::http(&self.location, err.to_string()))?;
        if response.status().is_success() {
            if let Some(size) = header_u64(response.headers().get(CONTENT_LENGTH)) {
                return Ok(size);
            }
        }

        // Some servers refuse HEAD; a one-byte range reports the total size.
        let response = self
            .client
            .get(&self.location)
            .header(RANGE, "bytes=0-0")
            .send()
            .map_err(|err| NwbError::http(&self.location, err.to_string()))?;
        let status = response.status();
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit_once('/'))
            .and_then(|(_, total)| total.trim().parse().ok());
        match (status, total) {
            (StatusCode::PARTIAL_CONTENT, Some(total)) => Ok(total),
            _ if status.is_success() => header_u64(response.headers().get(CONTENT_LENGTH))
                .ok_or_else(|| NwbError::http(&self.location, "server did not report a size")),
            _ => Err(NwbError::http(&self.location, format!("size request returned {status}"))),
        }
    }
}

impl RemoteFile for HttpRangeFile {
    fn location(&self) -> &str {
        &self.location
    }

    fn size(&self) -> Result<u64, NwbError> {
        self.size.get_or_try_init(|| self.fetch_size()).copied()
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, NwbError> {
        if let Some(&size) = self.size.get() {
            check_range(&self.location, offset, len, size)?;
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let last = offset + len as u64 - 1;
        debug!(url = %self.location, offset, len, "range request");
        let response = self
            .client
            .get(&self.location)
            .header(RANGE, format!("bytes={offset}-{last}"))
            .send()
            .map_err(|err| NwbError::http(&self.location, err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|err| NwbError::http(&self.location, err.to_string()))?;

        match status {
            StatusCode::PARTIAL_CONTENT if body.len() == len => Ok(body.to_vec()),
            StatusCode::PARTIAL_CONTENT => Err(NwbError::http(
                &self.location,
                format!("expected {len} bytes at offset {offset}, got {}", body.len()),
            )),
            // Range ignored: the whole body came back.
            StatusCode::OK => {
                check_range(&self.location, offset, len, body.len() as u64)?;
                let start = offset as usize;
                Ok(body[start..start + len].to_vec())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(NwbError::RangeOutOfBounds {
                location: self.location.clone(),
                offset,
                len,
                size: self.size()?,
            }),
            other => Err(NwbError::http(
                &self.location,
                format!("range request returned {other}"),
            )),
        }
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn header_u64(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct LocalRangeFile {
    location: String,
    path: PathBuf,
}

impl LocalRangeFile {
    /// Accepts `file://` URLs and bare filesystem paths.
    pub fn open(url: &str) -> Result<Self, NwbError> {
        let path = local_path_from_url(url)?;
        if !path.is_file() {
            return Err(NwbError::io(
                url,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }
        Ok(Self {
            location: url.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RemoteFile for LocalRangeFile {
    fn location(&self) -> &str {
        &self.location
    }

    fn size(&self) -> Result<u64, NwbError> {
        let metadata =
            std::fs::metadata(&self.path).map_err(|err| NwbError::io(&self.location, err))?;
        Ok(metadata.len())
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, NwbError> {
        let size = self.size()?;
        check_range(&self.location, offset, len, size)?;

        let mut file = File::open(&self.path).map_err(|err| NwbError::io(&self.location, err))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| NwbError::io(&self.location, err))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)
            .map_err(|err| NwbError::io(&self.location, err))?;
        Ok(buffer)
    }
}

/// In-memory byte source, mostly useful for tests and pre-fetched payloads.
#[derive(Debug, Clone)]
pub struct BytesFile {
    location: String,
    bytes: Vec<u8>,
}

impl BytesFile {
    pub fn new(location: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            location: location.into(),
            bytes,
        }
    }
}

impl RemoteFile for BytesFile {
    fn location(&self) -> &str {
        &self.location
    }

    fn size(&self) -> Result<u64, NwbError> {
        Ok(self.bytes.len() as u64)
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, NwbError> {
        check_range(&self.location, offset, len, self.bytes.len() as u64)?;
        let start = offset as usize;
        Ok(self.bytes[start..start + len].to_vec())
    }
}

fn check_range(location: &str, offset: u64, len: usize, size: u64) -> Result<(), NwbError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(NwbError::RangeOutOfBounds {
            location: location.to_string(),
            offset,
            len,
            size,
        }),
    }
}

fn local_path_from_url(url: &str) -> Result<PathBuf, NwbError> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    if is_http(url) {
        return Err(NwbError::UnsupportedUrl {
            url: url.to_string(),
            reason: "not a local file; open it with HttpRangeFile".to_string(),
        });
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(NwbError::UnsupportedUrl {
            url: url.to_string(),
            reason: format!("unknown scheme '{scheme}'"),
        });
    }
    Ok(PathBuf::from(url))
}

#[cfg(test)]
mod remote_tests {
    use super::*;

    #[test]
    fn bytes_file_rejects_reads_past_the_end() {
        let file = BytesFile::new("mem", vec![1, 2, 3, 4]);
        assert_eq!(file.read_range(1, 2).expect("in range"), vec![2, 3]);
        assert!(matches!(
            file.read_range(3, 2),
            Err(NwbError::RangeOutOfBounds { size: 4, .. })
        ));
    }

    #[test]
    fn http_urls_are_reported_as_unsupported() {
        let err = LocalRangeFile::open("https://example.org/file.nwb").unwrap_err();
        assert!(matches!(err, NwbError::UnsupportedUrl { .. }));
    }
}
