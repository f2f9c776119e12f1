//! Submission requests: the documents to convert and the background to apply.
//!
//! Validation happens here, before any network call. A request that fails
//! validation creates nothing and starts no subscription.

use crate::error::TrackerError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}){1,2}$").unwrap());

/// A document to upload: a file name plus its bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a document from disk, naming it after the file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrackerError::DocumentNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                TrackerError::DocumentReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        debug!("Read document {} ({} bytes)", name, bytes.len());
        Ok(Self { name, bytes })
    }
}

/// Background applied behind the rendered pages.
///
/// Exactly one of colour or image is carried, matching the service's rule
/// that the other field must be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Background {
    /// Keep the page as rendered. (default)
    #[default]
    None,
    /// Solid colour, `#RGB` or `#RRGGBB`.
    Color(String),
    /// An image stretched behind each page.
    Image(Document),
}

impl Background {
    /// Wire value of the `background_type` form field.
    pub fn kind(&self) -> &'static str {
        match self {
            Background::None => "none",
            Background::Color(_) => "color",
            Background::Image(_) => "image",
        }
    }

    /// Validate and build a colour background.
    pub fn color(value: impl Into<String>) -> Result<Self, TrackerError> {
        let value = value.into();
        if !HEX_COLOR.is_match(&value) {
            return Err(TrackerError::InvalidBackgroundColor { value });
        }
        Ok(Background::Color(value))
    }
}

/// Everything the service needs to start one or more conversion jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub documents: Vec<Document>,
    pub background: Background,
    /// Rendering DPI. `None` uses the tracker's configured default.
    pub dpi: Option<u32>,
}

impl SubmitRequest {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            background: Background::None,
            dpi: None,
        }
    }

    pub fn background(mut self, background: Background) -> Self {
        self.background = background;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = Some(dpi.clamp(72, 600));
        self
    }

    /// Read every path into a request with no background.
    pub async fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self, TrackerError> {
        let documents =
            futures::future::try_join_all(paths.iter().map(|p| Document::from_path(p.as_ref())))
                .await?;
        Ok(Self::new(documents))
    }

    /// Check the request before it leaves the process.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.documents.is_empty() {
            return Err(TrackerError::NoDocuments);
        }
        if let Background::Color(ref value) = self.background {
            if !HEX_COLOR.is_match(value) {
                return Err(TrackerError::InvalidBackgroundColor {
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Where a downloaded result comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Archive of one job's images.
    Job(String),
    /// Archive of every job in a batch.
    Batch(String),
    /// PNG of a job's first page before the background was applied.
    Original(String),
}

impl DownloadTarget {
    /// Default file name for the download.
    pub fn file_name(&self) -> String {
        match self {
            DownloadTarget::Job(id) => format!("{id}.zip"),
            DownloadTarget::Batch(id) => format!("batch-{id}.zip"),
            DownloadTarget::Original(id) => format!("{id}-original.png"),
        }
    }

    pub(crate) fn default_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadTarget::Job(id) => write!(f, "job {id}"),
            DownloadTarget::Batch(id) => write!(f, "batch {id}"),
            DownloadTarget::Original(id) => write!(f, "original snapshot of job {id}"),
        }
    }
}
