//! The hand-off point to source-specific normalizers.
//!
//! The ingestion core only produces [`DecodedFile`]s. Choosing a normalizer
//! and turning files into records belongs to an [`AdapterSelector`].

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// A top-level entry decoded as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedFile {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("no adapter recognizes this package")]
    NoMatch,
    #[error("{path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Normalizes one source's files into records.
pub trait Adapter {
    fn source_type(&self) -> &str;
    fn normalize(&self, files: &[DecodedFile]) -> Result<Vec<Value>, AdapterError>;
}

/// Picks an [`Adapter`] for a package, optionally steered by the caller's hint.
pub trait AdapterSelector: Send + Sync {
    fn select(
        &self,
        files: &[DecodedFile],
        selected_source: Option<&str>,
    ) -> Result<Box<dyn Adapter>, AdapterError>;
}

/// Emits one `{path, text}` record per file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFilesAdapter;

impl Adapter for RawFilesAdapter {
    fn source_type(&self) -> &str {
        RawFilesSelector::SOURCE
    }

    fn normalize(&self, files: &[DecodedFile]) -> Result<Vec<Value>, AdapterError> {
        Ok(files
            .iter()
            .map(|file| json!({ "path": file.path, "text": file.text }))
            .collect())
    }
}

/// Always selects [`RawFilesAdapter`]; any other requested source is unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFilesSelector;

impl RawFilesSelector {
    pub const SOURCE: &'static str = "raw";
}

impl AdapterSelector for RawFilesSelector {
    fn select(
        &self,
        _files: &[DecodedFile],
        selected_source: Option<&str>,
    ) -> Result<Box<dyn Adapter>, AdapterError> {
        match selected_source {
            None | Some(Self::SOURCE) => Ok(Box::new(RawFilesAdapter)),
            Some(other) => Err(AdapterError::UnknownSource(other.to_string())),
        }
    }
}
