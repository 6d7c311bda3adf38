use crate::CellKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const DOCUMENT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported document version {0}")]
    UnsupportedVersion(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotebookDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub cells: Vec<DocumentCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentCell {
    #[serde(rename = "type")]
    pub kind: CellKind,
    #[serde(default)]
    pub content: String,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl DocumentCell {
    pub fn new(kind: CellKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

impl NotebookDocument {
    pub fn new(cells: Vec<DocumentCell>) -> Self {
        Self {
            version: default_version(),
            cells,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, DocumentError> {
        let document: NotebookDocument = serde_json::from_str(raw)?;
        document.check_version()?;
        Ok(document)
    }

    pub fn to_json_pretty(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    fn check_version(&self) -> Result<(), DocumentError> {
        let major = self.version.trim().split('.').next().unwrap_or_default();
        if major != "1" {
            return Err(DocumentError::UnsupportedVersion(self.version.clone()));
        }
        Ok(())
    }
}
