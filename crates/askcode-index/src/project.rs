//! Stable per-project identity, persisted in `.chat/source.json`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::persist::{is_malformed, read_json, write_json_atomic};

pub const MARKER_FILE: &str = "source.json";

/// Opaque identifier binding a project to its collection entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceName(String);

impl SourceName {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    #[serde(rename = "SOURCE_NAME")]
    source_name: SourceName,
}

pub struct ProjectMarker;

impl ProjectMarker {
    #[must_use]
    pub fn path(chat_dir: &Path) -> PathBuf {
        chat_dir.join(MARKER_FILE)
    }

    /// Read the project's source name, creating and persisting a fresh one
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the marker cannot be read or written, or `Parse` if an
    /// existing marker is malformed.
    pub fn load_or_create(chat_dir: &Path) -> Result<SourceName> {
        let path = Self::path(chat_dir);
        match read_json::<Marker>(&path) {
            Ok(Some(marker)) if !marker.source_name.as_str().trim().is_empty() => {
                return Ok(marker.source_name);
            }
            Ok(Some(_)) => {
                return Err(IndexError::Parse(format!(
                    "{}: SOURCE_NAME is empty",
                    path.display()
                )));
            }
            Ok(None) => {}
            Err(e) if is_malformed(&e) => {
                return Err(IndexError::Parse(format!("{}: {e}", path.display())));
            }
            Err(e) => return Err(e.into()),
        }

        let marker = Marker {
            source_name: SourceName::generate(),
        };
        write_json_atomic(&path, &marker)?;
        tracing::info!(source_name = %marker.source_name, "created project marker");
        Ok(marker.source_name)
    }

    /// Existing source name, if the project has one.
    ///
    /// # Errors
    ///
    /// Same as [`ProjectMarker::load_or_create`], minus creation.
    pub fn load(chat_dir: &Path) -> Result<Option<SourceName>> {
        let path = Self::path(chat_dir);
        read_json::<Marker>(&path)
            .map(|m| m.map(|m| m.source_name))
            .map_err(|e| IndexError::Parse(format!("{}: {e}", path.display())))
    }
}
