//! Per-project record of what has been indexed (`.chat/manifest.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::persist::{is_malformed, read_json, write_json_atomic};
use crate::project::SourceName;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    #[default]
    Empty,
    Indexing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub fingerprint: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub source_name: SourceName,
    pub status: IndexStatus,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl Manifest {
    #[must_use]
    pub fn path_in(chat_dir: &Path) -> PathBuf {
        chat_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest, or start an empty one bound to `source_name`.
    ///
    /// A manifest written for a different source name (the marker was
    /// regenerated) or an unknown format version is discarded, so every file
    /// is re-indexed.
    ///
    /// # Errors
    ///
    /// Returns `Io` on read failure.
    pub fn load(chat_dir: &Path, source_name: &SourceName) -> Result<Self> {
        let path = Self::path_in(chat_dir);
        let loaded = match read_json::<Self>(&path) {
            Ok(m) => m,
            Err(e) if is_malformed(&e) => {
                tracing::warn!(path = %path.display(), "manifest is corrupt, starting over: {e}");
                None
            }
            Err(e) => return Err(IndexError::Io(e)),
        };
        let manifest = match loaded {
            Some(m) if m.version == MANIFEST_VERSION && m.source_name == *source_name => Self {
                path,
                ..m
            },
            Some(m) => {
                tracing::warn!(
                    version = m.version,
                    "manifest belongs to another index, starting over"
                );
                Self::empty(path, source_name.clone())
            }
            None => Self::empty(path, source_name.clone()),
        };
        Ok(manifest)
    }

    fn empty(path: PathBuf, source_name: SourceName) -> Self {
        Self {
            version: MANIFEST_VERSION,
            source_name,
            status: IndexStatus::Empty,
            files: BTreeMap::new(),
            path,
        }
    }

    /// # Errors
    ///
    /// Returns `Io` if the atomic write fails.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, self)?;
        Ok(())
    }

    /// Persist a new status.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the atomic write fails.
    pub fn set_status(&mut self, status: IndexStatus) -> Result<()> {
        self.status = status;
        self.save()
    }

    #[must_use]
    pub fn is_unchanged(&self, path: &str, fingerprint: &str) -> bool {
        self.files
            .get(path)
            .is_some_and(|e| e.fingerprint == fingerprint)
    }

    /// Record a file as indexed and persist.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the atomic write fails.
    pub fn record(&mut self, path: &str, fingerprint: &str, chunk_count: usize) -> Result<()> {
        self.files.insert(
            path.to_owned(),
            FileEntry {
                fingerprint: fingerprint.to_owned(),
                chunk_count,
                indexed_at: Utc::now(),
            },
        );
        self.save()
    }

    /// Drop a file's entry and persist.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the atomic write fails.
    pub fn forget(&mut self, path: &str) -> Result<Option<FileEntry>> {
        let removed = self.files.remove(path);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Forget everything and reset to `empty`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file exists but cannot be removed.
    pub fn clear(&mut self) -> Result<()> {
        self.files.clear();
        self.status = IndexStatus::Empty;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.files.values().map(|e| e.chunk_count).sum()
    }
}
