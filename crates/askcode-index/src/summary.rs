//! Lazily generated file and directory descriptions, cached in `.chat/summaries.json`.
//!
//! Directory descriptions are composed from their children's descriptions,
//! so a directory request resolves every descendant file first and then the
//! directories from the deepest up.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use askcode_llm::LlmError;
use askcode_llm::provider::{LlmProvider, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::loader::{FileRecord, FileSource};
use crate::persist::{is_malformed, read_json, write_json_atomic};

pub const SUMMARY_FILE: &str = "summaries.json";

/// Key used for the project root.
const ROOT_KEY: &str = ".";

const FILE_SYSTEM_PROMPT: &str = "You describe source files for a code search index. \
Answer with one or two plain sentences saying what the file is for. No preamble.";

const DIR_SYSTEM_PROMPT: &str = "You describe directories of a software project. \
Given the descriptions of its entries, answer with one or two plain sentences saying \
what the directory contains. No preamble.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCacheEntry {
    pub path: String,
    pub description: String,
    pub fingerprint: String,
    pub kind: SummaryKind,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    /// File contents beyond this many characters are cut before prompting.
    pub max_file_chars: usize,
    pub timeout: Duration,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            max_file_chars: 6000,
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct SummaryCache<P: LlmProvider> {
    source: FileSource,
    provider: Arc<P>,
    config: SummaryConfig,
    path: PathBuf,
    entries: RwLock<BTreeMap<String, SummaryCacheEntry>>,
}

impl<P: LlmProvider> std::fmt::Debug for SummaryCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCache")
            .field("path", &self.path)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

/// Fingerprint of a directory from its children's `(name, fingerprint)` pairs.
#[must_use]
pub fn directory_fingerprint<'a>(children: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut sorted: Vec<_> = children.into_iter().collect();
    sorted.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    for (name, fp) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(fp.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

fn parent_key(rel: &str) -> &str {
    rel.rsplit_once('/').map_or(ROOT_KEY, |(parent, _)| parent)
}

fn name_of(rel: &str) -> &str {
    rel.rsplit_once('/').map_or(rel, |(_, name)| name)
}

fn depth(rel: &str) -> usize {
    if rel == ROOT_KEY {
        0
    } else {
        rel.matches('/').count() + 1
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

struct Child {
    name: String,
    fingerprint: String,
    description: String,
}

impl<P: LlmProvider> SummaryCache<P> {
    /// Open the cache stored in `chat_dir`. A corrupt cache file is discarded.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the cache file exists but cannot be read.
    pub fn open(
        chat_dir: &Path,
        source: FileSource,
        provider: Arc<P>,
        config: SummaryConfig,
    ) -> Result<Self> {
        let path = chat_dir.join(SUMMARY_FILE);
        let entries = match read_json::<BTreeMap<String, SummaryCacheEntry>>(&path) {
            Ok(map) => map.unwrap_or_default(),
            Err(e) if is_malformed(&e) => {
                tracing::warn!(path = %path.display(), "summary cache is corrupt, starting over: {e}");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            source,
            provider,
            config,
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Cached description of `path` if it was computed from `fingerprint`.
    /// Never generates.
    #[must_use]
    pub fn cached_description(&self, path: &str, fingerprint: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .filter(|e| e.fingerprint == fingerprint)
            .map(|e| e.description.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Description of a file or directory (root-relative or absolute path),
    /// generating and caching whatever is missing or stale.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the path does not exist, `Other` if it holds nothing
    /// summarizable, or `Generation` if the backend fails.
    pub async fn get_description(&self, path: &Path) -> Result<String> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source.root().join(path)
        };
        let meta = std::fs::metadata(&abs)?;
        if meta.is_dir() {
            self.describe_directory(&abs).await
        } else {
            let record = self.source.load(&abs)?.ok_or_else(|| {
                IndexError::Other(format!(
                    "{} is excluded, empty, binary, or too large to summarize",
                    abs.display()
                ))
            })?;
            self.describe_file(&record).await
        }
    }

    async fn describe_file(&self, record: &FileRecord) -> Result<String> {
        if let Some(hit) = self.cached_description(&record.path, &record.fingerprint) {
            tracing::debug!(file = %record.path, "summary cache hit");
            return Ok(hit);
        }
        let content = truncate_chars(&record.content, self.config.max_file_chars);
        let messages = [
            Message::system(FILE_SYSTEM_PROMPT),
            Message::user(format!("File: {}\n\n```\n{content}\n```", record.path)),
        ];
        let description = self.generate(&messages).await?;
        self.store(SummaryCacheEntry {
            path: record.path.clone(),
            description: description.clone(),
            fingerprint: record.fingerprint.clone(),
            kind: SummaryKind::File,
            generated_at: Utc::now(),
        })?;
        tracing::info!(file = %record.path, "generated file summary");
        Ok(description)
    }

    async fn describe_directory(&self, abs: &Path) -> Result<String> {
        let dir_key = if abs == self.source.root() {
            ROOT_KEY.to_owned()
        } else {
            self.source.relative_path(abs).ok_or_else(|| {
                IndexError::Other(format!("{} is outside the project", abs.display()))
            })?
        };

        let files: Vec<FileRecord> = self.source.walk_dir(abs).collect();
        if files.is_empty() {
            return Err(IndexError::Other(format!(
                "{dir_key}: no text files to summarize"
            )));
        }

        let mut children: BTreeMap<String, Vec<Child>> = BTreeMap::new();
        let mut dirs: BTreeSet<String> = BTreeSet::new();
        for record in &files {
            let description = self.describe_file(record).await?;
            let parent = parent_key(&record.path).to_owned();
            children.entry(parent).or_default().push(Child {
                name: name_of(&record.path).to_owned(),
                fingerprint: record.fingerprint.clone(),
                description,
            });

            let mut dir = parent_key(&record.path);
            loop {
                dirs.insert(dir.to_owned());
                if dir == dir_key || dir == ROOT_KEY {
                    break;
                }
                dir = parent_key(dir);
            }
        }

        let mut ordered: Vec<String> = dirs.into_iter().collect();
        ordered.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

        let mut result = None;
        for dir in ordered {
            let entries = children.remove(&dir).unwrap_or_default();
            let fingerprint = directory_fingerprint(
                entries
                    .iter()
                    .map(|c| (c.name.as_str(), c.fingerprint.as_str())),
            );
            let description = match self.cached_description(&dir, &fingerprint) {
                Some(hit) => hit,
                None => self.generate_directory(&dir, &fingerprint, &entries).await?,
            };
            if dir == dir_key {
                result = Some(description);
                break;
            }
            children
                .entry(parent_key(&dir).to_owned())
                .or_default()
                .push(Child {
                    name: format!("{}/", name_of(&dir)),
                    fingerprint,
                    description,
                });
        }

        result.ok_or_else(|| IndexError::Other(format!("{dir_key}: nothing to summarize")))
    }

    async fn generate_directory(
        &self,
        dir: &str,
        fingerprint: &str,
        entries: &[Child],
    ) -> Result<String> {
        let listing: String = entries
            .iter()
            .map(|c| format!("- {}: {}\n", c.name, c.description))
            .collect();
        let messages = [
            Message::system(DIR_SYSTEM_PROMPT),
            Message::user(format!("Directory: {dir}\n\nEntries:\n{listing}")),
        ];
        let description = self.generate(&messages).await?;
        self.store(SummaryCacheEntry {
            path: dir.to_owned(),
            description: description.clone(),
            fingerprint: fingerprint.to_owned(),
            kind: SummaryKind::Directory,
            generated_at: Utc::now(),
        })?;
        tracing::info!(dir, "generated directory summary");
        Ok(description)
    }

    async fn generate(&self, messages: &[Message]) -> Result<String> {
        let timeout = self.config.timeout;
        let text = tokio::time::timeout(timeout, self.provider.chat(messages))
            .await
            .map_err(|_| {
                IndexError::Generation(LlmError::Timeout {
                    provider: self.provider.name().to_owned(),
                    secs: timeout.as_secs(),
                })
            })?
            .map_err(IndexError::Generation)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(IndexError::Generation(LlmError::EmptyResponse {
                provider: self.provider.name().to_owned(),
            }));
        }
        Ok(text.to_owned())
    }

    fn store(&self, entry: SummaryCacheEntry) -> Result<()> {
        let snapshot = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            entries.insert(entry.path.clone(), entry);
            entries.clone()
        };
        write_json_atomic(&self.path, &snapshot)?;
        Ok(())
    }
}
