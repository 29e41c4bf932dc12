//! Project walker: include/exclude globs, `.gitignore`, binary and size heuristics.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{LoadError, Result};

/// Directory holding per-project state; never indexed.
pub const CHAT_DIR: &str = ".chat";

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];
/// Per-directory ignore files, lowest precedence first.
const IGNORE_FILES: &[&str] = &[".gitignore", ".ignore"];
const GIT_EXCLUDE: &str = ".git/info/exclude";
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Globs a root-relative path must match. Empty means every file.
    pub include: Vec<String>,
    /// Globs that exclude a root-relative path.
    pub exclude: Vec<String>,
    pub max_file_size: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size: 1024 * 1024,
        }
    }
}

/// One text file read from the project.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Root-relative path with forward slashes.
    pub path: String,
    pub content: String,
    /// blake3 hex digest of the raw bytes.
    pub fingerprint: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Fingerprint used by the manifest and the summary cache.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    include: Option<GlobSet>,
    exclude: GlobSet,
    max_file_size: u64,
}

/// Rules from the ignore files directly inside `dir`; `None` if it has none.
fn dir_ignore_rules(dir: &Path, is_root: bool) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(dir);
    let mut found = false;
    let exclude = is_root.then(|| dir.join(GIT_EXCLUDE));
    for path in exclude
        .into_iter()
        .chain(IGNORE_FILES.iter().map(|name| dir.join(name)))
    {
        if !path.is_file() {
            continue;
        }
        found = true;
        if let Some(e) = builder.add(&path) {
            tracing::warn!(path = %path.display(), "bad ignore rule: {e}");
        }
    }
    if !found {
        return None;
    }
    match builder.build() {
        Ok(rules) => Some(rules),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), "ignoring unusable ignore file: {e}");
            None
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(builder.build()?)
}

impl FileSource {
    /// # Errors
    ///
    /// Returns `IndexError::Glob` if an include or exclude pattern is malformed.
    pub fn new(root: impl Into<PathBuf>, config: &LoaderConfig) -> Result<Self> {
        let include = if config.include.is_empty() {
            None
        } else {
            Some(build_globset(&config.include)?)
        };
        Ok(Self {
            root: root.into(),
            include,
            exclude: build_globset(&config.exclude)?,
            max_file_size: config.max_file_size,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a root-relative path would be indexed: the same decision the
    /// walk makes, so single-file updates never pick up what a full pass skips.
    #[must_use]
    pub fn accepts(&self, rel_path: &str) -> bool {
        self.passes_filters(rel_path) && !self.is_ignored(rel_path)
    }

    /// Hidden entries, state and VCS directories, and the configured globs.
    fn passes_filters(&self, rel_path: &str) -> bool {
        let hidden = rel_path.split('/').any(|part| {
            part.starts_with('.') || part == CHAT_DIR || VCS_DIRS.contains(&part)
        });
        if hidden || self.exclude.is_match(rel_path) {
            return false;
        }
        self.include.as_ref().is_none_or(|set| set.is_match(rel_path))
    }

    /// Evaluate ignore files the way the walker does: each entry on the way
    /// down is checked against its ancestors' rules, deepest directory first,
    /// and an ignored directory hides everything below it.
    fn is_ignored(&self, rel_path: &str) -> bool {
        let parts: Vec<&str> = rel_path.split('/').collect();
        let mut rules: Vec<Gitignore> = Vec::new();
        let mut entry = self.root.clone();
        for (i, part) in parts.iter().enumerate() {
            if let Some(dir_rules) = dir_ignore_rules(&entry, i == 0) {
                rules.push(dir_rules);
            }
            entry.push(part);
            let is_dir = i + 1 < parts.len();
            for level in rules.iter().rev() {
                let hit = level.matched(&entry, is_dir);
                if hit.is_ignore() {
                    return true;
                }
                if hit.is_whitelist() {
                    break;
                }
            }
        }
        false
    }

    /// Root-relative, forward-slash form of `path`; `None` if outside the root.
    #[must_use]
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Lazily walk the whole project in a stable (file name) order.
    ///
    /// Unreadable files are logged and skipped; the walk itself never fails.
    pub fn walk(&self) -> impl Iterator<Item = FileRecord> + '_ {
        self.walk_from(self.root.clone())
    }

    /// Walk the subtree at `dir` (relative to the root, or absolute).
    pub fn walk_dir(&self, dir: &Path) -> impl Iterator<Item = FileRecord> + '_ {
        let start = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        };
        self.walk_from(start)
    }

    fn walk_from(&self, start: PathBuf) -> impl Iterator<Item = FileRecord> + '_ {
        WalkBuilder::new(start)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .ignore(true)
            // Only rules inside the project, which `accepts` can reproduce.
            .git_global(false)
            .parents(false)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != CHAT_DIR && !VCS_DIRS.contains(&name.as_ref())
            })
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("{}", LoadError::Walk(e));
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter_map(move |entry| {
                let rel = self.relative_path(entry.path())?;
                if !self.passes_filters(&rel) {
                    return None;
                }
                match self.read(entry.path(), rel) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("skipping file: {e}");
                        None
                    }
                }
            })
    }

    /// Read one file, applying the filters and text heuristics.
    ///
    /// Returns `Ok(None)` for files that are filtered out, binary, empty, or too large.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Read` if the file exists but cannot be read.
    pub fn load(&self, abs_path: &Path) -> std::result::Result<Option<FileRecord>, LoadError> {
        let Some(rel) = self.relative_path(abs_path) else {
            return Ok(None);
        };
        if !self.accepts(&rel) {
            return Ok(None);
        }
        self.read(abs_path, rel)
    }

    fn read(
        &self,
        abs_path: &Path,
        rel: String,
    ) -> std::result::Result<Option<FileRecord>, LoadError> {
        let read_err = |source| LoadError::Read {
            path: rel.clone(),
            source,
        };

        let meta = std::fs::metadata(abs_path).map_err(read_err)?;
        if !meta.is_file() || meta.len() == 0 {
            return Ok(None);
        }
        if meta.len() > self.max_file_size {
            tracing::debug!(file = %rel, size = meta.len(), "skipping oversized file");
            return Ok(None);
        }

        let bytes = std::fs::read(abs_path).map_err(read_err)?;
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            tracing::debug!(file = %rel, "skipping binary file");
            return Ok(None);
        }
        let fingerprint = fingerprint(&bytes);
        let size = meta.len();
        let Ok(content) = String::from_utf8(bytes) else {
            tracing::debug!(file = %rel, "skipping non-UTF-8 file");
            return Ok(None);
        };

        Ok(Some(FileRecord {
            path: rel,
            content,
            fingerprint,
            size,
            modified: meta.modified().ok(),
        }))
    }
}
