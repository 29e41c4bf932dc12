//! Text sent to the embedding model for a chunk.
//!
//! Stored chunk text stays raw; only the embedded text carries the path,
//! scope, language, imports, and the owning file's summary when one is cached.

use crate::chunker::Chunk;

/// Maximum number of import lines included in the embedding text.
const MAX_IMPORT_LINES: usize = 5;

#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 256);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if let Some(summary) = chunk.parent_summary.as_deref().filter(|s| !s.is_empty()) {
        text.push_str("# Summary: ");
        text.push_str(summary.lines().next().unwrap_or_default());
        text.push('\n');
    }

    if !chunk.scope_chain.is_empty() {
        text.push_str("# Scope: ");
        text.push_str(&chunk.scope_chain);
        text.push('\n');
    }

    if let Some(lang) = chunk.language {
        text.push_str("# Language: ");
        text.push_str(lang.id());
        text.push('\n');
    }

    for line in chunk.imports.lines().take(MAX_IMPORT_LINES) {
        text.push_str(line);
        text.push('\n');
    }

    text.push_str(&chunk.text);
    text
}

/// `path:start-end` label used in prompts and CLI output.
#[must_use]
pub fn location(file_path: &str, line_range: (usize, usize)) -> String {
    format!("{file_path}:{}-{}", line_range.0, line_range.1)
}
