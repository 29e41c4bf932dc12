//! Line-addressed chunking: tree-sitter entity boundaries with a sliding-window fallback.
//!
//! Syntax-aware chunking never drops text. Batches of sibling entity nodes only
//! decide where a chunk *starts*; each chunk then spans whole lines up to the
//! next start, so the chunks of a file tile it exactly.

use std::path::Path;

use tree_sitter::{Node, Parser};

use crate::languages::{Lang, detect_language};
use crate::loader::FileRecord;

/// One retrievable unit of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_path: String,
    /// Position of the chunk within its file, starting at 0.
    pub index: usize,
    /// 1-based inclusive line range.
    pub line_range: (usize, usize),
    pub text: String,
    pub language: Option<Lang>,
    pub node_type: String,
    pub entity_name: Option<String>,
    pub scope_chain: String,
    pub imports: String,
    pub content_hash: String,
    pub parent_summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Entity batches grow up to this many non-whitespace characters.
    pub target_size: usize,
    /// Entities larger than this are split at their children.
    pub max_size: usize,
    /// Chunks below this many non-whitespace characters merge into a neighbour.
    pub min_size: usize,
    /// Sliding-window length in characters.
    pub window_size: usize,
    /// Characters shared by consecutive windows.
    pub window_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 600,
            max_size: 1200,
            min_size: 100,
            window_size: 2000,
            window_overlap: 200,
        }
    }
}

/// A chunk start found in the syntax tree.
#[derive(Debug, Clone)]
struct Boundary {
    row: usize,
    node_type: String,
    entity_name: Option<String>,
    scope: String,
}

/// Half-open line range `[start, end)` with its metadata.
#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    node_type: String,
    entity_name: Option<String>,
    scope: String,
}

/// Split a file into chunks.
///
/// Whitespace-only files produce no chunks; files smaller than `min_size`
/// produce exactly one chunk holding the whole file.
#[must_use]
pub fn chunk_file(record: &FileRecord, config: &ChunkerConfig) -> Vec<Chunk> {
    let source = record.content.as_str();
    let nws = non_ws_len(source);
    if nws == 0 {
        return Vec::new();
    }

    let lang = detect_language(Path::new(&record.path));
    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let whole = Segment {
        start: 0,
        end: lines.len(),
        node_type: "file".into(),
        entity_name: None,
        scope: String::new(),
    };

    if nws < config.min_size {
        return assemble(record, lang, &lines, vec![whole], String::new());
    }

    let syntax = lang
        .filter(|l| l.is_syntax_aware())
        .and_then(|l| syntax_segments(source, &lines, l, config));

    match syntax {
        Some((segments, imports)) => {
            let segments = resplit_oversized(&lines, segments, config);
            assemble(record, lang, &lines, segments, imports)
        }
        None => {
            let segments = window_segments(&lines, &whole, config, "window");
            assemble(record, lang, &lines, segments, String::new())
        }
    }
}

fn assemble(
    record: &FileRecord,
    lang: Option<Lang>,
    lines: &[&str],
    segments: Vec<Segment>,
    imports: String,
) -> Vec<Chunk> {
    segments
        .into_iter()
        .filter_map(|seg| {
            let text: String = lines[seg.start..seg.end].concat();
            (non_ws_len(&text) > 0).then_some((seg, text))
        })
        .enumerate()
        .map(|(index, (seg, text))| Chunk {
            file_path: record.path.clone(),
            index,
            line_range: (seg.start + 1, seg.end),
            content_hash: blake3_hex(&text),
            text,
            language: lang,
            node_type: seg.node_type,
            entity_name: seg.entity_name,
            scope_chain: seg.scope,
            imports: imports.clone(),
            parent_summary: None,
        })
        .collect()
}

/// Parse the file and derive line segments from entity boundaries.
///
/// Returns `None` when parsing fails so the caller can fall back to windows.
fn syntax_segments(
    source: &str,
    lines: &[&str],
    lang: Lang,
    config: &ChunkerConfig,
) -> Option<(Vec<Segment>, String)> {
    let grammar = lang.grammar()?;
    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&grammar) {
        tracing::debug!("tree-sitter rejected {lang} grammar: {e}");
        return None;
    }
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();

    let imports = extract_imports(source, &root, lang);
    let mut boundaries = Vec::new();
    collect_boundaries(source, &root, "", config, &mut boundaries);

    boundaries.sort_by_key(|b| b.row);
    boundaries.dedup_by_key(|b| b.row);

    let mut segments: Vec<Segment> = Vec::with_capacity(boundaries.len() + 1);
    if boundaries.first().is_none_or(|b| b.row > 0) {
        segments.push(Segment {
            start: 0,
            end: 0,
            node_type: "preamble".into(),
            entity_name: None,
            scope: String::new(),
        });
    }
    for b in boundaries {
        segments.push(Segment {
            start: b.row,
            end: 0,
            node_type: b.node_type,
            entity_name: b.entity_name,
            scope: b.scope,
        });
    }
    for i in 0..segments.len() {
        segments[i].end = segments.get(i + 1).map_or(lines.len(), |next| next.start);
    }
    segments.retain(|s| s.start < s.end);

    merge_small_segments(lines, &mut segments, config.min_size);
    Some((segments, imports))
}

/// Greedy sibling batching: consecutive entity-level children accumulate until
/// `target_size`, oversized children are descended into.
fn collect_boundaries(
    source: &str,
    parent: &Node,
    parent_scope: &str,
    config: &ChunkerConfig,
    out: &mut Vec<Boundary>,
) {
    let mut batch: Vec<Node> = Vec::new();
    let mut batch_size = 0usize;
    let child_count = u32::try_from(parent.named_child_count()).unwrap_or(u32::MAX);

    for i in 0..child_count {
        let Some(child) = parent.named_child(i) else {
            continue;
        };
        let child_nws = non_ws_len(&source[child.byte_range()]);

        if child_nws > config.max_size && child.named_child_count() > 0 {
            flush_batch(source, &batch, parent_scope, out);
            batch.clear();
            batch_size = 0;

            let scope = extend_scope(parent_scope, &child, source);
            out.push(Boundary {
                row: child.start_position().row,
                node_type: child.kind().to_string(),
                entity_name: extract_entity_name(&child, source),
                scope: parent_scope.to_string(),
            });
            collect_boundaries(source, &child, &scope, config, out);
            continue;
        }

        if batch_size + child_nws > config.target_size && !batch.is_empty() {
            flush_batch(source, &batch, parent_scope, out);
            batch.clear();
            batch_size = 0;
        }

        batch.push(child);
        batch_size += child_nws;
    }

    flush_batch(source, &batch, parent_scope, out);
}

fn flush_batch(source: &str, batch: &[Node], scope: &str, out: &mut Vec<Boundary>) {
    let Some(first) = batch.first() else {
        return;
    };
    let node_type = if batch.len() == 1 {
        first.kind().to_string()
    } else {
        format!("{}x{}", first.kind(), batch.len())
    };
    out.push(Boundary {
        row: first.start_position().row,
        node_type,
        entity_name: batch.iter().find_map(|n| extract_entity_name(n, source)),
        scope: scope.to_string(),
    });
}

/// Fold segments below `min_size` into their successor (the last one into
/// its predecessor). Line ranges stay contiguous.
fn merge_small_segments(lines: &[&str], segments: &mut Vec<Segment>, min_size: usize) {
    let seg_nws = |s: &Segment| lines[s.start..s.end].iter().map(|l| non_ws_len(l)).sum::<usize>();

    let mut i = 0;
    while i + 1 < segments.len() {
        if seg_nws(&segments[i]) < min_size {
            let small = segments.remove(i);
            let next = &mut segments[i];
            next.start = small.start;
            if next.entity_name.is_none() {
                next.entity_name = small.entity_name;
            }
        } else {
            i += 1;
        }
    }

    if segments.len() >= 2
        && let Some(last) = segments.last()
        && seg_nws(last) < min_size
    {
        let end = last.end;
        segments.pop();
        if let Some(prev) = segments.last_mut() {
            prev.end = end;
        }
    }
}

fn resplit_oversized(lines: &[&str], segments: Vec<Segment>, config: &ChunkerConfig) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        let chars: usize = lines[seg.start..seg.end].iter().map(|l| l.chars().count()).sum();
        if chars > config.window_size {
            let node_type = seg.node_type.clone();
            out.extend(window_segments(lines, &seg, config, &node_type));
        } else {
            out.push(seg);
        }
    }
    out
}

/// Line-aligned sliding window over `seg`.
///
/// Each window holds at least one line and at most `window_size` characters
/// (unless a single line is longer). The next window starts far enough back
/// to share up to `window_overlap` characters, and always at least one line
/// further than the previous start, so windows touch or overlap.
fn window_segments(
    lines: &[&str],
    seg: &Segment,
    config: &ChunkerConfig,
    node_type: &str,
) -> Vec<Segment> {
    let len = |i: usize| lines[i].chars().count();
    let mut out = Vec::new();
    let mut start = seg.start;

    while start < seg.end {
        let mut end = start;
        let mut size = 0;
        while end < seg.end && (end == start || size + len(end) <= config.window_size) {
            size += len(end);
            end += 1;
        }
        out.push(Segment {
            start,
            end,
            node_type: node_type.to_string(),
            entity_name: seg.entity_name.clone(),
            scope: seg.scope.clone(),
        });
        if end >= seg.end {
            break;
        }

        let mut next = end;
        let mut overlap = 0;
        while next > start + 1 && overlap + len(next - 1) <= config.window_overlap {
            overlap += len(next - 1);
            next -= 1;
        }
        start = next;
    }
    out
}

fn non_ws_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

fn extract_imports(source: &str, root: &Node, lang: Lang) -> String {
    let kinds = lang.import_node_kinds();
    if kinds.is_empty() {
        return String::new();
    }
    let mut imports = String::new();
    let child_count = u32::try_from(root.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = root.named_child(i) else {
            continue;
        };
        if kinds.contains(&child.kind()) {
            imports.push_str(&source[child.byte_range()]);
            imports.push('\n');
        }
    }
    imports
}

fn extract_entity_name(node: &Node, source: &str) -> Option<String> {
    // impl_item names its subject in the "type" field
    node.child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
        .map(|n| source[n.byte_range()].to_string())
}

/// Named nodes extend the scope; bodies and blocks are transparent.
fn extend_scope(parent_scope: &str, node: &Node, source: &str) -> String {
    match extract_entity_name(node, source) {
        None => parent_scope.to_string(),
        Some(name) if parent_scope.is_empty() => name,
        Some(name) => format!("{parent_scope} > {name}"),
    }
}

pub(crate) fn blake3_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use proptest::prelude::*;

    use super::*;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            content: content.into(),
            fingerprint: crate::loader::fingerprint(content.as_bytes()),
            size: content.len() as u64,
            modified: None,
        }
    }

    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            target_size: 80,
            max_size: 160,
            min_size: 20,
            window_size: 400,
            window_overlap: 40,
        }
    }

    fn concat(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    fn rust_source(fns: usize) -> String {
        let mut s = String::from("use std::io;\nuse std::fmt;\n\n");
        for i in 0..fns {
            let _ = writeln!(
                s,
                "/// doc {i}\nfn function_{i}(x: u32) -> u32 {{\n    let y = x * {i};\n    y + 1\n}}\n"
            );
        }
        s
    }

    #[test]
    fn whitespace_only_file_has_no_chunks() {
        assert!(chunk_file(&record("a.rs", "  \n\n\t\n"), &small_config()).is_empty());
    }

    #[test]
    fn tiny_file_is_one_whole_chunk() {
        let content = "fn a() {}\n";
        let chunks = chunk_file(&record("a.rs", content), &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, content);
        assert_eq!(chunks[0].line_range, (1, 1));
        assert_eq!(chunks[0].node_type, "file");
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn syntax_chunks_tile_the_file_exactly() {
        let source = rust_source(12);
        let chunks = chunk_file(&record("src/lib.rs", &source), &small_config());
        assert!(chunks.len() > 1, "expected several chunks, got {}", chunks.len());
        assert_eq!(concat(&chunks), source);

        for pair in chunks.windows(2) {
            assert_eq!(pair[0].line_range.1 + 1, pair[1].line_range.0);
        }
        assert_eq!(chunks[0].line_range.0, 1);
        assert_eq!(chunks.last().unwrap().line_range.1, source.lines().count());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.language, Some(Lang::Rust));
        }
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn chunks_start_at_entity_boundaries() {
        let source = rust_source(12);
        let chunks = chunk_file(&record("src/lib.rs", &source), &small_config());
        for c in &chunks[1..] {
            let first_line = c.text.lines().next().unwrap();
            assert!(
                first_line.starts_with("fn ") || first_line.starts_with("///"),
                "chunk starts mid-entity: {first_line:?}"
            );
        }
        assert!(chunks.iter().any(|c| c.entity_name.as_deref() == Some("function_3")));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn imports_are_attached() {
        let source = rust_source(6);
        let chunks = chunk_file(&record("src/lib.rs", &source), &small_config());
        assert!(chunks[0].imports.contains("use std::io;"));
        assert!(chunks.iter().all(|c| c.imports == chunks[0].imports));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn small_leading_segment_merges_forward() {
        let source = rust_source(6);
        let chunks = chunk_file(&record("src/lib.rs", &source), &small_config());
        assert!(chunks[0].text.starts_with("use std::io;"));
        assert!(chunks[0].text.contains("fn function_0"));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn large_impl_is_split_with_scope() {
        let mut source = String::from("struct Engine;\n\nimpl Engine {\n");
        for i in 0..10 {
            let _ = writeln!(
                source,
                "    fn step_{i}(&self) -> u64 {{\n        let a = {i} * 3;\n        a + 7\n    }}\n"
            );
        }
        source.push_str("}\n");

        let chunks = chunk_file(&record("src/engine.rs", &source), &small_config());
        assert!(chunks.len() > 2);
        assert_eq!(concat(&chunks), source);
        assert!(chunks.iter().any(|c| c.scope_chain == "Engine"));
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_classes_are_chunked() {
        let mut source = String::new();
        for i in 0..6 {
            let _ = writeln!(
                source,
                "class Handler{i}:\n    def handle(self, event):\n        return event * {i}\n"
            );
        }
        let chunks = chunk_file(&record("app.py", &source), &small_config());
        assert!(chunks.len() > 1);
        assert_eq!(concat(&chunks), source);
        assert_eq!(chunks[0].language, Some(Lang::Python));
    }

    #[test]
    fn unknown_language_uses_overlapping_windows() {
        let source: String = (0..200).map(|i| format!("line number {i}\n")).collect();
        let config = ChunkerConfig {
            window_size: 300,
            window_overlap: 60,
            ..small_config()
        };
        let chunks = chunk_file(&record("notes.txt", &source), &config);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].node_type, "window");
        assert_eq!(chunks[0].language, None);
        for pair in chunks.windows(2) {
            assert!(pair[1].line_range.0 <= pair[0].line_range.1, "gap between windows");
            assert!(pair[1].line_range.0 > pair[0].line_range.0, "window did not advance");
        }
        for c in &chunks {
            assert!(c.text.chars().count() <= 300);
        }
    }

    #[test]
    fn single_long_line_still_forms_a_window() {
        let source = "x".repeat(5000);
        let config = ChunkerConfig {
            window_size: 1000,
            ..small_config()
        };
        let chunks = chunk_file(&record("blob.txt", &source), &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, source);
    }

    #[test]
    fn content_hash_is_deterministic() {
        let source: String = (0..50).map(|i| format!("row {i}\n")).collect();
        let a = chunk_file(&record("t.txt", &source), &small_config());
        let b = chunk_file(&record("t.txt", &source), &small_config());
        assert_eq!(a, b);
        assert_eq!(a[0].content_hash.len(), 64);
    }

    #[test]
    fn non_ws_len_counts_correctly() {
        assert_eq!(non_ws_len("fn  foo () { }"), 9);
        assert_eq!(non_ws_len("   "), 0);
    }

    proptest! {
        #[test]
        fn windows_cover_every_nonblank_line(
            lines in proptest::collection::vec("[a-z ]{0,60}", 1..120),
            window in 40usize..400,
            overlap in 0usize..80,
        ) {
            let source: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let config = ChunkerConfig { window_size: window, window_overlap: overlap, min_size: 1, ..small_config() };
            let chunks = chunk_file(&record("p.txt", &source), &config);

            let mut covered = vec![false; lines.len()];
            for c in &chunks {
                prop_assert!(c.line_range.0 >= 1 && c.line_range.0 <= c.line_range.1);
                for l in c.line_range.0..=c.line_range.1 {
                    covered[l - 1] = true;
                }
            }
            for (i, line) in lines.iter().enumerate() {
                if !line.trim().is_empty() {
                    prop_assert!(covered[i], "line {} not covered", i + 1);
                }
            }
        }

        #[cfg(feature = "lang-rust")]
        #[test]
        fn syntax_chunks_reconstruct_source(fns in 1usize..25, target in 40usize..400) {
            let source = rust_source(fns);
            let config = ChunkerConfig {
                target_size: target,
                max_size: target * 2,
                min_size: target / 4,
                window_size: 100_000,
                window_overlap: 0,
            };
            let chunks = chunk_file(&record("gen.rs", &source), &config);
            prop_assert_eq!(concat(&chunks), source);
        }
    }
}
