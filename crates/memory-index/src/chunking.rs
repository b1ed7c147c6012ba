use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Approximate character-to-token ratio. Deliberately conservative (real
/// tokenizers pack several characters per token) so batch packing stays
/// under provider limits.
pub(crate) const CHARS_PER_TOKEN: usize = 1;

/// A line-bounded slice of a document, ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// 1-based inclusive line range in the source document.
    pub start_line: usize,
    pub end_line: usize,
    /// Digest of `text` alone, so unchanged content keeps its hash even
    /// when surrounding context shifts.
    pub hash: String,
}

pub(crate) fn hash_content(contents: &str) -> String {
    blake3::hash(contents.as_bytes()).to_hex().to_string()
}

/// Deterministic chunk identity: same inputs, same id, across reindexes.
pub(crate) fn chunk_id(
    source: &str,
    path: &str,
    start_line: usize,
    end_line: usize,
    chunk_hash: &str,
    model: &str,
) -> String {
    hash_content(&format!(
        "{source}:{path}:{start_line}:{end_line}:{chunk_hash}:{model}"
    ))
}

pub(crate) fn estimate_tokens(text: &str) -> usize {
    (text.len() / CHARS_PER_TOKEN).max(1)
}

/// Split Markdown into windows of roughly `max_tokens` tokens with
/// `overlap_lines` lines repeated at the head of each subsequent window.
///
/// Windows prefer to end at paragraph boundaries and never cut inside a
/// fenced or indented code block; an oversized block is carried whole in a
/// single window instead.
pub(crate) fn chunk_markdown(
    contents: &str,
    max_tokens: usize,
    overlap_lines: usize,
) -> Vec<Chunk> {
    let lines: Vec<&str> = contents.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let code_blocks = code_block_line_ranges(contents);
    let budget = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let mut end = start;
        let mut used = 0usize;
        while end < lines.len() {
            let cost = lines[end].len() + 1;
            if end > start && used + cost > budget {
                break;
            }
            used += cost;
            end += 1;
        }

        if end < lines.len() {
            end = adjust_cut(&lines, &code_blocks, start, end);
        }

        if let Some(chunk) = build_chunk(&lines, start, end) {
            // A window that only re-covers overlap carries no new content.
            let adds_content = chunks
                .last()
                .map_or(true, |prev: &Chunk| chunk.end_line > prev.end_line);
            if adds_content {
                chunks.push(chunk);
            }
        }

        if end >= lines.len() {
            break;
        }
        start = end.saturating_sub(overlap_lines).max(start + 1);
    }

    chunks
}

/// Move a tentative cut out of unsafe territory: out of code blocks first,
/// then back to the nearest paragraph boundary.
fn adjust_cut(
    lines: &[&str],
    code_blocks: &[(usize, usize)],
    start: usize,
    end: usize,
) -> usize {
    if let Some(&(block_start, block_end)) = code_blocks
        .iter()
        .find(|(block_start, block_end)| *block_start < end && end <= *block_end)
    {
        return if block_start > start {
            // Truncate before the block; the next window picks it up whole.
            block_start
        } else {
            // The window begins inside the block; swallow it even if that
            // overflows the budget.
            (block_end + 1).min(lines.len())
        };
    }

    let cut_is_mid_paragraph =
        !lines[end - 1].trim().is_empty() && end < lines.len() && !lines[end].trim().is_empty();
    if cut_is_mid_paragraph {
        if let Some(blank) = (start + 1..end).rev().find(|&i| lines[i].trim().is_empty()) {
            return blank;
        }
    }

    end
}

/// Trim surrounding blank lines out of the window so both the text hash and
/// the recorded line range describe content only.
fn build_chunk(lines: &[&str], start: usize, end: usize) -> Option<Chunk> {
    let first = (start..end).find(|&i| !lines[i].trim().is_empty())?;
    let last = (start..end).rev().find(|&i| !lines[i].trim().is_empty())?;

    let text = lines[first..=last].join("\n");
    let hash = hash_content(&text);

    Some(Chunk {
        text,
        start_line: first + 1,
        end_line: last + 1,
        hash,
    })
}

/// Line ranges (0-based inclusive) covered by code blocks, via the
/// pulldown-cmark offset iterator.
fn code_block_line_ranges(contents: &str) -> Vec<(usize, usize)> {
    let mut line_starts = vec![0usize];
    for (index, byte) in contents.bytes().enumerate() {
        if byte == b'\n' {
            line_starts.push(index + 1);
        }
    }
    let line_of = |offset: usize| line_starts.partition_point(|&start| start <= offset) - 1;

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);

    let mut ranges = Vec::new();
    let mut open_block_start: Option<usize> = None;

    for (event, range) in Parser::new_ext(contents, options).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(_)) => {
                open_block_start = Some(line_of(range.start));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(start_line) = open_block_start.take() {
                    let end_line = line_of(range.end.saturating_sub(1).max(range.start));
                    ranges.push((start_line, end_line));
                }
            }
            _ => {}
        }
    }

    ranges
}
