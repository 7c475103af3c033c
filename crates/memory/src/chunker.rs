//! Line-addressable chunking with optional markdown structure alignment.
//!
//! The text is cut into *units* (whole lines, atomic markdown blocks, or
//! token windows of an oversized line) which are then packed greedily into
//! chunks of at most `max_tokens`. When a chunk is flushed, its trailing
//! units worth at most `overlap_tokens` are carried into the next one.
//!
//! In markdown-aware mode a structural block (heading section, paragraph,
//! fenced code block) is kept whole as long as it stays within
//! [`STRUCTURAL_TOLERANCE`] × `max_tokens`; anything larger falls back to
//! line packing, and single lines above the limit are hard split by tokens.

use sha2::{Digest, Sha256};

/// How far a single structural block may exceed `max_tokens` before it is
/// force-split.
pub const STRUCTURAL_TOLERANCE: f32 = 1.25;

/// Deterministic token counter. Size limits are only as accurate as this.
pub trait Tokenizer: Send + Sync {
    /// Byte ranges of each token in `text`, in order.
    fn token_spans(&self, text: &str) -> Vec<(usize, usize)>;

    fn count(&self, text: &str) -> usize {
        self.token_spans(text).len()
    }
}

/// Counts whitespace-separated words as tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn token_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = None;
        for (i, ch) in text.char_indices() {
            match (ch.is_whitespace(), start) {
                (true, Some(s)) => {
                    spans.push((s, i));
                    start = None;
                },
                (false, None) => start = Some(i),
                _ => {},
            }
        }
        if let Some(s) = start {
            spans.push((s, text.len()));
        }
        spans
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub markdown_aware: bool,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 80,
            markdown_aware: true,
        }
    }
}

/// A chunk of source text with its 1-based, inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
    /// SHA-256 hex of `text`.
    pub hash: String,
    pub token_count: usize,
}

#[derive(Debug, Clone)]
struct Unit {
    start_line: usize,
    end_line: usize,
    text: String,
    tokens: usize,
}

/// Chunk `text` with the default [`WordTokenizer`].
pub fn chunk_text(text: &str, opts: &ChunkerOptions) -> Vec<TextChunk> {
    chunk_text_with(text, opts, &WordTokenizer)
}

pub fn chunk_text_with(
    text: &str,
    opts: &ChunkerOptions,
    tokenizer: &dyn Tokenizer,
) -> Vec<TextChunk> {
    let max = opts.max_tokens.max(1);
    let overlap = opts.overlap_tokens.min(max - 1);
    let lines: Vec<&str> = text.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Vec::new();
    }

    let line_tokens: Vec<usize> = lines.iter().map(|l| tokenizer.count(l)).collect();
    let units = if opts.markdown_aware {
        let tolerance = ((max as f32) * STRUCTURAL_TOLERANCE).floor() as usize;
        markdown_units(&lines, &line_tokens, max, overlap, tolerance, tokenizer)
    } else {
        (0..lines.len())
            .flat_map(|i| line_units(&lines, &line_tokens, i, max, overlap, tokenizer))
            .collect()
    };

    pack(units, max, overlap, tokenizer)
}

/// Units for a single line: the whole line, or token windows when it is
/// longer than `max`.
fn line_units(
    lines: &[&str],
    line_tokens: &[usize],
    idx: usize,
    max: usize,
    overlap: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<Unit> {
    let line = lines[idx];
    let line_no = idx + 1;
    if line_tokens[idx] <= max {
        return vec![Unit {
            start_line: line_no,
            end_line: line_no,
            text: line.to_string(),
            tokens: line_tokens[idx],
        }];
    }

    let spans = tokenizer.token_spans(line);
    let step = max - overlap;
    let mut units = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max).min(spans.len());
        units.push(Unit {
            start_line: line_no,
            end_line: line_no,
            text: line[spans[start].0..spans[end - 1].1].to_string(),
            tokens: end - start,
        });
        if end == spans.len() {
            break;
        }
        start += step;
    }
    units
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Blank,
    Block { heading_only: bool },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    kind: SegmentKind,
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Split lines into blank runs and structural blocks.
fn segments(lines: &[&str]) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            let start = i;
            while i < lines.len() && lines[i].trim().is_empty() {
                i += 1;
            }
            out.push(Segment {
                start,
                end: i,
                kind: SegmentKind::Blank,
            });
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            let start = i;
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with(marker) {
                i += 1;
            }
            // Include the closing fence if there is one.
            i = (i + 1).min(lines.len());
            out.push(Segment {
                start,
                end: i,
                kind: SegmentKind::Block {
                    heading_only: false,
                },
            });
            continue;
        }

        let start = i;
        let heading = is_heading(line);
        i += 1;
        while i < lines.len()
            && !lines[i].trim().is_empty()
            && !is_heading(lines[i])
            && fence_marker(lines[i]).is_none()
        {
            i += 1;
        }
        out.push(Segment {
            start,
            end: i,
            kind: SegmentKind::Block {
                heading_only: heading && i - start == 1,
            },
        });
    }
    out
}

fn markdown_units(
    lines: &[&str],
    line_tokens: &[usize],
    max: usize,
    overlap: usize,
    tolerance: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<Unit> {
    let tokens_in = |s: usize, e: usize| line_tokens[s..e].iter().sum::<usize>();

    // Glue a lone heading to the block that follows it when they fit together.
    let mut merged: Vec<Segment> = Vec::new();
    let segs = segments(lines);
    let mut k = 0;
    while k < segs.len() {
        let seg = segs[k];
        if seg.kind == (SegmentKind::Block { heading_only: true }) {
            let next_block = segs[k + 1..]
                .iter()
                .position(|s| s.kind != SegmentKind::Blank)
                .map(|off| k + 1 + off);
            if let Some(nb) = next_block
                && tokens_in(seg.start, segs[nb].end) <= tolerance
            {
                merged.push(Segment {
                    start: seg.start,
                    end: segs[nb].end,
                    kind: SegmentKind::Block {
                        heading_only: false,
                    },
                });
                k = nb + 1;
                continue;
            }
        }
        merged.push(seg);
        k += 1;
    }

    let mut units = Vec::new();
    for seg in merged {
        let tokens = tokens_in(seg.start, seg.end);
        match seg.kind {
            SegmentKind::Block { .. } if tokens <= tolerance => units.push(Unit {
                start_line: seg.start + 1,
                end_line: seg.end,
                text: lines[seg.start..seg.end].join("\n"),
                tokens,
            }),
            _ => {
                for idx in seg.start..seg.end {
                    units.extend(line_units(lines, line_tokens, idx, max, overlap, tokenizer));
                }
            },
        }
    }
    units
}

fn pack(units: Vec<Unit>, max: usize, overlap: usize, tokenizer: &dyn Tokenizer) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<Unit> = Vec::new();
    let mut current_tokens = 0usize;
    let mut has_fresh = false;

    for unit in units {
        if current_tokens + unit.tokens > max && has_fresh {
            let carry = overlap_tail(&current, overlap);
            if let Some(chunk) = emit(&current, tokenizer) {
                chunks.push(chunk);
            }
            current_tokens = carry.iter().map(|u| u.tokens).sum();
            current = carry;
            has_fresh = false;
            if current_tokens + unit.tokens > max {
                current.clear();
                current_tokens = 0;
            }
        }
        current_tokens += unit.tokens;
        has_fresh |= unit.tokens > 0;
        current.push(unit);
    }

    if has_fresh && let Some(chunk) = emit(&current, tokenizer) {
        chunks.push(chunk);
    }
    chunks
}

/// Trailing units totalling at most `overlap` tokens.
fn overlap_tail(units: &[Unit], overlap: usize) -> Vec<Unit> {
    if overlap == 0 {
        return Vec::new();
    }
    let mut total = 0;
    let mut take = 0;
    for unit in units.iter().rev() {
        if total + unit.tokens > overlap {
            break;
        }
        total += unit.tokens;
        take += 1;
    }
    let tail = &units[units.len() - take..];
    // Leading blank lines carry no context.
    let skip = tail.iter().take_while(|u| u.tokens == 0).count();
    tail[skip..].to_vec()
}

fn emit(units: &[Unit], tokenizer: &dyn Tokenizer) -> Option<TextChunk> {
    let first = units.iter().position(|u| u.tokens > 0)?;
    let last = units.iter().rposition(|u| u.tokens > 0)?;
    let body = &units[first..=last];
    let text = body
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Some(TextChunk {
        start_line: body[0].start_line,
        end_line: body[body.len() - 1].end_line,
        hash: sha256_hex(&text),
        token_count: tokenizer.count(&text),
        text,
    })
}

/// Lowercase hex SHA-256 of raw bytes; text hashes go through its UTF-8 encoding.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    format!("{:x}", hasher.finalize())
}
