//! Text chunking strategies.
//!
//! Splits raw unit text (a file body, a web page, a database row) into
//! fragments of at most `max_chars` characters using one of four
//! [`ChunkStrategy`] variants.
//!
//! Every strategy works on byte [`Span`]s into the source text, never on
//! copies, so the output can be checked against the input: spans are
//! ordered by start, are trimmed of surrounding whitespace, and anything
//! between two consecutive spans is whitespace. No text is dropped.
//!
//! Cuts only happen on Unicode word boundaries. A word longer than
//! `max_chars` (a URL, a base64 blob) becomes its own oversized fragment.
//! CJK ideographs are individual words, so CJK prose splits normally.
//!
//! # Strategies
//!
//! | Strategy | Split points | Oversized pieces |
//! |----------|--------------|------------------|
//! | `fixed` | word boundaries, with up to `overlap_chars` of overlap | n/a |
//! | `paragraph` | blank lines, neighbours coalesced | `fixed` |
//! | `sentence` | `.` `!` `?` `。` `！` `？`, neighbours coalesced | `fixed` |
//! | `smart` | headings, then per-region choice | per region |
//!
//! # Example
//!
//! ```rust
//! use zerag_core::chunk::{chunk, ChunkParams};
//! use zerag_core::models::ChunkStrategy;
//!
//! let params = ChunkParams { max_chars: 40, overlap_chars: 0, min_chars: 0 };
//! let parts = chunk("First paragraph.\n\nSecond paragraph is here.", ChunkStrategy::Paragraph, &params);
//! assert_eq!(parts, vec!["First paragraph.", "Second paragraph is here."]);
//! ```

use std::iter::once;

use unicode_segmentation::UnicodeSegmentation;

use crate::models::ChunkStrategy;

/// Size limits for chunking, all in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Upper bound per fragment (a single oversized word may exceed it).
    pub max_chars: usize,
    /// Maximum overlap between adjacent `fixed` fragments.
    pub overlap_chars: usize,
    /// `smart` merges fragments shorter than this into a neighbour when
    /// the result still fits in `max_chars`.
    pub min_chars: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chars: 512,
            overlap_chars: 64,
            min_chars: 40,
        }
    }
}

/// A byte range `[start, end)` into the chunked text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Split `text` into fragment strings.
///
/// Empty or whitespace-only input yields an empty vector.
pub fn chunk(text: &str, strategy: ChunkStrategy, params: &ChunkParams) -> Vec<String> {
    chunk_spans(text, strategy, params)
        .into_iter()
        .map(|s| text[s.start..s.end].to_string())
        .collect()
}

/// Split `text` into fragment spans. See the module docs for guarantees.
pub fn chunk_spans(text: &str, strategy: ChunkStrategy, params: &ChunkParams) -> Vec<Span> {
    let max = params.max_chars.max(1);
    let overlap = params.overlap_chars.min(max - 1);
    let whole = Span::new(0, text.len());

    match strategy {
        ChunkStrategy::Fixed => fixed(text, whole, max, overlap),
        ChunkStrategy::Paragraph => {
            let pieces = blocks(text, whole);
            pack(text, &pieces, max, |s| fixed(text, s, max, overlap))
        }
        ChunkStrategy::Sentence => {
            let pieces = sentences(text, whole);
            pack(text, &pieces, max, |s| fixed(text, s, max, overlap))
        }
        ChunkStrategy::Smart => smart(text, max, overlap, params.min_chars),
    }
}

// ============ Span helpers ============

fn char_len(text: &str, span: Span) -> usize {
    text[span.start..span.end].chars().count()
}

/// Shrink a span to exclude leading and trailing whitespace.
fn trim_span(text: &str, span: Span) -> Option<Span> {
    let slice = &text[span.start..span.end];
    let trimmed_start = slice.len() - slice.trim_start().len();
    let trimmed_end = slice.trim_end().len();
    if trimmed_end <= trimmed_start {
        return None;
    }
    Some(Span::new(span.start + trimmed_start, span.start + trimmed_end))
}

// ============ fixed ============

/// Greedy windows of whole words, each at most `max` characters, with the
/// next window starting up to `overlap` characters before the previous end.
fn fixed(text: &str, region: Span, max: usize, overlap: usize) -> Vec<Span> {
    let Some(region) = trim_span(text, region) else {
        return Vec::new();
    };
    let bounds: Vec<usize> = text[region.start..region.end]
        .split_word_bound_indices()
        .map(|(i, _)| region.start + i)
        .chain(once(region.end))
        .collect();
    let word_len = |k: usize| char_len(text, Span::new(bounds[k], bounds[k + 1]));

    let mut out = Vec::new();
    let mut i = 0;
    let mut last_end = 0;

    loop {
        let mut end = i + 1;
        let mut chars = word_len(i);
        while end + 1 < bounds.len() {
            let next = chars + word_len(end);
            if next > max {
                break;
            }
            chars = next;
            end += 1;
        }

        // The overlap tail plus the next word did not fit: restart clean.
        if end <= last_end {
            i = last_end;
            continue;
        }

        if let Some(span) = trim_span(text, Span::new(bounds[i], bounds[end])) {
            out.push(span);
        }
        if end + 1 >= bounds.len() {
            break;
        }
        last_end = end;

        let mut k = end;
        let mut back = 0;
        while k > i + 1 {
            let w = word_len(k - 1);
            if back + w > overlap {
                break;
            }
            back += w;
            k -= 1;
        }
        i = k;
    }

    out
}

// ============ paragraph / sentence ============

/// Maximal runs of non-blank lines.
fn blocks(text: &str, region: Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut current: Option<usize> = None;
    let mut current_end = region.start;
    let mut pos = region.start;

    for line in text[region.start..region.end].split_inclusive('\n') {
        let line_start = pos;
        pos += line.len();
        if line.trim().is_empty() {
            if let Some(start) = current.take() {
                out.extend(trim_span(text, Span::new(start, current_end)));
            }
        } else {
            current.get_or_insert(line_start);
            current_end = pos;
        }
    }
    if let Some(start) = current {
        out.extend(trim_span(text, Span::new(start, current_end)));
    }
    out
}

fn sentences(text: &str, region: Span) -> Vec<Span> {
    let slice = &text[region.start..region.end];
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = slice.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, n)| n.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            out.extend(trim_span(
                text,
                Span::new(region.start + start, region.start + end),
            ));
            start = end;
        }
    }
    out.extend(trim_span(
        text,
        Span::new(region.start + start, region.end),
    ));
    out
}

/// Coalesce ordered pieces into fragments up to `max` characters. Pieces
/// that are too large on their own are handed to `split`.
fn pack<F>(text: &str, pieces: &[Span], max: usize, split: F) -> Vec<Span>
where
    F: Fn(Span) -> Vec<Span>,
{
    let mut out = Vec::new();
    let mut group: Option<Span> = None;

    for &piece in pieces {
        if let Some(g) = group {
            if char_len(text, Span::new(g.start, piece.end)) <= max {
                group = Some(Span::new(g.start, piece.end));
                continue;
            }
            out.push(g);
            group = None;
        }
        if char_len(text, piece) > max {
            out.extend(split(piece));
        } else {
            group = Some(piece);
        }
    }
    out.extend(group);
    out
}

// ============ smart ============

fn is_heading(line: &str) -> bool {
    let t = line.trim();
    if t.starts_with('#') {
        return true;
    }
    let short = t.chars().count() <= 80;
    short && (t.ends_with(':') || t.ends_with('：')) && !t.contains(". ")
}

fn is_list_item(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") || t.starts_with("• ") {
        return true;
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (t[digits..].starts_with(". ") || t[digits..].starts_with(") "))
}

/// Split at heading lines; each heading starts a new section.
fn sections(text: &str) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    for line in text.split_inclusive('\n') {
        if is_heading(line) && pos > start {
            out.extend(trim_span(text, Span::new(start, pos)));
            start = pos;
        }
        pos += line.len();
    }
    out.extend(trim_span(text, Span::new(start, text.len())));
    out
}

/// Non-empty lines as individual spans.
fn lines(text: &str, region: Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut pos = region.start;
    for line in text[region.start..region.end].split_inclusive('\n') {
        out.extend(trim_span(text, Span::new(pos, pos + line.len())));
        pos += line.len();
    }
    out
}

/// Pick a splitter for one region based on its shape.
fn split_region(text: &str, region: Span, max: usize, overlap: usize) -> Vec<Span> {
    let body = &text[region.start..region.end];
    let line_spans = lines(text, region);
    let list_lines = line_spans
        .iter()
        .filter(|s| is_list_item(&text[s.start..s.end]))
        .count();
    let avg_line = if line_spans.is_empty() {
        0
    } else {
        char_len(text, region) / line_spans.len()
    };
    let has_terminals = body.contains(['.', '!', '?', '。', '！', '？']);

    let by_sentence = |s: Span| {
        let pieces = sentences(text, s);
        pack(text, &pieces, max, |p| fixed(text, p, max, overlap))
    };

    let paragraphs = blocks(text, region);
    if paragraphs.len() > 1 {
        return pack(text, &paragraphs, max, |p| {
            split_region(text, p, max, overlap)
        });
    }
    if line_spans.len() > 1 && (list_lines * 2 >= line_spans.len() || avg_line < 40) {
        return pack(text, &line_spans, max, |p| {
            if has_terminals {
                by_sentence(p)
            } else {
                fixed(text, p, max, overlap)
            }
        });
    }
    if has_terminals {
        return by_sentence(region);
    }
    fixed(text, region, max, overlap)
}

fn smart(text: &str, max: usize, overlap: usize, min: usize) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::new();
    for section in sections(text) {
        for span in split_region(text, section, max, overlap) {
            if let Some(last) = out.last_mut() {
                let small = char_len(text, *last) < min || char_len(text, span) < min;
                let merged = Span::new(last.start, span.end.max(last.end));
                if small && char_len(text, merged) <= max {
                    *last = merged;
                    continue;
                }
            }
            out.push(span);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ChunkStrategy; 4] = [
        ChunkStrategy::Fixed,
        ChunkStrategy::Paragraph,
        ChunkStrategy::Sentence,
        ChunkStrategy::Smart,
    ];

    fn params(max: usize, overlap: usize, min: usize) -> ChunkParams {
        ChunkParams {
            max_chars: max,
            overlap_chars: overlap,
            min_chars: min,
        }
    }

    /// Spans are ordered and every uncovered byte range is whitespace.
    fn assert_covers(text: &str, spans: &[Span]) {
        let mut cursor = 0;
        let mut prev_start = 0;
        for s in spans {
            assert!(s.start < s.end, "empty span {:?}", s);
            assert!(s.start >= prev_start, "spans out of order");
            if s.start > cursor {
                assert!(
                    text[cursor..s.start].trim().is_empty(),
                    "gap {:?} dropped text {:?}",
                    (cursor, s.start),
                    &text[cursor..s.start]
                );
            }
            cursor = cursor.max(s.end);
            prev_start = s.start;
        }
        assert!(text[cursor..].trim().is_empty(), "tail dropped");
    }

    fn sample_texts() -> Vec<String> {
        vec![
            "Short.".to_string(),
            "# Refunds\n\nOur refund policy allows returns within 30 days. Items must be unused!\n\n\
             ## Shipping:\n- Free over $50\n- Express available\n- International takes 2 weeks\n\n\
             Contact support for questions? We answer within a day."
                .to_string(),
            (0..60)
                .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
                .collect::<Vec<_>>()
                .join(" "),
            "退款政策：商品在三十天内可以退货。请保留收据！运费由买家承担。".repeat(10),
            format!(
                "prefix {} suffix words here",
                "x".repeat(300)
            ),
            "table orders record: id=1, customer=Ann, total=12.50, status=shipped".to_string(),
            "line one\nline two\n\n\n   \nline three   ".to_string(),
        ]
    }

    #[test]
    fn empty_input_yields_nothing() {
        for s in ALL {
            assert!(chunk("", s, &ChunkParams::default()).is_empty());
            assert!(chunk("  \n\n \t", s, &ChunkParams::default()).is_empty());
        }
    }

    #[test]
    fn every_strategy_covers_input() {
        for text in sample_texts() {
            for s in ALL {
                for p in [params(50, 10, 15), params(120, 0, 30), params(7, 3, 2)] {
                    let spans = chunk_spans(&text, s, &p);
                    assert!(!spans.is_empty());
                    assert_covers(&text, &spans);
                }
            }
        }
    }

    #[test]
    fn fragments_respect_max_unless_single_word() {
        for text in sample_texts() {
            for s in ALL {
                let p = params(60, 12, 20);
                for part in chunk(&text, s, &p) {
                    let n = part.chars().count();
                    let words = part.unicode_words().count();
                    assert!(
                        n <= 60 || words == 1,
                        "{:?} produced {} chars: {:?}",
                        s,
                        n,
                        part
                    );
                }
            }
        }
    }

    #[test]
    fn oversized_word_is_kept_whole() {
        let long = "y".repeat(100);
        let text = format!("alpha {} omega", long);
        let parts = chunk(&text, ChunkStrategy::Fixed, &params(20, 5, 0));
        assert!(parts.iter().any(|p| p == &long));
        assert!(parts.iter().all(|p| !p.contains('y') || p == &long));
    }

    #[test]
    fn fixed_overlap_is_bounded() {
        let text = (0..200).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let spans = chunk_spans(&text, ChunkStrategy::Fixed, &params(40, 10, 0));
        assert!(spans.len() > 5);
        let mut overlapped = 0;
        for pair in spans.windows(2) {
            if pair[1].start < pair[0].end {
                overlapped += 1;
                let shared = text[pair[1].start..pair[0].end].chars().count();
                assert!(shared <= 10, "overlap of {} chars", shared);
            }
            assert!(pair[1].end > pair[0].end, "no progress");
        }
        assert!(overlapped > 0);
    }

    #[test]
    fn fixed_without_overlap_is_disjoint() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let spans = chunk_spans(text, ChunkStrategy::Fixed, &params(15, 0, 0));
        for pair in spans.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
        assert_covers(text, &spans);
    }

    #[test]
    fn paragraph_coalesces_small_paragraphs() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let parts = chunk(text, ChunkStrategy::Paragraph, &params(700, 0, 0));
        assert_eq!(parts.len(), 1);
        let parts = chunk(text, ChunkStrategy::Paragraph, &params(20, 0, 0));
        assert_eq!(
            parts,
            vec!["First paragraph.", "Second paragraph.", "Third paragraph."]
        );
    }

    #[test]
    fn sentence_splits_on_terminals_and_cjk() {
        let parts = chunk(
            "One is here. Two is here! Three?",
            ChunkStrategy::Sentence,
            &params(14, 0, 0),
        );
        assert_eq!(parts, vec!["One is here.", "Two is here!", "Three?"]);

        let parts = chunk("第一句。第二句！", ChunkStrategy::Sentence, &params(4, 0, 0));
        assert_eq!(parts, vec!["第一句。", "第二句！"]);
    }

    #[test]
    fn sentence_does_not_split_decimals() {
        let parts = chunk(
            "The total was 12.50 dollars. Then more.",
            ChunkStrategy::Sentence,
            &params(30, 0, 0),
        );
        assert_eq!(parts[0], "The total was 12.50 dollars.");
    }

    #[test]
    fn smart_splits_at_headings() {
        let text = "# Refunds\nOur refund policy allows returns within thirty days of purchase.\n\
                    # Shipping\nOrders ship within two business days from our warehouse.";
        let parts = chunk(text, ChunkStrategy::Smart, &params(80, 0, 10));
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("# Refunds"));
        assert!(parts[1].starts_with("# Shipping"));
    }

    #[test]
    fn smart_merges_tiny_fragments() {
        let text = "Intro:\n\nA.\n\nThis paragraph is long enough to stand on its own as a chunk.";
        let parts = chunk(text, ChunkStrategy::Smart, &params(120, 0, 20));
        for p in &parts {
            assert!(p.chars().count() >= 20, "tiny fragment {:?}", p);
        }
    }

    #[test]
    fn deterministic_output() {
        for text in sample_texts() {
            for s in ALL {
                let p = params(50, 8, 10);
                assert_eq!(chunk(&text, s, &p), chunk(&text, s, &p));
            }
        }
    }
}
