//! Splitting documents into overlapping, character-sized windows.
//!
//! Sizing is in characters, not bytes or tokens, so multi-byte text never
//! splits inside a code point. A window ends at the last sentence break in
//! its final 30%, failing that the last whitespace in its final 20%, and
//! otherwise at exactly `chunk_size` characters. The next window starts
//! `overlap` characters before the previous end.
//!
//! Chunking is deterministic: the same content and settings always yield
//! the same windows and chunk indices, which keeps re-indexing stable.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    document::Document,
    error::{Error, Result},
};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Free-form key/value metadata attached to chunks and stored items.
pub type Metadata = BTreeMap<String, Value>;

/// Chunk sizing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config(
                "chunking.chunk_size must be greater than zero".into(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunking.overlap ({}) must be less than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A window of text with its character offsets in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
}

/// One chunk of a document, ready to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub source: String,
    /// Zero-based position among the document's chunks.
    pub chunk_index: usize,
    /// Character offset (inclusive) in the document content.
    pub start_char: usize,
    /// Character offset (exclusive) in the document content.
    pub end_char: usize,
    pub metadata: Metadata,
}

/// Split text into overlapping windows of at most `chunk_size` characters.
///
/// Windows containing only whitespace are dropped. Window text is kept
/// verbatim, so [`reconstruct`] can stitch the windows back together.
///
/// # Examples
///
/// ```
/// use docrag::chunking::chunk_text;
///
/// let windows = chunk_text("Hello, world!", 500, 50);
/// assert_eq!(windows.len(), 1);
/// assert_eq!(windows[0].text, "Hello, world!");
///
/// let text = "word ".repeat(500);
/// let windows = chunk_text(&text, 100, 20);
/// assert!(windows.iter().all(|w| w.text.chars().count() <= 100));
/// ```
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<TextWindow> {
    let chars: Vec<char> = text.chars().collect();
    let char_count = chars.len();
    if char_count == 0 || chunk_size == 0 {
        return Vec::new();
    }

    // char index -> byte index, with a trailing entry for text.len()
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let window_end = (start + chunk_size).min(char_count);
        let end = if window_end < char_count {
            find_break(&chars, start, window_end)
        } else {
            window_end
        };

        let slice = &text[char_to_byte[start]..char_to_byte[end]];
        if !slice.trim().is_empty() {
            windows.push(TextWindow {
                text: slice.to_string(),
                start_char: start,
                end_char: end,
            });
        }

        if end >= char_count {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    windows
}

/// Pick the end of the window `[start, window_end)`.
fn find_break(chars: &[char], start: usize, window_end: usize) -> usize {
    let len = window_end - start;

    // Sentence break in the last 30% of the window.
    for i in (start..window_end).rev() {
        if (i - start) * 10 <= len * 7 {
            break;
        }
        let sentence_end = matches!(chars[i], '.' | '!' | '?')
            || (chars[i] == '\n' && i > start && chars[i - 1] == '\n');
        if sentence_end {
            return i + 1;
        }
    }

    // Whitespace in the last 20% of the window.
    for i in (start..window_end).rev() {
        if (i - start) * 10 <= len * 8 {
            break;
        }
        if chars[i].is_whitespace() {
            return i + 1;
        }
    }

    window_end
}

/// Rebuild the original text from ordered, overlapping chunks by dropping
/// the characters each chunk shares with its predecessor.
pub fn reconstruct<'a, I>(windows: I) -> String
where
    I: IntoIterator<Item = (&'a str, usize, usize)>,
{
    let mut out = String::new();
    let mut covered = 0;
    for (text, start_char, end_char) in windows {
        if end_char <= covered {
            continue;
        }
        let skip = covered.saturating_sub(start_char);
        out.extend(text.chars().skip(skip));
        covered = end_char;
    }
    out
}

/// Turns documents into chunks carrying per-chunk metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    /// Create a chunker, rejecting an overlap that is not smaller than
    /// the chunk size.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Chunk one document. `extra` metadata is merged into every chunk
    /// and never overrides the built-in keys.
    pub fn chunk_document(
        &self,
        document: &Document,
        extra: Option<&Metadata>,
    ) -> Vec<Chunk> {
        let windows = chunk_text(
            &document.content,
            self.config.chunk_size,
            self.config.overlap,
        );
        let indexed_at = Utc::now().to_rfc3339();

        let chunks: Vec<Chunk> = windows
            .into_iter()
            .enumerate()
            .map(|(chunk_index, window)| {
                let mut metadata = extra.cloned().unwrap_or_default();
                metadata.insert("source".into(), document.source.clone().into());
                metadata.insert(
                    "file_type".into(),
                    document.file_type.extension().into(),
                );
                metadata.insert("file_size".into(), document.size.into());
                metadata.insert("indexed_at".into(), indexed_at.clone().into());
                metadata.insert("chunk_index".into(), chunk_index.into());
                metadata.insert("start_char".into(), window.start_char.into());
                metadata.insert("end_char".into(), window.end_char.into());
                metadata.insert(
                    "total_chars".into(),
                    window.text.chars().count().into(),
                );

                Chunk {
                    text: window.text,
                    source: document.source.clone(),
                    chunk_index,
                    start_char: window.start_char,
                    end_char: window.end_char,
                    metadata,
                }
            })
            .collect();

        tracing::debug!(
            source = %document.source,
            chunks = chunks.len(),
            "chunked document"
        );
        chunks
    }

    /// Chunk many documents, keeping document order.
    pub fn chunk_documents(
        &self,
        documents: &[Document],
        extra: Option<&Metadata>,
    ) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|doc| self.chunk_document(doc, extra))
            .collect()
    }
}

/// Size figures over a set of chunks, in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    pub total_chunks: usize,
    pub total_chars: usize,
    pub avg_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub sources: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }

        let sizes: Vec<usize> =
            chunks.iter().map(|c| c.text.chars().count()).collect();
        let sources: HashSet<&str> =
            chunks.iter().map(|c| c.source.as_str()).collect();
        let total_chars: usize = sizes.iter().sum();

        Self {
            total_chunks: chunks.len(),
            total_chars,
            avg_chunk_size: total_chars / chunks.len(),
            min_chunk_size: sizes.iter().copied().min().unwrap_or_default(),
            max_chunk_size: sizes.iter().copied().max().unwrap_or_default(),
            sources: sources.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FileType;

    fn doc(content: &str) -> Document {
        Document {
            content: content.to_string(),
            source: "/docs/a.md".to_string(),
            file_type: FileType::Md,
            size: content.len() as u64,
            created_at: Utc::now(),
        }
    }

    fn rebuild(windows: &[TextWindow]) -> String {
        reconstruct(
            windows
                .iter()
                .map(|w| (w.text.as_str(), w.start_char, w.end_char)),
        )
    }

    #[test]
    fn short_text_single_chunk() {
        let windows = chunk_text("Hello, world!", 500, 50);
        assert_eq!(
            windows,
            vec![TextWindow {
                text: "Hello, world!".into(),
                start_char: 0,
                end_char: 13,
            }]
        );
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("   \n\t  ", 100, 10).is_empty());
    }

    #[test]
    fn breaks_after_sentence_in_tail() {
        // 20-char window; the '.' at index 15 is past 70%.
        let text = format!("{}. {}", "a".repeat(15), "b".repeat(20));
        let windows = chunk_text(&text, 20, 0);
        assert_eq!(windows[0].text, format!("{}.", "a".repeat(15)));
        assert_eq!(windows[0].end_char, 16);
    }

    #[test]
    fn early_sentence_break_is_ignored() {
        // '.' at index 3 is too early; whitespace at 17 is past 80%.
        let text = format!("aaa.{} {}", "a".repeat(13), "b".repeat(20));
        let windows = chunk_text(&text, 20, 0);
        assert_eq!(windows[0].text, format!("aaa.{} ", "a".repeat(13)));
    }

    #[test]
    fn paragraph_break_counts_as_sentence_end() {
        let text = format!("{}\n\n{}", "a".repeat(16), "b".repeat(30));
        let windows = chunk_text(&text, 20, 0);
        assert_eq!(windows[0].text, format!("{}\n\n", "a".repeat(16)));
    }

    #[test]
    fn hard_cut_without_boundaries() {
        let text = "x".repeat(45);
        let windows = chunk_text(&text, 20, 5);
        assert_eq!(windows[0].end_char, 20);
        assert_eq!(windows[1].start_char, 15);
        assert_eq!(windows[1].end_char, 35);
        assert_eq!(windows.last().unwrap().end_char, 45);
        assert_eq!(rebuild(&windows), text);
    }

    #[test]
    fn windows_never_exceed_chunk_size() {
        let text = "Lorem ipsum dolor sit amet. Consectetur adipiscing! ".repeat(40);
        for (size, overlap) in [(50, 10), (64, 0), (100, 99), (7, 3)] {
            let windows = chunk_text(&text, size, overlap);
            assert!(windows.iter().all(|w| w.text.chars().count() <= size));
            assert_eq!(windows.last().unwrap().end_char, text.chars().count());
            assert_eq!(rebuild(&windows), text);
        }
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(50);
        let windows = chunk_text(&text, 37, 11);
        assert!(windows.len() > 1);
        assert_eq!(rebuild(&windows), text);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        let err = TextChunker::new(ChunkingConfig {
            chunk_size: 100,
            overlap: 100,
        })
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
        assert!(
            TextChunker::new(ChunkingConfig {
                chunk_size: 0,
                overlap: 0,
            })
            .is_err()
        );
    }

    #[test]
    fn chunk_document_assigns_contiguous_indices_and_metadata() {
        let content = "One sentence here. Another sentence follows! ".repeat(30);
        let chunker = TextChunker::new(ChunkingConfig {
            chunk_size: 120,
            overlap: 20,
        })
        .unwrap();

        let mut extra = Metadata::new();
        extra.insert("project".into(), "demo".into());
        extra.insert("source".into(), "ignored".into());

        let chunks = chunker.chunk_document(&doc(&content), Some(&extra));
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.metadata["chunk_index"], i);
            assert_eq!(chunk.metadata["source"], "/docs/a.md");
            assert_eq!(chunk.metadata["file_type"], "md");
            assert_eq!(chunk.metadata["project"], "demo");
            assert_eq!(
                chunk.metadata["total_chars"],
                chunk.text.chars().count()
            );
            assert!(chunk.metadata.contains_key("indexed_at"));
        }

        let rebuilt = reconstruct(
            chunks
                .iter()
                .map(|c| (c.text.as_str(), c.start_char, c.end_char)),
        );
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn chunking_is_deterministic() {
        let content = "Stable input. ".repeat(100);
        let chunker = TextChunker::default();
        let a = chunker.chunk_document(&doc(&content), None);
        let b = chunker.chunk_document(&doc(&content), None);
        let spans = |c: &[Chunk]| -> Vec<(usize, usize)> {
            c.iter().map(|c| (c.start_char, c.end_char)).collect()
        };
        assert_eq!(spans(&a), spans(&b));
    }

    #[test]
    fn stats_over_chunks() {
        let chunker = TextChunker::new(ChunkingConfig {
            chunk_size: 10,
            overlap: 0,
        })
        .unwrap();
        let mut second = doc("abcde");
        second.source = "/docs/b.md".into();
        let docs = vec![doc("0123456789abc"), second];

        let chunks = chunker.chunk_documents(&docs, None);
        let stats = ChunkStats::from_chunks(&chunks);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_chars, 18);
        assert_eq!(stats.avg_chunk_size, 6);
        assert_eq!(stats.min_chunk_size, 3);
        assert_eq!(stats.max_chunk_size, 10);
        assert_eq!(stats.sources, 2);

        assert_eq!(ChunkStats::from_chunks(&[]), ChunkStats::default());
    }
}
