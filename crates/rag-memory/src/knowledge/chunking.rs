//! Splitting knowledge content into embeddable chunks
//!
//! Sizes are counted in characters, never bytes, so chunk boundaries always
//! fall on UTF-8 character boundaries.
//!
//! ## Fixed-size
//! Windows of `chunk_size` characters advancing by `chunk_size - overlap`:
//! ```text
//! [0-800] [600-1400] [1200-2000] ...
//! ```
//!
//! ## Paragraph
//! Blank-line separated paragraphs packed greedily up to `chunk_size`.
//! Paragraphs longer than `chunk_size` fall back to fixed-size windows.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref PARAGRAPH_BREAK: Regex = Regex::new(r"\n\s*\n").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    FixedSize,
    Paragraph,
}

impl std::str::FromStr for ChunkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" | "fixed_size" => Ok(Self::FixedSize),
            "paragraph" => Ok(Self::Paragraph),
            other => Err(anyhow::anyhow!("unknown chunk strategy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub strategy: ChunkStrategy,
    /// Maximum chunk length in characters
    pub chunk_size: usize,
    /// Characters shared by consecutive fixed-size windows
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::FixedSize,
            chunk_size: 800,
            overlap: 200,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.overlap >= self.chunk_size {
            anyhow::bail!(
                "chunk overlap ({}) must be smaller than chunk_size ({})",
                self.overlap,
                self.chunk_size
            );
        }
        Ok(())
    }

    /// Stable description, folded into knowledge content hashes
    pub fn signature(&self) -> String {
        let strategy = match self.strategy {
            ChunkStrategy::FixedSize => "fixed",
            ChunkStrategy::Paragraph => "paragraph",
        };
        format!("{strategy}:{}:{}", self.chunk_size, self.overlap)
    }
}

/// Split `text` into chunks. Whitespace-only text yields no chunks; text
/// no longer than one chunk yields exactly one.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match config.strategy {
        ChunkStrategy::FixedSize => fixed_size_chunks(text, config.chunk_size, config.overlap),
        ChunkStrategy::Paragraph => paragraph_chunks(text, config),
    }
}

fn fixed_size_chunks(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let stride = chunk_size.saturating_sub(overlap).max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

fn paragraph_chunks(text: &str, config: &ChunkConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in PARAGRAPH_BREAK.split(text).map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        if len > config.chunk_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(fixed_size_chunks(paragraph, config.chunk_size, config.overlap));
            continue;
        }
        // +2 for the "\n\n" joiner
        let joined_len = if current.is_empty() { len } else { current_len + 2 + len };
        if joined_len > config.chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
