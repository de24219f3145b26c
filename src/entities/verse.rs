// 📖 Verse Model - the uniform shape every source adapter parses into
//
// Sources disagree on markup, pagination and chapter labels. Once a page has
// been parsed, none of that survives: a chapter is a number plus an ordered
// list of verses, each with an optional section heading.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lettered supplementary chapters ("A", "B", ...) are stored above the
/// normal chapter range: A = 101, B = 102, ...
pub const LETTERED_CHAPTER_BASE: u32 = 100;

// ============================================================================
// WORKSPACE
// ============================================================================

/// A (language, edition) scope. Not a stored row; every book carries it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Workspace {
    pub language: String,
    pub edition: String,
}

impl Workspace {
    pub fn new(language: &str, edition: &str) -> Self {
        Workspace {
            language: language.trim().to_string(),
            edition: edition.trim().to_string(),
        }
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.language, self.edition)
    }
}

// ============================================================================
// CHAPTER TOKENS
// ============================================================================

/// Chapter label as a source spells it, before mapping to a stored number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChapterToken {
    /// Plain integer. `0` means "this book has exactly one chapter" on
    /// sources that label single-chapter books that way.
    Number(u32),

    /// Single-letter supplementary chapter
    Letter(char),
}

impl ChapterToken {
    /// Parse a raw token: "12" → Number(12), "b" → Letter('B')
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(n) = raw.parse::<u32>() {
            return Some(ChapterToken::Number(n));
        }

        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => {
                Some(ChapterToken::Letter(c.to_ascii_uppercase()))
            }
            _ => None,
        }
    }

    /// Map to the stored chapter number.
    ///
    /// Returns None for `0` on a book that is not flagged single-chapter,
    /// since there is nothing sensible to store it as.
    pub fn to_chapter_number(&self, single_chapter: bool) -> Option<u32> {
        match self {
            ChapterToken::Number(0) if single_chapter => Some(1),
            ChapterToken::Number(0) => None,
            ChapterToken::Number(n) => Some(*n),
            ChapterToken::Letter(c) => {
                let upper = c.to_ascii_uppercase();
                if !upper.is_ascii_uppercase() {
                    return None;
                }
                Some(LETTERED_CHAPTER_BASE + (upper as u32 - 'A' as u32 + 1))
            }
        }
    }
}

impl fmt::Display for ChapterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterToken::Number(n) => write!(f, "{}", n),
            ChapterToken::Letter(c) => write!(f, "{}", c),
        }
    }
}

// ============================================================================
// VERSES & CHAPTERS
// ============================================================================

/// One parsed verse. `text` is already normalized and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRecord {
    pub number: u32,
    pub text: String,

    /// Section title that begins at this verse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
}

impl VerseRecord {
    pub fn new(number: u32, text: &str) -> Self {
        VerseRecord {
            number,
            text: text.to_string(),
            heading: None,
        }
    }

    /// Builder pattern: attach a heading
    pub fn with_heading(mut self, heading: &str) -> Self {
        self.heading = Some(heading.to_string());
        self
    }
}

/// Output of `SourceAdapter::fetch_chapter`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChapterContent {
    pub number: u32,
    pub verses: Vec<VerseRecord>,

    /// Headings remapped because their captured verse number was absent
    #[serde(default)]
    pub heading_fallbacks: usize,

    /// Repeated verse keys dropped while parsing
    #[serde(default)]
    pub duplicates_dropped: usize,
}

impl ChapterContent {
    pub fn new(number: u32, verses: Vec<VerseRecord>) -> Self {
        ChapterContent {
            number,
            verses,
            heading_fallbacks: 0,
            duplicates_dropped: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.verses.is_empty()
    }

    pub fn verse_numbers(&self) -> Vec<u32> {
        self.verses.iter().map(|v| v.number).collect()
    }

    pub fn get(&self, number: u32) -> Option<&VerseRecord> {
        self.verses.iter().find(|v| v.number == number)
    }

    pub fn heading_count(&self) -> usize {
        self.verses.iter().filter(|v| v.heading.is_some()).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
