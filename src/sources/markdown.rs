// 📝 Markdown Adapter - lightweight-markup rendition of a book
//
// Document shape (one per book, fetched with Accept: text/markdown):
//
//   ## Chapter 3            (also "## Pasal 3", "## 3", "## A")
//   ### Section Title
//   [1] verse text
//   continuation line of verse 1
//   [2] verse text
//
// Headings apply to the next verse line, so no proximity heuristics are
// involved. That makes this source a good independent reference for the
// live sampling audit.

use super::{join_url, map_token, ContentType, FetchError, PageFetcher, SourceAdapter, SourceKind, SourceRef};
use crate::deduplication::{DedupStrategy, DeduplicationEngine};
use crate::entities::{BookSpec, ChapterContent, ChapterToken, VerseRecord};
use crate::normalizer::{normalize, normalize_verse};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

static CHAPTER_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^##\s+(?:(?:chapter|pasal|bab|psalm|mazmur|tambahan)\s+)?([0-9]{1,3}|[a-z])\s*$").unwrap()
});
static HEADING_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^###\s+(.+?)\s*#*\s*$").unwrap());
static VERSE_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[(\d{1,3})\]\s*(.*)$").unwrap());

/// One chapter's raw lines, split out of the book document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownChapter {
    pub token: ChapterToken,
    pub lines: Vec<String>,
}

/// Split a book document at its `## ` chapter lines
pub fn split_chapters(doc: &str) -> Vec<MarkdownChapter> {
    let mut chapters: Vec<MarkdownChapter> = Vec::new();
    for line in doc.lines() {
        let line = line.trim_end();
        if let Some(caps) = CHAPTER_LINE_RE.captures(line.trim_start()) {
            if let Some(token) = ChapterToken::parse(&caps[1]) {
                chapters.push(MarkdownChapter {
                    token,
                    lines: Vec::new(),
                });
                continue;
            }
        }
        if let Some(current) = chapters.last_mut() {
            current.lines.push(line.to_string());
        }
    }
    chapters
}

fn strip_emphasis(text: &str) -> String {
    text.replace("**", "").replace('*', "")
}

/// Verses of one chapter. A heading with no verse after it is dropped.
/// A heading over an empty verse moves to the next verse with text.
pub fn parse_chapter_lines(lines: &[String], number: u32) -> ChapterContent {
    let mut verses: Vec<VerseRecord> = Vec::new();
    let mut raw_texts: Vec<String> = Vec::new();
    let mut pending_heading: Option<String> = None;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = HEADING_LINE_RE.captures(trimmed) {
            let title = normalize(&strip_emphasis(&caps[1]));
            if !title.is_empty() {
                pending_heading = Some(title);
            }
            continue;
        }

        if let Some(caps) = VERSE_LINE_RE.captures(trimmed) {
            let Ok(n) = caps[1].parse::<u32>() else {
                continue;
            };
            let mut verse = VerseRecord::new(n, "");
            verse.heading = pending_heading.take();
            verses.push(verse);
            raw_texts.push(caps[2].to_string());
            continue;
        }

        // Continuation of the previous verse; stray text before verse 1 is front matter
        if !trimmed.starts_with('#') {
            if let Some(raw) = raw_texts.last_mut() {
                raw.push(' ');
                raw.push_str(trimmed);
            }
        }
    }

    // An empty verse hands its heading to the next verse that has text
    let mut parsed = Vec::with_capacity(verses.len());
    let mut carried: Option<String> = None;
    let mut fallbacks = 0;
    for (mut verse, raw) in verses.into_iter().zip(raw_texts) {
        verse.text = normalize_verse(&strip_emphasis(&raw), verse.number);
        if verse.text.is_empty() {
            if verse.heading.is_some() {
                carried = verse.heading.take();
            }
            continue;
        }
        if let Some(heading) = carried.take() {
            if verse.heading.is_none() {
                verse.heading = Some(heading);
                fallbacks += 1;
            }
        }
        parsed.push(verse);
    }

    let outcome = DeduplicationEngine::new(DedupStrategy::KeepFirst).dedupe_verses(parsed);
    let mut chapter = ChapterContent::new(number, outcome.verses);
    chapter.duplicates_dropped = outcome.dropped.len();
    chapter.heading_fallbacks = fallbacks;
    chapter
}

pub struct MarkdownAdapter {
    base_url: String,
    fetcher: Arc<dyn PageFetcher>,
    documents: Mutex<HashMap<String, Arc<Vec<MarkdownChapter>>>>,
}

impl MarkdownAdapter {
    pub fn new(base_url: &str, fetcher: Arc<dyn PageFetcher>) -> Self {
        MarkdownAdapter {
            base_url: base_url.to_string(),
            fetcher,
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub fn document_url(&self, source: &SourceRef) -> String {
        format!("{}.md", join_url(&self.base_url, &[&source.slug]))
    }

    async fn document(&self, source: &SourceRef) -> Result<(String, Arc<Vec<MarkdownChapter>>), FetchError> {
        let url = self.document_url(source);
        if let Some(doc) = self.documents.lock().ok().and_then(|d| d.get(&source.slug).cloned()) {
            return Ok((url, doc));
        }

        let body = self.fetcher.get(&url, ContentType::Markdown).await?;
        let chapters = split_chapters(&body);
        if chapters.is_empty() {
            return Err(FetchError::structural(&url, "document has no chapter headings"));
        }

        let doc = Arc::new(chapters);
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(source.slug.clone(), doc.clone());
        }
        Ok((url, doc))
    }
}

#[async_trait]
impl SourceAdapter for MarkdownAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Markdown
    }

    async fn list_chapters(&self, _book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let (_, doc) = self.document(source).await?;
        let mut tokens: Vec<ChapterToken> = Vec::new();
        for chapter in doc.iter() {
            if !tokens.contains(&chapter.token) {
                tokens.push(chapter.token.clone());
            }
        }
        Ok(tokens)
    }

    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError> {
        let (url, doc) = self.document(source).await?;
        let number = map_token(book, token, &url)?;

        let chapter = doc
            .iter()
            .find(|c| &c.token == token)
            .ok_or_else(|| FetchError::structural(&url, format!("no chapter {} in document", token)))?;

        Ok(parse_chapter_lines(&chapter.lines, number))
    }
}

// ============================================================================
// TESTS
// ============================================================================
