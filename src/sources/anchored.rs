// ⚓ Anchored Adapter - one flat page per book
//
// The whole book sits on a single page:
//   <a name="c1"></a> ... <a name="v1"></a> ... <a name="c2"></a> ...
// A chapter section is the span between its chapter anchor and the next
// one. The page is fetched once per book and reused for every chapter.

use super::markup::{parse_html_section, trim_trailer};
use super::{join_url, map_token, ContentType, FetchError, PageFetcher, SourceAdapter, SourceKind, SourceRef};
use crate::entities::{BookSpec, ChapterContent, ChapterToken};
use crate::headings::HeadingSettings;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// Letter chapters are uppercase only, so ids like "ch" or "cb" never match
static CHAPTER_ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<[a-zA-Z]+\b[^>]*?\b(?:name|id)\s*=\s*["']?c(?:hapter)?[-_]?([0-9]{1,3}|[A-Z])["'\s>/][^>]*>?"#)
        .unwrap()
});

/// Chapter anchor: token plus the markup range it occupies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterAnchor {
    pub token: ChapterToken,
    pub offset: usize,
    pub end: usize,
}

pub fn scan_chapter_anchors(page: &str) -> Vec<ChapterAnchor> {
    CHAPTER_ANCHOR_RE
        .captures_iter(page)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let token = ChapterToken::parse(caps.get(1)?.as_str())?;
            Some(ChapterAnchor {
                token,
                offset: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Markup of one chapter: from its anchor to the next chapter anchor.
/// A repeated anchor for the same chapter keeps the first occurrence.
pub fn chapter_section<'a>(page: &'a str, anchors: &[ChapterAnchor], token: &ChapterToken) -> Option<&'a str> {
    let idx = anchors.iter().position(|a| &a.token == token)?;
    let start = anchors[idx].end;
    let end = anchors
        .iter()
        .skip(idx + 1)
        .find(|a| &a.token != token)
        .map(|a| a.offset)
        .unwrap_or(page.len());
    Some(trim_trailer(&page[start..end]))
}

pub struct AnchoredAdapter {
    base_url: String,
    fetcher: Arc<dyn PageFetcher>,
    headings: HeadingSettings,
    pages: Mutex<HashMap<String, Arc<String>>>,
}

impl AnchoredAdapter {
    pub fn new(base_url: &str, fetcher: Arc<dyn PageFetcher>, headings: HeadingSettings) -> Self {
        AnchoredAdapter {
            base_url: base_url.to_string(),
            fetcher,
            headings,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Book pages currently held in memory
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn book_url(&self, source: &SourceRef) -> String {
        join_url(&self.base_url, &[&source.slug])
    }

    async fn page(&self, source: &SourceRef) -> Result<(String, Arc<String>), FetchError> {
        let url = self.book_url(source);
        if let Some(body) = self.pages.lock().ok().and_then(|p| p.get(&source.slug).cloned()) {
            return Ok((url, body));
        }

        let body = Arc::new(self.fetcher.get(&url, ContentType::Html).await?);
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(source.slug.clone(), body.clone());
        }
        Ok((url, body))
    }
}

#[async_trait]
impl SourceAdapter for AnchoredAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Anchored
    }

    async fn list_chapters(&self, _book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let (url, body) = self.page(source).await?;

        let mut tokens: Vec<ChapterToken> = Vec::new();
        for anchor in scan_chapter_anchors(&body) {
            if !tokens.contains(&anchor.token) {
                tokens.push(anchor.token);
            }
        }

        if tokens.is_empty() {
            return Err(FetchError::structural(&url, "page has no chapter anchors"));
        }
        Ok(tokens)
    }

    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError> {
        let (url, body) = self.page(source).await?;
        let number = map_token(book, token, &url)?;

        let anchors = scan_chapter_anchors(&body);
        let section = chapter_section(&body, &anchors, token)
            .ok_or_else(|| FetchError::structural(&url, format!("no anchor for chapter {}", token)))?;

        Ok(parse_html_section(section, number, &self.headings))
    }

    fn release_book(&self, source: &SourceRef) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(&source.slug);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
