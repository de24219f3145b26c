// 🔌 Source Adapters - one per upstream source, one capability interface
//
// Every source answers two questions for a book:
//   1. which chapters exist?          (list_chapters)
//   2. what are chapter N's verses?   (fetch_chapter)
//
// Adapters differ in pagination (numbered pages, "next" links, one flat page
// with anchors, a markdown document, a local CSV) and in how they spell
// chapter labels. After fetch_chapter, those differences are gone.
//
// Failure semantics: adapters do NOT retry. Transient errors bubble up to the
// orchestrator's retry utility; a page missing its structural anchor is a
// `FetchError::Structural`. A chapter with no parseable verses is NOT an
// error - it comes back empty and the caller decides.

pub mod anchored;
pub mod csv_import;
pub mod http;
pub mod linked;
pub mod markdown;
pub mod markup;
pub mod paged;

use crate::config::SourcesConfig;
use crate::entities::{BookSpec, ChapterContent, ChapterToken};
use crate::headings::HeadingSettings;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use anchored::AnchoredAdapter;
pub use csv_import::{export_csv, read_csv_rows, write_csv_rows, CsvImportAdapter, CsvVerseRow};
pub use http::{ContentType, FetchError, HttpFetcher, PageFetcher};
#[cfg(test)]
pub use http::StaticFetcher;
pub use linked::LinkedAdapter;
pub use markdown::MarkdownAdapter;
pub use paged::PagedAdapter;

// ============================================================================
// SOURCE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Numbered chapter pages built from the book slug
    Paged,

    /// "Next"-link walk from the book's first page
    Linked,

    /// One flat page per book with chapter and verse anchors
    Anchored,

    /// Lightweight markup document per book
    Markdown,

    /// Local interchange CSV
    CsvImport,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Paged => "Paged chapter pages",
            SourceKind::Linked => "Next-link walk",
            SourceKind::Anchored => "Anchored flat page",
            SourceKind::Markdown => "Markdown document",
            SourceKind::CsvImport => "CSV import",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SourceKind::Paged => "paged",
            SourceKind::Linked => "linked",
            SourceKind::Anchored => "anchored",
            SourceKind::Markdown => "markdown",
            SourceKind::CsvImport => "csv_import",
        }
    }

    pub fn all() -> [SourceKind; 5] {
        [
            SourceKind::Paged,
            SourceKind::Linked,
            SourceKind::Anchored,
            SourceKind::Markdown,
            SourceKind::CsvImport,
        ]
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Which adapter serves a book, and the book's identifier on that source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,

    /// Path segment / document name / CSV book name, depending on kind
    pub slug: String,
}

impl SourceRef {
    pub fn new(kind: SourceKind, slug: &str) -> Self {
        SourceRef {
            kind,
            slug: slug.to_string(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.slug)
    }
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Chapter tokens for the book, in source order
    async fn list_chapters(&self, book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError>;

    /// Fetch and parse one chapter
    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError>;

    /// The chapter will not be fetched this run; drop whatever is cached for it
    fn skip_chapter(&self, _source: &SourceRef, _token: &ChapterToken) {}

    /// The book is finished; drop every cached page for it
    fn release_book(&self, _source: &SourceRef) {}
}

/// Token → stored chapter number, or a structural error naming the page
pub fn map_token(book: &BookSpec, token: &ChapterToken, url: &str) -> Result<u32, FetchError> {
    token.to_chapter_number(book.single_chapter).ok_or_else(|| {
        FetchError::structural(
            url,
            format!("chapter token '{}' has no mapping for {} (single_chapter={})", token, book.name, book.single_chapter),
        )
    })
}

/// Join a base URL and path segments with single slashes
pub(crate) fn join_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for seg in segments {
        let seg = seg.trim_matches('/');
        if !seg.is_empty() {
            url.push('/');
            url.push_str(seg);
        }
    }
    url
}

// ============================================================================
// ADAPTER FACTORY
// ============================================================================

/// Factory function to build the adapter for a source kind.
/// Returns None when the configuration has no endpoint for that kind.
pub fn build_adapter(
    kind: SourceKind,
    sources: &SourcesConfig,
    fetcher: Arc<dyn PageFetcher>,
    headings: &HeadingSettings,
) -> Option<Box<dyn SourceAdapter>> {
    match kind {
        SourceKind::Paged => sources
            .paged
            .as_ref()
            .map(|base| Box::new(PagedAdapter::new(base, fetcher, headings.clone())) as Box<dyn SourceAdapter>),
        SourceKind::Linked => sources
            .linked
            .as_ref()
            .map(|base| Box::new(LinkedAdapter::new(base, fetcher, headings.clone())) as Box<dyn SourceAdapter>),
        SourceKind::Anchored => sources
            .anchored
            .as_ref()
            .map(|base| Box::new(AnchoredAdapter::new(base, fetcher, headings.clone())) as Box<dyn SourceAdapter>),
        SourceKind::Markdown => sources
            .markdown
            .as_ref()
            .map(|base| Box::new(MarkdownAdapter::new(base, fetcher)) as Box<dyn SourceAdapter>),
        SourceKind::CsvImport => sources
            .csv_path
            .as_ref()
            .map(|path| Box::new(CsvImportAdapter::new(path)) as Box<dyn SourceAdapter>),
    }
}

/// The closed set of adapters available to a run, selected per book
#[derive(Default)]
pub struct SourceSet {
    adapters: HashMap<SourceKind, Box<dyn SourceAdapter>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every adapter the configuration has an endpoint for
    pub fn from_config(sources: &SourcesConfig, fetcher: Arc<dyn PageFetcher>, headings: &HeadingSettings) -> Self {
        let mut set = SourceSet::new();
        for kind in SourceKind::all() {
            if let Some(adapter) = build_adapter(kind, sources, fetcher.clone(), headings) {
                set.adapters.insert(kind, adapter);
            }
        }
        set
    }

    /// Builder pattern: register (or replace) an adapter
    pub fn with_adapter(mut self, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Result<&dyn SourceAdapter> {
        self.adapters
            .get(&kind)
            .map(|a| a.as_ref())
            .ok_or_else(|| anyhow!("No endpoint configured for source kind '{}'", kind))
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<SourceKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Grouping;

    #[test]
    fn test_source_kind_codes() {
        assert_eq!(SourceKind::CsvImport.code(), "csv_import");
        let json = serde_json::to_string(&SourceKind::CsvImport).unwrap();
        assert_eq!(json, "\"csv_import\"");
        assert_eq!(SourceRef::new(SourceKind::Paged, "kej").to_string(), "paged:kej");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://x.test/bible/", &["kej", "3"]), "https://x.test/bible/kej/3");
        assert_eq!(join_url("https://x.test", &["/obad/", ""]), "https://x.test/obad");
    }

    #[test]
    fn test_map_token() {
        let mut book = BookSpec {
            name: "Obaja".to_string(),
            abbreviation: "Ob".to_string(),
            grouping: Grouping::Old,
            order_index: 31,
            chapter_count: 1,
            single_chapter: false,
            aliases: vec![],
            source: SourceRef::new(SourceKind::Paged, "oba"),
            overlay: None,
            audit_source: None,
        };

        assert!(map_token(&book, &ChapterToken::Number(0), "u").is_err());
        book.single_chapter = true;
        assert_eq!(map_token(&book, &ChapterToken::Number(0), "u").unwrap(), 1);
    }

    #[test]
    fn test_source_set_from_config() {
        let sources = SourcesConfig {
            paged: Some("https://paged.test".to_string()),
            markdown: Some("https://md.test".to_string()),
            ..SourcesConfig::default()
        };
        let set = SourceSet::from_config(&sources, Arc::new(StaticFetcher::new()), &HeadingSettings::default());

        assert_eq!(set.kinds(), vec![SourceKind::Paged, SourceKind::Markdown]);
        assert!(set.get(SourceKind::Linked).is_err());
        assert_eq!(set.get(SourceKind::Paged).unwrap().kind(), SourceKind::Paged);
    }
}
