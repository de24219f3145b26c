// 📄 Paged Adapter - one HTML page per chapter at a predictable URL
//
// Layout:
//   {base}/{slug}           book index, links to every chapter page
//   {base}/{slug}/{token}   chapter page, <h1> carries "Book N"
//
// The <h1> is the structural anchor: a chapter page without one is a
// broken or foreign page (error template, captcha) and must not be parsed.

use super::markup::{find_chapter_heading, heading_token, parse_html_section, trim_trailer};
use super::{join_url, map_token, ContentType, FetchError, PageFetcher, SourceAdapter, SourceKind, SourceRef};
use crate::entities::{BookSpec, ChapterContent, ChapterToken};
use crate::headings::HeadingSettings;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static HREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"'#?]+)"#).unwrap());

pub struct PagedAdapter {
    base_url: String,
    fetcher: Arc<dyn PageFetcher>,
    headings: HeadingSettings,
}

impl PagedAdapter {
    pub fn new(base_url: &str, fetcher: Arc<dyn PageFetcher>, headings: HeadingSettings) -> Self {
        PagedAdapter {
            base_url: base_url.to_string(),
            fetcher,
            headings,
        }
    }

    pub fn index_url(&self, source: &SourceRef) -> String {
        join_url(&self.base_url, &[&source.slug])
    }

    pub fn chapter_url(&self, source: &SourceRef, token: &ChapterToken) -> String {
        join_url(&self.base_url, &[&source.slug, &token.to_string()])
    }
}

/// Chapter tokens from links shaped like `.../{slug}/{token}[.html]`
fn tokens_from_index(body: &str, slug: &str) -> Vec<ChapterToken> {
    let mut tokens: Vec<ChapterToken> = Vec::new();
    for caps in HREF_RE.captures_iter(body) {
        let href = caps[1].trim_end_matches('/');
        let href = href
            .strip_suffix(".html")
            .or_else(|| href.strip_suffix(".htm"))
            .unwrap_or(href);

        let mut segments = href.rsplit('/');
        let (Some(last), Some(parent)) = (segments.next(), segments.next()) else {
            continue;
        };
        if !parent.eq_ignore_ascii_case(slug) {
            continue;
        }
        if let Some(token) = ChapterToken::parse(last) {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
    }
    tokens
}

#[async_trait]
impl SourceAdapter for PagedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Paged
    }

    async fn list_chapters(&self, _book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let url = self.index_url(source);
        let body = self.fetcher.get(&url, ContentType::Html).await?;

        let tokens = tokens_from_index(&body, &source.slug);
        if tokens.is_empty() {
            return Err(FetchError::structural(&url, "book index lists no chapter links"));
        }
        Ok(tokens)
    }

    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError> {
        let url = self.chapter_url(source, token);
        let number = map_token(book, token, &url)?;
        let body = self.fetcher.get(&url, ContentType::Html).await?;

        let heading = find_chapter_heading(&body)
            .ok_or_else(|| FetchError::structural(&url, "no chapter heading on page"))?;

        // A page titled for another chapter means the source redirected us
        if let Some(shown) = heading_token(&heading.title)
            .and_then(ChapterToken::parse)
            .and_then(|t| t.to_chapter_number(book.single_chapter))
        {
            if shown != number {
                return Err(FetchError::structural(
                    &url,
                    format!("page heading '{}' is not chapter {}", heading.title, number),
                ));
            }
        }

        let section = trim_trailer(&body[heading.end..]);
        Ok(parse_html_section(section, number, &self.headings))
    }
}

// ============================================================================
// TESTS
// ============================================================================
