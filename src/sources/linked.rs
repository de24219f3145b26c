// 🔗 Linked Adapter - walk "next" links from a book's first page
//
// The source has no index; the only way to discover chapters is to follow
// rel="next" from chapter to chapter. The walk stops when:
// - the next link leaves the book's URL prefix (scope guard: the last
//   chapter of Genesis links to Exodus 1)
// - there is no next link
// - a page repeats (cycle)
//
// Pages seen while listing are cached, so fetching a chapter right after
// the walk costs no extra request. The cache lives until the orchestrator
// skips the chapter or releases the book.

use super::markup::{find_chapter_heading, heading_token, parse_html_section, trim_trailer};
use super::{join_url, map_token, ContentType, FetchError, PageFetcher, SourceAdapter, SourceKind, SourceRef};
use crate::entities::{BookSpec, ChapterContent, ChapterToken};
use crate::headings::HeadingSettings;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

static REL_NEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<(?:a|link)\b[^>]*\brel\s*=\s*["']?next\b[^>]*>"#).unwrap());
static CLASS_NEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<a\b[^>]*\bclass\s*=\s*["'][^"']*\bnext\b[^"']*["'][^>]*>"#).unwrap());
static HREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).unwrap());

/// Hard stop for runaway walks (no book has this many chapters)
pub const MAX_PAGES_PER_BOOK: usize = 500;

struct CachedPage {
    url: String,
    body: Option<String>,
}

pub struct LinkedAdapter {
    base_url: String,
    fetcher: Arc<dyn PageFetcher>,
    headings: HeadingSettings,
    pages: Mutex<HashMap<(String, ChapterToken), CachedPage>>,
}

impl LinkedAdapter {
    pub fn new(base_url: &str, fetcher: Arc<dyn PageFetcher>, headings: HeadingSettings) -> Self {
        LinkedAdapter {
            base_url: base_url.to_string(),
            fetcher,
            headings,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// First page of the book; also the scope prefix for the walk
    pub fn start_url(&self, source: &SourceRef) -> String {
        join_url(&self.base_url, &[&source.slug])
    }

    fn cache_put(&self, slug: &str, token: &ChapterToken, url: &str, body: Option<String>) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(
                (slug.to_string(), token.clone()),
                CachedPage {
                    url: url.to_string(),
                    body,
                },
            );
        }
    }

    /// Cached (url, body) for a chapter; the body is handed out once
    fn cache_take(&self, slug: &str, token: &ChapterToken) -> Option<(String, Option<String>)> {
        let mut pages = self.pages.lock().ok()?;
        let page = pages.get_mut(&(slug.to_string(), token.clone()))?;
        Some((page.url.clone(), page.body.take()))
    }

    /// Cached chapter entries, bodies or not
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn walk(&self, book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let prefix = self.start_url(source);
        let mut url = prefix.clone();
        let mut visited: HashSet<String> = HashSet::new();
        let mut tokens: Vec<ChapterToken> = Vec::new();

        loop {
            if !visited.insert(url.clone()) {
                debug!(url = %url, "next-link cycle, stopping walk");
                break;
            }
            if visited.len() > MAX_PAGES_PER_BOOK {
                warn!(book = %book.name, "next-link walk exceeded {} pages", MAX_PAGES_PER_BOOK);
                break;
            }

            let body = self.fetcher.get(&url, ContentType::Html).await?;
            let token = page_token(book, &body, &url)?;
            let next = next_link(&body, &url);

            self.cache_put(&source.slug, &token, &url, Some(body));
            if !tokens.contains(&token) {
                tokens.push(token);
            }

            match next {
                Some(n) if in_scope(&n, &prefix) => url = n,
                Some(n) => {
                    debug!(book = %book.name, next = %n, "next link left book scope");
                    break;
                }
                None => break,
            }
        }

        Ok(tokens)
    }
}

/// Chapter label from the page's <h1>. Single-chapter books often print
/// the bare book name, which maps to chapter 1.
fn page_token(book: &BookSpec, body: &str, url: &str) -> Result<ChapterToken, FetchError> {
    let heading = find_chapter_heading(body).ok_or_else(|| FetchError::structural(url, "no chapter heading on page"))?;

    match heading_token(&heading.title).and_then(ChapterToken::parse) {
        Some(token) => Ok(token),
        None if book.single_chapter => Ok(ChapterToken::Number(1)),
        None => Err(FetchError::structural(
            url,
            format!("cannot read chapter label from heading '{}'", heading.title),
        )),
    }
}

/// Absolute URL of the page's "next" link, if any
pub fn next_link(body: &str, current: &str) -> Option<String> {
    let tag = REL_NEXT_RE.find(body).or_else(|| CLASS_NEXT_RE.find(body))?;
    let href = HREF_RE.captures(tag.as_str())?.get(1)?.as_str().to_string();

    let base = Url::parse(current).ok()?;
    let mut resolved = base.join(&href).ok()?;
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Scope guard: the URL must be the prefix itself or below it
pub fn in_scope(url: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match url.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

#[async_trait]
impl SourceAdapter for LinkedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Linked
    }

    async fn list_chapters(&self, book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let tokens = self.walk(book, source).await?;
        if tokens.is_empty() {
            return Err(FetchError::structural(&self.start_url(source), "walk found no chapters"));
        }
        Ok(tokens)
    }

    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError> {
        let cached = match self.cache_take(&source.slug, token) {
            Some(hit) => Some(hit),
            None => {
                self.walk(book, source).await?;
                self.cache_take(&source.slug, token)
            }
        };

        let Some((url, body)) = cached else {
            return Err(FetchError::structural(
                &self.start_url(source),
                format!("chapter {} not reachable by next links", token),
            ));
        };

        let number = map_token(book, token, &url)?;
        let body = match body {
            Some(b) => b,
            None => self.fetcher.get(&url, ContentType::Html).await?,
        };

        let heading = find_chapter_heading(&body).ok_or_else(|| FetchError::structural(&url, "no chapter heading on page"))?;
        let section = trim_trailer(&body[heading.end..]);
        Ok(parse_html_section(section, number, &self.headings))
    }

    fn skip_chapter(&self, source: &SourceRef, token: &ChapterToken) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(&(source.slug.clone(), token.clone()));
        }
    }

    fn release_book(&self, source: &SourceRef) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.retain(|(slug, _), _| slug != &source.slug);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Grouping;
    use crate::sources::StaticFetcher;

    fn book() -> BookSpec {
        BookSpec {
            name: "Yunus".to_string(),
            abbreviation: "Yun".to_string(),
            grouping: Grouping::Old,
            order_index: 32,
            chapter_count: 2,
            single_chapter: false,
            aliases: vec![],
            source: SourceRef::new(SourceKind::Linked, "yun"),
            overlay: None,
            audit_source: None,
        }
    }

    fn fetcher() -> Arc<StaticFetcher> {
        Arc::new(
            StaticFetcher::new()
                .with_page(
                    "https://linked.test/tb/yun",
                    r#"<h1>Yunus 1</h1><a name="v1"></a>Now the word came.<nav><a rel="next" href="/tb/yun/2">Next</a></nav>"#,
                )
                .with_page(
                    "https://linked.test/tb/yun/2",
                    r#"<h1>Yunus 2</h1><a name="v1"></a>Then Jonah prayed.<nav><a class="btn next" href="../mi">Mikha</a></nav>"#,
                )
                .with_page("https://linked.test/tb/mi", "<h1>Mikha 1</h1>"),
        )
    }

    #[test]
    fn test_scope_guard() {
        assert!(in_scope("https://linked.test/tb/yun/2", "https://linked.test/tb/yun"));
        assert!(in_scope("https://linked.test/tb/yun", "https://linked.test/tb/yun/"));
        assert!(!in_scope("https://linked.test/tb/yunus-2", "https://linked.test/tb/yun"));
        assert!(!in_scope("https://linked.test/tb/mi", "https://linked.test/tb/yun"));
    }

    #[test]
    fn test_next_link_resolution() {
        let body = r#"<link rel="next" href="3#top">"#;
        assert_eq!(
            next_link(body, "https://linked.test/tb/yun/2"),
            Some("https://linked.test/tb/yun/3".to_string())
        );
        assert_eq!(next_link("<p>end</p>", "https://linked.test/tb/yun/2"), None);
    }

    #[tokio::test]
    async fn test_walk_stops_at_scope_and_uses_cache() {
        let pages = fetcher();
        let adapter = LinkedAdapter::new("https://linked.test/tb", pages.clone(), HeadingSettings::default());
        let b = book();

        let tokens = adapter.list_chapters(&b, &b.source).await.unwrap();
        assert_eq!(tokens, vec![ChapterToken::Number(1), ChapterToken::Number(2)]);
        assert_eq!(pages.hits("https://linked.test/tb/mi"), 0);

        let chapter = adapter.fetch_chapter(&b, &b.source, &ChapterToken::Number(2)).await.unwrap();
        assert_eq!(chapter.verses[0].text, "Then Jonah prayed.");
        assert_eq!(pages.hits("https://linked.test/tb/yun/2"), 1);
        println!("✅ Linked walk + cache PASSED");
    }

    #[tokio::test]
    async fn test_fetch_without_listing_walks_first() {
        let pages = fetcher();
        let adapter = LinkedAdapter::new("https://linked.test/tb", pages.clone(), HeadingSettings::default());
        let b = book();

        let chapter = adapter.fetch_chapter(&b, &b.source, &ChapterToken::Number(1)).await.unwrap();
        assert_eq!(chapter.verses[0].text, "Now the word came.");

        // Body was handed out; a second fetch goes back to the network
        adapter.fetch_chapter(&b, &b.source, &ChapterToken::Number(1)).await.unwrap();
        assert_eq!(pages.hits("https://linked.test/tb/yun"), 2);

        let missing = adapter.fetch_chapter(&b, &b.source, &ChapterToken::Number(7)).await.unwrap_err();
        assert!(!missing.is_transient());
    }

    #[tokio::test]
    async fn test_skip_and_release_empty_the_cache() {
        let pages = fetcher();
        let adapter = LinkedAdapter::new("https://linked.test/tb", pages.clone(), HeadingSettings::default());
        let b = book();

        adapter.list_chapters(&b, &b.source).await.unwrap();
        assert_eq!(adapter.cached_pages(), 2);

        // Chapter 1 already done: its body must not linger
        adapter.skip_chapter(&b.source, &ChapterToken::Number(1));
        assert_eq!(adapter.cached_pages(), 1);

        adapter.fetch_chapter(&b, &b.source, &ChapterToken::Number(2)).await.unwrap();
        adapter.release_book(&b.source);
        assert_eq!(adapter.cached_pages(), 0);
    }
}
