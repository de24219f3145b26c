// ⚙️ Configuration - one JSON file per workspace, env overrides on top
//
// Precedence (last wins): built-in defaults → config file → VERSE_SYNC_* env
// vars → CLI flags (applied by main.rs).

use crate::db::StoreOptions;
use crate::entities::{BookCatalog, BookSpec, Workspace};
use crate::headings::HeadingSettings;
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

// ============================================================================
// SOURCES
// ============================================================================

/// Endpoint per source kind. A kind without an endpoint has no adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub paged: Option<String>,
    pub linked: Option<String>,
    pub anchored: Option<String>,
    pub markdown: Option<String>,
    pub csv_path: Option<PathBuf>,
}

// ============================================================================
// CRAWL TUNING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Minimum gap between two outgoing requests
    pub request_delay_ms: u64,

    /// Verses per write transaction
    pub batch_size: usize,
    pub user_agent: String,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        CrawlSettings {
            concurrency: 4,
            timeout_ms: 25_000,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            request_delay_ms: 250,
            batch_size: 200,
            user_agent: format!("verse-sync/{}", crate::VERSION),
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

impl CrawlSettings {
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply VERSE_SYNC_* overrides from any lookup (the process env in production)
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = parse_override("VERSE_SYNC_CONCURRENCY", lookup("VERSE_SYNC_CONCURRENCY")) {
            self.concurrency = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_TIMEOUT_MS", lookup("VERSE_SYNC_TIMEOUT_MS")) {
            self.timeout_ms = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_MAX_ATTEMPTS", lookup("VERSE_SYNC_MAX_ATTEMPTS")) {
            self.max_attempts = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_BASE_DELAY_MS", lookup("VERSE_SYNC_BASE_DELAY_MS")) {
            self.base_delay_ms = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_MAX_DELAY_MS", lookup("VERSE_SYNC_MAX_DELAY_MS")) {
            self.max_delay_ms = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_REQUEST_DELAY_MS", lookup("VERSE_SYNC_REQUEST_DELAY_MS")) {
            self.request_delay_ms = v;
        }
        if let Some(v) = parse_override("VERSE_SYNC_BATCH_SIZE", lookup("VERSE_SYNC_BATCH_SIZE")) {
            self.batch_size = v;
        }
        if let Some(agent) = lookup("VERSE_SYNC_USER_AGENT").filter(|a| !a.trim().is_empty()) {
            self.user_agent = agent.trim().to_string();
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: self.timeout_ms,
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms.max(self.base_delay_ms),
        }
    }
}

// ============================================================================
// SAMPLING + STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Books drawn per live sample audit
    pub books: usize,
    pub seed: u64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings { books: 3, seed: 42 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,

    /// Mirror text/heading into legacy content/pericope columns
    pub legacy_columns: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("verse-sync.db"),
            legacy_columns: false,
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            legacy_columns: self.legacy_columns,
        }
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub workspace: Workspace,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    pub books: Vec<BookSpec>,

    #[serde(default)]
    pub crawl: CrawlSettings,

    #[serde(default)]
    pub headings: HeadingSettings,

    #[serde(default)]
    pub sampling: SamplingSettings,

    /// Workspace the end-of-run audit compares against
    #[serde(default)]
    pub reference: Option<Workspace>,
}

impl SyncConfig {
    /// Load from JSON and apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config = SyncConfig::from_json(&raw).with_context(|| format!("Invalid config: {}", path.display()))?;
        config.crawl.apply_env();
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(raw).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workspace.language.is_empty() || self.workspace.edition.is_empty() {
            bail!("Workspace needs both a language and an edition");
        }
        if self.reference.as_ref() == Some(&self.workspace) {
            bail!("Reference workspace must differ from the workspace being synced");
        }
        Ok(())
    }

    pub fn catalog(&self) -> Result<BookCatalog> {
        BookCatalog::new(self.books.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use std::collections::HashMap;

    const CONFIG: &str = r#"{
        "workspace": { "language": "id", "edition": "tb" },
        "sources": { "paged": "https://paged.test/tb", "markdown": "https://md.test/tb" },
        "books": [
            { "name": "Kejadian", "abbreviation": "Kej", "grouping": "old", "order_index": 1,
              "chapter_count": 50, "source": { "kind": "paged", "slug": "kej" } },
            { "name": "Ester", "abbreviation": "Est", "grouping": "old", "order_index": 17,
              "source": { "kind": "paged", "slug": "est" },
              "overlay": { "kind": "anchored", "slug": "ester-tambahan" } }
        ],
        "crawl": { "concurrency": 2 },
        "reference": { "language": "id", "edition": "tl" }
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = SyncConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.crawl.concurrency, 2);
        assert_eq!(config.crawl.timeout_ms, 25_000);
        assert_eq!(config.crawl.batch_size, 200);
        assert!(config.crawl.user_agent.starts_with("verse-sync/"));
        assert_eq!(config.headings, HeadingSettings::default());
        assert_eq!(config.store.path, PathBuf::from("verse-sync.db"));

        let catalog = config.catalog().unwrap();
        let ester = catalog.find("Est").unwrap();
        assert_eq!(ester.overlay.as_ref().map(|o| o.kind), Some(SourceKind::Anchored));
        assert!(config.sources.linked.is_none());
    }

    #[test]
    fn test_reference_must_differ() {
        let bad = CONFIG.replace(r#""edition": "tl""#, r#""edition": "tb""#);
        assert!(SyncConfig::from_json(&bad).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VERSE_SYNC_CONCURRENCY", "8"),
            ("VERSE_SYNC_TIMEOUT_MS", "not-a-number"),
            ("VERSE_SYNC_USER_AGENT", "mirror-bot/2"),
        ]
        .into_iter()
        .collect();

        let mut crawl = CrawlSettings::default();
        crawl.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(crawl.concurrency, 8);
        assert_eq!(crawl.timeout_ms, 25_000);
        assert_eq!(crawl.user_agent, "mirror-bot/2");
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let crawl = CrawlSettings {
            max_attempts: 0,
            base_delay_ms: 100,
            max_delay_ms: 50,
            ..Default::default()
        };
        let policy = crawl.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay_ms, 100);
    }
}
