// Verse Sync - Core Library
// Ingests a multi-book verse corpus from several sources into one
// workspace-scoped store. Exposes every module for the CLI and tests.

pub mod audit;          // Completeness auditor / differ
pub mod checkpoint;     // Resumable crawl state
pub mod config;
pub mod db;
pub mod deduplication;
pub mod entities;
pub mod headings;       // Heading → verse association
pub mod normalizer;
pub mod orchestrator;
pub mod placeholders;
pub mod reconciliation;
pub mod report;
pub mod retry;
pub mod sampling;       // Live sample audit
pub mod sources;

// Re-export commonly used types
pub use audit::{compare, CompareReport, IntegrityReport, Snapshot, SAMPLE_CAP};
pub use checkpoint::Checkpoint;
pub use config::{CrawlSettings, SamplingSettings, SourcesConfig, StoreConfig, SyncConfig};
pub use db::{setup_database, Store, StoreOptions, VerseRow};
pub use deduplication::{DedupStrategy, DeduplicationEngine};
pub use entities::{
    BookCatalog, BookRecord, BookSpec, ChapterContent, ChapterToken, Grouping, VerseRecord, Workspace,
    LETTERED_CHAPTER_BASE,
};
pub use headings::{extract_headings, HeadingSettings};
pub use normalizer::{normalize, normalize_key, normalize_verse};
pub use orchestrator::{CrawlOptions, Orchestrator};
pub use placeholders::{fill_placeholder, mark_gaps, PLACEHOLDER_PREFIX};
pub use reconciliation::{merge_book, merge_overlay, ReconciliationEngine, SyncStats, WriteMode};
pub use report::{BookState, RunReport, Warning, WarningKind};
pub use retry::{with_retry, RetryPolicy};
pub use sampling::{sample_audit, SampleAuditReport};
pub use sources::{
    export_csv, ContentType, FetchError, HttpFetcher, PageFetcher, SourceAdapter, SourceKind, SourceRef, SourceSet,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
