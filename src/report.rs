// 📋 Run Report - what a sync run did, written once at the end
//
// Logs scroll away; the report stays. Every warning the orchestrator logs
// also lands here, so a partially successful run can be audited later.

use crate::audit::{CompareReport, IntegrityReport};
use crate::entities::Workspace;
use crate::reconciliation::SyncStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

// ============================================================================
// PER-BOOK STATE
// ============================================================================

/// PLANNED → LISTING → (FETCHING_CHAPTER)* → DONE, or FAILED from any step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookState {
    Planned,
    Listing,
    FetchingChapter,
    Done,
    Failed,
}

impl BookState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookState::Done | BookState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookProgress {
    pub book: String,
    pub state: BookState,

    /// Why the book failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub chapters_listed: usize,
    pub chapters_synced: usize,
    pub chapters_skipped: usize,
    pub chapters_failed: usize,
}

impl BookProgress {
    pub fn new(book: &str) -> Self {
        BookProgress {
            book: book.to_string(),
            state: BookState::Planned,
            reason: None,
            chapters_listed: 0,
            chapters_synced: 0,
            chapters_skipped: 0,
            chapters_failed: 0,
        }
    }

    /// Move forward. Terminal states stay put.
    pub fn advance(&mut self, next: BookState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(book = %self.book, from = ?self.state, to = ?next, "book state");
        self.state = next;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = BookState::Failed;
        self.reason = Some(reason.into());
    }
}

// ============================================================================
// WARNINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Page missing its structural anchor
    Structural,

    /// Retries exhausted
    Transient,
    EmptyChapter,
    DuplicatesDropped,
    HeadingFallback,
    Store,

    /// Checkpoint file could not be written; the run continues
    Checkpoint,

    /// Book points at a source kind with no endpoint
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.book, self.chapter) {
            (Some(book), Some(ch)) => write!(f, "[{:?}] {} {}: {}", self.kind, book, ch, self.message),
            (Some(book), None) => write!(f, "[{:?}] {}: {}", self.kind, book, self.message),
            _ => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub books_processed: usize,
    pub chapters_processed: usize,

    /// Already completed according to the checkpoint
    pub chapters_skipped: usize,
    pub verses_processed: usize,
    pub heading_fallbacks: usize,
    pub duplicates_dropped: usize,

    #[serde(flatten)]
    pub sync: SyncStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSection {
    pub integrity: IntegrityReport,

    /// Present when a reference workspace is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<CompareReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workspace: Workspace,
    pub dry_run: bool,

    /// Stopped between chapters before the plan was finished
    pub interrupted: bool,
    pub books: Vec<BookProgress>,
    pub counts: RunCounts,
    pub warnings: Vec<Warning>,
    pub audit: Option<AuditSection>,
}

impl RunReport {
    pub fn new(workspace: &Workspace, dry_run: bool) -> Self {
        RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            workspace: workspace.clone(),
            dry_run,
            interrupted: false,
            books: Vec::new(),
            counts: RunCounts::default(),
            warnings: Vec::new(),
            audit: None,
        }
    }

    pub fn warn(&mut self, kind: WarningKind, book: Option<&str>, chapter: Option<u32>, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            book: book.map(|b| b.to_string()),
            chapter,
            message: message.into(),
        });
    }

    pub fn warnings_of(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }

    pub fn failed_books(&self) -> Vec<&BookProgress> {
        self.books.iter().filter(|b| b.state == BookState::Failed).collect()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        let c = &self.counts;
        format!(
            "{} books, {} chapters ({} skipped), {} verses: +{} ~{} -{} ({} unchanged, {} placeholders kept), {} warnings",
            c.books_processed,
            c.chapters_processed,
            c.chapters_skipped,
            c.verses_processed,
            c.sync.inserted(),
            c.sync.updated(),
            c.sync.deleted_stale(),
            c.sync.verses_unchanged,
            c.sync.placeholders_kept,
            self.warnings.len()
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
