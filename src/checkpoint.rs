// 📍 Checkpoint - which chapters are durably synced
//
// Written after every chapter, read once at startup. On restart any chapter
// listed here is skipped, so a crash, a Ctrl-C or a deliberately partial run
// all resume from the same place.
//
// File shape:
//   { "version": 1, "updatedAt": "...", "workspace": {...},
//     "books": { "kejadian": { "completedChapters": [1, 2], "totalChapters": 50 } },
//     "stats": {...} }
//
// The file is replaced wholesale (write temp, fsync, rename) so a crash mid
// write leaves the previous checkpoint intact.

use crate::entities::Workspace;
use crate::reconciliation::SyncStats;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookCheckpoint {
    /// Sorted, unique
    pub completed_chapters: Vec<u32>,
    pub total_chapters: u32,
}

impl BookCheckpoint {
    pub fn is_done(&self) -> bool {
        self.total_chapters > 0 && self.completed_chapters.len() >= self.total_chapters as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub workspace: Workspace,
    pub books: BTreeMap<String, BookCheckpoint>,
    #[serde(default)]
    pub stats: SyncStats,
}

impl Checkpoint {
    pub fn new(workspace: &Workspace) -> Self {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            updated_at: Utc::now(),
            workspace: workspace.clone(),
            books: BTreeMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let mut checkpoint: Checkpoint =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            bail!(
                "Checkpoint {} has version {}, expected {}",
                path.display(),
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }

        // Hand-edited files may be unsorted; lookups binary-search
        for book in checkpoint.books.values_mut() {
            book.completed_chapters.sort_unstable();
            book.completed_chapters.dedup();
        }
        Ok(checkpoint)
    }

    /// Resume from `path` if it exists. A checkpoint for another workspace
    /// is an error unless `reset` is set, in which case it is discarded.
    pub fn load_or_new(path: &Path, workspace: &Workspace, reset: bool) -> Result<Self> {
        if reset || !path.exists() {
            if reset && path.exists() {
                info!(path = %path.display(), "discarding previous checkpoint");
            }
            return Ok(Checkpoint::new(workspace));
        }

        let checkpoint = Checkpoint::load(path)?;
        if &checkpoint.workspace != workspace {
            bail!(
                "Checkpoint {} belongs to workspace {}, not {} (use --reset to start over)",
                path.display(),
                checkpoint.workspace,
                workspace
            );
        }

        let chapters: usize = checkpoint.books.values().map(|b| b.completed_chapters.len()).sum();
        info!(books = checkpoint.books.len(), chapters, "resuming from checkpoint");
        Ok(checkpoint)
    }

    pub fn is_completed(&self, book_key: &str, chapter: u32) -> bool {
        self.books
            .get(book_key)
            .map(|b| b.completed_chapters.binary_search(&chapter).is_ok())
            .unwrap_or(false)
    }

    pub fn mark_completed(&mut self, book_key: &str, chapter: u32) {
        let book = self.books.entry(book_key.to_string()).or_default();
        if let Err(pos) = book.completed_chapters.binary_search(&chapter) {
            book.completed_chapters.insert(pos, chapter);
        }
        self.updated_at = Utc::now();
    }

    pub fn set_total(&mut self, book_key: &str, total: u32) {
        self.books.entry(book_key.to_string()).or_default().total_chapters = total;
    }

    pub fn completed(&self, book_key: &str) -> &[u32] {
        self.books
            .get(book_key)
            .map(|b| b.completed_chapters.as_slice())
            .unwrap_or(&[])
    }

    pub fn record_stats(&mut self, stats: &SyncStats) {
        self.stats.merge(stats);
    }

    /// Atomic replace: temp file, fsync, rename
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize checkpoint")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all().context("Failed to flush checkpoint")?;
        }
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace checkpoint {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
