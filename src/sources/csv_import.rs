// 📑 CSV Interchange - curated verse files in and out
//
// Format (header row required):
//   book_name,grouping,order_index,chapter,verse,text,pericope
//
// `chapter` is the STORED chapter number (lettered supplements already
// mapped above 100). `pericope` is the heading, empty for most rows.
// Curated files accumulate manual fixes, so duplicate keys keep the
// longest text rather than the first.

use super::{map_token, FetchError, SourceAdapter, SourceKind, SourceRef};
use crate::db::{Store, VerseRow};
use crate::deduplication::{DedupStrategy, DeduplicationEngine};
use crate::entities::{BookSpec, ChapterContent, ChapterToken, VerseRecord, Workspace};
use crate::normalizer::{normalize, normalize_key};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvVerseRow {
    pub book_name: String,
    pub grouping: String,
    pub order_index: u32,
    pub chapter: u32,
    pub verse: u32,
    pub text: String,
    pub pericope: Option<String>,
}

impl CsvVerseRow {
    pub fn from_verse_row(row: &VerseRow) -> Self {
        CsvVerseRow {
            book_name: row.book_name.clone(),
            grouping: row.grouping.as_str().to_string(),
            order_index: row.order_index,
            chapter: row.chapter,
            verse: row.verse,
            text: row.text.clone(),
            pericope: row.heading.clone(),
        }
    }
}

// ============================================================================
// READ / WRITE
// ============================================================================

pub fn read_csv_rows(path: &Path) -> Result<Vec<CsvVerseRow>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open CSV: {}", path.display()))?;

    let mut rows = Vec::new();
    for (i, result) in reader.deserialize().enumerate() {
        let row: CsvVerseRow =
            result.with_context(|| format!("Failed to parse CSV row {} in {}", i + 2, path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn write_csv_rows(path: &Path, rows: &[CsvVerseRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create CSV: {}", path.display()))?;
    for row in rows {
        writer.serialize(row).context("Failed to write CSV row")?;
    }
    writer.flush().context("Failed to flush CSV")?;
    Ok(())
}

/// Write a whole workspace in interchange format, canonical order.
/// Returns the number of rows written.
pub fn export_csv(store: &Store, workspace: &Workspace, path: &Path) -> Result<usize> {
    let rows: Vec<CsvVerseRow> = store
        .load_rows(workspace)?
        .iter()
        .map(CsvVerseRow::from_verse_row)
        .collect();
    write_csv_rows(path, &rows)?;
    Ok(rows.len())
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct CsvImportAdapter {
    path: PathBuf,
    rows: Mutex<Option<Arc<Vec<CsvVerseRow>>>>,
}

impl CsvImportAdapter {
    pub fn new(path: &Path) -> Self {
        CsvImportAdapter {
            path: path.to_path_buf(),
            rows: Mutex::new(None),
        }
    }

    fn rows(&self) -> Result<Arc<Vec<CsvVerseRow>>, FetchError> {
        let mut cached = self.rows.lock().map_err(|_| FetchError::Network {
            url: self.path.display().to_string(),
            message: "CSV cache poisoned".to_string(),
        })?;

        if let Some(rows) = cached.as_ref() {
            return Ok(rows.clone());
        }

        let rows = read_csv_rows(&self.path)
            .map_err(|e| FetchError::structural(&self.path.display().to_string(), format!("{:#}", e)))?;
        let rows = Arc::new(rows);
        *cached = Some(rows.clone());
        Ok(rows)
    }

    fn book_rows(&self, source: &SourceRef) -> Result<Vec<CsvVerseRow>, FetchError> {
        let key = normalize_key(&source.slug);
        Ok(self
            .rows()?
            .iter()
            .filter(|r| normalize_key(&r.book_name) == key)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for CsvImportAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::CsvImport
    }

    async fn list_chapters(&self, _book: &BookSpec, source: &SourceRef) -> Result<Vec<ChapterToken>, FetchError> {
        let mut chapters: Vec<u32> = self.book_rows(source)?.iter().map(|r| r.chapter).collect();
        chapters.sort_unstable();
        chapters.dedup();

        if chapters.is_empty() {
            return Err(FetchError::structural(
                &self.path.display().to_string(),
                format!("no rows for book '{}'", source.slug),
            ));
        }
        Ok(chapters.into_iter().map(ChapterToken::Number).collect())
    }

    async fn fetch_chapter(
        &self,
        book: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> Result<ChapterContent, FetchError> {
        let location = self.path.display().to_string();
        let number = map_token(book, token, &location)?;
        let wanted = match token {
            ChapterToken::Number(n) => *n,
            ChapterToken::Letter(_) => number,
        };

        let verses: Vec<VerseRecord> = self
            .book_rows(source)?
            .into_iter()
            .filter(|r| r.chapter == wanted)
            .filter_map(|r| {
                let text = normalize(&r.text);
                if text.is_empty() {
                    return None;
                }
                let mut verse = VerseRecord::new(r.verse, &text);
                verse.heading = r.pericope.as_deref().map(normalize).filter(|h| !h.is_empty());
                Some(verse)
            })
            .collect();

        let outcome = DeduplicationEngine::new(DedupStrategy::KeepLongest).dedupe_verses(verses);
        let mut chapter = ChapterContent::new(number, outcome.verses);
        chapter.duplicates_dropped = outcome.dropped.len();
        Ok(chapter)
    }
}

// ============================================================================
// TESTS
// ============================================================================
