// 🔍 Completeness Auditor - diff two verse sets at every granularity
//
// Both sides are reduced to the same key space:
//   book     kejadian
//   chapter  kejadian 3
//   verse    kejadian 3:15
//   heading  kejadian 3:15  (only verses carrying a heading)
//
// Book keys are diacritic/case/punctuation-insensitive, so "Kéjadian" in a
// CSV and "Kejadian" in the store line up. Counts are always exact; the
// sample lists are capped so a badly broken workspace still produces a
// readable report.

use crate::db::{Store, VerseRow};
use crate::entities::{BookSpec, ChapterContent, Grouping, Workspace};
use crate::normalizer::{normalize, normalize_key};
use crate::placeholders::is_placeholder;
use crate::sources::read_csv_rows;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

/// Maximum entries kept per discrepancy list
pub const SAMPLE_CAP: usize = 25;

// ============================================================================
// KEYS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChapterKey {
    pub book: String,
    pub chapter: u32,
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.book, self.chapter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerseKey {
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
}

impl VerseKey {
    pub fn of(row: &VerseRow) -> Self {
        VerseKey {
            book: row.name_key.clone(),
            chapter: row.chapter,
            verse: row.verse,
        }
    }

    pub fn chapter_key(&self) -> ChapterKey {
        ChapterKey {
            book: self.book.clone(),
            chapter: self.chapter,
        }
    }
}

impl fmt::Display for VerseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.book, self.chapter, self.verse)
    }
}

// ============================================================================
// CAPPED LISTS
// ============================================================================

/// Exact count plus at most SAMPLE_CAP examples
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CappedList<T> {
    pub count: usize,
    pub samples: Vec<T>,
}

impl<T> Default for CappedList<T> {
    fn default() -> Self {
        CappedList {
            count: 0,
            samples: Vec::new(),
        }
    }
}

impl<T> CappedList<T> {
    pub fn push(&mut self, item: T) {
        self.count += 1;
        if self.samples.len() < SAMPLE_CAP {
            self.samples.push(item);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T> FromIterator<T> for CappedList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut list = CappedList::default();
        for item in iter {
            list.push(item);
        }
        list
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDiff {
    /// In source, absent from target
    pub missing: CappedList<String>,

    /// In target, absent from source
    pub extra: CappedList<String>,
}

impl SetDiff {
    fn between<K: Ord + fmt::Display>(source: &BTreeSet<K>, target: &BTreeSet<K>) -> Self {
        SetDiff {
            missing: source.difference(target).map(|k| k.to_string()).collect(),
            extra: target.difference(source).map(|k| k.to_string()).collect(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingMismatch {
    pub key: String,
    pub source: String,
    pub target: String,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// A flat, labeled verse set that can come from anywhere
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub label: String,
    pub rows: Vec<VerseRow>,
}

impl Snapshot {
    pub fn new(label: &str, rows: Vec<VerseRow>) -> Self {
        Snapshot {
            label: label.to_string(),
            rows,
        }
    }

    pub fn from_store(store: &Store, workspace: &Workspace) -> Result<Self> {
        Ok(Snapshot::new(&format!("store:{}", workspace), store.load_rows(workspace)?))
    }

    /// Interchange CSV; unknown grouping tags fall back to `old`
    pub fn from_csv(path: &Path) -> Result<Self> {
        let rows = read_csv_rows(path)
            .with_context(|| format!("Failed to load snapshot from {}", path.display()))?
            .into_iter()
            .map(|r| VerseRow {
                name_key: normalize_key(&r.book_name),
                book_name: r.book_name,
                grouping: Grouping::parse(&r.grouping).unwrap_or(Grouping::Old),
                order_index: r.order_index,
                chapter: r.chapter,
                verse: r.verse,
                text: r.text,
                heading: r.pericope.filter(|p| !p.trim().is_empty()),
            })
            .collect();
        Ok(Snapshot::new(&format!("csv:{}", path.display()), rows))
    }

    /// Freshly fetched chapters of one book
    pub fn from_chapters(label: &str, book: &BookSpec, chapters: &[ChapterContent]) -> Self {
        let rows = chapters
            .iter()
            .flat_map(|c| {
                c.verses.iter().map(move |v| VerseRow {
                    book_name: book.name.clone(),
                    name_key: book.key(),
                    grouping: book.grouping,
                    order_index: book.order_index,
                    chapter: c.number,
                    verse: v.number,
                    text: v.text.clone(),
                    heading: v.heading.clone(),
                })
            })
            .collect();
        Snapshot::new(label, rows)
    }

    pub fn extend(&mut self, other: Snapshot) {
        self.rows.extend(other.rows);
    }

    /// Keep only rows of the given book keys
    pub fn restrict_to(&self, book_keys: &HashSet<String>) -> Snapshot {
        Snapshot {
            label: self.label.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| book_keys.contains(&r.name_key))
                .cloned()
                .collect(),
        }
    }

    /// Keep only the given chapters
    pub fn restrict_to_chapters(&self, chapters: &BTreeSet<ChapterKey>) -> Snapshot {
        Snapshot {
            label: self.label.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| chapters.contains(&VerseKey::of(r).chapter_key()))
                .cloned()
                .collect(),
        }
    }

    pub fn book_keys(&self) -> BTreeSet<String> {
        self.rows.iter().map(|r| r.name_key.clone()).collect()
    }

    pub fn chapter_keys(&self) -> BTreeSet<ChapterKey> {
        self.rows.iter().map(|r| VerseKey::of(r).chapter_key()).collect()
    }

    pub fn verse_keys(&self) -> BTreeSet<VerseKey> {
        self.rows.iter().map(VerseKey::of).collect()
    }

    /// Heading-start keys with their titles (first row wins on duplicates)
    pub fn headings(&self) -> BTreeMap<VerseKey, String> {
        let mut headings = BTreeMap::new();
        for row in &self.rows {
            if let Some(title) = &row.heading {
                headings.entry(VerseKey::of(row)).or_insert_with(|| title.clone());
            }
        }
        headings
    }

    /// SHA-256 over sorted keys, texts and headings
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<(VerseKey, &str, &str)> = self
            .rows
            .iter()
            .map(|r| (VerseKey::of(r), r.text.as_str(), r.heading.as_deref().unwrap_or("")))
            .collect();
        entries.sort();

        let mut hasher = Sha256::new();
        for (key, text, heading) in entries {
            hasher.update(key.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(text.as_bytes());
            hasher.update([0u8]);
            hasher.update(heading.as_bytes());
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// INTEGRITY
// ============================================================================

/// Single-side scan: duplicate keys, placeholder filler, empty text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub rows: usize,

    /// Keys held by more than one row ("key ×n")
    pub duplicates: CappedList<String>,
    pub placeholders: CappedList<String>,
    pub empty_text: CappedList<String>,
}

impl IntegrityReport {
    pub fn scan(rows: &[VerseRow]) -> Self {
        let mut counts: BTreeMap<VerseKey, usize> = BTreeMap::new();
        let mut report = IntegrityReport {
            rows: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let key = VerseKey::of(row);
            if is_placeholder(&row.text) {
                report.placeholders.push(key.to_string());
            } else if row.text.trim().is_empty() {
                report.empty_text.push(key.to_string());
            }
            *counts.entry(key).or_insert(0) += 1;
        }

        report.duplicates = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(key, n)| format!("{} ×{}", key, n))
            .collect();
        report
    }

    /// Placeholders are expected; duplicates and empty rows are not
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.empty_text.is_empty()
    }
}

// ============================================================================
// COMPARE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareReport {
    pub source_label: String,
    pub target_label: String,
    pub source_fingerprint: String,
    pub target_fingerprint: String,
    pub books: SetDiff,
    pub chapters: SetDiff,
    pub verses: SetDiff,
    pub headings: SetDiff,
    pub heading_mismatches: CappedList<HeadingMismatch>,
    pub target_integrity: IntegrityReport,
}

impl CompareReport {
    pub fn is_clean(&self) -> bool {
        self.books.is_clean()
            && self.chapters.is_clean()
            && self.verses.is_clean()
            && self.headings.is_clean()
            && self.heading_mismatches.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} vs {}: books -{} +{}, chapters -{} +{}, verses -{} +{}, headings -{} +{} ~{}",
            self.source_label,
            self.target_label,
            self.books.missing.count,
            self.books.extra.count,
            self.chapters.missing.count,
            self.chapters.extra.count,
            self.verses.missing.count,
            self.verses.extra.count,
            self.headings.missing.count,
            self.headings.extra.count,
            self.heading_mismatches.count
        )
    }
}

/// Compare: what the target lacks, what it has extra, and where heading
/// titles disagree under the same key
pub fn compare(source: &Snapshot, target: &Snapshot) -> CompareReport {
    let source_headings = source.headings();
    let target_headings = target.headings();

    let heading_mismatches = source_headings
        .iter()
        .filter_map(|(key, title)| {
            let other = target_headings.get(key)?;
            // Case and punctuation count as a difference; markup and spacing do not
            (normalize(title) != normalize(other)).then(|| HeadingMismatch {
                key: key.to_string(),
                source: title.clone(),
                target: other.clone(),
            })
        })
        .collect();

    let source_heading_keys: BTreeSet<VerseKey> = source_headings.keys().cloned().collect();
    let target_heading_keys: BTreeSet<VerseKey> = target_headings.keys().cloned().collect();

    CompareReport {
        source_label: source.label.clone(),
        target_label: target.label.clone(),
        source_fingerprint: source.fingerprint(),
        target_fingerprint: target.fingerprint(),
        books: SetDiff::between(&source.book_keys(), &target.book_keys()),
        chapters: SetDiff::between(&source.chapter_keys(), &target.chapter_keys()),
        verses: SetDiff::between(&source.verse_keys(), &target.verse_keys()),
        headings: SetDiff::between(&source_heading_keys, &target_heading_keys),
        heading_mismatches,
        target_integrity: IntegrityReport::scan(&target.rows),
    }
}

// ============================================================================
// TESTS
// ============================================================================
