// 📚 Book Entity - catalog entries + stored rows
//
// "The name is a VALUE (can drift between sources), the legacy id is IDENTITY
// (assigned once, never changes)."
//
// Problem solved:
// - "Kejadian", "kejadian", "Kéjadian" → same book key
// - Renaming a book in the catalog doesn't orphan its stored chapters
//   (aliases are checked before a new row is created)

use crate::normalizer::normalize_key;
use crate::sources::SourceRef;
use crate::entities::verse::Workspace;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// GROUPING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// Old Testament / Hebrew scriptures
    Old,

    /// New Testament
    New,

    /// Deuterocanonical books
    Deutero,
}

impl Grouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Old => "old",
            Grouping::New => "new",
            Grouping::Deutero => "deutero",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "old" | "ot" | "pl" => Some(Grouping::Old),
            "new" | "nt" | "pb" => Some(Grouping::New),
            "deutero" | "dk" | "deuterocanonical" => Some(Grouping::Deutero),
            _ => None,
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// BOOK SPEC (static catalog entry)
// ============================================================================

/// One book as the catalog describes it: what it is called, where it sits in
/// reading order, and which source(s) supply its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSpec {
    pub name: String,
    pub abbreviation: String,
    pub grouping: Grouping,
    pub order_index: u32,

    /// Normal chapter count (excluding lettered supplements). 0 = unknown.
    #[serde(default)]
    pub chapter_count: u32,

    /// Book has exactly one chapter; sources may label it "0"
    #[serde(default)]
    pub single_chapter: bool,

    /// Earlier or alternative names that refer to the same stored book
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Primary source
    pub source: SourceRef,

    /// Supplementary source woven into specific chapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<SourceRef>,

    /// Independent source used by the live sampling audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_source: Option<SourceRef>,
}

impl BookSpec {
    pub fn new(name: &str, abbreviation: &str, grouping: Grouping, order_index: u32, source: SourceRef) -> Self {
        BookSpec {
            name: name.to_string(),
            abbreviation: abbreviation.to_string(),
            grouping,
            order_index,
            chapter_count: 0,
            single_chapter: false,
            aliases: Vec::new(),
            source,
            overlay: None,
            audit_source: None,
        }
    }

    /// Builder pattern: add a supplementary overlay source
    pub fn with_overlay(mut self, overlay: SourceRef) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Builder pattern: mark as a one-chapter book
    pub fn with_single_chapter(mut self) -> Self {
        self.single_chapter = true;
        self.chapter_count = 1;
        self
    }

    /// Normalized book key (diacritic/case/punctuation-insensitive)
    pub fn key(&self) -> String {
        normalize_key(&self.name)
    }

    /// Keys for the name and every alias
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys = vec![self.key()];
        for alias in &self.aliases {
            let k = normalize_key(alias);
            if !k.is_empty() && !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }

    /// Check if a string names this book (name, abbreviation or alias)
    pub fn matches(&self, name: &str) -> bool {
        let wanted = normalize_key(name);
        if wanted.is_empty() {
            return false;
        }
        wanted == normalize_key(&self.abbreviation) || self.all_keys().contains(&wanted)
    }
}

// ============================================================================
// BOOK RECORD (stored row)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: i64,
    pub workspace: Workspace,
    pub name: String,
    pub name_key: String,
    pub abbreviation: String,
    pub grouping: Grouping,
    pub order_index: u32,

    /// Stable secondary identifier - set once, never changed
    pub legacy_id: Option<i64>,

    /// Cached count of stored chapters
    pub chapter_count: u32,
}

impl BookRecord {
    /// Descriptive fields that differ from the catalog entry
    pub fn drift_from(&self, spec: &BookSpec) -> Vec<&'static str> {
        let mut drifted = Vec::new();
        if self.name != spec.name {
            drifted.push("name");
        }
        if self.abbreviation != spec.abbreviation {
            drifted.push("abbreviation");
        }
        if self.grouping != spec.grouping {
            drifted.push("grouping");
        }
        if self.order_index != spec.order_index {
            drifted.push("order_index");
        }
        drifted
    }
}

// ============================================================================
// BOOK CATALOG
// ============================================================================

/// Ordered set of book specs for one workspace
#[derive(Debug, Clone, Default)]
pub struct BookCatalog {
    books: Vec<BookSpec>,
}

impl BookCatalog {
    /// Build a catalog, sorted by order index. Rejects duplicate order
    /// indexes and duplicate name keys.
    pub fn new(mut books: Vec<BookSpec>) -> Result<Self> {
        books.sort_by_key(|b| b.order_index);

        let mut orders = HashSet::new();
        let mut keys = HashSet::new();
        for book in &books {
            if book.key().is_empty() {
                bail!("Book with order index {} has an empty name", book.order_index);
            }
            if !orders.insert(book.order_index) {
                bail!("Duplicate order index {} in catalog ({})", book.order_index, book.name);
            }
            if !keys.insert(book.key()) {
                bail!("Duplicate book name in catalog: {}", book.name);
            }
        }

        Ok(BookCatalog { books })
    }

    pub fn books(&self) -> &[BookSpec] {
        &self.books
    }

    pub fn count(&self) -> usize {
        self.books.len()
    }

    /// Find a book by name, abbreviation or alias
    pub fn find(&self, name: &str) -> Option<&BookSpec> {
        self.books.iter().find(|b| b.matches(name))
    }

    pub fn by_grouping(&self, grouping: Grouping) -> Vec<&BookSpec> {
        self.books.iter().filter(|b| b.grouping == grouping).collect()
    }

    /// Books a run should visit: optionally one book, optionally starting
    /// at an order index. Canonical order is preserved.
    pub fn scoped(&self, book: Option<&str>, from_order: Option<u32>) -> Result<Vec<&BookSpec>> {
        if let Some(name) = book {
            return match self.find(name) {
                Some(spec) => Ok(vec![spec]),
                None => bail!("Book not found in catalog: {}", name),
            };
        }

        let start = from_order.unwrap_or(0);
        Ok(self.books.iter().filter(|b| b.order_index >= start).collect())
    }

    pub fn keys(&self) -> HashSet<String> {
        self.books.iter().map(|b| b.key()).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
