// 🔍 Deduplication Engine - one verse per (chapter, verse number)
//
// Sources repeat themselves: a page carries the same verse anchor twice,
// a curated CSV has two rows for one key after a manual fix. The store
// enforces uniqueness, so duplicates must be collapsed BEFORE the write.
//
// Two strategies:
// - KeepFirst: first-seen wins (HTML pages; later copies are usually
//   footnote echoes or navigation repeats)
// - KeepLongest: longest text wins (curated CSV; shorter copies are
//   usually truncated imports)

use crate::entities::VerseRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    KeepFirst,
    KeepLongest,
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DedupOutcome {
    /// Unique verses, sorted by verse number
    pub verses: Vec<VerseRecord>,

    /// Verse numbers that appeared more than once (one entry per extra copy)
    pub dropped: Vec<u32>,
}

impl DedupOutcome {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

pub struct DeduplicationEngine {
    pub strategy: DedupStrategy,
}

impl DeduplicationEngine {
    pub fn new(strategy: DedupStrategy) -> Self {
        DeduplicationEngine { strategy }
    }

    /// Collapse repeated verse numbers according to the strategy.
    ///
    /// A heading is never lost: if the surviving copy has none but a
    /// dropped copy does, the survivor inherits it.
    pub fn dedupe_verses(&self, verses: Vec<VerseRecord>) -> DedupOutcome {
        let mut slots: HashMap<u32, usize> = HashMap::new();
        let mut kept: Vec<VerseRecord> = Vec::with_capacity(verses.len());
        let mut dropped = Vec::new();

        for verse in verses {
            match slots.get(&verse.number) {
                None => {
                    slots.insert(verse.number, kept.len());
                    kept.push(verse);
                }
                Some(&idx) => {
                    dropped.push(verse.number);
                    let existing = &mut kept[idx];

                    let replace = match self.strategy {
                        DedupStrategy::KeepFirst => false,
                        DedupStrategy::KeepLongest => verse.text.chars().count() > existing.text.chars().count(),
                    };

                    if replace {
                        let inherited = existing.heading.take();
                        *existing = verse;
                        if existing.heading.is_none() {
                            existing.heading = inherited;
                        }
                    } else if existing.heading.is_none() {
                        existing.heading = verse.heading;
                    }
                }
            }
        }

        kept.sort_by_key(|v| v.number);
        DedupOutcome { verses: kept, dropped }
    }
}

impl Default for DeduplicationEngine {
    fn default() -> Self {
        Self::new(DedupStrategy::KeepFirst)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_first() {
        let engine = DeduplicationEngine::new(DedupStrategy::KeepFirst);
        let outcome = engine.dedupe_verses(vec![
            VerseRecord::new(2, "second"),
            VerseRecord::new(1, "first"),
            VerseRecord::new(2, "second but longer echo"),
        ]);

        assert_eq!(outcome.verses.len(), 2);
        assert_eq!(outcome.verses[0].number, 1);
        assert_eq!(outcome.verses[1].text, "second");
        assert_eq!(outcome.dropped, vec![2]);
        println!("✅ Keep-first dedup PASSED");
    }

    #[test]
    fn test_keep_longest() {
        let engine = DeduplicationEngine::new(DedupStrategy::KeepLongest);
        let outcome = engine.dedupe_verses(vec![
            VerseRecord::new(5, "truncated"),
            VerseRecord::new(5, "the full verse text"),
            VerseRecord::new(5, "short"),
        ]);

        assert_eq!(outcome.verses.len(), 1);
        assert_eq!(outcome.verses[0].text, "the full verse text");
        assert_eq!(outcome.dropped_count(), 2);
    }

    #[test]
    fn test_heading_survives_dedup() {
        let first = DeduplicationEngine::new(DedupStrategy::KeepFirst)
            .dedupe_verses(vec![VerseRecord::new(1, "text"), VerseRecord::new(1, "echo").with_heading("Title")]);
        assert_eq!(first.verses[0].heading.as_deref(), Some("Title"));

        let longest = DeduplicationEngine::new(DedupStrategy::KeepLongest).dedupe_verses(vec![
            VerseRecord::new(1, "a").with_heading("Title"),
            VerseRecord::new(1, "a longer text"),
        ]);
        assert_eq!(longest.verses[0].text, "a longer text");
        assert_eq!(longest.verses[0].heading.as_deref(), Some("Title"));
    }
}
