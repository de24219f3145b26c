// 🎲 Live Sample Audit - spot-check stored books against a third source
//
// Comparing two stores cannot catch an extraction bug both of them share.
// So: draw N books at random (seeded, reproducible), fetch them again from
// an independent source, and diff verses and headings against the store.

use crate::audit::{compare, ChapterKey, CompareReport, Snapshot};
use crate::config::SamplingSettings;
use crate::db::Store;
use crate::entities::{BookCatalog, BookSpec, ChapterContent, Workspace};
use crate::retry::{with_retry, RetryPolicy};
use crate::sources::SourceSet;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

/// In-place Fisher–Yates shuffle driven by a seeded PRNG
pub fn fisher_yates<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

/// Pick up to `n` books, reproducibly for a given seed
pub fn sample_books<'a>(candidates: &[&'a BookSpec], n: usize, seed: u64) -> Vec<&'a BookSpec> {
    let mut pool: Vec<&BookSpec> = candidates.to_vec();
    pool.sort_by_key(|b| b.order_index);
    fisher_yates(&mut pool, seed);
    pool.truncate(n);
    pool
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleAuditReport {
    pub seed: u64,
    pub books: Vec<String>,

    /// Books or chapters that could not be re-fetched, with the reason
    pub skipped: Vec<String>,
    pub heading_fallbacks: usize,

    /// Live source on the left, store on the right
    pub comparison: CompareReport,
}

/// Sample books stored in `workspace` and diff them against their audit source
pub async fn sample_audit(
    store: &Store,
    workspace: &Workspace,
    catalog: &BookCatalog,
    sources: &SourceSet,
    settings: &SamplingSettings,
    retry: &RetryPolicy,
) -> Result<SampleAuditReport> {
    let stored = store.select_books(workspace)?;
    let candidates: Vec<&BookSpec> = stored.iter().filter_map(|b| catalog.find(&b.name)).collect();
    let picked = sample_books(&candidates, settings.books, settings.seed);
    info!(seed = settings.seed, books = picked.len(), "live sample audit");

    let mut live = Snapshot::new("live sample", Vec::new());
    let mut fetched_chapters: BTreeSet<ChapterKey> = BTreeSet::new();
    let mut skipped: Vec<String> = Vec::new();
    let mut heading_fallbacks = 0;

    for book in &picked {
        let Some(source) = book.audit_source.as_ref() else {
            skipped.push(format!("{}: no audit source", book.name));
            continue;
        };
        let adapter = match sources.get(source.kind) {
            Ok(adapter) => adapter,
            Err(err) => {
                skipped.push(format!("{}: {}", book.name, err));
                continue;
            }
        };

        let label = format!("list {}", source);
        let tokens = match with_retry(retry, &label, || adapter.list_chapters(book, source)).await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(book = %book.name, error = %err, "audit listing failed");
                adapter.release_book(source);
                skipped.push(format!("{}: {}", book.name, err));
                continue;
            }
        };

        let mut chapters: Vec<ChapterContent> = Vec::new();
        for token in &tokens {
            let label = format!("fetch {} {}", source, token);
            match with_retry(retry, &label, || adapter.fetch_chapter(book, source, token)).await {
                Ok(chapter) => {
                    heading_fallbacks += chapter.heading_fallbacks;
                    fetched_chapters.insert(ChapterKey {
                        book: book.key(),
                        chapter: chapter.number,
                    });
                    chapters.push(chapter);
                }
                Err(err) => skipped.push(format!("{} {}: {}", book.name, token, err)),
            }
        }
        live.extend(Snapshot::from_chapters("live sample", book, &chapters));
        adapter.release_book(source);
    }

    let keys: HashSet<String> = picked.iter().map(|b| b.key()).collect();
    let target = Snapshot::from_store(store, workspace)?
        .restrict_to(&keys)
        .restrict_to_chapters(&fetched_chapters);

    let comparison = compare(&live, &target);
    info!(summary = %comparison.summary(), "live sample audit finished");

    Ok(SampleAuditReport {
        seed: settings.seed,
        books: picked.iter().map(|b| b.name.clone()).collect(),
        skipped,
        heading_fallbacks,
        comparison,
    })
}

// ============================================================================
// TESTS
// ============================================================================
