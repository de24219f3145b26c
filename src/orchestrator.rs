// 🚦 Crawl Orchestrator - plan, fetch, reconcile, checkpoint
//
// Per book:
//   PLANNED → LISTING → FETCHING_CHAPTER* → DONE
//                 └──────────┴────────────→ FAILED
//
// 1. List chapter tokens from the primary source (and the overlay, if any)
// 2. Ensure the book row exists
// 3. Fetch pending chapters through a bounded pool (buffer_unordered)
// 4. Write each chapter as it completes, then mark it in the checkpoint
// 5. Prune chapters the source no longer lists
//
// Fetch errors never abort the run. They become warnings in the report and
// the book ends FAILED; the next book starts normally. The stop flag is
// checked between chapters, never in the middle of a write.

use crate::audit::{compare, IntegrityReport, Snapshot};
use crate::checkpoint::Checkpoint;
use crate::config::CrawlSettings;
use crate::db::Store;
use crate::entities::{BookCatalog, BookRecord, BookSpec, ChapterContent, ChapterToken, Workspace};
use crate::reconciliation::{merge_overlay, ReconciliationEngine, SyncStats, WriteMode};
use crate::report::{AuditSection, BookProgress, BookState, RunReport, WarningKind};
use crate::retry::{retry_store, with_retry, RetryPolicy};
use crate::sources::{map_token, FetchError, SourceAdapter, SourceRef, SourceSet};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub dry_run: bool,

    /// Restrict the run to one book (name, abbreviation or alias)
    pub book: Option<String>,

    /// Start at this order index
    pub from_order: Option<u32>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub batch_size: usize,

    /// Delete stored books missing from the catalog (unscoped runs only)
    pub prune_books: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        CrawlOptions::from_settings(&CrawlSettings::default())
    }
}

impl CrawlOptions {
    pub fn from_settings(settings: &CrawlSettings) -> Self {
        CrawlOptions {
            dry_run: false,
            book: None,
            from_order: None,
            concurrency: settings.concurrency.max(1),
            retry: settings.retry_policy(),
            batch_size: settings.batch_size.max(1),
            prune_books: true,
        }
    }

    pub fn is_scoped(&self) -> bool {
        self.book.is_some() || self.from_order.is_some()
    }
}

/// One stored chapter number and the token(s) that produce it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannedChapter {
    pub number: u32,
    pub primary: Option<ChapterToken>,
    pub overlay: Option<ChapterToken>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator<'a> {
    store: &'a Store,
    workspace: Workspace,
    catalog: &'a BookCatalog,
    sources: &'a SourceSet,
    options: CrawlOptions,
    checkpoint_path: Option<PathBuf>,
    reference: Option<Workspace>,
    stop: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a Store,
        workspace: &Workspace,
        catalog: &'a BookCatalog,
        sources: &'a SourceSet,
        options: CrawlOptions,
    ) -> Self {
        Orchestrator {
            store,
            workspace: workspace.clone(),
            catalog,
            sources,
            options,
            checkpoint_path: None,
            reference: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builder pattern: persist the checkpoint here after every chapter
    pub fn with_checkpoint_path(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    /// Builder pattern: compare against this workspace at the end of the run
    pub fn with_reference(mut self, reference: Option<Workspace>) -> Self {
        self.reference = reference;
        self
    }

    /// Builder pattern: share a stop flag (set from a signal handler)
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn engine(&self) -> ReconciliationEngine {
        let mode = if self.options.dry_run {
            WriteMode::DryRun
        } else {
            WriteMode::Apply
        };
        ReconciliationEngine::new()
            .with_batch_size(self.options.batch_size)
            .with_mode(mode)
    }

    /// Run the whole plan. The checkpoint comes back updated (and, unless
    /// dry-run, already persisted after each chapter).
    pub async fn run(&self, mut checkpoint: Checkpoint) -> Result<(Checkpoint, RunReport)> {
        let mut report = RunReport::new(&self.workspace, self.options.dry_run);
        let books = self.catalog.scoped(self.options.book.as_deref(), self.options.from_order)?;
        report.books = books.iter().map(|b| BookProgress::new(&b.name)).collect();

        info!(
            workspace = %self.workspace,
            books = books.len(),
            dry_run = self.options.dry_run,
            concurrency = self.options.concurrency,
            "starting sync run"
        );

        // Swapped or shifted catalog orders are settled before any book is touched
        if !self.options.dry_run {
            match self.store.align_book_orders(&self.workspace, self.catalog.books()) {
                Ok(0) => {}
                Ok(moved) => info!(moved, "book order indexes realigned with the catalog"),
                Err(err) => report.warn(WarningKind::Store, None, None, format!("book reorder failed: {:#}", err)),
            }
        }

        let engine = self.engine();
        for (i, spec) in books.iter().enumerate() {
            if self.stopped() {
                report.interrupted = true;
                break;
            }
            let mut progress = report.books[i].clone();
            let outcome = self
                .sync_one_book(&engine, spec, &mut checkpoint, &mut progress, &mut report)
                .await;
            self.release_sources(spec);
            outcome?;
            report.books[i] = progress;
            if report.interrupted {
                break;
            }
        }

        let clean = report.failed_books().is_empty() && !report.interrupted;
        if self.options.prune_books && !self.options.is_scoped() && clean {
            match engine.prune_books(self.store, &self.workspace, &self.catalog.keys()) {
                Ok(stats) => report.counts.sync.merge(&stats),
                Err(err) => report.warn(WarningKind::Store, None, None, format!("book pruning failed: {:#}", err)),
            }
        }

        report.audit = Some(self.audit(&mut report));
        report.finish();
        info!(summary = %report.summary(), "sync run finished");
        Ok((checkpoint, report))
    }

    async fn sync_one_book(
        &self,
        engine: &ReconciliationEngine,
        spec: &BookSpec,
        checkpoint: &mut Checkpoint,
        progress: &mut BookProgress,
        report: &mut RunReport,
    ) -> Result<()> {
        let key = spec.key();
        report.counts.books_processed += 1;
        progress.advance(BookState::Listing);

        let plan = match self.plan_book(spec, report).await {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(book = %spec.name, reason = %reason, "book failed during listing");
                progress.fail(reason);
                return Ok(());
            }
        };
        progress.chapters_listed = plan.len();

        let (record, book_stats) = match engine.ensure_book(self.store, &self.workspace, spec) {
            Ok(result) => result,
            Err(err) => {
                report.warn(WarningKind::Store, Some(&spec.name), None, format!("{:#}", err));
                progress.fail(format!("store: {:#}", err));
                return Ok(());
            }
        };
        report.counts.sync.merge(&book_stats);
        if !self.options.dry_run {
            checkpoint.set_total(&key, plan.len() as u32);
        }

        let pending: Vec<PlannedChapter> = plan
            .iter()
            .filter(|p| !checkpoint.is_completed(&key, p.number))
            .cloned()
            .collect();
        for done in plan.iter().filter(|p| checkpoint.is_completed(&key, p.number)) {
            self.skip_planned(spec, done);
        }
        progress.chapters_skipped = plan.len() - pending.len();
        report.counts.chapters_skipped += progress.chapters_skipped;
        if progress.chapters_skipped > 0 {
            info!(book = %spec.name, skipped = progress.chapters_skipped, "chapters already completed");
        }

        progress.advance(BookState::FetchingChapter);
        let fetches = stream::iter(pending.into_iter().map(|planned| async move {
            let result = self.fetch_planned(spec, &planned).await;
            (planned.number, result)
        }))
        .buffer_unordered(self.options.concurrency.max(1));
        let mut fetches = std::pin::pin!(fetches);

        while let Some((number, result)) = fetches.next().await {
            match result {
                Ok(chapter) => {
                    self.write_chapter(engine, spec, record.as_ref(), chapter, checkpoint, progress, report)
                        .await;
                }
                Err(err) => {
                    let kind = if err.is_transient() {
                        WarningKind::Transient
                    } else {
                        WarningKind::Structural
                    };
                    warn!(book = %spec.name, chapter = number, error = %err, "chapter fetch failed");
                    report.warn(kind, Some(&spec.name), Some(number), err.to_string());
                    progress.chapters_failed += 1;
                }
            }

            if self.stopped() {
                info!(book = %spec.name, chapter = number, "stop requested, leaving remaining chapters for resume");
                report.interrupted = true;
                return Ok(());
            }
        }

        let listed: BTreeSet<u32> = plan.iter().map(|p| p.number).collect();
        match engine.finish_book(self.store, record.as_ref(), &listed) {
            Ok(stats) => report.counts.sync.merge(&stats),
            Err(err) => report.warn(WarningKind::Store, Some(&spec.name), None, format!("{:#}", err)),
        }

        if progress.chapters_failed > 0 {
            progress.fail(format!("{} of {} chapters failed", progress.chapters_failed, plan.len()));
        } else {
            progress.advance(BookState::Done);
        }
        Ok(())
    }

    /// Let adapters drop pages cached for a chapter the checkpoint already has
    fn skip_planned(&self, spec: &BookSpec, planned: &PlannedChapter) {
        let sides = [(Some(&spec.source), &planned.primary), (spec.overlay.as_ref(), &planned.overlay)];
        for (source, token) in sides {
            if let (Some(source), Some(token)) = (source, token) {
                if let Ok(adapter) = self.sources.get(source.kind) {
                    adapter.skip_chapter(source, token);
                }
            }
        }
    }

    fn release_sources(&self, spec: &BookSpec) {
        for source in std::iter::once(&spec.source).chain(spec.overlay.as_ref()) {
            if let Ok(adapter) = self.sources.get(source.kind) {
                adapter.release_book(source);
            }
        }
    }

    fn adapter_for(&self, source: &SourceRef) -> std::result::Result<&dyn SourceAdapter, String> {
        self.sources.get(source.kind).map_err(|e| e.to_string())
    }

    async fn list_tokens(&self, spec: &BookSpec, source: &SourceRef) -> std::result::Result<Vec<ChapterToken>, FetchError> {
        let adapter = self
            .sources
            .get(source.kind)
            .map_err(|e| FetchError::structural(&source.to_string(), e.to_string()))?;
        let label = format!("list {}", source);
        with_retry(&self.options.retry, &label, || adapter.list_chapters(spec, source)).await
    }

    /// Chapter plan: union of primary and overlay listings keyed by stored number
    async fn plan_book(&self, spec: &BookSpec, report: &mut RunReport) -> std::result::Result<Vec<PlannedChapter>, String> {
        let mut plan: BTreeMap<u32, PlannedChapter> = BTreeMap::new();

        let mut sides = vec![(&spec.source, false)];
        if let Some(overlay) = &spec.overlay {
            sides.push((overlay, true));
        }

        for (source, is_overlay) in sides {
            if let Err(reason) = self.adapter_for(source) {
                report.warn(WarningKind::Config, Some(&spec.name), None, reason.clone());
                return Err(reason);
            }

            let tokens = match self.list_tokens(spec, source).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    let kind = if err.is_transient() {
                        WarningKind::Transient
                    } else {
                        WarningKind::Structural
                    };
                    report.warn(kind, Some(&spec.name), None, err.to_string());
                    return Err(format!("listing {}: {}", source, err));
                }
            };

            for token in tokens {
                let number = match map_token(spec, &token, &source.to_string()) {
                    Ok(n) => n,
                    Err(err) => {
                        report.warn(WarningKind::Structural, Some(&spec.name), None, err.to_string());
                        continue;
                    }
                };
                let entry = plan.entry(number).or_insert_with(|| PlannedChapter {
                    number,
                    ..Default::default()
                });
                if is_overlay {
                    entry.overlay = Some(token);
                } else {
                    entry.primary = Some(token);
                }
            }
        }

        if plan.is_empty() {
            return Err("no chapters listed".to_string());
        }
        Ok(plan.into_values().collect())
    }

    async fn fetch_from(
        &self,
        spec: &BookSpec,
        source: &SourceRef,
        token: &ChapterToken,
    ) -> std::result::Result<ChapterContent, FetchError> {
        let adapter = self
            .sources
            .get(source.kind)
            .map_err(|e| FetchError::structural(&source.to_string(), e.to_string()))?;
        let label = format!("fetch {} {}", source, token);
        with_retry(&self.options.retry, &label, || adapter.fetch_chapter(spec, source, token)).await
    }

    /// Fetch one planned chapter from each side that has it, then merge
    async fn fetch_planned(&self, spec: &BookSpec, planned: &PlannedChapter) -> std::result::Result<ChapterContent, FetchError> {
        let primary = match &planned.primary {
            Some(token) => Some(self.fetch_from(spec, &spec.source, token).await?),
            None => None,
        };
        let overlay = match (&planned.overlay, &spec.overlay) {
            (Some(token), Some(source)) => Some(self.fetch_from(spec, source, token).await?),
            _ => None,
        };

        Ok(match (primary, overlay) {
            (Some(p), Some(o)) => merge_overlay(p, o),
            (Some(p), None) => p,
            (None, Some(o)) => o,
            (None, None) => ChapterContent::new(planned.number, Vec::new()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_chapter(
        &self,
        engine: &ReconciliationEngine,
        spec: &BookSpec,
        record: Option<&BookRecord>,
        chapter: ChapterContent,
        checkpoint: &mut Checkpoint,
        progress: &mut BookProgress,
        report: &mut RunReport,
    ) {
        let number = chapter.number;
        report.counts.heading_fallbacks += chapter.heading_fallbacks;
        report.counts.duplicates_dropped += chapter.duplicates_dropped;

        if chapter.duplicates_dropped > 0 {
            report.warn(
                WarningKind::DuplicatesDropped,
                Some(&spec.name),
                Some(number),
                format!("{} duplicate verse anchors dropped", chapter.duplicates_dropped),
            );
        }
        if chapter.heading_fallbacks > 0 {
            report.warn(
                WarningKind::HeadingFallback,
                Some(&spec.name),
                Some(number),
                format!("{} headings remapped to another verse", chapter.heading_fallbacks),
            );
        }

        // Empty is not an error, but it is not "done" either
        if chapter.is_empty() {
            warn!(book = %spec.name, chapter = number, "chapter parsed to zero verses");
            report.warn(WarningKind::EmptyChapter, Some(&spec.name), Some(number), "no verses parsed");
            progress.chapters_failed += 1;
            return;
        }

        let label = format!("write {} {}", spec.name, number);
        let write = retry_store(&self.options.retry, &label, || engine.sync_chapter(self.store, record, &chapter)).await;
        let stats: SyncStats = match write {
            Ok(stats) => stats,
            Err(err) => {
                warn!(book = %spec.name, chapter = number, error = %err, "chapter write failed");
                report.warn(WarningKind::Store, Some(&spec.name), Some(number), format!("{:#}", err));
                progress.chapters_failed += 1;
                return;
            }
        };

        report.counts.chapters_processed += 1;
        report.counts.verses_processed += chapter.verses.len();
        report.counts.sync.merge(&stats);
        progress.chapters_synced += 1;

        if !self.options.dry_run {
            checkpoint.mark_completed(&spec.key(), number);
            checkpoint.record_stats(&stats);
            // The chapter is already in the store; a lost checkpoint only costs a refetch
            if let Some(path) = &self.checkpoint_path {
                if let Err(err) = checkpoint.save(path) {
                    warn!(path = %path.display(), error = %err, "checkpoint save failed");
                    report.warn(WarningKind::Checkpoint, Some(&spec.name), Some(number), format!("{:#}", err));
                }
            }
        }
    }

    /// Integrity scan of the workspace, plus a comparison with the reference
    fn audit(&self, report: &mut RunReport) -> AuditSection {
        let target = match Snapshot::from_store(self.store, &self.workspace) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                report.warn(WarningKind::Store, None, None, format!("audit skipped: {:#}", err));
                return AuditSection::default();
            }
        };

        let comparison = match &self.reference {
            Some(reference) => match Snapshot::from_store(self.store, reference) {
                Ok(source) => Some(compare(&source, &target)),
                Err(err) => {
                    report.warn(WarningKind::Store, None, None, format!("reference audit skipped: {:#}", err));
                    None
                }
            },
            None => None,
        };

        AuditSection {
            integrity: IntegrityReport::scan(&target.rows),
            comparison,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreOptions;
    use crate::entities::Grouping;
    use crate::headings::HeadingSettings;
    use crate::sources::{AnchoredAdapter, PagedAdapter, SourceKind, StaticFetcher};

    const BASE: &str = "https://paged.test/tb";

    fn chapter_page(book: &str, n: u32, verses: &[&str]) -> String {
        let body: String = verses
            .iter()
            .enumerate()
            .map(|(i, t)| format!("<a name=\"v{}\"></a>{} {} ", i + 1, i + 1, t))
            .collect();
        format!("<html><body><h1>{} {}</h1><p>{}</p></body></html>", book, n, body)
    }

    fn index_page(slug: &str, chapters: &[u32]) -> String {
        chapters
            .iter()
            .map(|n| format!("<a href=\"/tb/{}/{}\">{}</a>", slug, n, n))
            .collect()
    }

    fn rut() -> BookSpec {
        BookSpec::new("Rut", "Rut", Grouping::Old, 8, SourceRef::new(SourceKind::Paged, "rut"))
    }

    fn fetcher() -> Arc<StaticFetcher> {
        Arc::new(
            StaticFetcher::new()
                .with_page(&format!("{}/rut", BASE), &index_page("rut", &[1, 2]))
                .with_page(&format!("{}/rut/1", BASE), &chapter_page("Rut", 1, &["Pada zaman.", "Nama orang itu."]))
                .with_page(&format!("{}/rut/2", BASE), &chapter_page("Rut", 2, &["Naomi mempunyai sanak."])),
        )
    }

    fn sources(fetcher: Arc<StaticFetcher>) -> SourceSet {
        SourceSet::new()
            .with_adapter(Box::new(PagedAdapter::new(BASE, fetcher.clone(), HeadingSettings::default())))
            .with_adapter(Box::new(AnchoredAdapter::new("https://flat.test", fetcher, HeadingSettings::default())))
    }

    fn options() -> CrawlOptions {
        CrawlOptions {
            retry: RetryPolicy::immediate(),
            ..CrawlOptions::default()
        }
    }

    fn ws() -> Workspace {
        Workspace::new("id", "tb")
    }

    fn store() -> Store {
        Store::open_in_memory(&StoreOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_full_run_marks_checkpoint() {
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher());

        let orchestrator = Orchestrator::new(&store, &ws(), &catalog, &sources, options());
        let (checkpoint, report) = orchestrator.run(Checkpoint::new(&ws())).await.unwrap();

        assert_eq!(checkpoint.completed("rut"), &[1, 2]);
        assert_eq!(checkpoint.books["rut"].total_chapters, 2);
        assert_eq!(report.books[0].state, BookState::Done);
        assert_eq!(report.counts.sync.verses_inserted, 3);
        assert_eq!(report.counts.chapters_processed, 2);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.audit.as_ref().unwrap().integrity.rows, 3);
        assert_eq!(store.verse_count(&ws()).unwrap(), 3);
        println!("✅ Orchestrated sync PASSED");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher());
        let opts = CrawlOptions {
            dry_run: true,
            ..options()
        };

        let (checkpoint, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, opts)
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.counts.sync.verses_inserted, 3);
        assert_eq!(report.counts.sync.books_inserted, 1);
        assert!(checkpoint.books.is_empty());
        assert_eq!(store.verse_count(&ws()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_book_does_not_stop_run() {
        let store = store();
        let kej = BookSpec::new("Kejadian", "Kej", Grouping::Old, 1, SourceRef::new(SourceKind::Paged, "kej"));
        let catalog = BookCatalog::new(vec![kej, rut()]).unwrap();
        let sources = sources(fetcher());

        let (_, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert_eq!(report.books[0].state, BookState::Failed);
        assert_eq!(report.books[1].state, BookState::Done);
        assert_eq!(report.warnings_of(WarningKind::Transient), 1);
        assert_eq!(store.verse_count(&ws()).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_structural_chapter_failure_is_warning() {
        let fetcher = fetcher();
        fetcher.insert(&format!("{}/rut/2", BASE), "<html><body>Service unavailable</body></html>");
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher);

        let (checkpoint, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert_eq!(checkpoint.completed("rut"), &[1]);
        assert_eq!(report.warnings_of(WarningKind::Structural), 1);
        assert_eq!(report.books[0].state, BookState::Failed);
        assert_eq!(report.books[0].chapters_failed, 1);
    }

    #[tokio::test]
    async fn test_overlay_woven_into_chapters() {
        let overlay_page = r#"<a name="c2"></a><h2>Pasal 2</h2><p><a name="v1"></a>Overlay text. <a name="v2"></a>Extra verse.</p>
<a name="c3"></a><h2>Pasal 3</h2><p><a name="v1"></a>Only in overlay.</p>"#;
        let fetcher = fetcher();
        fetcher.insert("https://flat.test/rut-extra", overlay_page);
        let store = store();
        let book = rut().with_overlay(SourceRef::new(SourceKind::Anchored, "rut-extra"));
        let catalog = BookCatalog::new(vec![book]).unwrap();
        let sources = sources(fetcher);

        let (checkpoint, _) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert_eq!(checkpoint.completed("rut"), &[1, 2, 3]);
        let rows = store.load_rows(&ws()).unwrap();
        let ch2: Vec<&str> = rows.iter().filter(|r| r.chapter == 2).map(|r| r.text.as_str()).collect();
        assert_eq!(ch2, vec!["Overlay text.", "Extra verse."]);
        assert_eq!(rows.iter().filter(|r| r.chapter == 3).count(), 1);
    }

    #[tokio::test]
    async fn test_stop_flag_halts_before_next_book() {
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher());
        let stop = Arc::new(AtomicBool::new(true));

        let (_, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .with_stop_flag(stop)
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.books[0].state, BookState::Planned);
        assert_eq!(store.verse_count(&ws()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_anchors_leave_no_duplicate_rows() {
        let fetcher = fetcher();
        fetcher.insert(
            &format!("{}/rut/2", BASE),
            r#"<html><body><h1>Rut 2</h1><p><a name="v1"></a>1 Naomi mempunyai sanak. <a name="v2"></a>2 Rut pergi. <a name="v2"></a>2 Rut pergi lagi.</p></body></html>"#,
        );
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher);

        let (_, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert_eq!(report.warnings_of(WarningKind::DuplicatesDropped), 1);
        assert_eq!(report.counts.duplicates_dropped, 1);

        let integrity = &report.audit.as_ref().unwrap().integrity;
        assert!(integrity.duplicates.is_empty());
        assert!(integrity.is_clean());

        let rescanned = IntegrityReport::scan(&store.load_rows(&ws()).unwrap());
        assert_eq!(rescanned.duplicates.count, 0);
        let ch2: Vec<String> = store
            .load_rows(&ws())
            .unwrap()
            .into_iter()
            .filter(|r| r.chapter == 2)
            .map(|r| r.text)
            .collect();
        assert_eq!(ch2, vec!["Naomi mempunyai sanak.", "Rut pergi."]);
        println!("✅ Duplicate anchors → clean store PASSED");
    }

    #[tokio::test]
    async fn test_checkpoint_save_failure_is_warning() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();
        let sources = sources(fetcher());

        let (checkpoint, report) = Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .with_checkpoint_path(blocker.join("checkpoint.json"))
            .run(Checkpoint::new(&ws()))
            .await
            .unwrap();

        assert_eq!(report.warnings_of(WarningKind::Checkpoint), 2);
        assert_eq!(report.books[0].state, BookState::Done);
        assert_eq!(checkpoint.completed("rut"), &[1, 2]);
        assert_eq!(store.verse_count(&ws()).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_swapped_catalog_orders_converge() {
        let store = store();
        let kej = BookSpec::new("Kejadian", "Kej", Grouping::Old, 1, SourceRef::new(SourceKind::Paged, "kej"));
        let engine = ReconciliationEngine::new();
        engine.ensure_book(&store, &ws(), &kej).unwrap();
        engine.ensure_book(&store, &ws(), &BookSpec { order_index: 2, ..rut() }).unwrap();

        // Catalog now puts Rut first and Kejadian second
        let kej_second = BookSpec { order_index: 2, ..kej };
        let rut_first = BookSpec { order_index: 1, ..rut() };
        let catalog = BookCatalog::new(vec![kej_second, rut_first]).unwrap();
        let sources = sources(fetcher());

        for _ in 0..2 {
            Orchestrator::new(&store, &ws(), &catalog, &sources, options())
                .run(Checkpoint::new(&ws()))
                .await
                .unwrap();
        }

        let orders: Vec<(String, u32)> = store
            .select_books(&ws())
            .unwrap()
            .into_iter()
            .map(|b| (b.name, b.order_index))
            .collect();
        assert_eq!(orders, vec![("Rut".to_string(), 1), ("Kejadian".to_string(), 2)]);
    }

    /// Paged adapter that logs cache hints from the orchestrator
    struct Recording {
        inner: PagedAdapter,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Recording {
        fn kind(&self) -> SourceKind {
            self.inner.kind()
        }

        async fn list_chapters(&self, book: &BookSpec, source: &SourceRef) -> std::result::Result<Vec<ChapterToken>, FetchError> {
            self.inner.list_chapters(book, source).await
        }

        async fn fetch_chapter(
            &self,
            book: &BookSpec,
            source: &SourceRef,
            token: &ChapterToken,
        ) -> std::result::Result<ChapterContent, FetchError> {
            self.inner.fetch_chapter(book, source, token).await
        }

        fn skip_chapter(&self, source: &SourceRef, token: &ChapterToken) {
            self.log.lock().unwrap().push(format!("skip {} {}", source.slug, token));
        }

        fn release_book(&self, source: &SourceRef) {
            self.log.lock().unwrap().push(format!("release {}", source.slug));
        }
    }

    #[tokio::test]
    async fn test_skipped_chapters_and_finished_books_release_cache() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sources = SourceSet::new().with_adapter(Box::new(Recording {
            inner: PagedAdapter::new(BASE, fetcher(), HeadingSettings::default()),
            log: log.clone(),
        }));
        let store = store();
        let catalog = BookCatalog::new(vec![rut()]).unwrap();

        let mut checkpoint = Checkpoint::new(&ws());
        checkpoint.mark_completed("rut", 1);
        Orchestrator::new(&store, &ws(), &catalog, &sources, options())
            .run(checkpoint)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["skip rut 1".to_string(), "release rut".to_string()]);
    }
}
