// Verse Sync - CLI
// Thin operator surface over the library: every subcommand loads the JSON
// config, opens the store, and hands off to one library entry point.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use verse_sync::{
    compare, export_csv, fill_placeholder, mark_gaps, sample_audit, BookCatalog, BookSpec, Checkpoint, CrawlOptions,
    HttpFetcher, Orchestrator, PageFetcher, RunReport, Snapshot, SourceKind, SourceRef, SourceSet, Store, SyncConfig,
    Workspace,
};

#[derive(Parser)]
#[command(name = "verse-sync", version, about = "Sync a multi-source verse corpus into one workspace store")]
struct Cli {
    /// Workspace config (JSON)
    #[arg(long, global = true, env = "VERSE_SYNC_CONFIG", default_value = "verse-sync.json")]
    config: PathBuf,

    /// Override the store path from the config
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl the configured sources into the workspace
    Sync(SyncArgs),

    /// Sync the workspace from an interchange CSV
    #[command(name = "import-csv")]
    ImportCsv {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = "verse-sync.report.json")]
        report: PathBuf,
    },

    /// Write a workspace to an interchange CSV
    #[command(name = "export-csv")]
    ExportCsv {
        #[arg(long)]
        out: PathBuf,
        /// language/edition (defaults to the config workspace)
        #[arg(long, value_parser = parse_workspace)]
        workspace: Option<Workspace>,
    },

    /// Diff a source workspace (or CSV) against a target workspace
    Compare {
        #[arg(long, value_parser = parse_workspace, conflicts_with = "source_csv")]
        source: Option<Workspace>,
        #[arg(long)]
        source_csv: Option<PathBuf>,
        /// language/edition (defaults to the config workspace)
        #[arg(long, value_parser = parse_workspace)]
        target: Option<Workspace>,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Re-fetch a random sample of books from their audit source
    #[command(name = "sample-audit")]
    SampleAudit {
        #[arg(long)]
        books: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Insert placeholder rows for a known gap
    #[command(name = "mark-gaps")]
    MarkGaps {
        #[arg(long)]
        book: String,
        #[arg(long)]
        chapter: u32,
        /// Verse range, e.g. "3-7" or "4"
        #[arg(long)]
        verses: String,
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Replace one placeholder with curated text
    #[command(name = "fill-placeholder")]
    FillPlaceholder {
        #[arg(long)]
        book: String,
        #[arg(long)]
        chapter: u32,
        #[arg(long)]
        verse: u32,
        #[arg(long)]
        text: String,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Run fetch/parse/merge but write nothing
    #[arg(long)]
    dry_run: bool,

    /// Ignore (and overwrite) an existing checkpoint
    #[arg(long)]
    reset: bool,

    /// Only this book (name, abbreviation or alias)
    #[arg(long)]
    book: Option<String>,

    /// Start at this order index
    #[arg(long)]
    from_order: Option<u32>,

    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    request_delay_ms: Option<u64>,

    /// Keep stored books that are missing from the catalog
    #[arg(long)]
    no_prune: bool,

    #[arg(long, default_value = "verse-sync.checkpoint.json")]
    checkpoint: PathBuf,

    #[arg(long, default_value = "verse-sync.report.json")]
    report: PathBuf,
}

fn parse_workspace(raw: &str) -> Result<Workspace, String> {
    match raw.split_once('/') {
        Some((lang, edition)) if !lang.trim().is_empty() && !edition.trim().is_empty() => {
            Ok(Workspace::new(lang, edition))
        }
        _ => Err(format!("expected language/edition, got '{}'", raw)),
    }
}

fn parse_verse_range(raw: &str) -> Result<std::ops::RangeInclusive<u32>> {
    let (start, end) = match raw.split_once('-') {
        Some((a, b)) => (a.trim().parse::<u32>()?, b.trim().parse::<u32>()?),
        None => {
            let v = raw.trim().parse::<u32>()?;
            (v, v)
        }
    };
    if start == 0 || end < start {
        bail!("Invalid verse range '{}'", raw);
    }
    Ok(start..=end)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_file(&cli.config)?;
    if let Some(path) = &cli.store {
        config.store.path = path.clone();
    }

    let store = Store::open(&config.store.path, &config.store.options())?;
    let catalog = config.catalog()?;

    match cli.command {
        Command::Sync(args) => run_sync(&config, &store, &catalog, args).await,
        Command::ImportCsv { csv, dry_run, report } => run_import(&config, &store, &catalog, csv, dry_run, report).await,
        Command::ExportCsv { out, workspace } => {
            let workspace = workspace.unwrap_or_else(|| config.workspace.clone());
            let rows = export_csv(&store, &workspace, &out)?;
            println!("✓ Exported {} verses of {} to {}", rows, workspace, out.display());
            Ok(())
        }
        Command::Compare {
            source,
            source_csv,
            target,
            out,
        } => run_compare(&config, &store, source, source_csv, target, out),
        Command::SampleAudit { books, seed, out } => {
            let mut settings = config.sampling.clone();
            if let Some(n) = books {
                settings.books = n;
            }
            if let Some(s) = seed {
                settings.seed = s;
            }
            let sources = build_sources(&config)?;
            let report = sample_audit(
                &store,
                &config.workspace,
                &catalog,
                &sources,
                &settings,
                &config.crawl.retry_policy(),
            )
            .await?;

            println!("🎲 Sample audit (seed {}): {}", report.seed, report.books.join(", "));
            println!("   {}", report.comparison.summary());
            for skipped in &report.skipped {
                println!("   ⚠️  skipped {}", skipped);
            }
            if let Some(path) = out {
                std::fs::write(&path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            Ok(())
        }
        Command::MarkGaps {
            book,
            chapter,
            verses,
            reason,
        } => {
            let spec = find_book(&catalog, &book)?;
            let report = mark_gaps(&store, &config.workspace, spec, chapter, parse_verse_range(&verses)?, &reason)?;
            println!(
                "✓ {} {}: {} placeholders inserted, {} verses already present",
                spec.name,
                chapter,
                report.inserted.len(),
                report.existing.len()
            );
            Ok(())
        }
        Command::FillPlaceholder {
            book,
            chapter,
            verse,
            text,
        } => {
            let spec = find_book(&catalog, &book)?;
            fill_placeholder(&store, &config.workspace, spec, chapter, verse, &text)?;
            println!("✓ {} {}:{} filled", spec.name, chapter, verse);
            Ok(())
        }
    }
}

fn find_book<'a>(catalog: &'a BookCatalog, name: &str) -> Result<&'a BookSpec> {
    catalog
        .find(name)
        .with_context(|| format!("Book not found in catalog: {}", name))
}

fn build_sources(config: &SyncConfig) -> Result<SourceSet> {
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(
        &config.crawl.user_agent,
        config.crawl.timeout_ms,
        config.crawl.request_delay_ms,
    )?);
    Ok(SourceSet::from_config(&config.sources, fetcher, &config.headings))
}

/// Stop flag flipped by Ctrl-C; the orchestrator finishes the current chapter
fn install_stop_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current chapter");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

async fn run_sync(config: &SyncConfig, store: &Store, catalog: &BookCatalog, args: SyncArgs) -> Result<()> {
    let mut crawl = config.crawl.clone();
    if let Some(v) = args.concurrency {
        crawl.concurrency = v;
    }
    if let Some(v) = args.timeout_ms {
        crawl.timeout_ms = v;
    }
    if let Some(v) = args.max_attempts {
        crawl.max_attempts = v;
    }
    if let Some(v) = args.request_delay_ms {
        crawl.request_delay_ms = v;
    }

    println!("📖 Verse Sync - {}", config.workspace);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut runtime_config = config.clone();
    runtime_config.crawl = crawl.clone();
    let sources = build_sources(&runtime_config)?;

    let options = CrawlOptions {
        dry_run: args.dry_run,
        book: args.book,
        from_order: args.from_order,
        prune_books: !args.no_prune,
        ..CrawlOptions::from_settings(&crawl)
    };

    let checkpoint = Checkpoint::load_or_new(&args.checkpoint, &config.workspace, args.reset)?;
    let orchestrator = Orchestrator::new(store, &config.workspace, catalog, &sources, options)
        .with_checkpoint_path(args.checkpoint.clone())
        .with_reference(config.reference.clone())
        .with_stop_flag(install_stop_flag());

    let (_, report) = orchestrator.run(checkpoint).await?;
    finish_report(&report, &args.report)
}

/// Sync every catalog book from one CSV file, ignoring configured sources
async fn run_import(
    config: &SyncConfig,
    store: &Store,
    catalog: &BookCatalog,
    csv: PathBuf,
    dry_run: bool,
    report_path: PathBuf,
) -> Result<()> {
    println!("📑 CSV import → {}", config.workspace);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let books: Vec<BookSpec> = catalog
        .books()
        .iter()
        .map(|b| BookSpec {
            source: SourceRef::new(SourceKind::CsvImport, &b.name),
            overlay: None,
            ..b.clone()
        })
        .collect();
    let csv_catalog = BookCatalog::new(books)?;

    let mut sources_config = config.sources.clone();
    sources_config.csv_path = Some(csv);
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.crawl.user_agent, config.crawl.timeout_ms, 0)?);
    let sources = SourceSet::from_config(&sources_config, fetcher, &config.headings);

    let options = CrawlOptions {
        dry_run,
        ..CrawlOptions::from_settings(&config.crawl)
    };
    let orchestrator = Orchestrator::new(store, &config.workspace, &csv_catalog, &sources, options)
        .with_reference(config.reference.clone())
        .with_stop_flag(install_stop_flag());

    let (_, report) = orchestrator.run(Checkpoint::new(&config.workspace)).await?;
    finish_report(&report, &report_path)
}

fn finish_report(report: &RunReport, path: &Path) -> Result<()> {
    report.write(path)?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());
    for warning in report.warnings.iter().take(20) {
        println!("   ⚠️  {}", warning);
    }
    if report.warnings.len() > 20 {
        println!("   ... {} more in {}", report.warnings.len() - 20, path.display());
    }
    if report.interrupted {
        println!("⏸️  Interrupted - rerun the same command to resume");
    }

    let failed = report.failed_books();
    if failed.is_empty() {
        println!("✅ Sync complete{}", if report.dry_run { " (dry run)" } else { "" });
    } else {
        for book in &failed {
            println!("❌ {}: {}", book.book, book.reason.as_deref().unwrap_or("failed"));
        }
    }
    println!("📋 Report: {}", path.display());
    Ok(())
}

fn run_compare(
    config: &SyncConfig,
    store: &Store,
    source: Option<Workspace>,
    source_csv: Option<PathBuf>,
    target: Option<Workspace>,
    out: Option<PathBuf>,
) -> Result<()> {
    let source = match (source, source_csv, &config.reference) {
        (Some(ws), _, _) => Snapshot::from_store(store, &ws)?,
        (None, Some(path), _) => Snapshot::from_csv(&path)?,
        (None, None, Some(reference)) => Snapshot::from_store(store, reference)?,
        (None, None, None) => bail!("Nothing to compare against: pass --source, --source-csv or configure a reference"),
    };
    let target = Snapshot::from_store(store, &target.unwrap_or_else(|| config.workspace.clone()))?;

    let report = compare(&source, &target);
    println!("🔍 {}", report.summary());
    println!("   fingerprints: {} / {}", &report.source_fingerprint[..12], &report.target_fingerprint[..12]);
    println!(
        "   integrity: {} duplicates, {} placeholders, {} empty",
        report.target_integrity.duplicates.count,
        report.target_integrity.placeholders.count,
        report.target_integrity.empty_text.count
    );

    if let Some(path) = out {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("📋 Written to {}", path.display());
    }

    if report.is_clean() {
        println!("✅ No differences");
    }
    Ok(())
}
