use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tidemark_core::{refresh_window, FetchWindow, SeriesCatalog};
use tidemark_cache::DataCache;
use tidemark_ledger::RunLedger;

#[derive(Parser)]
#[command(name = "tidemark", version, about = "tidemark sync engine utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the refresh window a series would fetch next
    Plan(PlanArgs),
    /// Web-cache inspection and housekeeping
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Run-ledger inspection
    Ledger {
        #[command(subcommand)]
        cmd: LedgerCmd,
    },
    /// Series catalog helpers
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCmd,
    },
}

#[derive(Args)]
struct PlanArgs {
    /// Series catalog file (TOML)
    #[arg(long)]
    catalog: String,
    /// Series id to plan
    #[arg(long)]
    series: String,
    /// Last persisted mark (YYYY-MM-DD); omit for a first run
    #[arg(long)]
    mark: Option<NaiveDate>,
    /// Pretend today is this date (YYYY-MM-DD)
    #[arg(long)]
    now: Option<NaiveDate>,
    /// Emit JSON instead of human-readable lines
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum CacheCmd {
    /// Per-operation entry counts and sizes
    Stats {
        #[arg(long, default_value = "webcache")]
        root: String,
    },
    /// Drop cached entries (one operation, or everything)
    Clear {
        #[arg(long, default_value = "webcache")]
        root: String,
        /// Only clear this operation's entries
        #[arg(long)]
        op: Option<String>,
    },
}

#[derive(Subcommand)]
enum LedgerCmd {
    /// List every task record
    Show {
        #[arg(long, default_value = "ledger.sqlite")]
        db: String,
        #[arg(long)]
        json: bool,
    },
    /// Forget a task so its next cycle runs unconditionally
    Reset {
        #[arg(long, default_value = "ledger.sqlite")]
        db: String,
        task: String,
    },
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// Parse and validate a catalog file
    Check { path: String },
}

fn main() -> Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan(args) => plan(args),
        Commands::Cache { cmd } => cache(cmd),
        Commands::Ledger { cmd } => ledger(cmd),
        Commands::Catalog { cmd } => catalog(cmd),
    }
}

fn plan(args: PlanArgs) -> Result<()> {
    let catalog = SeriesCatalog::load(&args.catalog)?;
    let entry = catalog
        .get(&args.series)
        .with_context(|| format!("series {} not in catalog", args.series))?;
    let now = args.now.unwrap_or_else(|| Local::now().date_naive());
    let window = refresh_window(&entry.spec(), args.mark, now, None);

    if args.json {
        let spans = window.as_ref().map(FetchWindow::spans);
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "series": args.series,
                "periodicity": entry.periodicity,
                "mark": args.mark,
                "now": now,
                "window": window,
                "spans": spans,
            }))?
        );
        return Ok(());
    }
    match window {
        None => println!("{}: no refresh needed", args.series),
        Some(FetchWindow::Full) => println!("{}: full one-time fetch", args.series),
        Some(window) => {
            if let FetchWindow::Range { start, end, .. } = &window {
                println!("{}: {} .. {}", args.series, start, end);
            }
            for span in window.spans() {
                println!("  {span}");
            }
        }
    }
    Ok(())
}

fn cache(cmd: CacheCmd) -> Result<()> {
    match cmd {
        CacheCmd::Stats { root } => {
            let cache = DataCache::open(root)?;
            let stats = cache.stats()?;
            if stats.operations.is_empty() {
                println!("cache is empty");
                return Ok(());
            }
            for (op, s) in &stats.operations {
                println!("{op}: {} entries, {} bytes", s.entries, s.bytes);
            }
        }
        CacheCmd::Clear { root, op } => {
            let cache = DataCache::open(root)?;
            match op {
                Some(op) => {
                    cache.clear_operation(&op)?;
                    println!("cleared operation {op}");
                }
                None => {
                    cache.clear()?;
                    println!("cleared cache");
                }
            }
        }
    }
    Ok(())
}

fn ledger(cmd: LedgerCmd) -> Result<()> {
    match cmd {
        LedgerCmd::Show { db, json } => {
            let ledger = RunLedger::open(&db)?;
            let records = ledger.all()?;
            if json {
                let value: serde_json::Value = records
                    .iter()
                    .map(|(task, rec)| (task.clone(), serde_json::to_value(rec).unwrap_or_default()))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("ledger is empty");
                return Ok(());
            }
            for (task, rec) in records {
                let at = rec
                    .last_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{task}: {} attempts={} at={at} {}",
                    rec.status.as_str(),
                    rec.attempts,
                    rec.note
                );
            }
        }
        LedgerCmd::Reset { db, task } => {
            let ledger = RunLedger::open(&db)?;
            if ledger.reset(&task)? {
                println!("reset {task}");
            } else {
                println!("no record for {task}");
            }
        }
    }
    Ok(())
}

fn catalog(cmd: CatalogCmd) -> Result<()> {
    match cmd {
        CatalogCmd::Check { path } => {
            let catalog = SeriesCatalog::load(&path)?;
            if catalog.is_empty() {
                bail!("catalog has no series entries");
            }
            println!("ok: {} series", catalog.len());
            for id in catalog.ids() {
                let entry = catalog.get(id).expect("listed id");
                println!("  {id} ({})", entry.periodicity);
            }
        }
    }
    Ok(())
}
