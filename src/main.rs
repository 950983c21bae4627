use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use rusqlite::Connection;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use barrio_warehouse::{
    get_open_conflicts, latest_coverage, resolve_conflict, CsvExtract, EngineConfig, FactTable, ReconciliationEngine,
    SourceBatch,
};

/// Barcelona neighborhood warehouse: territory resolution and fact reconciliation
#[derive(Parser, Debug)]
#[command(name = "barrio-warehouse")]
#[command(version)]
struct Cli {
    /// Config file (falls back to BARRIO_WAREHOUSE_CONFIG, then ./barrio-warehouse.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the warehouse database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the warehouse schema and seed the neighborhood list
    Init,

    /// Reconcile one or more CSV extracts into the warehouse
    Ingest {
        /// Extract files; source id defaults to the file stem
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show coverage of the latest run
    Coverage {
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// List key conflicts waiting for review, or decide one
    Conflicts {
        #[command(subcommand)]
        action: Option<ConflictAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ConflictAction {
    /// Accept the incoming value or keep the warehouse value
    #[command(group(ArgGroup::new("decision").required(true).args(["accept", "reject"])))]
    Resolve {
        /// Conflict id, as shown by `conflicts`
        id: i64,

        /// Write the incoming value over the warehouse value
        #[arg(long)]
        accept: bool,

        /// Keep the warehouse value
        #[arg(long)]
        reject: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barrio_warehouse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Command::Init => run_init(config),
        Command::Ingest { files } => run_ingest(config, files),
        Command::Coverage { json } => run_coverage(config, json),
        Command::Conflicts { action: None } => run_conflicts(config),
        Command::Conflicts {
            action: Some(ConflictAction::Resolve { id, accept, reject }),
        } => run_resolve(config, id, accept && !reject),
    }
}

fn open_warehouse(config: &EngineConfig) -> Result<Connection> {
    Connection::open(&config.db_path)
        .with_context(|| format!("Failed to open warehouse {:?}", config.db_path))
}

fn run_init(config: EngineConfig) -> Result<()> {
    println!("🗄️  Warehouse init - schema + neighborhood list");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let conn = open_warehouse(&config)?;
    let engine = ReconciliationEngine::from_config(config)?;

    let seeded = engine.prepare(&conn)?;
    println!("✓ Database initialized with WAL mode");
    println!(
        "✓ {} barrios in reference list ({} newly seeded)",
        engine.reference().registry.count(),
        seeded
    );
    println!("✓ Alias table version {}", engine.reference().aliases.version());

    Ok(())
}

fn run_ingest(config: EngineConfig, files: Vec<PathBuf>) -> Result<()> {
    println!("📥 Ingest - {} extract(s)", files.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut conn = open_warehouse(&config)?;
    let engine = ReconciliationEngine::from_config(config)?;
    engine.prepare(&conn)?;

    // 1. Extract
    println!("\n📂 Loading extracts...");
    let batches: Vec<SourceBatch> = files
        .iter()
        .map(|path| {
            let batch = SourceBatch::collect(&CsvExtract::from_path(path));
            match &batch {
                SourceBatch::Fetched { source_id, records } => {
                    println!("✓ {}: {} rows", source_id, records.len())
                }
                SourceBatch::Failed { source_id, reason } => {
                    println!("❌ {}: {}", source_id, reason)
                }
            }
            batch
        })
        .collect();

    // 2. Reconcile
    println!("\n⚖️  Reconciling...");
    let report = engine.run(&mut conn, batches)?;

    // 3. Summary
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Run {}", report.run_id);
    println!("✓ Facts written: {} ({} new, {} replaced)", report.facts_written, report.inserted, report.replaced);
    println!("✓ Superseded in batch: {}", report.superseded);

    if !report.schema_violations.is_empty() {
        println!("⚠️  Schema rejections: {}", report.schema_violations.len());
    }
    if !report.apportionment_failures.is_empty() {
        println!("⚠️  Apportionment failures: {}", report.apportionment_failures.len());
    }
    if !report.unresolvable.is_empty() {
        println!("⚠️  Unresolvable labels: {}", report.unresolvable.len());
        for err in report.unresolvable.iter().take(10) {
            println!("   - {}", err);
        }
    }
    if !report.conflicts.is_empty() {
        println!("⚠️  Key conflicts held for review: {}", report.conflicts.len());
    }

    println!("\n📊 Resolution by source/year");
    for line in report.resolution_table() {
        println!("   {}", line);
    }
    println!("\n{}", report.coverage.summary());

    Ok(())
}

fn run_coverage(config: EngineConfig, json: bool) -> Result<()> {
    let conn = open_warehouse(&config)?;

    let Some(report) = latest_coverage(&conn)? else {
        println!("No runs recorded yet. Run: barrio-warehouse ingest <csv>...");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        return Ok(());
    }

    println!("📊 Coverage - run {}", report.run_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for line in report.table_lines() {
        println!("   {}", line);
    }
    println!("\n{}", report.summary());

    for table in FactTable::ALL {
        let count = barrio_warehouse::db::fact_count(&conn, table)?;
        println!("   {:<18} {:>8} rows", table.table_name(), count);
    }

    Ok(())
}

fn run_conflicts(config: EngineConfig) -> Result<()> {
    let conn = open_warehouse(&config)?;
    let conflicts = get_open_conflicts(&conn)?;

    if conflicts.is_empty() {
        println!("✅ No open key conflicts");
        return Ok(());
    }

    println!("⚠️  {} open key conflict(s)", conflicts.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for conflict in conflicts {
        println!(
            "   #{:<4} {}  warehouse {} (run {})  incoming {} (run {})",
            conflict.id,
            conflict.incoming.key(),
            conflict.existing_value,
            conflict.existing_run_id,
            conflict.incoming.value,
            conflict.incoming.run_id
        );
    }
    println!("\nDecide with: barrio-warehouse conflicts resolve <id> --accept|--reject");

    Ok(())
}

fn run_resolve(config: EngineConfig, id: i64, accept: bool) -> Result<()> {
    let conn = open_warehouse(&config)?;
    let conflict = resolve_conflict(&conn, id, accept, "operator")?;

    if accept {
        println!(
            "✓ Conflict #{} accepted: {} = {}",
            id,
            conflict.incoming.key(),
            conflict.incoming.value
        );
    } else {
        println!(
            "✓ Conflict #{} rejected: {} stays {}",
            id,
            conflict.incoming.key(),
            conflict.existing_value
        );
    }

    Ok(())
}
