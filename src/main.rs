use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};

use shipment_recon::loader::{
    load_tracking_groups, CsvCancellations, CsvCarrierData, CsvOrderInfo, CsvPurchaseOrders,
};
use shipment_recon::logging::configure_logging;
use shipment_recon::sheet::{export_sheet, import_sheet};
use shipment_recon::{
    CancellationSource, Cluster, Config, CsvSnapshotStore, PurchaseOrderSource, ReviewStatus,
    SnapshotBackend, SnapshotStore, Sources, SqliteSnapshotStore, StatusThresholds,
};

#[derive(Parser)]
#[clap(name = "shipment-recon", version, about = "Reconcile shipment costs against carrier reimbursements")]
struct Cli {
    /// Path to the TOML configuration
    #[clap(short, long, global = true, default_value = "recon.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild clusters, reconcile costs and upload the ranked snapshot
    Run {
        /// Only recompute tracked costs for these groups
        #[clap(long, num_args = 1..)]
        groups: Vec<String>,

        /// Reconcile and print, but leave the snapshot untouched
        #[clap(long)]
        dry_run: bool,
    },
    /// Print the current snapshot in stored order
    Show {
        #[clap(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Write the current snapshot as an editable review sheet
    Export { path: PathBuf },
    /// Replace the snapshot with an edited review sheet
    Import { path: PathBuf },
    /// List previous uploads (SQLite backend only)
    History {
        #[clap(short, long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_logging(cli.verbose);

    let config = Config::from_file(&cli.config)?;

    match cli.command {
        Commands::Run { groups, dry_run } => run_reconciliation(&config, &groups, dry_run),
        Commands::Show { limit } => run_show(&config, limit),
        Commands::Export { path } => run_export(&config, &path),
        Commands::Import { path } => run_import(&config, &path),
        Commands::History { limit } => run_history(&config, limit),
    }
}

fn open_store(config: &Config) -> Result<Box<dyn SnapshotStore>> {
    let path = config.snapshot_path();
    Ok(match config.snapshot.backend {
        SnapshotBackend::Sqlite => Box::new(SqliteSnapshotStore::open(&path)?),
        SnapshotBackend::Csv => Box::new(CsvSnapshotStore::new(path, config.thresholds)),
    })
}

fn run_reconciliation(config: &Config, groups: &[String], dry_run: bool) -> Result<()> {
    println!("📦 Shipment Reconciliation");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let reconciler = config.reconciler(groups)?;

    println!("\n📂 Loading inputs...");
    let tracking_groups = load_tracking_groups(&config.resolve(&config.inputs.trackings))?;
    let order_info = CsvOrderInfo::from_path(&config.resolve(&config.inputs.orders))?;
    println!(
        "✓ {} tracking groups, {} orders",
        tracking_groups.len(),
        order_info.len()
    );

    let carrier = CsvCarrierData::new(config.carrier_paths());
    let cancellations = config
        .inputs
        .cancellations
        .as_ref()
        .map(|path| CsvCancellations::new(config.resolve(path)));
    let purchase_orders = config
        .inputs
        .purchase_orders
        .as_ref()
        .map(|path| CsvPurchaseOrders::new(config.resolve(path)));

    let sources = Sources {
        order_info: &order_info,
        carrier: &carrier,
        cancellations: cancellations.as_ref().map(|c| c as &dyn CancellationSource),
        purchase_orders: purchase_orders.as_ref().map(|p| p as &dyn PurchaseOrderSource),
    };

    println!("\n🔧 Reconciling groups: {}", reconciler.scoped_groups().join(", "));
    let mut store = open_store(config)?;
    let result = reconciler.run(&tracking_groups, &sources, store.as_mut(), dry_run)?;
    let report = &result.report;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ {}", report.summary());
    for status in ReviewStatus::all() {
        println!("  {:<17} {}", status.as_str(), report.status_count(status));
    }
    if !report.orders.failed_orders.is_empty() {
        println!("⚠️  No order info for: {}", report.orders.failed_orders.join(", "));
    }
    if !report.failed_groups.is_empty() {
        println!("⚠️  Carrier data unavailable for: {}", report.failed_groups.join(", "));
    }

    if dry_run {
        println!("\n🔍 Dry run - top of the review list:");
        print_clusters(&result.clusters, reconciler.thresholds(), 10);
    } else {
        println!("\n✅ Uploaded {} clusters", result.clusters.len());
    }

    Ok(())
}

fn print_clusters(clusters: &[Cluster], thresholds: &StatusThresholds, limit: usize) {
    for cluster in clusters.iter().take(limit) {
        let trackings: Vec<&str> = cluster.trackings.iter().map(String::as_str).collect();
        println!(
            "  {:<17} {:>10.2}  {:<8} {}",
            thresholds.classify(cluster).as_str(),
            cluster.total_diff(),
            cluster.group,
            trackings.join(", ")
        );
    }
    if clusters.len() > limit {
        println!("  ... {} more", clusters.len() - limit);
    }
}

fn run_show(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let clusters = store.download()?;

    if clusters.is_empty() {
        println!("No snapshot yet. Run: shipment-recon run");
        return Ok(());
    }

    println!("📊 {} clusters in snapshot\n", clusters.len());
    print_clusters(&clusters, &config.thresholds, limit);
    Ok(())
}

fn run_export(config: &Config, path: &Path) -> Result<()> {
    let store = open_store(config)?;
    let clusters = store.download()?;
    export_sheet(path, &clusters, &config.thresholds)?;
    println!("✅ Exported {} clusters to {}", clusters.len(), path.display());
    Ok(())
}

fn run_import(config: &Config, path: &Path) -> Result<()> {
    let clusters = import_sheet(path)?;
    let mut store = open_store(config)?;
    store.upload(&clusters)?;
    store.record_event(
        "sheet_imported",
        serde_json::json!({ "path": path.display().to_string(), "clusters": clusters.len() }),
    )?;
    println!("✅ Imported {} clusters from {}", clusters.len(), path.display());
    Ok(())
}

fn run_history(config: &Config, limit: usize) -> Result<()> {
    if config.snapshot.backend != SnapshotBackend::Sqlite {
        bail!("Run history needs the sqlite snapshot backend");
    }

    let store = SqliteSnapshotStore::open(&config.snapshot_path())?;
    let runs = store.history(limit)?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
    }
    for run in runs {
        println!(
            "  {}  {}  {} clusters",
            run.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.cluster_count
        );
    }
    Ok(())
}
