// 📋 Review Sheet
// The human-edited export: one row per cluster, in ranked order.
//
// Reviewers edit Adjustment, Notes, Manual Override, Verified and Below Cost
// in a spreadsheet; everything else is recomputed on the next run. Parsing
// is lenient about the formatting spreadsheets add ($, thousands separators,
// TRUE/FALSE or x for checkboxes).

use crate::cluster::Cluster;
use crate::costs::StatusThresholds;
use crate::loader::{parse_amount, parse_date, parse_flag, split_list};
use crate::sources::SnapshotStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

// ============================================================================
// SHEET ROW
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    #[serde(rename = "Trackings")]
    pub trackings: String,

    #[serde(rename = "Orders", default)]
    pub orders: String,

    #[serde(rename = "Group", default)]
    pub group: String,

    #[serde(rename = "Expected Cost", default)]
    pub expected_cost: String,

    #[serde(rename = "Adjustment", default)]
    pub adjustment: String,

    #[serde(rename = "Email IDs", default)]
    pub email_ids: String,

    #[serde(rename = "Last Ship Date", default)]
    pub last_ship_date: String,

    #[serde(rename = "Non-Reimbursed Trackings", default)]
    pub non_reimbursed_trackings: String,

    #[serde(rename = "Purchase Orders", default)]
    pub purchase_orders: String,

    /// Informational; recomputed from the cancellation source every run
    #[serde(rename = "Cancelled Items", default)]
    pub cancelled_items: String,

    #[serde(rename = "Tracked Cost", default)]
    pub tracked_cost: String,

    #[serde(rename = "Manual Override", default)]
    pub manual_override: String,

    /// Derived; ignored on import
    #[serde(rename = "Total Diff", default)]
    pub total_diff: String,

    #[serde(rename = "Verified", default)]
    pub verified: String,

    #[serde(rename = "Notes", default)]
    pub notes: String,

    /// Derived; ignored on import
    #[serde(rename = "Status", default)]
    pub status: String,

    #[serde(rename = "Below Cost", default)]
    pub below_cost: String,
}

fn join_list<'a, I: IntoIterator<Item = &'a String>>(values: I) -> String {
    values
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn flag(value: bool) -> String {
    if value { "TRUE" } else { "FALSE" }.to_string()
}

fn to_set(cell: &str) -> BTreeSet<String> {
    split_list(cell).into_iter().collect()
}

impl SheetRow {
    pub fn from_cluster(cluster: &Cluster, thresholds: &StatusThresholds) -> Self {
        SheetRow {
            trackings: join_list(&cluster.trackings),
            orders: join_list(&cluster.orders),
            group: cluster.group.clone(),
            expected_cost: format!("{:.2}", cluster.expected_cost),
            adjustment: format!("{:.2}", cluster.adjustment),
            email_ids: join_list(&cluster.email_ids),
            last_ship_date: cluster
                .last_ship_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            non_reimbursed_trackings: join_list(&cluster.non_reimbursed_trackings),
            purchase_orders: join_list(&cluster.purchase_orders),
            cancelled_items: cluster
                .cancelled_items
                .iter()
                .map(|item| item.label())
                .collect::<Vec<_>>()
                .join("; "),
            tracked_cost: format!("{:.2}", cluster.tracked_cost),
            manual_override: flag(cluster.manual_override),
            total_diff: format!("{:.2}", cluster.total_diff()),
            verified: flag(cluster.verified),
            notes: cluster.notes.clone(),
            status: thresholds.classify(cluster).to_string(),
            below_cost: flag(cluster.below_cost),
        }
    }

    /// Rebuild the cluster a reviewer left behind. Derived columns are ignored.
    pub fn to_cluster(&self) -> Result<Cluster> {
        Ok(Cluster {
            trackings: to_set(&self.trackings),
            orders: to_set(&self.orders),
            purchase_orders: to_set(&self.purchase_orders),
            email_ids: to_set(&self.email_ids),
            group: self.group.trim().to_string(),
            expected_cost: parse_amount(&self.expected_cost).context("Expected Cost")?,
            tracked_cost: parse_amount(&self.tracked_cost).context("Tracked Cost")?,
            adjustment: parse_amount(&self.adjustment).context("Adjustment")?,
            non_reimbursed_trackings: to_set(&self.non_reimbursed_trackings),
            cancelled_items: Vec::new(),
            manual_override: parse_flag(&self.manual_override, false).context("Manual Override")?,
            verified: parse_flag(&self.verified, false).context("Verified")?,
            below_cost: parse_flag(&self.below_cost, false).context("Below Cost")?,
            notes: self.notes.trim().to_string(),
            last_ship_date: parse_date(&self.last_ship_date).context("Last Ship Date")?,
        })
    }
}

// ============================================================================
// READ / WRITE
// ============================================================================

pub fn write_sheet<W: Write>(
    writer: W,
    clusters: &[Cluster],
    thresholds: &StatusThresholds,
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for cluster in clusters {
        wtr.serialize(SheetRow::from_cluster(cluster, thresholds))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Rows without trackings are skipped
pub fn read_sheet<R: Read>(reader: R) -> Result<Vec<Cluster>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut clusters = Vec::new();
    for (i, result) in rdr.deserialize().enumerate() {
        let line = i + 2;
        let row: SheetRow = result.with_context(|| format!("Line {}: malformed row", line))?;
        let cluster = row
            .to_cluster()
            .with_context(|| format!("Line {}: invalid cell", line))?;
        if !cluster.trackings.is_empty() {
            clusters.push(cluster);
        }
    }

    Ok(clusters)
}

pub fn export_sheet(path: &Path, clusters: &[Cluster], thresholds: &StatusThresholds) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create sheet {}", path.display()))?;
    write_sheet(file, clusters, thresholds)
        .with_context(|| format!("Failed to write sheet {}", path.display()))
}

pub fn import_sheet(path: &Path) -> Result<Vec<Cluster>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open sheet {}", path.display()))?;
    read_sheet(file).with_context(|| format!("Failed to read sheet {}", path.display()))
}

// ============================================================================
// CSV SNAPSHOT STORE
// ============================================================================

/// Snapshot kept as a single review sheet on disk
#[derive(Debug, Clone)]
pub struct CsvSnapshotStore {
    path: PathBuf,
    thresholds: StatusThresholds,
}

impl CsvSnapshotStore {
    pub fn new(path: PathBuf, thresholds: StatusThresholds) -> Self {
        CsvSnapshotStore { path, thresholds }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for CsvSnapshotStore {
    /// A missing sheet is an empty snapshot (first run)
    fn download(&self) -> Result<Vec<Cluster>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no review sheet yet, starting fresh");
            return Ok(Vec::new());
        }
        import_sheet(&self.path)
    }

    fn upload(&mut self, clusters: &[Cluster]) -> Result<()> {
        export_sheet(&self.path, clusters, &self.thresholds)
    }
}

// ============================================================================
// TESTS
// ============================================================================
