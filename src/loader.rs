// 📂 CSV Sources
// File-backed implementations of the collaborator traits.
//
// Every input is a headed CSV. Cells holding several values use commas,
// semicolons or whitespace as separators; amounts may carry `$` and
// thousands separators.

use crate::cluster::{CancelledItem, TrackingGroup};
use crate::sources::{
    CancellationSource, CarrierCosts, CarrierDataSource, OrderInfo, OrderInfoSource,
    PurchaseOrderSource, TrackingTuple,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// CELL PARSING
// ============================================================================

/// Split a multi-value cell; blanks are dropped
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `$1,234.50`, `-3.2`, `(4.00)`; blank is 0
pub fn parse_amount(cell: &str) -> Result<f64> {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return Ok(0.0);
    }

    let (negative, digits) = match cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, cleaned.as_str()),
    };

    let value: f64 = digits
        .parse()
        .with_context(|| format!("Invalid amount: '{}'", cell))?;
    if !value.is_finite() {
        bail!("Invalid amount: '{}'", cell);
    }

    Ok(if negative { -value } else { value })
}

/// Checkbox-style cell. Blank yields `default`.
pub fn parse_flag(cell: &str, default: bool) -> Result<bool> {
    match cell.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "true" | "yes" | "y" | "x" | "1" => Ok(true),
        "false" | "no" | "n" | "0" => Ok(false),
        other => Err(anyhow!("Invalid flag: '{}'", other)),
    }
}

/// ISO (`2024-05-01`) or US (`05/01/2024`) date; blank is `None`
pub fn parse_date(cell: &str) -> Result<Option<NaiveDate>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }

    NaiveDate::parse_from_str(cell, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(cell, "%m/%d/%Y"))
        .map(Some)
        .with_context(|| format!("Invalid date: '{}'", cell))
}

fn open_csv(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))
}

// ============================================================================
// TRACKING GROUPS
// ============================================================================

#[derive(Debug, Deserialize)]
struct TrackingRow {
    #[serde(rename = "Tracking")]
    tracking: String,

    #[serde(rename = "Order_IDs")]
    orders: String,

    #[serde(rename = "Group")]
    group: String,

    #[serde(rename = "Ship_Date", default)]
    ship_date: String,

    #[serde(rename = "Reconcile", default)]
    reconcile: String,
}

pub fn load_tracking_groups(path: &Path) -> Result<Vec<TrackingGroup>> {
    let rdr = open_csv(path)?;
    read_tracking_groups(rdr)
        .with_context(|| format!("Failed to load tracking groups from {}", path.display()))
}

pub fn read_tracking_groups<R: Read>(mut rdr: csv::Reader<R>) -> Result<Vec<TrackingGroup>> {
    let mut groups = Vec::new();

    for (i, result) in rdr.deserialize().enumerate() {
        let line = i + 2;
        let row: TrackingRow = result.with_context(|| format!("Line {}: malformed row", line))?;

        let trackings = split_list(&row.tracking);
        if trackings.is_empty() {
            warn!(line, "tracking row without trackings, skipping");
            continue;
        }

        let mut group = TrackingGroup::new(&row.group, trackings, split_list(&row.orders));
        group.ship_date = parse_date(&row.ship_date).with_context(|| format!("Line {}", line))?;
        group.reconcile = parse_flag(&row.reconcile, true).with_context(|| format!("Line {}", line))?;
        groups.push(group);
    }

    debug!(groups = groups.len(), "loaded tracking groups");
    Ok(groups)
}

// ============================================================================
// ORDER INFO
// ============================================================================

#[derive(Debug, Deserialize)]
struct OrderRow {
    #[serde(rename = "Order_ID")]
    order_id: String,

    #[serde(rename = "Cost")]
    cost: String,

    #[serde(rename = "Email_ID", default)]
    email_id: String,
}

/// Order costs exported from the commerce backend
#[derive(Debug, Clone, Default)]
pub struct CsvOrderInfo {
    orders: HashMap<String, OrderInfo>,
}

impl CsvOrderInfo {
    pub fn from_path(path: &Path) -> Result<Self> {
        let rdr = open_csv(path)?;
        Self::from_reader(rdr)
            .with_context(|| format!("Failed to load order info from {}", path.display()))
    }

    pub fn from_reader<R: Read>(mut rdr: csv::Reader<R>) -> Result<Self> {
        let mut orders = HashMap::new();

        for (i, result) in rdr.deserialize().enumerate() {
            let line = i + 2;
            let row: OrderRow = result.with_context(|| format!("Line {}: malformed row", line))?;
            let cost = parse_amount(&row.cost).with_context(|| format!("Line {}", line))?;

            let mut info = OrderInfo::new(cost);
            if !row.email_id.is_empty() {
                info = info.with_email_id(&row.email_id);
            }
            orders.insert(row.order_id, info);
        }

        Ok(CsvOrderInfo { orders })
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl OrderInfoSource for CsvOrderInfo {
    fn order_info(&self, order_id: &str) -> Result<OrderInfo> {
        self.orders.order_info(order_id)
    }
}

// ============================================================================
// CARRIER DATA
// ============================================================================

#[derive(Debug, Deserialize)]
struct CarrierRow {
    #[serde(rename = "Trackings", default)]
    trackings: String,

    #[serde(rename = "Purchase_Order", default)]
    purchase_order: String,

    #[serde(rename = "Cost")]
    cost: String,
}

/// One carrier export per buying group.
///
/// A row with trackings is a co-shipped tuple. A row with only a purchase
/// order prices that PO.
#[derive(Debug, Clone, Default)]
pub struct CsvCarrierData {
    paths: BTreeMap<String, PathBuf>,
}

impl CsvCarrierData {
    pub fn new(paths: BTreeMap<String, PathBuf>) -> Self {
        CsvCarrierData { paths }
    }

    pub fn read<R: Read>(mut rdr: csv::Reader<R>) -> Result<CarrierCosts> {
        let mut costs = CarrierCosts::new();

        for (i, result) in rdr.deserialize().enumerate() {
            let line = i + 2;
            let row: CarrierRow = result.with_context(|| format!("Line {}: malformed row", line))?;
            let cost = parse_amount(&row.cost).with_context(|| format!("Line {}", line))?;

            let trackings = split_list(&row.trackings);
            if !trackings.is_empty() {
                costs.add_tuple(TrackingTuple::new(trackings, cost));
            } else if !row.purchase_order.is_empty() {
                costs.add_purchase_order(&row.purchase_order, cost);
            } else {
                warn!(line, "carrier row without trackings or purchase order, skipping");
            }
        }

        Ok(costs)
    }
}

impl CarrierDataSource for CsvCarrierData {
    fn trackings_and_costs(&self, group: &str) -> Result<CarrierCosts> {
        let path = self
            .paths
            .get(group)
            .ok_or_else(|| anyhow!("No carrier export configured for group {}", group))?;

        let rdr = open_csv(path)?;
        Self::read(rdr).with_context(|| format!("Failed to load carrier data from {}", path.display()))
    }
}

// ============================================================================
// CANCELLATIONS
// ============================================================================

#[derive(Debug, Deserialize)]
struct CancellationRow {
    #[serde(rename = "Order_ID")]
    order_id: String,

    #[serde(rename = "Item")]
    item: String,

    #[serde(rename = "Quantity", default)]
    quantity: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CsvCancellations {
    path: PathBuf,
}

impl CsvCancellations {
    pub fn new(path: PathBuf) -> Self {
        CsvCancellations { path }
    }

    pub fn read<R: Read>(mut rdr: csv::Reader<R>) -> Result<HashMap<String, Vec<CancelledItem>>> {
        let mut items: HashMap<String, Vec<CancelledItem>> = HashMap::new();

        for (i, result) in rdr.deserialize().enumerate() {
            let row: CancellationRow =
                result.with_context(|| format!("Line {}: malformed row", i + 2))?;

            items.entry(row.order_id.clone()).or_default().push(CancelledItem {
                order_id: row.order_id,
                description: row.item,
                quantity: row.quantity.unwrap_or(1),
            });
        }

        Ok(items)
    }
}

impl CancellationSource for CsvCancellations {
    fn cancelled_items(&self) -> Result<HashMap<String, Vec<CancelledItem>>> {
        let rdr = open_csv(&self.path)?;
        Self::read(rdr)
            .with_context(|| format!("Failed to load cancellations from {}", self.path.display()))
    }
}

// ============================================================================
// PURCHASE ORDER CHECK-INS
// ============================================================================

#[derive(Debug, Deserialize)]
struct PurchaseOrderRow {
    #[serde(rename = "Tracking")]
    tracking: String,

    #[serde(rename = "Purchase_Order")]
    purchase_order: String,
}

/// Tracking → purchase order as reported by the buying group's receiving desk
#[derive(Debug, Clone)]
pub struct CsvPurchaseOrders {
    path: PathBuf,
}

impl CsvPurchaseOrders {
    pub fn new(path: PathBuf) -> Self {
        CsvPurchaseOrders { path }
    }

    pub fn read<R: Read>(mut rdr: csv::Reader<R>) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();

        for (i, result) in rdr.deserialize().enumerate() {
            let row: PurchaseOrderRow =
                result.with_context(|| format!("Line {}: malformed row", i + 2))?;
            if row.tracking.is_empty() || row.purchase_order.is_empty() {
                continue;
            }
            map.insert(row.tracking, row.purchase_order);
        }

        Ok(map)
    }
}

impl PurchaseOrderSource for CsvPurchaseOrders {
    fn tracking_purchase_orders(&self) -> Result<HashMap<String, String>> {
        let rdr = open_csv(&self.path)?;
        Self::read(rdr)
            .with_context(|| format!("Failed to load purchase orders from {}", self.path.display()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
