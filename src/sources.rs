// 🔌 External Collaborators
// Everything the reconciliation core consumes but does not own.
// Each trait is one seam: swap a file adapter for a live one, or for a mock in tests.

use crate::cluster::{CancelledItem, Cluster};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// DATA TYPES
// ============================================================================

/// Result of one order lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub cost: f64,
    pub email_id: Option<String>,
}

impl OrderInfo {
    pub fn new(cost: f64) -> Self {
        OrderInfo {
            cost,
            email_id: None,
        }
    }

    pub fn with_email_id(mut self, email_id: &str) -> Self {
        self.email_id = Some(email_id.to_string());
        self
    }
}

/// Trackings a carrier reports as shipped (and paid) together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingTuple {
    pub trackings: Vec<String>,
    pub cost: f64,
}

impl TrackingTuple {
    pub fn new<I, S>(trackings: I, cost: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TrackingTuple {
            trackings: trackings.into_iter().map(Into::into).collect(),
            cost,
        }
    }

    /// The tracking whose owner receives the tuple's cost
    pub fn first(&self) -> Option<&str> {
        self.trackings.first().map(String::as_str)
    }

    /// Singletons carry no co-shipping information
    pub fn is_mergeable(&self) -> bool {
        self.trackings.len() > 1
    }
}

/// Everything a carrier reports for one or more groups.
///
/// Tuples keep insertion order because merge tie-breaks are first-seen-wins.
/// Re-adding a tuple with the same trackings replaces its cost in place.
#[derive(Debug, Clone, Default)]
pub struct CarrierCosts {
    tuples: Vec<TrackingTuple>,
    positions: HashMap<Vec<String>, usize>,
    purchase_order_costs: HashMap<String, f64>,
}

impl CarrierCosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tuple(&mut self, tuple: TrackingTuple) {
        match self.positions.get(&tuple.trackings) {
            Some(&pos) => self.tuples[pos].cost = tuple.cost,
            None => {
                self.positions
                    .insert(tuple.trackings.clone(), self.tuples.len());
                self.tuples.push(tuple);
            }
        }
    }

    pub fn add_purchase_order(&mut self, purchase_order: &str, cost: f64) {
        self.purchase_order_costs
            .insert(purchase_order.to_string(), cost);
    }

    /// Fold another group's report into this one
    pub fn extend(&mut self, other: CarrierCosts) {
        for tuple in other.tuples {
            self.add_tuple(tuple);
        }
        self.purchase_order_costs.extend(other.purchase_order_costs);
    }

    pub fn tuples(&self) -> &[TrackingTuple] {
        &self.tuples
    }

    /// Known cost of a PO; unpriced POs count as zero
    pub fn purchase_order_cost(&self, purchase_order: &str) -> f64 {
        self.purchase_order_costs
            .get(purchase_order)
            .copied()
            .unwrap_or(0.0)
    }

    /// Whether the carrier reported a price for this PO, zero included
    pub fn is_priced(&self, purchase_order: &str) -> bool {
        self.purchase_order_costs.contains_key(purchase_order)
    }

    pub fn purchase_order_count(&self) -> usize {
        self.purchase_order_costs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.purchase_order_costs.is_empty()
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Commerce backend: cost and email of a single order.
///
/// Calls fail independently; one failure says nothing about the next order.
pub trait OrderInfoSource {
    fn order_info(&self, order_id: &str) -> Result<OrderInfo>;
}

/// Carrier / buying-group site: co-shipped tuples and PO prices for one group
pub trait CarrierDataSource {
    fn trackings_and_costs(&self, group: &str) -> Result<CarrierCosts>;
}

/// Cancelled line items keyed by order ID
pub trait CancellationSource {
    fn cancelled_items(&self) -> Result<HashMap<String, Vec<CancelledItem>>>;
}

/// Purchase orders a buying group assigned to received trackings
pub trait PurchaseOrderSource {
    fn tracking_purchase_orders(&self) -> Result<HashMap<String, String>>;
}

/// Where the previous run's clusters (and the human edits on them) live
pub trait SnapshotStore {
    /// Clusters from the latest upload, in uploaded order
    fn download(&self) -> Result<Vec<Cluster>>;

    /// Replace the snapshot with a freshly ranked cluster list
    fn upload(&mut self, clusters: &[Cluster]) -> Result<()>;

    /// Append an audit entry. Stores without an audit trail ignore it.
    fn record_event(&mut self, _event_type: &str, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

impl OrderInfoSource for HashMap<String, OrderInfo> {
    fn order_info(&self, order_id: &str) -> Result<OrderInfo> {
        self.get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("No order info for order {}", order_id))
    }
}

impl CarrierDataSource for HashMap<String, CarrierCosts> {
    fn trackings_and_costs(&self, group: &str) -> Result<CarrierCosts> {
        self.get(group)
            .cloned()
            .ok_or_else(|| anyhow!("No carrier data for group {}", group))
    }
}

impl CancellationSource for HashMap<String, Vec<CancelledItem>> {
    fn cancelled_items(&self) -> Result<HashMap<String, Vec<CancelledItem>>> {
        Ok(self.clone())
    }
}

impl PurchaseOrderSource for HashMap<String, String> {
    fn tracking_purchase_orders(&self) -> Result<HashMap<String, String>> {
        Ok(self.clone())
    }
}

/// Snapshot kept in memory; used by dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    pub clusters: Vec<Cluster>,
    pub uploads: usize,
}

impl MemorySnapshotStore {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        MemorySnapshotStore {
            clusters,
            uploads: 0,
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn download(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.clone())
    }

    fn upload(&mut self, clusters: &[Cluster]) -> Result<()> {
        self.clusters = clusters.to_vec();
        self.uploads += 1;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
