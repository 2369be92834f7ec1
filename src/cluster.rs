// 📦 Cluster - One physical shipment
// Identity = trackings ∪ orders. Cost fields are filled in by the pipeline,
// review fields only ever come from a human-edited snapshot.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// ============================================================================
// RAW INPUT
// ============================================================================

/// Trackings known to belong together, e.g. from a single order-info lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingGroup {
    pub trackings: BTreeSet<String>,
    pub orders: BTreeSet<String>,
    pub group: String,
    pub ship_date: Option<NaiveDate>,

    /// Rows flagged `false` are tracked but never reconciled
    #[serde(default = "default_reconcile")]
    pub reconcile: bool,
}

fn default_reconcile() -> bool {
    true
}

impl TrackingGroup {
    pub fn new<T, O>(group: &str, trackings: T, orders: O) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        TrackingGroup {
            trackings: trackings.into_iter().map(Into::into).collect(),
            orders: orders.into_iter().map(Into::into).collect(),
            group: group.to_string(),
            ship_date: None,
            reconcile: true,
        }
    }

    pub fn with_ship_date(mut self, date: NaiveDate) -> Self {
        self.ship_date = Some(date);
        self
    }
}

/// A cancelled line item. Informational only, never part of cost arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledItem {
    pub order_id: String,
    pub description: String,
    pub quantity: u32,
}

impl CancelledItem {
    /// Short form used in exported sheets: `O1: Widget x2`
    pub fn label(&self) -> String {
        format!("{}: {} x{}", self.order_id, self.description, self.quantity)
    }
}

// ============================================================================
// CLUSTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cluster {
    // Identity
    pub trackings: BTreeSet<String>,
    pub orders: BTreeSet<String>,

    pub purchase_orders: BTreeSet<String>,
    pub email_ids: BTreeSet<String>,
    pub group: String,

    // Costs
    pub expected_cost: f64,
    pub tracked_cost: f64,
    pub adjustment: f64,
    pub non_reimbursed_trackings: BTreeSet<String>,
    pub cancelled_items: Vec<CancelledItem>,

    // Human review fields
    pub manual_override: bool,
    pub verified: bool,
    pub below_cost: bool,
    pub notes: String,

    pub last_ship_date: Option<NaiveDate>,
}

impl Cluster {
    pub fn new(group: &str) -> Self {
        Cluster {
            group: group.to_string(),
            ..Default::default()
        }
    }

    pub fn from_tracking_group(tracking_group: &TrackingGroup) -> Self {
        Cluster {
            trackings: tracking_group.trackings.clone(),
            orders: tracking_group.orders.clone(),
            group: tracking_group.group.clone(),
            last_ship_date: tracking_group.ship_date,
            ..Default::default()
        }
    }

    /// `tracked + adjustment - expected`, or 0 once a human has certified
    /// the cluster with a manual override.
    pub fn total_diff(&self) -> f64 {
        if self.manual_override {
            return 0.0;
        }
        self.tracked_cost + self.adjustment - self.expected_cost
    }

    /// Both trackings and orders are contained in `other`
    pub fn is_subset_of(&self, other: &Cluster) -> bool {
        self.trackings.is_subset(&other.trackings) && self.orders.is_subset(&other.orders)
    }

    /// Exactly the same trackings and orders
    pub fn same_identity(&self, other: &Cluster) -> bool {
        self.trackings == other.trackings && self.orders == other.orders
    }

    pub fn shares_tracking_with(&self, other: &Cluster) -> bool {
        !self.trackings.is_disjoint(&other.trackings)
    }

    /// Union `other` into `self`.
    ///
    /// Identity sets only grow. Costs and adjustments add up, notes are
    /// joined, the later ship date wins. Review flags are cleared: they
    /// certified an identity that no longer exists.
    pub fn merge_with(&mut self, other: Cluster) {
        self.trackings.extend(other.trackings);
        self.orders.extend(other.orders);
        self.purchase_orders.extend(other.purchase_orders);
        self.email_ids.extend(other.email_ids);
        self.non_reimbursed_trackings
            .extend(other.non_reimbursed_trackings);
        self.cancelled_items.extend(other.cancelled_items);

        self.expected_cost += other.expected_cost;
        self.tracked_cost += other.tracked_cost;
        self.adjustment += other.adjustment;

        self.notes = join_notes([self.notes.as_str(), other.notes.as_str()]);

        self.last_ship_date = match (self.last_ship_date, other.last_ship_date) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        self.clear_review_flags();
    }

    pub fn clear_review_flags(&mut self) {
        self.manual_override = false;
        self.verified = false;
        self.below_cost = false;
    }

    /// Drop any non-reimbursed tracking that is not part of this cluster
    pub fn retain_own_non_reimbursed(&mut self) {
        let trackings = &self.trackings;
        self.non_reimbursed_trackings
            .retain(|tracking| trackings.contains(tracking));
    }

    /// SHA-256 over the sorted identity sets.
    /// Stable across runs for an unchanged identity, used as the storage key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for tracking in &self.trackings {
            hasher.update(tracking.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
        for order in &self.orders {
            hasher.update(order.as_bytes());
            hasher.update(b"\x1f");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Join non-blank notes with `"; "`
pub fn join_notes<'a, I>(notes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    notes
        .into_iter()
        .filter(|note| !note.trim().is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// GROUP FILTER
// ============================================================================

/// Restricts which buying groups a run recomputes (`--groups`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupFilter {
    groups: Option<BTreeSet<String>>,
}

impl GroupFilter {
    /// Every group is in scope
    pub fn all() -> Self {
        GroupFilter { groups: None }
    }

    pub fn only<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupFilter {
            groups: Some(groups.into_iter().map(Into::into).collect()),
        }
    }

    pub fn includes(&self, group: &str) -> bool {
        match &self.groups {
            Some(groups) => groups.contains(group),
            None => true,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.groups.is_some()
    }
}

// ============================================================================
// TESTS
// ============================================================================
