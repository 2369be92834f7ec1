// ⚖️ Cost Reconciliation
// Folds three independent cost signals into one state per cluster:
//
//   diff = tracked_cost + adjustment - expected_cost
//
// expected_cost  → order-info lookups (demand side)
// tracked_cost   → carrier tuples + purchase-order prices (supply side)
// adjustment     → human correction imported from the snapshot
//
// Lookups are best-effort: a failed order or group is logged and skipped,
// the partial sum stands.

use crate::cluster::{CancelledItem, Cluster, GroupFilter};
use crate::merge::ClusterArena;
use crate::sources::{CarrierCosts, OrderInfoSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

// ============================================================================
// REVIEW STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReviewStatus {
    /// A human certified the cluster with a manual override
    Certified,

    /// Reimbursement matches the expected cost (within tolerance)
    Balanced,

    /// Overcompensated by no more than the configured ratio of expected cost
    SlightlyOver,

    /// Reimbursed more than expected
    Overcompensated,

    /// Reimbursed less than expected - needs review
    Undercompensated,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Certified => "Certified",
            ReviewStatus::Balanced => "Balanced",
            ReviewStatus::SlightlyOver => "Slightly Over",
            ReviewStatus::Overcompensated => "Overcompensated",
            ReviewStatus::Undercompensated => "Undercompensated",
        }
    }

    pub fn needs_review(&self) -> bool {
        matches!(self, ReviewStatus::Undercompensated | ReviewStatus::Overcompensated)
    }

    pub fn all() -> [ReviewStatus; 5] {
        [
            ReviewStatus::Certified,
            ReviewStatus::Balanced,
            ReviewStatus::SlightlyOver,
            ReviewStatus::Overcompensated,
            ReviewStatus::Undercompensated,
        ]
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusThresholds {
    /// |diff| at or below this counts as balanced (default: $0.01)
    pub balance_tolerance: f64,

    /// Overcompensation up to this share of expected cost is "slightly over" (default: 5%)
    pub overcompensation_ratio: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        StatusThresholds {
            balance_tolerance: 0.01,
            overcompensation_ratio: 0.05,
        }
    }
}

impl StatusThresholds {
    pub fn classify(&self, cluster: &Cluster) -> ReviewStatus {
        if cluster.manual_override {
            return ReviewStatus::Certified;
        }

        let diff = cluster.total_diff();
        if diff.abs() <= self.balance_tolerance {
            ReviewStatus::Balanced
        } else if diff < 0.0 {
            ReviewStatus::Undercompensated
        } else if diff <= cluster.expected_cost * self.overcompensation_ratio {
            ReviewStatus::SlightlyOver
        } else {
            ReviewStatus::Overcompensated
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderCostReport {
    pub orders_priced: usize,
    pub failed_orders: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedCostReport {
    /// Tuples whose first tracking resolved to an in-scope cluster
    pub tuples_attributed: usize,

    /// Tuples with no owner (or an out-of-scope owner)
    pub tuples_unattributed: usize,

    pub purchase_orders_priced: usize,
    pub purchase_orders_unpriced: usize,
}

// ============================================================================
// COST RECONCILER
// ============================================================================

pub struct CostReconciler {
    filter: GroupFilter,
}

impl CostReconciler {
    pub fn new(filter: GroupFilter) -> Self {
        CostReconciler { filter }
    }

    /// Expected cost and email IDs from per-order lookups.
    ///
    /// A failing order is skipped with a warning; the rest of the cluster
    /// (and the run) carries on with the partial sum.
    pub fn fill_order_info(
        &self,
        arena: &mut ClusterArena,
        source: &dyn OrderInfoSource,
    ) -> OrderCostReport {
        let mut report = OrderCostReport::default();

        for cluster in arena.clusters_mut() {
            cluster.expected_cost = 0.0;
            cluster.email_ids.clear();

            for order_id in &cluster.orders {
                match source.order_info(order_id) {
                    Ok(info) => {
                        if let Some(email_id) = info.email_id {
                            cluster.email_ids.insert(email_id);
                        }
                        cluster.expected_cost += info.cost;
                        report.orders_priced += 1;
                    }
                    Err(e) => {
                        warn!(
                            order_id = %order_id,
                            error = %e,
                            "order info lookup failed, check the oldest email for this order; skipping"
                        );
                        report.failed_orders.push(order_id.clone());
                    }
                }
            }
        }

        report
    }

    /// Add purchase orders a buying group assigned to the cluster's trackings
    pub fn fill_purchase_orders(
        &self,
        arena: &mut ClusterArena,
        tracking_to_po: &HashMap<String, String>,
    ) -> usize {
        let mut added = 0;

        for cluster in arena.clusters_mut() {
            if !self.filter.includes(&cluster.group) {
                continue;
            }
            for tracking in &cluster.trackings {
                if let Some(po) = tracking_to_po.get(tracking) {
                    if cluster.purchase_orders.insert(po.clone()) {
                        added += 1;
                    }
                }
            }
        }

        added
    }

    /// Recompute tracked cost for in-scope clusters.
    ///
    /// Run only after every merge pass: each tuple's whole cost goes to the
    /// owner of its first tracking. PO prices are added on top.
    pub fn fill_tracked_costs(
        &self,
        arena: &mut ClusterArena,
        carrier: &CarrierCosts,
    ) -> TrackedCostReport {
        let mut report = TrackedCostReport::default();

        for cluster in arena.clusters_mut() {
            if !self.filter.includes(&cluster.group) {
                continue;
            }
            cluster.non_reimbursed_trackings = cluster.trackings.clone();
            cluster.tracked_cost = 0.0;
        }

        for tuple in carrier.tuples() {
            let owner = tuple.first().and_then(|first| arena.owner_of(first));
            let Some(cluster) = owner.and_then(|id| arena.get_mut(id)) else {
                report.tuples_unattributed += 1;
                continue;
            };
            if !self.filter.includes(&cluster.group) {
                debug!(group = %cluster.group, "tuple owner out of scope, not attributed");
                report.tuples_unattributed += 1;
                continue;
            }

            cluster.tracked_cost += tuple.cost;
            for tracking in &tuple.trackings {
                cluster.non_reimbursed_trackings.remove(tracking);
            }
            report.tuples_attributed += 1;
        }

        for cluster in arena.clusters_mut() {
            if !self.filter.includes(&cluster.group) {
                continue;
            }
            for po in &cluster.purchase_orders {
                let cost = carrier.purchase_order_cost(po);
                cluster.tracked_cost += cost;
                if carrier.is_priced(po) {
                    report.purchase_orders_priced += 1;
                } else {
                    report.purchase_orders_unpriced += 1;
                }
            }
        }

        report
    }

    /// Attach cancelled items for every order in the cluster
    pub fn fill_cancellations(
        &self,
        arena: &mut ClusterArena,
        cancellations: &HashMap<String, Vec<CancelledItem>>,
    ) -> usize {
        let mut attached = 0;

        for cluster in arena.clusters_mut() {
            cluster.cancelled_items = cluster
                .orders
                .iter()
                .filter_map(|order| cancellations.get(order))
                .flatten()
                .cloned()
                .collect();
            attached += cluster.cancelled_items.len();
        }

        attached
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TrackingGroup;
    use crate::sources::{OrderInfo, TrackingTuple};

    fn arena(groups: &[(&str, &[&str], &[&str])]) -> ClusterArena {
        let groups: Vec<TrackingGroup> = groups
            .iter()
            .map(|(g, t, o)| TrackingGroup::new(g, t.iter().copied(), o.iter().copied()))
            .collect();
        ClusterArena::from_tracking_groups(&groups)
    }

    fn orders(entries: &[(&str, f64)]) -> HashMap<String, OrderInfo> {
        entries
            .iter()
            .map(|(id, cost)| (id.to_string(), OrderInfo::new(*cost).with_email_id(&format!("mail-{}", id))))
            .collect()
    }

    fn cluster_of<'a>(arena: &'a ClusterArena, tracking: &str) -> &'a Cluster {
        arena.get(arena.owner_of(tracking).unwrap()).unwrap()
    }

    #[test]
    fn test_expected_cost_sums_orders() {
        let mut arena = arena(&[("usa", &["tA"], &["O1", "O2"])]);
        let reconciler = CostReconciler::new(GroupFilter::all());

        let report = reconciler.fill_order_info(&mut arena, &orders(&[("O1", 10.0), ("O2", 20.0)]));

        let cluster = cluster_of(&arena, "tA");
        assert_eq!(cluster.expected_cost, 30.0);
        assert_eq!(cluster.email_ids.len(), 2);
        assert_eq!(report.orders_priced, 2);
        assert!(report.failed_orders.is_empty());
    }

    #[test]
    fn test_failed_order_lookup_keeps_partial_sum() {
        let mut arena = arena(&[("usa", &["tA"], &["O1", "O2"])]);
        let reconciler = CostReconciler::new(GroupFilter::all());

        let report = reconciler.fill_order_info(&mut arena, &orders(&[("O1", 10.0)]));

        assert_eq!(cluster_of(&arena, "tA").expected_cost, 10.0);
        assert_eq!(report.failed_orders, vec!["O2".to_string()]);
    }

    #[test]
    fn test_tuple_cost_goes_to_first_tracking_owner() {
        let mut arena = arena(&[("usa", &["A"], &["O1"]), ("usa", &["B"], &["O2"])]);
        let mut carrier = CarrierCosts::new();
        carrier.add_tuple(TrackingTuple::new(["A", "B"], 50.0));
        arena.merge_by_trackings_tuples(carrier.tuples());

        let report = CostReconciler::new(GroupFilter::all()).fill_tracked_costs(&mut arena, &carrier);

        let cluster = cluster_of(&arena, "A");
        assert_eq!(cluster.tracked_cost, 50.0);
        assert!(!cluster.non_reimbursed_trackings.contains("A"));
        assert!(!cluster.non_reimbursed_trackings.contains("B"));
        assert_eq!(report.tuples_attributed, 1);
    }

    #[test]
    fn test_unmatched_trackings_stay_non_reimbursed() {
        let mut arena = arena(&[("usa", &["A", "B"], &["O1"])]);
        let mut carrier = CarrierCosts::new();
        carrier.add_tuple(TrackingTuple::new(["A"], 12.0));
        carrier.add_tuple(TrackingTuple::new(["Z"], 99.0));

        let report = CostReconciler::new(GroupFilter::all()).fill_tracked_costs(&mut arena, &carrier);

        let cluster = cluster_of(&arena, "A");
        assert_eq!(cluster.tracked_cost, 12.0);
        assert!(cluster.non_reimbursed_trackings.contains("B"));
        assert!(cluster.non_reimbursed_trackings.is_subset(&cluster.trackings));
        assert_eq!(report.tuples_unattributed, 1);
    }

    #[test]
    fn test_purchase_order_costs_are_additive() {
        let mut arena = arena(&[("usa", &["A"], &["O1"])]);
        let id = arena.owner_of("A").unwrap();
        let cluster = arena.get_mut(id).unwrap();
        cluster.purchase_orders.insert("PO1".to_string());
        cluster.purchase_orders.insert("PO-unpriced".to_string());

        let mut carrier = CarrierCosts::new();
        carrier.add_tuple(TrackingTuple::new(["A"], 10.0));
        carrier.add_purchase_order("PO1", 15.0);

        let report = CostReconciler::new(GroupFilter::all()).fill_tracked_costs(&mut arena, &carrier);

        assert_eq!(cluster_of(&arena, "A").tracked_cost, 25.0);
        assert_eq!(report.purchase_orders_priced, 1);
        assert_eq!(report.purchase_orders_unpriced, 1);
    }

    #[test]
    fn test_zero_priced_purchase_order_counts_as_priced() {
        let mut arena = arena(&[("usa", &["A"], &["O1"])]);
        let id = arena.owner_of("A").unwrap();
        let cluster = arena.get_mut(id).unwrap();
        cluster.purchase_orders.insert("PO-free".to_string());
        cluster.purchase_orders.insert("PO-missing".to_string());

        let mut carrier = CarrierCosts::new();
        carrier.add_purchase_order("PO-free", 0.0);

        let report = CostReconciler::new(GroupFilter::all()).fill_tracked_costs(&mut arena, &carrier);

        assert_eq!(cluster_of(&arena, "A").tracked_cost, 0.0);
        assert_eq!(report.purchase_orders_priced, 1);
        assert_eq!(report.purchase_orders_unpriced, 1);
    }

    #[test]
    fn test_out_of_scope_clusters_keep_their_costs() {
        let mut arena = arena(&[("usa", &["A"], &["O1"]), ("bfmr", &["B"], &["O2"])]);
        let id = arena.owner_of("B").unwrap();
        arena.get_mut(id).unwrap().tracked_cost = 42.0;

        let mut carrier = CarrierCosts::new();
        carrier.add_tuple(TrackingTuple::new(["A"], 10.0));
        carrier.add_tuple(TrackingTuple::new(["B"], 10.0));

        let report = CostReconciler::new(GroupFilter::only(["usa"])).fill_tracked_costs(&mut arena, &carrier);

        assert_eq!(cluster_of(&arena, "A").tracked_cost, 10.0);
        assert_eq!(cluster_of(&arena, "B").tracked_cost, 42.0);
        assert_eq!(report.tuples_unattributed, 1);
    }

    #[test]
    fn test_fill_purchase_orders_respects_filter() {
        let mut arena = arena(&[("usa", &["A"], &["O1"]), ("bfmr", &["B"], &["O2"])]);
        let tracking_to_po: HashMap<String, String> = [("A", "PO1"), ("B", "PO2")]
            .iter()
            .map(|(t, p)| (t.to_string(), p.to_string()))
            .collect();

        let added = CostReconciler::new(GroupFilter::only(["usa"]))
            .fill_purchase_orders(&mut arena, &tracking_to_po);

        assert_eq!(added, 1);
        assert!(cluster_of(&arena, "A").purchase_orders.contains("PO1"));
        assert!(cluster_of(&arena, "B").purchase_orders.is_empty());
    }

    #[test]
    fn test_cancellations_attached_per_order() {
        let mut arena = arena(&[("usa", &["A"], &["O1", "O2"])]);
        let mut cancellations = HashMap::new();
        cancellations.insert(
            "O2".to_string(),
            vec![CancelledItem {
                order_id: "O2".to_string(),
                description: "Widget".to_string(),
                quantity: 2,
            }],
        );

        let attached = CostReconciler::new(GroupFilter::all()).fill_cancellations(&mut arena, &cancellations);

        assert_eq!(attached, 1);
        assert_eq!(cluster_of(&arena, "A").cancelled_items[0].description, "Widget");
    }

    #[test]
    fn test_review_status_classification() {
        let thresholds = StatusThresholds::default();
        let mut cluster = Cluster::new("usa");
        cluster.expected_cost = 100.0;

        cluster.tracked_cost = 100.0;
        assert_eq!(thresholds.classify(&cluster), ReviewStatus::Balanced);

        cluster.tracked_cost = 104.0;
        assert_eq!(thresholds.classify(&cluster), ReviewStatus::SlightlyOver);

        cluster.tracked_cost = 120.0;
        assert_eq!(thresholds.classify(&cluster), ReviewStatus::Overcompensated);

        cluster.tracked_cost = 40.0;
        assert_eq!(thresholds.classify(&cluster), ReviewStatus::Undercompensated);
        assert!(ReviewStatus::Undercompensated.needs_review());

        cluster.manual_override = true;
        assert_eq!(thresholds.classify(&cluster), ReviewStatus::Certified);
    }

    #[test]
    fn test_scenario_undercompensated_by_five() {
        let mut arena = arena(&[("usa", &["tA"], &["O1", "O2"])]);
        let reconciler = CostReconciler::new(GroupFilter::all());
        reconciler.fill_order_info(&mut arena, &orders(&[("O1", 10.0), ("O2", 20.0)]));

        let mut carrier = CarrierCosts::new();
        carrier.add_tuple(TrackingTuple::new(["tA"], 25.0));
        reconciler.fill_tracked_costs(&mut arena, &carrier);

        let cluster = cluster_of(&arena, "tA");
        assert_eq!(cluster.total_diff(), -5.0);
        assert_eq!(
            StatusThresholds::default().classify(cluster),
            ReviewStatus::Undercompensated
        );
    }
}
