// 🚚 Reconciliation Pipeline
// raw tracking groups → merge → costs → snapshot import → ranking
//
// `reconcile` is the pure core: everything it needs is passed in, and the
// only call that can fail is a per-order lookup, which is skipped on error.
// `Reconciler` gathers those inputs from the collaborator traits and uploads
// the ranked result.

use crate::cluster::{CancelledItem, Cluster, GroupFilter, TrackingGroup};
use crate::costs::{CostReconciler, OrderCostReport, ReviewStatus, StatusThresholds, TrackedCostReport};
use crate::merge::{ClusterArena, MergeReport};
use crate::ranking::rank;
use crate::snapshot::{ImportReport, SnapshotImporter};
use crate::sources::{
    CancellationSource, CarrierCosts, CarrierDataSource, OrderInfoSource, PurchaseOrderSource,
    SnapshotStore,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

// ============================================================================
// INPUTS & OUTPUTS
// ============================================================================

/// Everything `reconcile` needs besides the tracking groups and order lookups
#[derive(Debug, Clone, Default)]
pub struct ReconcileInputs {
    pub carrier: CarrierCosts,
    pub tracking_purchase_orders: HashMap<String, String>,
    pub cancellations: HashMap<String, Vec<CancelledItem>>,
    pub snapshot: Vec<Cluster>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub clusters: usize,
    pub merges: MergeReport,
    pub orders: OrderCostReport,
    pub tracked: TrackedCostReport,
    pub imports: ImportReport,
    pub purchase_orders_added: usize,
    pub cancelled_items: usize,
    pub failed_groups: Vec<String>,
    pub statuses: BTreeMap<ReviewStatus, usize>,
}

impl RunReport {
    pub fn status_count(&self, status: ReviewStatus) -> usize {
        self.statuses.get(&status).copied().unwrap_or(0)
    }

    pub fn needs_review(&self) -> usize {
        self.statuses
            .iter()
            .filter(|(status, _)| status.needs_review())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} clusters ({} merged), {} need review, {} failed order lookups, {} failed groups, review flags imported {} / withheld {}",
            self.clusters,
            self.merges.absorbed,
            self.needs_review(),
            self.orders.failed_orders.len(),
            self.failed_groups.len(),
            self.imports.flags_imported,
            self.imports.flags_withheld,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Final presentation order
    pub clusters: Vec<Cluster>,
    pub report: RunReport,
}

// ============================================================================
// PURE CORE
// ============================================================================

/// Build, merge, cost, import and rank clusters.
///
/// Merging finishes (orders, then carrier tuples) before any cost is
/// attributed. The PO baseline is imported from the snapshot before the
/// automated PO and tracked-cost pass; adjustments, notes and review flags
/// are imported last, against the final identities.
pub fn reconcile(
    tracking_groups: &[TrackingGroup],
    inputs: &ReconcileInputs,
    order_info: &dyn OrderInfoSource,
    filter: &GroupFilter,
    thresholds: &StatusThresholds,
) -> Reconciliation {
    let mut report = RunReport::default();

    let mut arena = ClusterArena::new();
    for group in tracking_groups.iter().filter(|g| g.reconcile) {
        arena.insert(Cluster::from_tracking_group(group));
    }
    report.merges.add(&arena.merge_by_orders());
    report
        .merges
        .add(&arena.merge_by_trackings_tuples(inputs.carrier.tuples()));
    info!(clusters = arena.len(), absorbed = report.merges.absorbed, "clusters merged");

    let costs = CostReconciler::new(filter.clone());
    report.orders = costs.fill_order_info(&mut arena, order_info);

    let importer = SnapshotImporter::new(&inputs.snapshot);
    let baseline = importer.import_purchase_orders(arena.clusters_mut());
    info!(matched = baseline, snapshot = inputs.snapshot.len(), "manual PO baseline imported");

    report.purchase_orders_added =
        costs.fill_purchase_orders(&mut arena, &inputs.tracking_purchase_orders);
    report.tracked = costs.fill_tracked_costs(&mut arena, &inputs.carrier);
    report.cancelled_items = costs.fill_cancellations(&mut arena, &inputs.cancellations);

    let mut clusters = arena.into_clusters();
    report.imports = importer.import_review_fields(clusters.iter_mut());

    rank(&mut clusters);

    report.clusters = clusters.len();
    for cluster in &clusters {
        *report.statuses.entry(thresholds.classify(cluster)).or_insert(0) += 1;
    }

    Reconciliation { clusters, report }
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Collaborators for one run. Cancellations and scraped POs are optional.
pub struct Sources<'a> {
    pub order_info: &'a dyn OrderInfoSource,
    pub carrier: &'a dyn CarrierDataSource,
    pub cancellations: Option<&'a dyn CancellationSource>,
    pub purchase_orders: Option<&'a dyn PurchaseOrderSource>,
}

pub struct Reconciler {
    /// Every configured group, in configuration order
    groups: Vec<String>,
    filter: GroupFilter,
    thresholds: StatusThresholds,
}

impl Reconciler {
    pub fn new(groups: Vec<String>, filter: GroupFilter, thresholds: StatusThresholds) -> Self {
        Reconciler {
            groups,
            filter,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &StatusThresholds {
        &self.thresholds
    }

    /// Groups whose carrier data this run fetches
    pub fn scoped_groups(&self) -> Vec<&str> {
        self.groups
            .iter()
            .map(String::as_str)
            .filter(|group| self.filter.includes(group))
            .collect()
    }

    /// Collect carrier data, cancellations, scraped POs and the snapshot.
    ///
    /// Returns the inputs plus the groups whose carrier data failed. Only a
    /// failed snapshot download is fatal: carrying on would upload a sheet
    /// with every human edit dropped.
    pub fn gather(
        &self,
        sources: &Sources<'_>,
        store: &dyn SnapshotStore,
    ) -> Result<(ReconcileInputs, Vec<String>)> {
        let mut inputs = ReconcileInputs::default();
        let mut failed_groups = Vec::new();

        if self.filter.is_restricted() {
            info!(groups = ?self.scoped_groups(), "only reconciling selected groups");
        }
        for group in self.scoped_groups() {
            match sources.carrier.trackings_and_costs(group) {
                Ok(costs) => {
                    info!(
                        group,
                        tuples = costs.tuples().len(),
                        purchase_orders = costs.purchase_order_count(),
                        "loaded tracked costs"
                    );
                    inputs.carrier.extend(costs);
                }
                Err(e) => {
                    warn!(group, error = %e, "carrier data unavailable, skipping group");
                    failed_groups.push(group.to_string());
                }
            }
        }

        if let Some(source) = sources.cancellations {
            match source.cancelled_items() {
                Ok(items) => inputs.cancellations = items,
                Err(e) => warn!(error = %e, "cancelled items unavailable, skipping"),
            }
        }

        if let Some(source) = sources.purchase_orders {
            match source.tracking_purchase_orders() {
                Ok(map) => inputs.tracking_purchase_orders = map,
                Err(e) => warn!(error = %e, "purchase order check-ins unavailable, skipping"),
            }
        }

        inputs.snapshot = store
            .download()
            .context("Failed to download previous reconciliation snapshot")?;
        info!(clusters = inputs.snapshot.len(), "downloaded snapshot");

        Ok((inputs, failed_groups))
    }

    /// Gather, reconcile and (unless `dry_run`) upload
    pub fn run(
        &self,
        tracking_groups: &[TrackingGroup],
        sources: &Sources<'_>,
        store: &mut dyn SnapshotStore,
        dry_run: bool,
    ) -> Result<Reconciliation> {
        let (inputs, failed_groups) = self.gather(sources, store)?;

        let mut result = reconcile(
            tracking_groups,
            &inputs,
            sources.order_info,
            &self.filter,
            &self.thresholds,
        );
        result.report.failed_groups = failed_groups;

        if dry_run {
            info!("dry run, snapshot left untouched");
            return Ok(result);
        }

        store
            .upload(&result.clusters)
            .context("Failed to upload reconciliation snapshot")?;
        // The snapshot is already written; a missing audit entry must not fail the run
        let recorded = serde_json::to_value(&result.report)
            .context("Failed to serialize run report")
            .and_then(|data| store.record_event("reconciliation_run", data));
        if let Err(e) = recorded {
            warn!(error = %e, "failed to record reconciliation event");
        }
        info!(clusters = result.clusters.len(), "uploaded reconciliation");

        Ok(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================
