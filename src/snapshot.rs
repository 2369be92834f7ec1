// 📝 Snapshot Override Importer
// Carries human edits from the previous export onto freshly built clusters.
//
// A snapshot cluster is a candidate for a new cluster when their trackings
// intersect. Additive fields (adjustment, notes, POs) aggregate over every
// candidate. Review flags certify one specific identity, so they are only
// imported from a single candidate whose trackings AND orders are exactly
// equal to the new cluster's.

use crate::cluster::{join_notes, Cluster};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

// ============================================================================
// IMPORT REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Clusters with at least one candidate
    pub matched: usize,

    /// Clusters with no candidate (new since the last export)
    pub unmatched: usize,

    /// Clusters whose review flags were imported
    pub flags_imported: usize,

    /// Clusters with candidates whose review flags were withheld
    /// (several candidates, or identity changed since export)
    pub flags_withheld: usize,
}

// ============================================================================
// SNAPSHOT IMPORTER
// ============================================================================

pub struct SnapshotImporter<'a> {
    snapshot: &'a [Cluster],
    by_tracking: HashMap<&'a str, Vec<usize>>,
}

impl<'a> SnapshotImporter<'a> {
    pub fn new(snapshot: &'a [Cluster]) -> Self {
        let mut by_tracking: HashMap<&'a str, Vec<usize>> = HashMap::new();
        for (i, cluster) in snapshot.iter().enumerate() {
            for tracking in &cluster.trackings {
                by_tracking.entry(tracking.as_str()).or_default().push(i);
            }
        }

        SnapshotImporter {
            snapshot,
            by_tracking,
        }
    }

    /// Snapshot clusters sharing at least one tracking, in snapshot order
    pub fn candidates(&self, cluster: &Cluster) -> Vec<&'a Cluster> {
        let positions: BTreeSet<usize> = cluster
            .trackings
            .iter()
            .filter_map(|tracking| self.by_tracking.get(tracking.as_str()))
            .flatten()
            .copied()
            .collect();

        positions.into_iter().map(|i| &self.snapshot[i]).collect()
    }

    /// Manual PO baseline.
    ///
    /// Purchase orders and non-reimbursed trackings are the union over all
    /// candidates; tracked cost is their sum. Automated PO and cost filling
    /// runs afterwards on top of this baseline.
    pub fn import_purchase_orders<'c, I>(&self, clusters: I) -> usize
    where
        I: IntoIterator<Item = &'c mut Cluster>,
    {
        let mut matched = 0;

        for cluster in clusters {
            let candidates = self.candidates(cluster);
            if !candidates.is_empty() {
                matched += 1;
            }

            let mut purchase_orders = BTreeSet::new();
            let mut non_reimbursed = BTreeSet::new();
            let mut tracked_cost = 0.0;
            for candidate in &candidates {
                purchase_orders.extend(candidate.purchase_orders.iter().cloned());
                non_reimbursed.extend(candidate.non_reimbursed_trackings.iter().cloned());
                tracked_cost += candidate.tracked_cost;
            }

            cluster.purchase_orders = purchase_orders;
            cluster.non_reimbursed_trackings = non_reimbursed;
            cluster.tracked_cost = tracked_cost;
            cluster.retain_own_non_reimbursed();
        }

        matched
    }

    /// Adjustment, notes and review flags
    pub fn import_review_fields<'c, I>(&self, clusters: I) -> ImportReport
    where
        I: IntoIterator<Item = &'c mut Cluster>,
    {
        let mut report = ImportReport::default();

        for cluster in clusters {
            let candidates = self.candidates(cluster);
            if candidates.is_empty() {
                report.unmatched += 1;
            } else {
                report.matched += 1;
            }

            cluster.adjustment = candidates.iter().map(|c| c.adjustment).sum();
            cluster.notes = join_notes(candidates.iter().map(|c| c.notes.as_str()));

            match candidates.as_slice() {
                [only] if only.same_identity(cluster) => {
                    cluster.manual_override = only.manual_override;
                    cluster.verified = only.verified;
                    cluster.below_cost = only.below_cost;
                    report.flags_imported += 1;
                }
                [] => {}
                _ => {
                    debug!(
                        candidates = candidates.len(),
                        trackings = cluster.trackings.len(),
                        "identity changed since export, review flags withheld"
                    );
                    report.flags_withheld += 1;
                }
            }
        }

        report
    }
}

// ============================================================================
// TESTS
// ============================================================================
