// 🔗 Cluster Merge Engine
// Arena of clusters + explicit tracking → cluster index.
//
// Absorbing a cluster retires its slot and repoints every index entry to the
// survivor, so a stale handle can never observe a half-merged cluster.
// First-seen wins on every merge key.

use crate::cluster::{Cluster, TrackingGroup};
use crate::sources::TrackingTuple;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// CLUSTER HANDLE
// ============================================================================

/// Position of a cluster in the arena. Only valid while the slot is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(usize);

impl ClusterId {
    pub fn index(self) -> usize {
        self.0
    }
}

// ============================================================================
// MERGE REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Merge keys (shared order, shared tracking, carrier tuple) that resolved to a cluster
    pub keys_resolved: usize,

    /// Clusters unioned into a survivor
    pub absorbed: usize,

    /// Clusters retired because the survivor already contained them
    pub retired_subsets: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.absorbed > 0 || self.retired_subsets > 0
    }

    pub fn add(&mut self, other: &MergeReport) {
        self.keys_resolved += other.keys_resolved;
        self.absorbed += other.absorbed;
        self.retired_subsets += other.retired_subsets;
    }
}

// ============================================================================
// CLUSTER ARENA
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ClusterArena {
    slots: Vec<Option<Cluster>>,

    /// tracking → owner. May also hold trackings a carrier tuple reported
    /// that no cluster lists; those resolve to the tuple's target.
    by_tracking: HashMap<String, ClusterId>,
}

impl ClusterArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// One cluster per reconcilable group, then merge clusters sharing an order
    pub fn from_tracking_groups(groups: &[TrackingGroup]) -> Self {
        let mut arena = ClusterArena::new();
        for group in groups.iter().filter(|g| g.reconcile) {
            arena.insert(Cluster::from_tracking_group(group));
        }
        arena.merge_by_orders();
        arena
    }

    /// Add a cluster. If any of its trackings is already owned, it is merged
    /// into the earliest owner and that owner's id is returned.
    pub fn insert(&mut self, cluster: Cluster) -> ClusterId {
        let mut owners: Vec<ClusterId> = cluster
            .trackings
            .iter()
            .filter_map(|tracking| self.by_tracking.get(tracking).copied())
            .collect();
        owners.sort();
        owners.dedup();

        let id = ClusterId(self.slots.len());
        self.slots.push(Some(cluster));

        if owners.is_empty() {
            self.index_trackings(id);
            return id;
        }

        owners.push(id);
        let mut report = MergeReport::default();
        self.merge_all(&owners, &mut report)
    }

    // ------------------------------------------------------------------------
    // Merge passes
    // ------------------------------------------------------------------------

    /// Transitively merge clusters that share an order ID
    pub fn merge_by_orders(&mut self) -> MergeReport {
        let mut report = MergeReport::default();
        let mut by_order: HashMap<String, ClusterId> = HashMap::new();

        for id in self.ids() {
            let Some(cluster) = self.get(id) else {
                continue;
            };

            let mut owners: Vec<ClusterId> = cluster
                .orders
                .iter()
                .filter_map(|order| by_order.get(order).copied())
                .collect();
            owners.sort();
            owners.dedup();

            let target = if owners.is_empty() {
                id
            } else {
                report.keys_resolved += 1;
                owners.push(id);
                self.merge_all(&owners, &mut report)
            };

            if let Some(survivor) = self.get(target) {
                for order in &survivor.orders {
                    by_order.insert(order.clone(), target);
                }
            }
        }

        report
    }

    /// Merge clusters a carrier reports as shipped together.
    ///
    /// Must run over every tuple before any cost is attributed: cost
    /// attribution assumes a stable partition. A tuple that only resolves
    /// through an alias introduced by a later tuple is picked up on the next
    /// pass, so passes repeat until neither the clusters nor the index move.
    /// `keys_resolved` is taken from the final pass.
    pub fn merge_by_trackings_tuples(&mut self, tuples: &[TrackingTuple]) -> MergeReport {
        let mut report = MergeReport::default();

        loop {
            let (pass, index_moved) = self.tuple_pass(tuples);
            report.absorbed += pass.absorbed;
            report.retired_subsets += pass.retired_subsets;
            report.keys_resolved = pass.keys_resolved;

            if !pass.changed() && !index_moved {
                break;
            }
        }

        report
    }

    /// One first-seen-wins sweep. Also reports whether any tracking gained
    /// or changed an owner.
    fn tuple_pass(&mut self, tuples: &[TrackingTuple]) -> (MergeReport, bool) {
        let mut report = MergeReport::default();
        let mut index_moved = false;

        for tuple in tuples.iter().filter(|t| t.is_mergeable()) {
            let resolved: Vec<ClusterId> = tuple
                .trackings
                .iter()
                .filter_map(|tracking| self.by_tracking.get(tracking).copied())
                .collect();

            if resolved.is_empty() {
                continue;
            }
            report.keys_resolved += 1;

            let target = self.merge_all(&resolved, &mut report);
            for tracking in &tuple.trackings {
                if self.by_tracking.insert(tracking.clone(), target) != Some(target) {
                    index_moved = true;
                }
            }
        }

        (report, index_moved)
    }

    /// Absorb `absorbed` into `target` and return the survivor.
    ///
    /// The absorbed slot is emptied; callers must continue with the
    /// returned id. A cluster already contained in the target is retired
    /// without contributing anything.
    pub fn absorb(&mut self, target: ClusterId, absorbed: ClusterId) -> ClusterId {
        let mut report = MergeReport::default();
        self.absorb_into(target, absorbed, &mut report)
    }

    fn absorb_into(
        &mut self,
        target: ClusterId,
        absorbed: ClusterId,
        report: &mut MergeReport,
    ) -> ClusterId {
        if target == absorbed || !self.is_live(absorbed) {
            return target;
        }
        if !self.is_live(target) {
            return absorbed;
        }

        let Some(other) = self.slots[absorbed.0].take() else {
            return target;
        };

        if let Some(survivor) = self.slots[target.0].as_mut() {
            if other.is_subset_of(survivor) {
                report.retired_subsets += 1;
            } else {
                debug!(
                    target = target.0,
                    absorbed = absorbed.0,
                    trackings = other.trackings.len(),
                    orders = other.orders.len(),
                    "absorbing cluster"
                );
                survivor.merge_with(other);
                report.absorbed += 1;
            }
        }

        for owner in self.by_tracking.values_mut() {
            if *owner == absorbed {
                *owner = target;
            }
        }
        self.index_trackings(target);

        target
    }

    /// Fold every id into the first one
    fn merge_all(&mut self, ids: &[ClusterId], report: &mut MergeReport) -> ClusterId {
        let mut unique: Vec<ClusterId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        let mut target = unique[0];
        for other in &unique[1..] {
            target = self.absorb_into(target, *other, report);
        }
        target
    }

    // ------------------------------------------------------------------------
    // Index
    // ------------------------------------------------------------------------

    fn index_trackings(&mut self, id: ClusterId) {
        if let Some(Some(cluster)) = self.slots.get(id.0) {
            for tracking in &cluster.trackings {
                self.by_tracking.insert(tracking.clone(), id);
            }
        }
    }

    /// Rebuild the tracking index from scratch. Carrier aliases are dropped.
    pub fn rebuild_index(&mut self) {
        self.by_tracking.clear();
        for id in self.ids() {
            self.index_trackings(id);
        }
    }

    pub fn owner_of(&self, tracking: &str) -> Option<ClusterId> {
        self.by_tracking.get(tracking).copied()
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    pub fn is_live(&self, id: ClusterId) -> bool {
        matches!(self.slots.get(id.0), Some(Some(_)))
    }

    pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ClusterId) -> Option<&mut Cluster> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live ids in creation order
    pub fn ids(&self) -> Vec<ClusterId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| ClusterId(i))
            .collect()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn clusters_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Surviving clusters in creation order
    pub fn into_clusters(self) -> Vec<Cluster> {
        self.slots.into_iter().flatten().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn group(trackings: &[&str], orders: &[&str]) -> TrackingGroup {
        TrackingGroup::new("usa", trackings.iter().copied(), orders.iter().copied())
    }

    fn owner_trackings(arena: &ClusterArena, tracking: &str) -> Vec<String> {
        let id = arena.owner_of(tracking).unwrap();
        arena.get(id).unwrap().trackings.iter().cloned().collect()
    }

    #[test]
    fn test_groups_become_clusters() {
        let arena = ClusterArena::from_tracking_groups(&[
            group(&["t1"], &["O1"]),
            group(&["t2"], &["O2"]),
        ]);

        assert_eq!(arena.len(), 2);
        assert_ne!(arena.owner_of("t1"), arena.owner_of("t2"));
    }

    #[test]
    fn test_non_reconcilable_groups_skipped() {
        let mut skipped = group(&["t2"], &["O2"]);
        skipped.reconcile = false;

        let arena = ClusterArena::from_tracking_groups(&[group(&["t1"], &["O1"]), skipped]);

        assert_eq!(arena.len(), 1);
        assert!(arena.owner_of("t2").is_none());
    }

    #[test]
    fn test_shared_order_merges_transitively() {
        // t1-O1, t2-O1+O2, t3-O2 → one cluster
        let arena = ClusterArena::from_tracking_groups(&[
            group(&["t1"], &["O1"]),
            group(&["t2"], &["O1", "O2"]),
            group(&["t3"], &["O2"]),
            group(&["t4"], &["O4"]),
        ]);

        assert_eq!(arena.len(), 2);
        assert_eq!(owner_trackings(&arena, "t3"), vec!["t1", "t2", "t3"]);
        assert_eq!(arena.owner_of("t1"), arena.owner_of("t3"));
    }

    #[test]
    fn test_repeated_tracking_merges_into_owner() {
        let arena = ClusterArena::from_tracking_groups(&[
            group(&["t1"], &["O1"]),
            group(&["t1"], &["O9"]),
        ]);

        assert_eq!(arena.len(), 1);
        let cluster = arena.clusters().next().unwrap();
        assert_eq!(cluster.orders.len(), 2);
    }

    #[test]
    fn test_tuple_merges_into_first_resolved() {
        let mut arena = ClusterArena::from_tracking_groups(&[
            group(&["A"], &["O1"]),
            group(&["B"], &["O2"]),
            group(&["C"], &["O3"]),
        ]);
        let first = arena.owner_of("B").unwrap();

        let report =
            arena.merge_by_trackings_tuples(&[TrackingTuple::new(["B", "X", "C"], 20.0)]);

        assert_eq!(report.absorbed, 1);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.owner_of("C"), Some(first));
        // Unknown tracking resolves to the target but is not part of its identity
        assert_eq!(arena.owner_of("X"), Some(first));
        assert!(!arena.get(first).unwrap().trackings.contains("X"));
    }

    #[test]
    fn test_singleton_and_unresolvable_tuples_are_noops() {
        let mut arena = ClusterArena::from_tracking_groups(&[
            group(&["A"], &["O1"]),
            group(&["B"], &["O2"]),
        ]);

        let report = arena.merge_by_trackings_tuples(&[
            TrackingTuple::new(["A"], 5.0),
            TrackingTuple::new(["Y", "Z"], 5.0),
        ]);

        assert!(!report.changed());
        assert_eq!(report.keys_resolved, 0);
        assert_eq!(arena.len(), 2);
        assert!(arena.owner_of("Y").is_none());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut arena = ClusterArena::from_tracking_groups(&[
            group(&["A"], &["O1"]),
            group(&["B"], &["O2"]),
        ]);
        let tuples = vec![TrackingTuple::new(["A", "B"], 10.0)];

        let first = arena.merge_by_trackings_tuples(&tuples);
        let snapshot: Vec<Cluster> = arena.clusters().cloned().collect();
        let second = arena.merge_by_trackings_tuples(&tuples);

        assert!(first.changed());
        assert!(!second.changed());
        assert_eq!(arena.clusters().cloned().collect::<Vec<_>>(), snapshot);
    }

    #[test]
    fn test_tuple_resolving_through_later_alias_merges_in_one_call() {
        // U and V belong to no group: (U,V) only resolves once the later
        // tuples alias U to A and V to B
        let mut arena = ClusterArena::from_tracking_groups(&[
            group(&["A"], &["O1"]),
            group(&["B"], &["O2"]),
        ]);
        let tuples = vec![
            TrackingTuple::new(["U", "V"], 1.0),
            TrackingTuple::new(["U", "A"], 2.0),
            TrackingTuple::new(["V", "B"], 3.0),
        ];

        let first = arena.merge_by_trackings_tuples(&tuples);

        assert_eq!(first.absorbed, 1);
        assert_eq!(first.keys_resolved, 3);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.owner_of("A"), arena.owner_of("B"));
        assert_eq!(arena.owner_of("U"), arena.owner_of("V"));

        let snapshot: Vec<Cluster> = arena.clusters().cloned().collect();
        let second = arena.merge_by_trackings_tuples(&tuples);

        assert!(!second.changed());
        assert_eq!(arena.clusters().cloned().collect::<Vec<_>>(), snapshot);
    }

    #[test]
    fn test_absorb_retires_slot_and_repoints_index() {
        let mut arena = ClusterArena::new();
        let a = arena.insert(Cluster::from_tracking_group(&group(&["A"], &["O1"])));
        let b = arena.insert(Cluster::from_tracking_group(&group(&["B", "C"], &["O2"])));

        let survivor = arena.absorb(a, b);

        assert_eq!(survivor, a);
        assert!(!arena.is_live(b));
        assert!(arena.get(b).is_none());
        assert_eq!(arena.owner_of("C"), Some(a));
        assert_eq!(arena.get(a).unwrap().trackings.len(), 3);
    }

    #[test]
    fn test_absorb_subset_contributes_nothing() {
        let mut arena = ClusterArena::new();
        let mut big = Cluster::from_tracking_group(&group(&["A", "B"], &["O1"]));
        big.expected_cost = 10.0;
        let a = arena.insert(big);

        // Build a contained duplicate directly in a slot
        let mut dup = Cluster::from_tracking_group(&group(&["A"], &["O1"]));
        dup.expected_cost = 10.0;
        arena.slots.push(Some(dup));
        let dup_id = ClusterId(arena.slots.len() - 1);

        let mut report = MergeReport::default();
        let survivor = arena.absorb_into(a, dup_id, &mut report);

        assert_eq!(survivor, a);
        assert_eq!(report.retired_subsets, 1);
        assert_eq!(arena.get(a).unwrap().expected_cost, 10.0);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_rebuild_index_drops_aliases() {
        let mut arena = ClusterArena::from_tracking_groups(&[group(&["A"], &["O1"])]);
        arena.merge_by_trackings_tuples(&[TrackingTuple::new(["A", "X"], 1.0)]);
        assert!(arena.owner_of("X").is_some());

        arena.rebuild_index();

        assert!(arena.owner_of("X").is_none());
        assert!(arena.owner_of("A").is_some());
    }
}
