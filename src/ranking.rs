// 📊 Ordering / Ranking
// Presentation order for the review sheet.
//
// The review comparator is a three-way chain with an explicit tie value.
// It is NOT a strict weak ordering (rules 2 and 4 can disagree for the same
// pair depending on argument order), so it must never be handed to
// `slice::sort_by`, which may panic on inconsistent comparators. `rank`
// uses its own stable binary insertion sort that only asks "is a before b".
// Rule 4 never answers "before", so on its own the diff does not move a
// cluster; verified and below-cost clusters sink to the bottom.

use crate::cluster::Cluster;
use std::cmp::Ordering;

/// Review comparator.
///
/// 1. second verified                    → first before second
/// 2. first verified, second below cost  → tie
/// 3. first unverified, second below cost → first before second
/// 4. diff(first) < diff(second)         → first after second, else tie
pub fn compare(first: &Cluster, second: &Cluster) -> Ordering {
    if second.verified {
        Ordering::Less
    } else if first.verified && second.below_cost {
        Ordering::Equal
    } else if !first.verified && second.below_cost {
        Ordering::Less
    } else if first.total_diff() < second.total_diff() {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Oldest ship date first; clusters without a date sort before dated ones
pub fn compare_ship_dates(first: &Cluster, second: &Cluster) -> Ordering {
    first.last_ship_date.cmp(&second.last_ship_date)
}

/// Final presentation order.
///
/// Clusters are first ordered by ship date, then by the review comparator.
/// Both passes are stable, so ship date breaks every review tie.
pub fn rank(clusters: &mut [Cluster]) {
    clusters.sort_by(compare_ship_dates);
    stable_sort_by(clusters, compare);
}

/// Run detection + binary insertion sort.
///
/// Stable, never panics, and only asks "is a < b" (`Ordering::Less`), so
/// a comparator that is not a total order still yields a deterministic
/// permutation.
pub fn stable_sort_by<T, F>(items: &mut [T], mut cmp: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    let n = items.len();
    if n < 2 {
        return;
    }

    let mut is_less = |a: &T, b: &T| cmp(a, b) == Ordering::Less;

    // Leading run: strictly descending runs are reversed, which keeps
    // stability because no two of their elements compare equal.
    let mut run = 2;
    if is_less(&items[1], &items[0]) {
        while run < n && is_less(&items[run], &items[run - 1]) {
            run += 1;
        }
        items[..run].reverse();
    } else {
        while run < n && !is_less(&items[run], &items[run - 1]) {
            run += 1;
        }
    }

    for start in run..n {
        let mut lo = 0;
        let mut hi = start;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if is_less(&items[start], &items[mid]) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        items[lo..=start].rotate_right(1);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn cluster(name: &str, diff: f64) -> Cluster {
        let mut cluster = Cluster::new("usa");
        cluster.trackings.insert(name.to_string());
        cluster.tracked_cost = diff;
        cluster
    }

    fn names(clusters: &[Cluster]) -> Vec<String> {
        clusters
            .iter()
            .map(|c| c.trackings.iter().next().cloned().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_compare_rule_precedence() {
        let plain = cluster("p", 0.0);
        let mut verified = cluster("v", 0.0);
        verified.verified = true;
        let mut below = cluster("b", 0.0);
        below.below_cost = true;

        // Rule 1
        assert_eq!(compare(&plain, &verified), Ordering::Less);
        assert_eq!(compare(&verified, &verified), Ordering::Less);
        // Rule 2
        assert_eq!(compare(&verified, &below), Ordering::Equal);
        // Rule 3
        assert_eq!(compare(&plain, &below), Ordering::Less);
        // Rule 4
        assert_eq!(compare(&cluster("x", -5.0), &cluster("y", 3.0)), Ordering::Greater);
        assert_eq!(compare(&cluster("x", 3.0), &cluster("y", -5.0)), Ordering::Equal);
        assert_eq!(compare(&cluster("x", 1.0), &cluster("y", 1.0)), Ordering::Equal);
    }

    #[test]
    fn test_compare_is_not_symmetric() {
        let mut verified = cluster("v", -50.0);
        verified.verified = true;
        let mut below = cluster("b", 10.0);
        below.below_cost = true;

        // Rule 2 says tie one way; the other way rule 3 does not apply
        // (second is verified) and rule 1 fires.
        assert_eq!(compare(&verified, &below), Ordering::Equal);
        assert_eq!(compare(&below, &verified), Ordering::Less);
    }

    #[test]
    fn test_override_diff_counts_as_zero() {
        let mut certified = cluster("c", -100.0);
        certified.manual_override = true;

        assert_eq!(compare(&cluster("x", -1.0), &certified), Ordering::Greater);
    }

    #[test]
    fn test_rank_sinks_below_cost_then_verified() {
        let mut verified = cluster("v", 0.0);
        verified.verified = true;
        let mut below = cluster("b", 0.0);
        below.below_cost = true;

        let mut clusters = vec![verified, cluster("p1", 0.0), below, cluster("p2", 0.0)];
        rank(&mut clusters);

        assert_eq!(names(&clusters), vec!["p1", "p2", "b", "v"]);
    }

    #[test]
    fn test_rank_never_reorders_on_diff_alone() {
        // Rule 4 only ever answers "after" or "tie", and the sort only asks
        // "before?", so unflagged clusters keep their incoming order.
        let mut clusters = vec![cluster("a", -5.0), cluster("b", 10.0), cluster("c", 0.0)];
        assert_eq!(compare(&clusters[0], &clusters[1]), Ordering::Greater);

        rank(&mut clusters);

        assert_eq!(names(&clusters), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rank_is_stable_for_ties() {
        let mut clusters = vec![cluster("a", 1.0), cluster("b", 1.0), cluster("c", 1.0)];

        rank(&mut clusters);

        assert_eq!(names(&clusters), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rank_uses_ship_date_for_ties() {
        let mut late = cluster("late", 0.0);
        late.last_ship_date = NaiveDate::from_ymd_opt(2024, 5, 2);
        let mut early = cluster("early", 0.0);
        early.last_ship_date = NaiveDate::from_ymd_opt(2024, 5, 1);
        let undated = cluster("undated", 0.0);

        let mut clusters = vec![late, early, undated];
        rank(&mut clusters);

        assert_eq!(names(&clusters), vec!["undated", "early", "late"]);
    }

    #[test]
    fn test_stable_sort_matches_std_on_total_orders() {
        let mut ours = vec![5, 3, 9, 1, 3, 7, 2, 8, 2, 0, 6];
        let mut expected = ours.clone();

        stable_sort_by(&mut ours, |a: &i32, b: &i32| a.cmp(b));
        expected.sort();

        assert_eq!(ours, expected);
    }

    #[test]
    fn test_stable_sort_keeps_equal_keys_in_order() {
        let mut pairs = vec![(2, 'a'), (1, 'b'), (2, 'c'), (1, 'd'), (0, 'e')];

        stable_sort_by(&mut pairs, |a, b| a.0.cmp(&b.0));

        assert_eq!(pairs, vec![(0, 'e'), (1, 'b'), (1, 'd'), (2, 'a'), (2, 'c')]);
    }

    #[test]
    fn test_stable_sort_descending_run() {
        let mut items = vec![9, 7, 4, 1, 5];

        stable_sort_by(&mut items, |a: &i32, b: &i32| a.cmp(b));

        assert_eq!(items, vec![1, 4, 5, 7, 9]);
    }
}
