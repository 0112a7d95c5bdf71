//! Global top-K merging of per-shard result lists.
//!
//! Two paths, depending on whether the query carried a sort descriptor:
//! score-ordered lists merge through a bounded hit queue with positional
//! scanning and early shard termination; field-sorted lists merge with a
//! k-way merge over the sort-key tuples. Ties break by
//! (node, shard, doc id) so a result set is a pure function of
//! (query, shard set, data) regardless of replica placement.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::engine::{compare_sort_keys, SortSpec, SortValue};

/// One globally merged hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub node: String,
    pub shard: String,
    pub doc_id: u32,
    pub score: f32,
    pub sort_fields: Option<Vec<SortValue>>,
}

impl Hit {
    /// Score ordering: higher score wins, ties by (node, shard, doc id).
    fn score_cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.node.cmp(&self.node))
            .then_with(|| other.shard.cmp(&self.shard))
            .then_with(|| other.doc_id.cmp(&self.doc_id))
    }
}

/// Min-heap entry: the queue keeps the best `limit` hits with the worst on
/// top for cheap replacement.
struct QueueSlot(Hit);

impl PartialEq for QueueSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.score_cmp(&other.0) == Ordering::Equal
    }
}
impl Eq for QueueSlot {}
impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap's max is the weakest kept hit.
        other.0.score_cmp(&self.0)
    }
}

/// Bounded queue of the best `limit` hits seen so far.
pub struct HitQueue {
    limit: usize,
    heap: BinaryHeap<QueueSlot>,
}

impl HitQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            heap: BinaryHeap::with_capacity(limit.saturating_add(1)),
        }
    }

    /// Insert `hit`; returns false when the hit cannot beat the weakest
    /// kept entry, which lets a sorted source stop feeding.
    pub fn insert(&mut self, hit: Hit) -> bool {
        if self.limit == 0 {
            return false;
        }
        if self.heap.len() < self.limit {
            self.heap.push(QueueSlot(hit));
            return true;
        }
        let weakest = self.heap.peek().map(|slot| slot.0.clone());
        if let Some(weakest) = weakest {
            if weakest.score_cmp(&hit) == Ordering::Less {
                self.heap.pop();
                self.heap.push(QueueSlot(hit));
                return true;
            }
        }
        false
    }

    /// Drain into descending score order.
    pub fn into_sorted(self) -> Vec<Hit> {
        let mut hits: Vec<Hit> = self.heap.into_iter().map(|slot| slot.0).collect();
        hits.sort_by(|a, b| b.score_cmp(a));
        hits
    }
}

/// Merge score-ordered per-shard lists into the global top `limit`.
///
/// Lists are scanned positionally: every round takes the next hit of every
/// live list, and a list is retired once its next hit cannot enter the
/// queue (its remaining hits are weaker still).
pub fn merge_by_score(lists: Vec<Vec<Hit>>, limit: usize) -> Vec<Hit> {
    let mut queue = HitQueue::new(limit);
    let mut done = vec![false; lists.len()];
    let mut pos = 0usize;
    loop {
        let mut advanced = false;
        for (idx, list) in lists.iter().enumerate() {
            if done[idx] {
                continue;
            }
            match list.get(pos) {
                Some(hit) => {
                    advanced = true;
                    if !queue.insert(hit.clone()) {
                        done[idx] = true;
                    }
                }
                None => done[idx] = true,
            }
        }
        pos += 1;
        if !advanced || done.iter().all(|d| *d) {
            break;
        }
    }
    queue.into_sorted()
}

/// Merge already field-sorted per-shard lists with a k-way merge on the
/// sort-key tuple, ties broken by (node, shard, doc id).
pub fn merge_by_sort(lists: Vec<Vec<Hit>>, spec: &SortSpec, limit: usize) -> Vec<Hit> {
    let mut positions = vec![0usize; lists.len()];
    let mut merged = Vec::with_capacity(limit.min(64));

    while merged.len() < limit {
        let mut best: Option<usize> = None;
        for (idx, list) in lists.iter().enumerate() {
            let Some(candidate) = list.get(positions[idx]) else {
                continue;
            };
            best = match best {
                None => Some(idx),
                Some(current) => {
                    let incumbent = &lists[current][positions[current]];
                    if sorted_cmp(candidate, incumbent, spec) == Ordering::Less {
                        Some(idx)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        let Some(winner) = best else { break };
        merged.push(lists[winner][positions[winner]].clone());
        positions[winner] += 1;
    }
    merged
}

fn sorted_cmp(a: &Hit, b: &Hit, spec: &SortSpec) -> Ordering {
    compare_sort_keys(
        a.sort_fields.as_deref().unwrap_or(&[]),
        b.sort_fields.as_deref().unwrap_or(&[]),
        spec,
    )
    .then_with(|| a.node.cmp(&b.node))
    .then_with(|| a.shard.cmp(&b.shard))
    .then_with(|| a.doc_id.cmp(&b.doc_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SortField;

    fn hit(shard: &str, doc_id: u32, score: f32) -> Hit {
        Hit {
            node: "n1".into(),
            shard: shard.into(),
            doc_id,
            score,
            sort_fields: None,
        }
    }

    fn sorted_hit(shard: &str, doc_id: u32, key: f64) -> Hit {
        Hit {
            node: "n1".into(),
            shard: shard.into(),
            doc_id,
            score: 0.0,
            sort_fields: Some(vec![SortValue::Number(key)]),
        }
    }

    #[test]
    fn merge_equals_top_k_of_union() {
        let a = vec![hit("s1", 0, 9.0), hit("s1", 1, 5.0), hit("s1", 2, 1.0)];
        let b = vec![hit("s2", 0, 8.0), hit("s2", 1, 7.0), hit("s2", 2, 6.0)];
        let mut union: Vec<Hit> = a.iter().chain(b.iter()).cloned().collect();
        union.sort_by(|x, y| y.score_cmp(x));
        union.truncate(4);

        let merged = merge_by_score(vec![a, b], 4);
        assert_eq!(merged, union);
    }

    #[test]
    fn merge_respects_limit() {
        let lists = vec![
            (0..20).map(|i| hit("s1", i, 100.0 - i as f32)).collect(),
            (0..20).map(|i| hit("s2", i, 99.5 - i as f32)).collect(),
        ];
        let merged = merge_by_score(lists, 10);
        assert_eq!(merged.len(), 10);
        assert!(merged.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn merge_limit_zero_is_empty() {
        let merged = merge_by_score(vec![vec![hit("s1", 0, 1.0)]], 0);
        assert!(merged.is_empty());
    }

    #[test]
    fn identical_scores_break_ties_deterministically() {
        let a = vec![Hit {
            node: "n2".into(),
            ..hit("s1", 3, 4.0)
        }];
        let b = vec![hit("s1", 1, 4.0), hit("s2", 1, 4.0)];
        let merged = merge_by_score(vec![a, b], 3);
        // Same score: node asc, then shard asc, then doc id asc.
        assert_eq!(merged[0].node, "n1");
        assert_eq!(merged[0].shard, "s1");
        assert_eq!(merged[1].shard, "s2");
        assert_eq!(merged[2].node, "n2");
    }

    #[test]
    fn early_termination_does_not_lose_hits() {
        // Shard s2's first hit fails to enter the full queue; its remaining
        // hits are weaker, so retiring the list is lossless.
        let a = vec![hit("s1", 0, 10.0), hit("s1", 1, 9.0), hit("s1", 2, 8.0)];
        let b = vec![hit("s2", 0, 1.0), hit("s2", 1, 0.5)];
        let merged = merge_by_score(vec![a, b], 3);
        assert_eq!(
            merged.iter().map(|h| h.score).collect::<Vec<_>>(),
            vec![10.0, 9.0, 8.0]
        );
    }

    #[test]
    fn sorted_merge_interleaves_lists() {
        let spec = SortSpec {
            fields: vec![SortField {
                field: "year".into(),
                reverse: false,
            }],
        };
        let a = vec![sorted_hit("s1", 0, 1.0), sorted_hit("s1", 1, 4.0)];
        let b = vec![sorted_hit("s2", 0, 2.0), sorted_hit("s2", 1, 3.0)];
        let merged = merge_by_sort(vec![a, b], &spec, 10);
        let keys: Vec<f64> = merged
            .iter()
            .map(|h| match h.sort_fields.as_ref().unwrap()[0] {
                SortValue::Number(n) => n,
                _ => panic!("expected numbers"),
            })
            .collect();
        assert_eq!(keys, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn sorted_merge_honors_reverse_and_limit() {
        let spec = SortSpec {
            fields: vec![SortField {
                field: "year".into(),
                reverse: true,
            }],
        };
        let a = vec![sorted_hit("s1", 0, 9.0), sorted_hit("s1", 1, 2.0)];
        let b = vec![sorted_hit("s2", 0, 5.0)];
        let merged = merge_by_sort(vec![a, b], &spec, 2);
        assert_eq!(merged.len(), 2);
        let keys: Vec<f64> = merged
            .iter()
            .map(|h| match h.sort_fields.as_ref().unwrap()[0] {
                SortValue::Number(n) => n,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![9.0, 5.0]);
    }
}
