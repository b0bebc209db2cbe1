//! Snippet formation: turning a message's byte classification into mutable ranges.
//!
//! Response classes are clustered by the shape of their representative
//! response. Replaying the merges over the per-byte classification coarsens it
//! step by step; every maximal run of equally-labelled bytes at every step is a
//! snippet.

use crate::feedback::ResponseClass;
use crate::probe::ProbeResult;
use std::ops::Range;

pub const FEATURE_COUNT: usize = 5;

pub type Features = [f64; FEATURE_COUNT];

/// `[alphabetic runs, numeric runs, other runs, length, threshold]` of a class's response.
pub fn feature_vector(class: &ResponseClass) -> Features {
    #[derive(Clone, Copy, PartialEq)]
    enum Kind {
        Alpha,
        Digit,
        Other,
    }

    let mut runs = [0usize; 3];
    let mut previous = None;
    let mut length = 0usize;
    for ch in class.response.chars() {
        length += 1;
        let kind = if ch.is_numeric() {
            Kind::Digit
        } else if ch.is_alphabetic() {
            Kind::Alpha
        } else {
            Kind::Other
        };
        if previous != Some(kind) {
            runs[kind as usize] += 1;
            previous = Some(kind);
        }
    }
    [
        runs[Kind::Alpha as usize] as f64,
        runs[Kind::Digit as usize] as f64,
        runs[Kind::Other as usize] as f64,
        length as f64,
        class.threshold,
    ]
}

fn euclidean(a: &Features, b: &Features) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// One agglomeration step. Merge `k` of `n` points creates cluster id `n + k`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMerge {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    /// Number of original points in the merged cluster.
    pub size: usize,
}

/// Average-linkage agglomerative clustering; equal distances merge the lowest id pair first.
pub fn linkage(points: &[Features]) -> Vec<ClusterMerge> {
    let n = points.len();
    let mut active: Vec<(usize, Vec<usize>)> = (0..n).map(|i| (i, vec![i])).collect();
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while active.len() > 1 {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..active.len() {
            for j in (i + 1)..active.len() {
                let distance = average_distance(points, &active[i].1, &active[j].1);
                if best.is_none_or(|(_, _, d)| distance < d) {
                    best = Some((i, j, distance));
                }
            }
        }
        let Some((i, j, distance)) = best else {
            break;
        };

        // j > i, so removing j first keeps i in place.
        let (right_id, right_members) = active.remove(j);
        let (left_id, mut members) = active.remove(i);
        members.extend(right_members);
        merges.push(ClusterMerge {
            left: left_id,
            right: right_id,
            distance,
            size: members.len(),
        });
        active.push((n + merges.len() - 1, members));
    }
    merges
}

fn average_distance(points: &[Features], a: &[usize], b: &[usize]) -> f64 {
    let total: f64 = a
        .iter()
        .flat_map(|&x| b.iter().map(move |&y| (x, y)))
        .map(|(x, y)| euclidean(&points[x], &points[y]))
        .sum();
    total / (a.len() * b.len()) as f64
}

/// Maximal runs of equal labels, as half-open ranges.
pub fn label_runs(labels: &[usize]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for end in 1..=labels.len() {
        if end == labels.len() || labels[end] != labels[start] {
            runs.push(start..end);
            start = end;
        }
    }
    runs
}

/// Merge history and distinct snippets of one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnippetMap {
    merges: Vec<ClusterMerge>,
    index: Vec<usize>,
    ranges: Vec<Range<usize>>,
}

impl SnippetMap {
    pub fn form(probe: &ProbeResult) -> Self {
        let features: Vec<Features> = probe.pool.classes().iter().map(feature_vector).collect();
        let merges = linkage(&features);
        let mut map = Self {
            merges,
            index: probe.index.clone(),
            ranges: Vec::new(),
        };
        for depth in 0..=map.merges.len() {
            for range in map.partition_at(depth) {
                if !map.ranges.contains(&range) {
                    map.ranges.push(range);
                }
            }
        }
        map
    }

    pub fn merges(&self) -> &[ClusterMerge] {
        &self.merges
    }

    /// Distinct snippets, finest first.
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// The byte partition after applying the first `depth` merges.
    pub fn partition_at(&self, depth: usize) -> Vec<Range<usize>> {
        let n = self.merges.len() + 1;
        let mut labels = self.index.clone();
        for (k, merge) in self.merges.iter().take(depth).enumerate() {
            for label in labels.iter_mut() {
                if *label == merge.left || *label == merge.right {
                    *label = n + k;
                }
            }
        }
        label_runs(&labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::ResponsePool;

    fn class(response: &str, threshold: f64) -> ResponseClass {
        ResponseClass {
            response: response.to_string(),
            threshold,
        }
    }

    fn probe(classes: Vec<ResponseClass>, index: Vec<usize>) -> ProbeResult {
        ProbeResult {
            pool: ResponsePool::from_classes(classes),
            index,
        }
    }

    #[test]
    fn features_count_runs_by_character_kind() {
        assert_eq!(
            feature_vector(&class("ab12-c", 90.0)),
            [2.0, 1.0, 1.0, 6.0, 90.0]
        );
        assert_eq!(feature_vector(&class("", 100.0)), [0.0, 0.0, 0.0, 0.0, 100.0]);
        assert_eq!(feature_vector(&class("{}", 100.0)), [0.0, 0.0, 1.0, 2.0, 100.0]);
    }

    #[test]
    fn linkage_merges_closest_first_and_numbers_new_clusters() {
        let points = [
            [0.0, 0.0, 0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let merges = linkage(&points);
        assert_eq!(merges.len(), 2);
        assert_eq!((merges[0].left, merges[0].right, merges[0].size), (0, 2, 2));
        assert_eq!(merges[0].distance, 1.0);
        assert_eq!((merges[1].left, merges[1].right, merges[1].size), (1, 3, 3));
        // Average of |10-0| and |10-1|.
        assert_eq!(merges[1].distance, 9.5);
    }

    #[test]
    fn linkage_breaks_ties_by_lowest_ids() {
        let points = [[0.0; 5], [0.0; 5], [0.0; 5]];
        let merges = linkage(&points);
        assert_eq!((merges[0].left, merges[0].right), (0, 1));
        assert_eq!((merges[1].left, merges[1].right), (2, 3));
    }

    #[test]
    fn single_merge_collapses_to_whole_message() {
        let map = SnippetMap::form(&probe(
            vec![class("OK", 100.0), class("ERR", 100.0)],
            vec![0, 0, 1, 1, 1],
        ));
        assert_eq!(map.merges().len(), 1);
        assert_eq!(map.partition_at(0), vec![0..2, 2..5]);
        assert_eq!(map.partition_at(1), vec![0..5]);
        assert_eq!(map.ranges(), &[0..2, 2..5, 0..5]);
    }

    #[test]
    fn every_depth_partitions_the_whole_content() {
        let map = SnippetMap::form(&probe(
            vec![class("OK", 80.0), class("ERR 1", 100.0), class("x", 100.0)],
            vec![0, 1, 1, 2, 0, 0, 2, 1],
        ));
        for depth in 0..=map.merges().len() {
            let partition = map.partition_at(depth);
            assert_eq!(partition.first().map(|r| r.start), Some(0));
            assert_eq!(partition.last().map(|r| r.end), Some(8));
            assert!(partition.windows(2).all(|w| w[0].end == w[1].start));
        }
        assert!(map.ranges().contains(&(0..8)));
    }

    #[test]
    fn single_class_and_empty_content() {
        let unprobeable = SnippetMap::form(&ProbeResult::unprobeable(4));
        assert_eq!(unprobeable.ranges(), &[0..4]);
        let empty = SnippetMap::form(&ProbeResult::unprobeable(0));
        assert!(empty.ranges().is_empty());
    }

    #[test]
    fn label_runs_handles_single_byte_tail() {
        assert_eq!(label_runs(&[3, 3, 4]), vec![0..2, 2..3]);
        assert_eq!(label_runs(&[7]), vec![0..1]);
        assert!(label_runs(&[]).is_empty());
    }
}
