//! Balanced static k-d tree over fixed-dimension descriptor points.
//!
//! The tree is an implicit binary tree over flat arrays: for any node range
//! `[lo, hi)` the splitting node sits at the midpoint, split on axis
//! `depth % dim`. Built once by recursive median partition, never mutated,
//! so the whole structure is two arrays and serializes as-is.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct KdTree {
    dim: usize,
    /// Node coordinates in tree order, `dim` values per node.
    coords: Vec<f32>,
    /// Original frame index of each node, parallel to `coords`.
    frames: Vec<u32>,
}

impl KdTree {
    /// Build from one descriptor sequence. O(n log n) expected via
    /// `select_nth_unstable_by` median partitioning.
    pub(crate) fn build(descriptors: &[Vec<f32>]) -> Result<Self, String> {
        let Some(first) = descriptors.first() else {
            return Err("Cannot build an index over an empty corpus".to_string());
        };
        let dim = first.len();
        if dim == 0 {
            return Err("Descriptor dimension must be positive".to_string());
        }
        for (frame, d) in descriptors.iter().enumerate() {
            if d.len() != dim {
                return Err(format!(
                    "Descriptor {frame} has length {}, expected {dim}",
                    d.len()
                ));
            }
        }
        let mut order: Vec<u32> = (0..descriptors.len() as u32).collect();
        partition_segment(&mut order, descriptors, dim, 0);
        let mut coords = Vec::with_capacity(descriptors.len() * dim);
        for &frame in &order {
            coords.extend_from_slice(&descriptors[frame as usize]);
        }
        Ok(Self {
            dim,
            coords,
            frames: order,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }

    /// Invariants a deserialized tree must satisfy before use.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.dim == 0 {
            return Err("Index dimension must be positive".to_string());
        }
        if self.coords.len() != self.frames.len() * self.dim {
            return Err(format!(
                "Coordinate count {} does not match {} nodes of dimension {}",
                self.coords.len(),
                self.frames.len(),
                self.dim
            ));
        }
        let n = self.frames.len();
        let mut seen = vec![false; n];
        for &frame in &self.frames {
            let idx = frame as usize;
            if idx >= n || seen[idx] {
                return Err("Frame ids are not a permutation of the corpus".to_string());
            }
            seen[idx] = true;
        }
        Ok(())
    }

    /// The `k` nearest nodes to `point` by Euclidean distance, ascending,
    /// ties broken by original frame order. Returns all nodes when the
    /// corpus holds fewer than `k`.
    pub(crate) fn knn(&self, point: &[f32], k: usize) -> Vec<(f32, u32)> {
        if k == 0 || self.frames.is_empty() || point.len() != self.dim {
            return Vec::new();
        }
        let mut best = BoundedWorst::new(k);
        self.search(point, 0, self.frames.len(), 0, &mut best);
        let mut results = best.into_vec();
        results.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        results
            .into_iter()
            .map(|(dist_sq, frame)| (dist_sq.sqrt(), frame))
            .collect()
    }

    fn search(&self, point: &[f32], lo: usize, hi: usize, depth: usize, best: &mut BoundedWorst) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let node = &self.coords[mid * self.dim..(mid + 1) * self.dim];
        best.offer(distance_sq(point, node), self.frames[mid]);

        let axis = depth % self.dim;
        let delta = point[axis] - node[axis];
        let (near, far) = if delta < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.search(point, near.0, near.1, depth + 1, best);
        // The far half can only contain closer points (or equal-distance
        // points with smaller frame ids) when the splitting plane is within
        // the current worst distance.
        if !best.full() || delta * delta <= best.worst_dist_sq() {
            self.search(point, far.0, far.1, depth + 1, best);
        }
    }
}

fn partition_segment(order: &mut [u32], descriptors: &[Vec<f32>], dim: usize, depth: usize) {
    if order.len() <= 1 {
        return;
    }
    let mid = order.len() / 2;
    let axis = depth % dim;
    order.select_nth_unstable_by(mid, |&a, &b| {
        descriptors[a as usize][axis]
            .total_cmp(&descriptors[b as usize][axis])
            .then(a.cmp(&b))
    });
    let (left, rest) = order.split_at_mut(mid);
    partition_segment(left, descriptors, dim, depth + 1);
    partition_segment(&mut rest[1..], descriptors, dim, depth + 1);
}

fn distance_sq(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum
}

/// Fixed-capacity set of current best candidates ordered worst-first.
///
/// A candidate is "worse" when its distance is larger, or equal with a
/// later frame id. This is the query tie-break rule inverted.
struct BoundedWorst {
    capacity: usize,
    heap: std::collections::BinaryHeap<Candidate>,
}

#[derive(PartialEq, Eq)]
struct Candidate {
    dist_sq: OrderedDist,
    frame: u32,
}

#[derive(PartialEq, Eq)]
struct OrderedDist(u32);

impl OrderedDist {
    fn new(dist_sq: f32) -> Self {
        // total_cmp-compatible bit trick is unnecessary here; distances are
        // non-negative so the raw bit pattern orders correctly.
        Self(dist_sq.max(0.0).to_bits())
    }

    fn value(&self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist_sq
            .0
            .cmp(&other.dist_sq.0)
            .then(self.frame.cmp(&other.frame))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl BoundedWorst {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: std::collections::BinaryHeap::with_capacity(capacity + 1),
        }
    }

    fn offer(&mut self, dist_sq: f32, frame: u32) {
        let candidate = Candidate {
            dist_sq: OrderedDist::new(dist_sq),
            frame,
        };
        if self.heap.len() < self.capacity {
            self.heap.push(candidate);
            return;
        }
        let improves = self.heap.peek().is_some_and(|worst| candidate < *worst);
        if improves {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    fn full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    fn worst_dist_sq(&self) -> f32 {
        self.heap
            .peek()
            .map(|c| c.dist_sq.value())
            .unwrap_or(f32::INFINITY)
    }

    fn into_vec(self) -> Vec<(f32, u32)> {
        self.heap
            .into_iter()
            .map(|c| (c.dist_sq.value(), c.frame))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<Vec<f32>> {
        // 3x3 grid in 2D, frame order row-major.
        let mut points = Vec::new();
        for y in 0..3 {
            for x in 0..3 {
                points.push(vec![x as f32, y as f32]);
            }
        }
        points
    }

    fn brute_force(points: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u32> {
        let mut scored: Vec<(f32, u32)> = points
            .iter()
            .enumerate()
            .map(|(i, p)| (distance_sq(query, p), i as u32))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(k).map(|(_, i)| i).collect()
    }

    #[test]
    fn build_rejects_mixed_dimensions() {
        let err = KdTree::build(&[vec![0.0, 1.0], vec![0.0]]).unwrap_err();
        assert!(err.contains("length"));
    }

    #[test]
    fn build_rejects_empty_corpus() {
        assert!(KdTree::build(&[]).is_err());
    }

    #[test]
    fn exact_point_query_returns_its_frame() {
        let points = grid_points();
        let tree = KdTree::build(&points).unwrap();
        for (frame, p) in points.iter().enumerate() {
            let result = tree.knn(p, 1);
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].1 as usize, frame);
            assert_eq!(result[0].0, 0.0);
        }
    }

    #[test]
    fn knn_matches_brute_force_on_random_points() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(7);
        let points: Vec<Vec<f32>> = (0..200)
            .map(|_| (0..5).map(|_| rng.random_range(-1.0_f32..1.0)).collect())
            .collect();
        let tree = KdTree::build(&points).unwrap();
        for _ in 0..50 {
            let query: Vec<f32> = (0..5).map(|_| rng.random_range(-1.0_f32..1.0)).collect();
            for k in [1usize, 3, 10] {
                let got: Vec<u32> = tree.knn(&query, k).into_iter().map(|(_, f)| f).collect();
                assert_eq!(got, brute_force(&points, &query, k));
            }
        }
    }

    #[test]
    fn equal_distances_break_ties_by_frame_order() {
        // Four identical points: any query is equidistant to all of them.
        let points = vec![vec![1.0_f32, 1.0]; 4];
        let tree = KdTree::build(&points).unwrap();
        let got: Vec<u32> = tree.knn(&[0.0, 0.0], 2).into_iter().map(|(_, f)| f).collect();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn oversized_k_returns_every_point() {
        let points = grid_points();
        let tree = KdTree::build(&points).unwrap();
        let got = tree.knn(&[1.0, 1.0], 50);
        assert_eq!(got.len(), points.len());
    }

    #[test]
    fn serialized_tree_answers_identical_queries() {
        let points = grid_points();
        let tree = KdTree::build(&points).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let restored: KdTree = serde_json::from_str(&json).unwrap();
        restored.validate().unwrap();
        for query in [[0.2_f32, 0.7], [2.5, 2.5], [1.0, 1.0]] {
            for k in 1..=9 {
                assert_eq!(tree.knn(&query, k), restored.knn(&query, k));
            }
        }
    }

    #[test]
    fn validate_rejects_corrupt_frame_ids() {
        let points = grid_points();
        let tree = KdTree::build(&points).unwrap();
        let mut json: serde_json::Value = serde_json::to_value(&tree).unwrap();
        json["frames"][0] = serde_json::json!(99);
        let corrupt: KdTree = serde_json::from_value(json).unwrap();
        assert!(corrupt.validate().is_err());
    }
}
