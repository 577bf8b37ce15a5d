use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::SENTINEL_ID;

pub const SENTINEL_DIST: f32 = f32::INFINITY;

#[inline]
#[must_use]
pub fn sentinel_pair() -> (f32, u64) {
    (SENTINEL_DIST, SENTINEL_ID)
}

/// Total order on `(distance, id)` pairs: ascending distance, ties broken by
/// the smaller id. NaN sorts after infinity via `total_cmp`, so a poisoned
/// distance can never displace a real neighbor.
#[inline]
#[must_use]
pub fn cmp_pair(a: &(f32, u64), b: &(f32, u64)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct HeapPair {
    dist: f32,
    id: u64,
}

impl Eq for HeapPair {}

impl PartialOrd for HeapPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapPair {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_pair(&(self.dist, self.id), &(other.dist, other.id))
    }
}

/// Bounded max-heap keeping the `k` smallest `(distance, id)` pairs seen so
/// far. The heap root is the current worst survivor, so a push is a single
/// comparison in the common miss case.
#[derive(Clone, Debug)]
pub struct TopkHeap {
    k: usize,
    heap: BinaryHeap<HeapPair>,
}

impl TopkHeap {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Current worst survivor, if the heap is full.
    #[must_use]
    pub fn threshold(&self) -> Option<(f32, u64)> {
        if self.heap.len() < self.k {
            None
        } else {
            self.heap.peek().map(|p| (p.dist, p.id))
        }
    }

    #[inline]
    pub fn push(&mut self, dist: f32, id: u64) {
        if self.k == 0 {
            return;
        }
        let pair = HeapPair { dist, id };
        if self.heap.len() < self.k {
            self.heap.push(pair);
        } else if pair < *self.heap.peek().unwrap() {
            self.heap.pop();
            self.heap.push(pair);
        }
    }

    /// Absorbs another heap built with the same `k`. The result is identical
    /// to having streamed both inputs through a single heap, so worker-local
    /// heaps can be merged in any order.
    pub fn absorb(&mut self, other: TopkHeap) {
        for p in other.heap {
            self.push(p.dist, p.id);
        }
    }

    /// Drains to ascending `(distance, id)` order, padded with sentinels up
    /// to `k`.
    #[must_use]
    pub fn into_sorted(self) -> Vec<(f32, u64)> {
        let k = self.k;
        let mut out: Vec<(f32, u64)> = self.heap.into_iter().map(|p| (p.dist, p.id)).collect();
        out.sort_unstable_by(cmp_pair);
        out.resize(k, sentinel_pair());
        out
    }
}

/// Partitioned-select top-k: `select_nth_unstable` moves the k smallest
/// candidates to the front, then only that prefix is sorted. O(n + k log k)
/// against the heap's O(n log k).
#[must_use]
pub fn nth_topk(mut candidates: Vec<(f32, u64)>, k: usize) -> Vec<(f32, u64)> {
    if candidates.len() > k && k > 0 {
        candidates.select_nth_unstable_by(k, cmp_pair);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(cmp_pair);
    candidates.resize(k, sentinel_pair());
    candidates
}

/// Merges two already-sorted top-k rows into one.
#[must_use]
pub fn merge_topk(a: Vec<(f32, u64)>, mut b: Vec<(f32, u64)>, k: usize) -> Vec<(f32, u64)> {
    let mut merged = a;
    merged.append(&mut b);
    merged.sort_unstable_by(cmp_pair);
    merged.truncate(k);
    merged.resize(k, sentinel_pair());
    merged
}

/// Top-k finalization variant. `Heap` streams candidates through a bounded
/// heap; `Nth` buffers them and partial-sorts once at the end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Select {
    #[default]
    Heap,
    Nth,
}

/// Query results for `m` queries, `k` neighbors each, stored row-major.
/// Distances are non-decreasing along each row; absent entries hold the
/// sentinel pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbors {
    k: usize,
    dists: Vec<f32>,
    ids: Vec<u64>,
}

impl Neighbors {
    #[must_use]
    pub fn sentinel(nqueries: usize, k: usize) -> Self {
        Self {
            k,
            dists: vec![SENTINEL_DIST; nqueries * k],
            ids: vec![SENTINEL_ID; nqueries * k],
        }
    }

    /// Builds from per-query rows, padding or truncating each to `k`.
    #[must_use]
    pub fn from_rows(rows: Vec<Vec<(f32, u64)>>, k: usize) -> Self {
        let mut dists = Vec::with_capacity(rows.len() * k);
        let mut ids = Vec::with_capacity(rows.len() * k);
        for mut row in rows {
            row.resize(k, sentinel_pair());
            for (d, i) in row {
                dists.push(d);
                ids.push(i);
            }
        }
        Self { k, dists, ids }
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn nqueries(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.dists.len() / self.k
        }
    }

    #[must_use]
    pub fn distances(&self, query: usize) -> &[f32] {
        &self.dists[query * self.k..(query + 1) * self.k]
    }

    #[must_use]
    pub fn ids(&self, query: usize) -> &[u64] {
        &self.ids[query * self.k..(query + 1) * self.k]
    }

    #[must_use]
    pub fn row(&self, query: usize) -> Vec<(f32, u64)> {
        self.distances(query)
            .iter()
            .copied()
            .zip(self.ids(query).iter().copied())
            .collect()
    }
}
