//! IVF-Flat index: vectors are clustered by k-means at ingestion time and
//! laid out partition-contiguously; a query probes only the `nprobe`
//! partitions whose centroids are closest.

use std::collections::BTreeSet;
use std::mem;
use std::path::PathBuf;

use log::debug;
use rayon::prelude::*;

use crate::distances::squared_l2;
use crate::group::IndexGroup;
use crate::matrix::ColMajorMatrix;
use crate::storage::{self, TsRange};
use crate::topk::{merge_topk, nth_topk, Neighbors, Select, TopkHeap};
use crate::{Dtype, ElemType, Error, Result, SENTINEL_ID};

/// Loop ordering of the partition scan. Query-major keeps one query's heap
/// hot; vector-major touches each candidate vector exactly once. Results
/// are identical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    QueryMajor,
    VectorMajor,
}

#[derive(Clone, Debug)]
pub struct IvfFlatIndex {
    parts_uri: PathBuf,
    ids_uri: PathBuf,
    dtype: Dtype,
    dim: usize,
    centroids: ColMajorMatrix<f32>,
    offsets: Vec<u64>,
    read_range: TsRange,
    base_size: u64,
}

struct LoadedPartition<T> {
    part: u32,
    cols: ColMajorMatrix<T>,
    ids: Vec<u64>,
}

/// Per-query candidate sink. Worker-local sinks are merged after each scan,
/// which keeps the result independent of worker count and scan order.
trait Collector: Send {
    fn new(k: usize) -> Self;
    fn add(&mut self, dist: f32, id: u64);
    fn absorb(&mut self, other: Self);
}

impl Collector for TopkHeap {
    fn new(k: usize) -> Self {
        TopkHeap::new(k)
    }

    fn add(&mut self, dist: f32, id: u64) {
        self.push(dist, id);
    }

    fn absorb(&mut self, other: Self) {
        TopkHeap::absorb(self, other);
    }
}

impl Collector for Vec<(f32, u64)> {
    fn new(_k: usize) -> Self {
        Vec::new()
    }

    fn add(&mut self, dist: f32, id: u64) {
        self.push((dist, id));
    }

    fn absorb(&mut self, mut other: Self) {
        self.append(&mut other);
    }
}

impl IvfFlatIndex {
    /// Loads centroids and partition offsets for the snapshot at `base_ts`.
    /// Partition vectors and ids stay on storage until a query probes them.
    pub fn open(group: &IndexGroup, base_ts: u64) -> Result<Self> {
        let read_range = TsRange::up_to(base_ts);
        let partitions = group.partitions_at(base_ts)?;
        let base_size = group.base_size_at(base_ts)?;
        let centroids = match storage::read_dense(&group.centroids_uri()?, read_range, partitions)?
        {
            crate::matrix::AnyMatrix::F32(m) => m,
            other => {
                return Err(Error::Corrupt(format!(
                    "centroid array holds {} data",
                    other.dtype().name()
                )))
            }
        };
        let offsets = storage::read_dense(&group.offsets_uri()?, read_range, partitions + 1)?
            .into_u64_row()?;
        if offsets.len() != partitions as usize + 1
            || offsets.first() != Some(&0)
            || offsets.last() != Some(&base_size)
            || offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(Error::Corrupt(format!(
                "partition offsets of snapshot {base_ts} do not cover [0, {base_size})"
            )));
        }
        Ok(Self {
            parts_uri: group.parts_uri()?,
            ids_uri: group.ids_uri()?,
            dtype: group.dtype,
            dim: group.dimensions,
            centroids,
            offsets,
            read_range,
            base_size,
        })
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.base_size as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_size == 0
    }

    fn partition_rows(&self, part: u32) -> u64 {
        self.offsets[part as usize + 1] - self.offsets[part as usize]
    }

    /// Bytes one partition occupies in memory once loaded: its vector slice
    /// plus the row-aligned external ids.
    fn partition_bytes(&self, part: u32) -> usize {
        self.partition_rows(part) as usize * (self.dtype.size() * self.dim + 8)
    }

    /// Probes the `nprobe` closest partitions per query. `memory_budget`
    /// switches to out-of-core processing: partitions are packed into load
    /// batches that fit the budget and scanned batch by batch.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        queries: &ColMajorMatrix<f32>,
        k: usize,
        nprobe: usize,
        memory_budget: Option<usize>,
        scan_order: ScanOrder,
        select: Select,
    ) -> Result<Neighbors> {
        if queries.nrows() != self.dim {
            return Err(Error::ShapeMismatch(format!(
                "query dimension {} against index dimension {}",
                queries.nrows(),
                self.dim
            )));
        }
        let m = queries.ncols();
        if self.base_size == 0 || m == 0 || k == 0 {
            debug!("empty probe: {} base rows, {m} queries", self.base_size);
            return Ok(Neighbors::sentinel(m, k));
        }
        let nprobe = nprobe.clamp(1, self.partitions());

        let selected = self.select_partitions(queries, nprobe);
        let active: Vec<u32> = selected
            .iter()
            .flatten()
            .copied()
            .filter(|&p| self.partition_rows(p) > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let batches = self.plan_batches(&active, memory_budget)?;
        debug!(
            "probing {} partitions in {} batches for {m} queries",
            active.len(),
            batches.len()
        );

        match self.dtype {
            Dtype::U8 => self.run::<u8>(queries, k, &selected, &batches, scan_order, select),
            Dtype::I8 => self.run::<i8>(queries, k, &selected, &batches, scan_order, select),
            Dtype::F32 => self.run::<f32>(queries, k, &selected, &batches, scan_order, select),
            Dtype::U64 => Err(Error::TypeMismatch(
                "uint64 is not a vector element type".to_string(),
            )),
        }
    }

    /// Per-query list of probed partition ids, each sorted ascending.
    fn select_partitions(&self, queries: &ColMajorMatrix<f32>, nprobe: usize) -> Vec<Vec<u32>> {
        (0..queries.ncols())
            .into_par_iter()
            .map(|qi| {
                let q = queries.col(qi);
                let mut heap = TopkHeap::new(nprobe);
                for (p, centroid) in self.centroids.iter_cols().enumerate() {
                    heap.push(squared_l2(q, centroid), p as u64);
                }
                let mut sel: Vec<u32> = heap
                    .into_sorted()
                    .into_iter()
                    .filter(|&(_, id)| id != SENTINEL_ID)
                    .map(|(_, id)| id as u32)
                    .collect();
                sel.sort_unstable();
                sel
            })
            .collect()
    }

    /// Packs active partitions into load batches. With no budget everything
    /// is one batch; otherwise batches are filled greedily and a partition
    /// that alone exceeds the budget fails the query before any scan.
    fn plan_batches(&self, active: &[u32], budget: Option<usize>) -> Result<Vec<Vec<u32>>> {
        let budget = match budget {
            None => return Ok(vec![active.to_vec()]),
            Some(b) => b,
        };
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0usize;
        for &p in active {
            let bytes = self.partition_bytes(p);
            if bytes > budget {
                return Err(Error::PartitionTooLarge {
                    partition: p as usize,
                    bytes,
                    budget,
                });
            }
            if current_bytes + bytes > budget && !current.is_empty() {
                batches.push(mem::take(&mut current));
                current_bytes = 0;
            }
            current.push(p);
            current_bytes += bytes;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    fn load_partition<T: ElemType>(&self, part: u32) -> Result<LoadedPartition<T>> {
        let lo = self.offsets[part as usize];
        let hi = self.offsets[part as usize + 1];
        let cols = T::from_any(storage::read_dense_cols(
            &self.parts_uri,
            self.read_range,
            lo,
            hi,
        )?)?;
        let ids = storage::read_dense_cols(&self.ids_uri, self.read_range, lo, hi)?
            .into_u64_row()?;
        Ok(LoadedPartition { part, cols, ids })
    }

    fn run<T: ElemType>(
        &self,
        queries: &ColMajorMatrix<f32>,
        k: usize,
        selected: &[Vec<u32>],
        batches: &[Vec<u32>],
        scan_order: ScanOrder,
        select: Select,
    ) -> Result<Neighbors> {
        let m = queries.ncols();
        match select {
            Select::Heap => {
                let mut running: Vec<TopkHeap> = (0..m).map(|_| TopkHeap::new(k)).collect();
                for batch in batches {
                    let loaded = self.load_batch::<T>(batch)?;
                    let scanned: Vec<TopkHeap> =
                        scan_batch(&loaded, queries, selected, k, scan_order);
                    for (into, from) in running.iter_mut().zip(scanned) {
                        into.absorb(from);
                    }
                    // Batch buffers drop here before the next load.
                }
                Ok(Neighbors::from_rows(
                    running.into_iter().map(TopkHeap::into_sorted).collect(),
                    k,
                ))
            }
            Select::Nth => {
                let mut running: Vec<Vec<(f32, u64)>> = vec![Vec::new(); m];
                for batch in batches {
                    let loaded = self.load_batch::<T>(batch)?;
                    let scanned: Vec<Vec<(f32, u64)>> =
                        scan_batch(&loaded, queries, selected, k, scan_order);
                    for (into, from) in running.iter_mut().zip(scanned) {
                        *into = merge_topk(mem::take(into), nth_topk(from, k), k);
                    }
                }
                Ok(Neighbors::from_rows(running, k))
            }
        }
    }

    fn load_batch<T: ElemType>(&self, batch: &[u32]) -> Result<Vec<LoadedPartition<T>>> {
        batch.iter().map(|&p| self.load_partition(p)).collect()
    }
}

/// Scans the partitions of one batch for every query that probes them,
/// returning one collector per query.
fn scan_batch<T: ElemType, C: Collector>(
    batch: &[LoadedPartition<T>],
    queries: &ColMajorMatrix<f32>,
    selected: &[Vec<u32>],
    k: usize,
    scan_order: ScanOrder,
) -> Vec<C> {
    let m = queries.ncols();
    match scan_order {
        ScanOrder::QueryMajor => (0..m)
            .into_par_iter()
            .map(|qi| {
                let q = queries.col(qi);
                let mut sink = C::new(k);
                for part in batch {
                    if selected[qi].binary_search(&part.part).is_err() {
                        continue;
                    }
                    for (col, &id) in part.cols.iter_cols().zip(&part.ids) {
                        sink.add(squared_l2(q, col), id);
                    }
                }
                sink
            })
            .collect(),
        ScanOrder::VectorMajor => {
            let per_partition: Vec<Vec<(usize, C)>> = batch
                .par_iter()
                .map(|part| {
                    let probing: Vec<usize> = (0..m)
                        .filter(|&qi| selected[qi].binary_search(&part.part).is_ok())
                        .collect();
                    let mut sinks: Vec<(usize, C)> =
                        probing.into_iter().map(|qi| (qi, C::new(k))).collect();
                    for (col, &id) in part.cols.iter_cols().zip(&part.ids) {
                        for (qi, sink) in sinks.iter_mut() {
                            sink.add(squared_l2(queries.col(*qi), col), id);
                        }
                    }
                    sinks
                })
                .collect();
            let mut out: Vec<C> = (0..m).map(|_| C::new(k)).collect();
            for sinks in per_partition {
                for (qi, sink) in sinks {
                    out[qi].absorb(sink);
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::IndexType;
    use crate::matrix::{u64_row, AnyMatrix};
    use tempfile::tempdir;

    /// Hand-built two-partition snapshot: partition 0 around (0,0),
    /// partition 1 around (10,10).
    fn build_group(dir: &std::path::Path) -> IndexGroup {
        let mut group = IndexGroup::create(dir, IndexType::IvfFlat, Dtype::F32, 2).unwrap();
        let ts = 10;

        let mut parts = ColMajorMatrix::<f32>::with_rows(2);
        for v in [[0.0f32, 0.0], [1.0, 0.0], [10.0, 10.0], [11.0, 10.0]] {
            parts.push_col(&v);
        }
        storage::append_dense(&group.parts_uri().unwrap(), &AnyMatrix::F32(parts), 0, ts)
            .unwrap();
        storage::append_dense(&group.ids_uri().unwrap(), &u64_row(&[100, 101, 200, 201]), 0, ts)
            .unwrap();

        let mut centroids = ColMajorMatrix::<f32>::with_rows(2);
        centroids.push_col(&[0.5, 0.0]);
        centroids.push_col(&[10.5, 10.0]);
        storage::append_dense(
            &group.centroids_uri().unwrap(),
            &AnyMatrix::F32(centroids),
            0,
            ts,
        )
        .unwrap();
        storage::append_dense(&group.offsets_uri().unwrap(), &u64_row(&[0, 2, 4]), 0, ts)
            .unwrap();

        group.ingestion_timestamps = vec![ts];
        group.partition_history = vec![2];
        group.base_sizes = vec![4];
        group.save().unwrap();
        group
    }

    fn query(v: [f32; 2]) -> ColMajorMatrix<f32> {
        let mut q = ColMajorMatrix::with_rows(2);
        q.push_col(&v);
        q
    }

    #[test]
    fn probes_only_selected_partition() {
        let dir = tempdir().unwrap();
        let group = build_group(&dir.path().join("g"));
        let index = IvfFlatIndex::open(&group, 10).unwrap();
        let res = index
            .query(&query([0.0, 0.0]), 4, 1, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        // nprobe=1 sees only the near partition; the rest pads out.
        assert_eq!(res.ids(0)[..2], [100, 101]);
        assert_eq!(res.ids(0)[2..], [SENTINEL_ID, SENTINEL_ID]);
    }

    #[test]
    fn full_probe_matches_exhaustive_order() {
        let dir = tempdir().unwrap();
        let group = build_group(&dir.path().join("g"));
        let index = IvfFlatIndex::open(&group, 10).unwrap();
        let res = index
            .query(&query([9.0, 9.0]), 4, 2, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        assert_eq!(res.ids(0), &[200, 201, 101, 100]);
    }

    #[test]
    fn scan_orders_and_selects_agree() {
        let dir = tempdir().unwrap();
        let group = build_group(&dir.path().join("g"));
        let index = IvfFlatIndex::open(&group, 10).unwrap();
        let q = query([3.0, 2.0]);
        let base = index
            .query(&q, 3, 2, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        for order in [ScanOrder::QueryMajor, ScanOrder::VectorMajor] {
            for select in [Select::Heap, Select::Nth] {
                let res = index.query(&q, 3, 2, None, order, select).unwrap();
                assert_eq!(res, base);
            }
        }
    }

    #[test]
    fn memory_budget_equivalence_and_failure() {
        let dir = tempdir().unwrap();
        let group = build_group(&dir.path().join("g"));
        let index = IvfFlatIndex::open(&group, 10).unwrap();
        let q = query([5.0, 5.0]);
        let unbounded = index
            .query(&q, 4, 2, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        let one_partition_bytes = 2 * (4 * 2 + 8);
        let batched = index
            .query(
                &q,
                4,
                2,
                Some(one_partition_bytes),
                ScanOrder::QueryMajor,
                Select::Heap,
            )
            .unwrap();
        assert_eq!(batched, unbounded);

        assert!(matches!(
            index.query(&q, 4, 2, Some(7), ScanOrder::QueryMajor, Select::Heap),
            Err(Error::PartitionTooLarge { .. })
        ));
    }

    #[test]
    fn nprobe_clamps_to_partition_count() {
        let dir = tempdir().unwrap();
        let group = build_group(&dir.path().join("g"));
        let index = IvfFlatIndex::open(&group, 10).unwrap();
        let q = query([0.0, 0.0]);
        let clamped = index
            .query(&q, 4, 99, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        let full = index
            .query(&q, 4, 2, None, ScanOrder::QueryMajor, Select::Heap)
            .unwrap();
        assert_eq!(clamped, full);
    }
}
