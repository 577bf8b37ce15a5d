//! Exhaustive (flat) index: a dense column-major matrix of base vectors and
//! the row-aligned external ids.

use rayon::prelude::*;

use crate::distances::squared_l2;
use crate::matrix::{AnyMatrix, ColMajorMatrix};
use crate::topk::{nth_topk, Neighbors, Select, TopkHeap};
use crate::{ElemType, Error, Result};

#[derive(Clone, Debug)]
pub struct FlatIndex {
    vectors: AnyMatrix,
    ids: Vec<u64>,
}

impl FlatIndex {
    pub fn new(vectors: AnyMatrix, ids: Vec<u64>) -> Result<Self> {
        if ids.len() != vectors.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.ncols()
            )));
        }
        Ok(Self { vectors, ids })
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.vectors.nrows()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.ncols()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Scans every base vector for every query. Workers take contiguous
    /// column blocks, keep a local heap per query and merge at the end.
    pub fn query(
        &self,
        queries: &ColMajorMatrix<f32>,
        k: usize,
        select: Select,
    ) -> Result<Neighbors> {
        if queries.nrows() != self.dim() {
            return Err(Error::ShapeMismatch(format!(
                "query dimension {} against index dimension {}",
                queries.nrows(),
                self.dim()
            )));
        }
        Ok(scan_matrix(&self.vectors, Some(&self.ids), queries, k, select))
    }
}

/// Brute-force top-k of `queries` against the columns of `vectors`.
/// Candidates carry `ids[j]` when ids are given, the column index otherwise.
/// Also serves the updates-log scan, which brings its own external ids.
pub(crate) fn scan_matrix(
    vectors: &AnyMatrix,
    ids: Option<&[u64]>,
    queries: &ColMajorMatrix<f32>,
    k: usize,
    select: Select,
) -> Neighbors {
    match vectors {
        AnyMatrix::U8(m) => scan_typed(m, ids, queries, k, select),
        AnyMatrix::I8(m) => scan_typed(m, ids, queries, k, select),
        AnyMatrix::F32(m) => scan_typed(m, ids, queries, k, select),
        AnyMatrix::U64(m) => scan_typed(m, ids, queries, k, select),
    }
}

fn scan_typed<T: ElemType>(
    vectors: &ColMajorMatrix<T>,
    ids: Option<&[u64]>,
    queries: &ColMajorMatrix<f32>,
    k: usize,
    select: Select,
) -> Neighbors {
    let n = vectors.ncols();
    let m = queries.ncols();
    if n == 0 || m == 0 || k == 0 {
        return Neighbors::sentinel(m, k);
    }
    let block = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let blocks: Vec<(usize, usize)> = (0..n)
        .step_by(block)
        .map(|lo| (lo, (lo + block).min(n)))
        .collect();

    match select {
        Select::Heap => {
            let partials: Vec<Vec<TopkHeap>> = blocks
                .par_iter()
                .map(|&(lo, hi)| {
                    let mut heaps: Vec<TopkHeap> = (0..m).map(|_| TopkHeap::new(k)).collect();
                    for j in lo..hi {
                        let col = vectors.col(j);
                        let id = ids.map_or(j as u64, |ids| ids[j]);
                        for (heap, q) in heaps.iter_mut().zip(queries.iter_cols()) {
                            heap.push(squared_l2(q, col), id);
                        }
                    }
                    heaps
                })
                .collect();
            let mut merged: Vec<TopkHeap> = (0..m).map(|_| TopkHeap::new(k)).collect();
            for worker in partials {
                for (into, from) in merged.iter_mut().zip(worker) {
                    into.absorb(from);
                }
            }
            Neighbors::from_rows(merged.into_iter().map(TopkHeap::into_sorted).collect(), k)
        }
        Select::Nth => {
            let partials: Vec<Vec<Vec<(f32, u64)>>> = blocks
                .par_iter()
                .map(|&(lo, hi)| {
                    let mut rows: Vec<Vec<(f32, u64)>> =
                        (0..m).map(|_| Vec::with_capacity(hi - lo)).collect();
                    for j in lo..hi {
                        let col = vectors.col(j);
                        let id = ids.map_or(j as u64, |ids| ids[j]);
                        for (row, q) in rows.iter_mut().zip(queries.iter_cols()) {
                            row.push((squared_l2(q, col), id));
                        }
                    }
                    rows
                })
                .collect();
            let rows: Vec<Vec<(f32, u64)>> = (0..m)
                .into_par_iter()
                .map(|qi| {
                    let mut all = Vec::with_capacity(n);
                    for worker in &partials {
                        all.extend_from_slice(&worker[qi]);
                    }
                    nth_topk(all, k)
                })
                .collect();
            Neighbors::from_rows(rows, k)
        }
    }
}
