//! Scanning the updates log into an effective view: last-writer-wins per
//! external id, split into deletions and additions.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::flat::scan_matrix;
use crate::matrix::{AnyMatrix, ColMajorMatrix};
use crate::storage::{self, SparseCell, TsRange};
use crate::topk::{Neighbors, Select};
use crate::{Dtype, ElemType, Error, Result};

/// Effective state of the updates log over one timestamp window. For every
/// external id only the newest row in the window counts; an empty value is
/// a deletion tombstone, anything else an insertion-or-replacement.
#[derive(Clone, Debug)]
pub struct UpdateView {
    pub deleted: Vec<u64>,
    pub added_ids: Vec<u64>,
    pub added: AnyMatrix,
}

impl UpdateView {
    pub fn scan(updates_uri: &Path, dtype: Dtype, dim: usize, range: TsRange) -> Result<Self> {
        let cells = storage::read_sparse(updates_uri, range)?;
        Self::from_cells(cells, dtype, dim)
    }

    pub(crate) fn from_cells(cells: Vec<SparseCell>, dtype: Dtype, dim: usize) -> Result<Self> {
        // Replay order makes the later fragment win same-timestamp ties.
        let mut latest: BTreeMap<u64, SparseCell> = BTreeMap::new();
        for cell in cells {
            match latest.get(&cell.id) {
                Some(prev) if prev.ts > cell.ts => {}
                _ => {
                    latest.insert(cell.id, cell);
                }
            }
        }
        let mut deleted = Vec::new();
        let mut added_ids = Vec::new();
        let mut added = AnyMatrix::with_rows(dtype, dim);
        for (id, cell) in latest {
            if cell.value.is_empty() {
                deleted.push(id);
            } else {
                added_ids.push(id);
                push_decoded(&mut added, &cell.value, dim)?;
            }
        }
        Ok(Self {
            deleted,
            added_ids,
            added,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added_ids.is_empty()
    }

    /// Ids invalidated on the base side of a merge: deletions plus both
    /// halves of every replacement.
    #[must_use]
    pub fn updated_ids(&self) -> HashSet<u64> {
        self.deleted
            .iter()
            .chain(self.added_ids.iter())
            .copied()
            .collect()
    }

    /// Brute-force top-k of the queries against the added vectors.
    #[must_use]
    pub fn query(&self, queries: &ColMajorMatrix<f32>, k: usize, select: Select) -> Neighbors {
        scan_matrix(&self.added, Some(&self.added_ids), queries, k, select)
    }
}

fn push_decoded(added: &mut AnyMatrix, value: &[u8], dim: usize) -> Result<()> {
    match added {
        AnyMatrix::U8(m) => push_typed::<u8>(m, value, dim),
        AnyMatrix::I8(m) => push_typed::<i8>(m, value, dim),
        AnyMatrix::F32(m) => push_typed::<f32>(m, value, dim),
        AnyMatrix::U64(m) => push_typed::<u64>(m, value, dim),
    }
}

fn push_typed<T: ElemType>(m: &mut ColMajorMatrix<T>, value: &[u8], dim: usize) -> Result<()> {
    let decoded = T::from_bytes(value)?;
    if decoded.len() != dim {
        return Err(Error::Corrupt(format!(
            "updates cell holds {} elements, index dimension is {dim}",
            decoded.len()
        )));
    }
    m.push_col(&decoded);
    Ok(())
}
