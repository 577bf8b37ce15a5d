//! User-facing index handle: a consistent logical view of one base snapshot
//! plus a window of the updates log, resolved from the caller's timestamp.

use std::collections::HashSet;
use std::path::Path;

use itertools::Itertools;
use log::debug;

use crate::flat::FlatIndex;
use crate::group::{IndexGroup, IndexType};
use crate::ingest::{self, IngestParams};
use crate::ivf::{IvfFlatIndex, ScanOrder};
use crate::matrix::{AnyMatrix, ColMajorMatrix};
use crate::storage::{self, TsRange};
use crate::topk::{cmp_pair, sentinel_pair, Neighbors, Select};
use crate::updates::UpdateView;
use crate::{Dtype, ElemType, Error, Result, SENTINEL_ID};

/// Updates-log fragment count that triggers compaction on the write path.
const MAX_UPDATE_FRAGMENTS: usize = 10;

/// Oversampling factor for the base query during a merge with the updates
/// log: deletions may invalidate base results, so the base side fetches
/// `RETRIEVAL_FACTOR * k` before truncating back to `k`.
const RETRIEVAL_FACTOR: usize = 2;

/// The point in logical time a handle reads at.
///
/// * `Latest`: newest snapshot plus every update written after it.
/// * `At(t)`: the snapshot in effect at `t` plus the updates up to `t`.
/// * `Range(a, b)`: explicit window. When `a` lies after the first
///   ingestion timestamp no base snapshot is read at all: the view shows
///   only vectors written to the updates log inside `[a, b]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timestamp {
    #[default]
    Latest,
    At(u64),
    Range(u64, u64),
}

#[derive(Clone, Copy, Debug)]
pub struct QueryParams {
    /// Partitions probed per query (IVF only); clamped to `[1, P]`.
    pub nprobe: usize,
    /// Byte budget for out-of-core partition loading (IVF only).
    pub memory_budget: Option<usize>,
    pub scan_order: ScanOrder,
    pub select: Select,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            nprobe: 1,
            memory_budget: None,
            scan_order: ScanOrder::default(),
            select: Select::default(),
        }
    }
}

enum Backend {
    Flat(FlatIndex),
    Ivf(IvfFlatIndex),
}

pub struct Index {
    group: IndexGroup,
    backend: Option<Backend>,
    base_ts: Option<u64>,
    update_range: TsRange,
}

impl Index {
    /// Creates a new index group and publishes an initial, empty snapshot.
    /// Queries against it return all-sentinel results until data arrives.
    pub fn create(
        uri: &Path,
        index_type: IndexType,
        dtype: Dtype,
        dimensions: usize,
        partitions: usize,
        index_timestamp: Option<u64>,
    ) -> Result<Index> {
        if dimensions == 0 {
            return Err(Error::InvalidArgument(
                "vector dimension must be positive".to_string(),
            ));
        }
        let params = IngestParams {
            index_type,
            partitions,
            index_timestamp,
            ..IngestParams::flat()
        };
        ingest::ingest(uri, &AnyMatrix::with_rows(dtype, dimensions), None, &params)?;
        Index::open(uri, Timestamp::Latest)
    }

    pub fn open(uri: &Path, at: Timestamp) -> Result<Index> {
        let group = IndexGroup::open(uri)?;
        let (base_ts, update_range) = resolve_view(&group, at);
        let backend = match base_ts {
            None => None,
            Some(ts) => Some(match group.index_type {
                IndexType::Flat => {
                    let n = group.base_size_at(ts)?;
                    let read_range = TsRange::up_to(ts);
                    let vectors = storage::read_dense(&group.parts_uri()?, read_range, n)?;
                    let ids = storage::read_dense(&group.ids_uri()?, read_range, n)?
                        .into_u64_row()?;
                    Backend::Flat(FlatIndex::new(vectors, ids)?)
                }
                IndexType::IvfFlat => Backend::Ivf(IvfFlatIndex::open(&group, ts)?),
            }),
        };
        debug!(
            "opened {} at base {base_ts:?}, updates [{}, {}]",
            uri.display(),
            update_range.lo,
            update_range.hi
        );
        Ok(Index {
            group,
            backend,
            base_ts,
            update_range,
        })
    }

    #[must_use]
    pub fn uri(&self) -> &Path {
        self.group.uri()
    }

    #[must_use]
    pub fn index_type(&self) -> IndexType {
        self.group.index_type
    }

    #[must_use]
    pub fn dtype(&self) -> Dtype {
        self.group.dtype
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.group.dimensions
    }

    #[must_use]
    pub fn base_timestamp(&self) -> Option<u64> {
        self.base_ts
    }

    #[must_use]
    pub fn ingestion_timestamps(&self) -> &[u64] {
        &self.group.ingestion_timestamps
    }

    /// k-nearest neighbors of every query column under squared Euclidean
    /// distance, honoring the deletions and replacements visible in this
    /// handle's timestamp window.
    pub fn query(
        &self,
        queries: &ColMajorMatrix<f32>,
        k: usize,
        params: &QueryParams,
    ) -> Result<Neighbors> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be positive".to_string()));
        }
        if queries.nrows() != self.group.dimensions {
            return Err(Error::ShapeMismatch(format!(
                "query dimension {} against index dimension {}",
                queries.nrows(),
                self.group.dimensions
            )));
        }
        let m = queries.ncols();
        let retrieval_k = RETRIEVAL_FACTOR * k;

        // The updates-log scan runs as a task concurrent with the base-index
        // query; both are joined here before merging.
        let (base_res, update_res) = rayon::join(
            || -> Result<Neighbors> {
                match &self.backend {
                    None => Ok(Neighbors::sentinel(m, retrieval_k)),
                    Some(Backend::Flat(index)) => index.query(queries, retrieval_k, params.select),
                    Some(Backend::Ivf(index)) => index.query(
                        queries,
                        retrieval_k,
                        params.nprobe,
                        params.memory_budget,
                        params.scan_order,
                        params.select,
                    ),
                }
            },
            || -> Result<(UpdateView, Neighbors)> {
                let view = UpdateView::scan(
                    &self.group.updates_uri()?,
                    self.group.dtype,
                    self.group.dimensions,
                    self.update_range,
                )?;
                let res = view.query(queries, k, params.select);
                Ok((view, res))
            },
        );
        let base = base_res?;
        let (view, additions) = update_res?;
        Ok(merge(&base, &additions, &view.updated_ids(), k))
    }

    /// Inserts or replaces one vector in the updates log.
    pub fn update(&self, external_id: u64, vector: &AnyMatrix, ts: Option<u64>) -> Result<()> {
        self.update_batch(&[external_id], vector, ts)
    }

    /// Batch insert-or-replace: column `j` of `vectors` becomes the new
    /// value of `external_ids[j]`.
    pub fn update_batch(
        &self,
        external_ids: &[u64],
        vectors: &AnyMatrix,
        ts: Option<u64>,
    ) -> Result<()> {
        if vectors.dtype() != self.group.dtype {
            return Err(Error::TypeMismatch(format!(
                "{} update against a {} index",
                vectors.dtype().name(),
                self.group.dtype.name()
            )));
        }
        if vectors.nrows() != self.group.dimensions {
            return Err(Error::ShapeMismatch(format!(
                "{}-dimensional update against a {}-dimensional index",
                vectors.nrows(),
                self.group.dimensions
            )));
        }
        if external_ids.len() != vectors.ncols() {
            return Err(Error::InvalidArgument(format!(
                "{} ids for {} update vectors",
                external_ids.len(),
                vectors.ncols()
            )));
        }
        let rows: Vec<(u64, Vec<u8>)> = match vectors {
            AnyMatrix::U8(m) => encode_rows(external_ids, m),
            AnyMatrix::I8(m) => encode_rows(external_ids, m),
            AnyMatrix::F32(m) => encode_rows(external_ids, m),
            AnyMatrix::U64(_) => unreachable!("group never holds uint64 vectors"),
        };
        self.write_cells(rows, ts)
    }

    /// Writes a deletion tombstone. Deleting an absent or already-deleted id
    /// is a no-op at read time, so the call is idempotent.
    pub fn delete(&self, external_id: u64, ts: Option<u64>) -> Result<()> {
        self.delete_batch(&[external_id], ts)
    }

    pub fn delete_batch(&self, external_ids: &[u64], ts: Option<u64>) -> Result<()> {
        let rows = external_ids.iter().map(|&id| (id, Vec::new())).collect();
        self.write_cells(rows, ts)
    }

    fn write_cells(&self, rows: Vec<(u64, Vec<u8>)>, ts: Option<u64>) -> Result<()> {
        for (id, _) in &rows {
            if *id == SENTINEL_ID {
                return Err(Error::InvalidArgument(
                    "u64::MAX is a reserved external id".to_string(),
                ));
            }
        }
        let latest = self.group.latest_ingestion().unwrap_or(0);
        let cell_ts = match ts {
            Some(ts) => {
                if ts <= latest {
                    return Err(Error::TimestampBeforeLatestIngestion { ts, latest });
                }
                ts
            }
            None => storage::now_ms().max(latest + 1),
        };
        let updates_uri = self.group.updates_uri()?;
        storage::append_sparse(&updates_uri, &rows, cell_ts)?;
        if storage::fragments(&updates_uri)?.len() > MAX_UPDATE_FRAGMENTS {
            storage::consolidate(&updates_uri)?;
            storage::vacuum(&updates_uri)?;
        }
        Ok(())
    }

    /// Replays the effective updates into a fresh base snapshot and returns
    /// a handle on it. Time travel to older timestamps keeps working: the
    /// consumed log cells stay readable at their original timestamps.
    pub fn consolidate_updates(self) -> Result<Index> {
        let uri = self.group.uri().to_path_buf();
        drop(self);
        ingest::consolidate_updates(&uri)?;
        Index::open(&uri, Timestamp::Latest)
    }
}

/// Timestamp-selection rules mapping the caller's view to a base snapshot
/// and an updates window.
fn resolve_view(group: &IndexGroup, at: Timestamp) -> (Option<u64>, TsRange) {
    let first = group.ingestion_timestamps.first().copied();
    match at {
        Timestamp::Latest => match group.latest_ingestion() {
            Some(latest) => (Some(latest), TsRange::new(latest + 1, u64::MAX)),
            None => (None, TsRange::new(0, u64::MAX)),
        },
        Timestamp::At(t) => match group.select_base_ts(t) {
            Some(base) => (Some(base), TsRange::new(base + 1, t)),
            None => (None, TsRange::new(0, t)),
        },
        Timestamp::Range(a, b) => match first {
            // A window opening after the first snapshot skips the base read
            // entirely and shows only the updates written inside it.
            Some(first_ts) if a <= first_ts => {
                (Some(first_ts), TsRange::new(first_ts + 1, b))
            }
            _ => (None, TsRange::new(a, b)),
        },
    }
}

/// Merges base-index rows with updates-log rows. Base entries whose id was
/// deleted or replaced are invalidated to the sentinel, as is the pair
/// `(0.0, 0)`: the dense store zero-fills unwritten cells, so that pair can
/// be a phantom match against an unwritten column. A genuine exact match on
/// external id 0 at distance zero is coerced too.
fn merge(base: &Neighbors, additions: &Neighbors, updated: &HashSet<u64>, k: usize) -> Neighbors {
    let m = base.nqueries();
    let mut rows = Vec::with_capacity(m);
    for qi in 0..m {
        let invalidated = base.row(qi).into_iter().map(|pair| {
            if (pair.0 == 0.0 && pair.1 == 0) || updated.contains(&pair.1) {
                sentinel_pair()
            } else {
                pair
            }
        });
        let row: Vec<(f32, u64)> = invalidated
            .chain(additions.row(qi))
            .sorted_unstable_by(cmp_pair)
            .take(k)
            .collect();
        rows.push(row);
    }
    Neighbors::from_rows(rows, k)
}

fn encode_rows<T: ElemType>(ids: &[u64], vectors: &ColMajorMatrix<T>) -> Vec<(u64, Vec<u8>)> {
    ids.iter()
        .zip(vectors.iter_cols())
        .map(|(&id, col)| (id, T::to_bytes(col)))
        .collect()
}
