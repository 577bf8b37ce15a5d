//! Ingestion pipeline: trains centroids, assigns vectors to partitions,
//! writes the shuffled base arrays and publishes a new snapshot timestamp.

use std::collections::HashSet;
use std::path::Path;

use indicatif::ParallelProgressIterator;
use log::info;
use num_traits::AsPrimitive;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::group::{IndexGroup, IndexType};
use crate::kmeans::{self, KmeansParams};
use crate::matrix::{u64_row, AnyMatrix, ColMajorMatrix};
use crate::storage::{self, TsRange};
use crate::updates::UpdateView;
use crate::{ElemType, Error, Result, SENTINEL_ID};

#[derive(Clone, Copy, Debug)]
pub struct IngestParams {
    pub index_type: IndexType,
    /// Partition count for IVF-Flat; 0 derives `max(1, sqrt(N))`.
    pub partitions: usize,
    /// Training vectors sampled for k-means; 0 derives `min(N, 100 * P)`.
    pub training_sample_size: usize,
    pub kmeans: KmeansParams,
    /// Shard width of the shuffle-write step.
    pub vectors_per_work_item: usize,
    /// Ingestion timestamp; `None` uses the current wall clock.
    pub index_timestamp: Option<u64>,
}

impl IngestParams {
    #[must_use]
    pub fn flat() -> Self {
        Self {
            index_type: IndexType::Flat,
            partitions: 0,
            training_sample_size: 0,
            kmeans: KmeansParams::default(),
            vectors_per_work_item: 100_000,
            index_timestamp: None,
        }
    }

    #[must_use]
    pub fn ivf_flat(partitions: usize) -> Self {
        Self {
            index_type: IndexType::IvfFlat,
            partitions,
            ..Self::flat()
        }
    }
}

/// Ingests `vectors` as a new base snapshot of the group at `uri`, creating
/// the group if needed. External ids default to the row index. The snapshot
/// becomes visible only once the group metadata is republished, so a failed
/// ingestion leaves no observable trace.
pub fn ingest(
    uri: &Path,
    vectors: &AnyMatrix,
    external_ids: Option<&[u64]>,
    params: &IngestParams,
) -> Result<()> {
    let mut group = if uri.join("group.json").exists() {
        let group = IndexGroup::open(uri)?;
        if group.index_type != params.index_type {
            return Err(Error::InvalidArgument(format!(
                "group is {}, ingestion requested {}",
                group.index_type.name(),
                params.index_type.name()
            )));
        }
        if group.dtype != vectors.dtype() {
            return Err(Error::TypeMismatch(format!(
                "{} vectors into a {} group",
                vectors.dtype().name(),
                group.dtype.name()
            )));
        }
        if group.dimensions != vectors.nrows() {
            return Err(Error::ShapeMismatch(format!(
                "{}-dimensional vectors into a {}-dimensional group",
                vectors.nrows(),
                group.dimensions
            )));
        }
        group
    } else {
        IndexGroup::create(uri, params.index_type, vectors.dtype(), vectors.nrows())?
    };

    let n = vectors.ncols();
    let default_ids: Vec<u64>;
    let ids: &[u64] = match external_ids {
        Some(ids) => ids,
        None => {
            default_ids = (0..n as u64).collect();
            &default_ids
        }
    };
    if ids.len() != n {
        return Err(Error::InvalidArgument(format!(
            "{} external ids for {} vectors",
            ids.len(),
            n
        )));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    for &id in ids {
        if id == SENTINEL_ID {
            return Err(Error::InvalidArgument(
                "u64::MAX is a reserved external id".to_string(),
            ));
        }
        if !seen.insert(id) {
            return Err(Error::InvalidArgument(format!(
                "duplicate external id {id} in one base snapshot"
            )));
        }
    }

    let ts = params.index_timestamp.unwrap_or_else(storage::now_ms);
    if let Some(latest) = group.latest_ingestion() {
        if ts <= latest {
            return Err(Error::TimestampBeforeLatestIngestion { ts, latest });
        }
    }

    let partitions = match vectors {
        AnyMatrix::U8(m) => ingest_typed(&group, m, ids, params, ts)?,
        AnyMatrix::I8(m) => ingest_typed(&group, m, ids, params, ts)?,
        AnyMatrix::F32(m) => ingest_typed(&group, m, ids, params, ts)?,
        AnyMatrix::U64(_) => {
            return Err(Error::TypeMismatch(
                "uint64 is not a vector element type".to_string(),
            ))
        }
    };

    group.ingestion_timestamps.push(ts);
    group.partition_history.push(partitions);
    group.base_sizes.push(n as u64);
    group.index_version += 1;
    group.save()?;
    info!(
        "published snapshot at {ts}: {n} vectors, {partitions} partitions, group version {}",
        group.index_version
    );
    Ok(())
}

/// Writes the base arrays for one snapshot; returns the published partition
/// count (0 for flat).
fn ingest_typed<T: ElemType>(
    group: &IndexGroup,
    vectors: &ColMajorMatrix<T>,
    ids: &[u64],
    params: &IngestParams,
    ts: u64,
) -> Result<u64> {
    match params.index_type {
        IndexType::Flat => {
            write_shards(group, vectors, ids, None, params.vectors_per_work_item, ts)?;
            Ok(0)
        }
        IndexType::IvfFlat => {
            let n = vectors.ncols();
            let partitions = if params.partitions > 0 {
                params.partitions
            } else {
                ((n as f64).sqrt() as usize).max(1)
            };

            let sample_size = if params.training_sample_size > 0 {
                params.training_sample_size.min(n)
            } else {
                (100 * partitions).min(n)
            };
            let mut rng = match params.kmeans.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut training = ColMajorMatrix::<f32>::with_rows(vectors.nrows());
            if n > 0 {
                for i in rand::seq::index::sample(&mut rng, n, sample_size) {
                    let col: Vec<f32> = vectors.col(i).iter().map(|&v| v.as_()).collect();
                    training.push_col(&col);
                }
            }
            info!(
                "training {partitions} centroids on {} of {n} vectors",
                training.ncols()
            );
            let centroids = kmeans::train(&training, partitions, &params.kmeans);

            let assign: Vec<usize> = (0..n)
                .into_par_iter()
                .progress_count(n as u64)
                .map(|i| kmeans::nearest_centroid(vectors.col(i), &centroids))
                .collect();

            let mut counts = vec![0u64; partitions];
            for &p in &assign {
                counts[p] += 1;
            }
            let mut offsets = Vec::with_capacity(partitions + 1);
            let mut acc = 0u64;
            offsets.push(0);
            for &c in &counts {
                acc += c;
                offsets.push(acc);
            }

            write_shards(
                group,
                vectors,
                ids,
                Some((&assign, &offsets)),
                params.vectors_per_work_item,
                ts,
            )?;

            storage::append_dense(
                &group.centroids_uri()?,
                &AnyMatrix::F32(centroids),
                0,
                ts,
            )?;
            storage::append_dense(&group.offsets_uri()?, &u64_row(&offsets), 0, ts)?;
            Ok(partitions as u64)
        }
    }
}

/// Shuffle-write: the input is cut into shards of `vectors_per_work_item`
/// columns; every shard buffers its vectors per partition and lands each
/// buffer at that partition's next free offset. Flat snapshots are the
/// single-partition special case and keep the input order.
fn write_shards<T: ElemType>(
    group: &IndexGroup,
    vectors: &ColMajorMatrix<T>,
    ids: &[u64],
    layout: Option<(&[usize], &[u64])>,
    vectors_per_work_item: usize,
    ts: u64,
) -> Result<()> {
    let parts_uri = group.parts_uri()?;
    let ids_uri = group.ids_uri()?;
    let n = vectors.ncols();
    let shard_width = vectors_per_work_item.max(1);

    let (assign, offsets) = match layout {
        Some((assign, offsets)) => (assign, offsets),
        None => {
            // No partitioning: stream shards straight through.
            for lo in (0..n).step_by(shard_width) {
                let hi = (lo + shard_width).min(n);
                storage::append_dense(
                    &parts_uri,
                    &T::into_any(vectors.cols_range(lo, hi)),
                    lo as u64,
                    ts,
                )?;
                storage::append_dense(&ids_uri, &u64_row(&ids[lo..hi]), lo as u64, ts)?;
            }
            return Ok(());
        }
    };

    let partitions = offsets.len() - 1;
    // Next free slot per partition, advanced shard by shard so the
    // concatenated buffers land exactly on the offset index.
    let mut cursor: Vec<u64> = offsets[..partitions].to_vec();
    for lo in (0..n).step_by(shard_width) {
        let hi = (lo + shard_width).min(n);
        let mut part_vecs: Vec<ColMajorMatrix<T>> = (0..partitions)
            .map(|_| ColMajorMatrix::with_rows(vectors.nrows()))
            .collect();
        let mut part_ids: Vec<Vec<u64>> = vec![Vec::new(); partitions];
        for j in lo..hi {
            let p = assign[j];
            part_vecs[p].push_col(vectors.col(j));
            part_ids[p].push(ids[j]);
        }
        for (p, (vecs, pids)) in part_vecs.into_iter().zip(part_ids).enumerate() {
            if vecs.is_empty() {
                continue;
            }
            let written = vecs.ncols() as u64;
            storage::append_dense(&parts_uri, &T::into_any(vecs), cursor[p], ts)?;
            storage::append_dense(&ids_uri, &u64_row(&pids), cursor[p], ts)?;
            cursor[p] += written;
        }
    }
    debug_assert!(cursor
        .iter()
        .zip(&offsets[1..])
        .all(|(c, &end)| *c == end));
    Ok(())
}

/// Replays the effective updates log into a fresh base snapshot whose
/// timestamp is strictly greater than every consumed cell timestamp, then
/// compacts the consumed log fragments.
pub fn consolidate_updates(uri: &Path) -> Result<u64> {
    let group = IndexGroup::open(uri)?;
    let latest = group.latest_ingestion().ok_or_else(|| {
        Error::InvalidArgument("group has no ingested snapshot to consolidate onto".to_string())
    })?;
    let n = group.base_size_at(latest)?;
    let read_range = TsRange::up_to(latest);

    let cells = storage::read_sparse(&group.updates_uri()?, TsRange::new(latest + 1, u64::MAX))?;
    let max_cell_ts = cells.iter().map(|c| c.ts).max().unwrap_or(latest);
    let view = UpdateView::from_cells(cells, group.dtype, group.dimensions)?;

    let base_vectors = storage::read_dense(&group.parts_uri()?, read_range, n)?;
    let base_ids = storage::read_dense(&group.ids_uri()?, read_range, n)?.into_u64_row()?;

    let new_ts = storage::now_ms().max(max_cell_ts + 1).max(latest + 1);
    let partitions = group.partitions_at(latest)? as usize;
    let params = IngestParams {
        index_type: group.index_type,
        partitions,
        index_timestamp: Some(new_ts),
        ..IngestParams::flat()
    };

    let (merged, merged_ids) = match (base_vectors, &view.added) {
        (AnyMatrix::U8(base), AnyMatrix::U8(added)) => {
            let (m, i) = replay(&base, &base_ids, added, &view);
            (AnyMatrix::U8(m), i)
        }
        (AnyMatrix::I8(base), AnyMatrix::I8(added)) => {
            let (m, i) = replay(&base, &base_ids, added, &view);
            (AnyMatrix::I8(m), i)
        }
        (AnyMatrix::F32(base), AnyMatrix::F32(added)) => {
            let (m, i) = replay(&base, &base_ids, added, &view);
            (AnyMatrix::F32(m), i)
        }
        _ => {
            return Err(Error::Corrupt(
                "updates log dtype disagrees with the base arrays".to_string(),
            ))
        }
    };

    info!(
        "consolidating {} deletions and {} additions into snapshot {new_ts}",
        view.deleted.len(),
        view.added_ids.len()
    );
    ingest(uri, &merged, Some(&merged_ids), &params)?;

    let updates_uri = group.updates_uri()?;
    storage::consolidate(&updates_uri)?;
    storage::vacuum(&updates_uri)?;
    Ok(new_ts)
}

/// Live rows of the consolidated snapshot: base rows that were neither
/// deleted nor replaced, followed by the effective additions.
fn replay<T: ElemType>(
    base: &ColMajorMatrix<T>,
    base_ids: &[u64],
    added: &ColMajorMatrix<T>,
    view: &UpdateView,
) -> (ColMajorMatrix<T>, Vec<u64>) {
    let updated = view.updated_ids();
    let mut vectors = ColMajorMatrix::with_rows(base.nrows());
    let mut ids = Vec::new();
    for (j, &id) in base_ids.iter().enumerate() {
        if updated.contains(&id) {
            continue;
        }
        vectors.push_col(base.col(j));
        ids.push(id);
    }
    for (j, &id) in view.added_ids.iter().enumerate() {
        vectors.push_col(added.col(j));
        ids.push(id);
    }
    (vectors, ids)
}
