//! End-to-end scenarios: index lifecycle with updates and consolidation,
//! time travel, memory-budgeted probing and recall against brute force.

use std::collections::HashSet;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use quiver::flat::FlatIndex;
use quiver::ingest::{self, IngestParams};
use quiver::kmeans::KmeansParams;
use quiver::{
    AnyMatrix, ColMajorMatrix, Dtype, Error, Index, IndexType, QueryParams, Select, Timestamp,
    SENTINEL_ID,
};

fn u8_cols(cols: &[[u8; 3]]) -> AnyMatrix {
    let mut m = ColMajorMatrix::<u8>::with_rows(3);
    for c in cols {
        m.push_col(c);
    }
    AnyMatrix::U8(m)
}

fn query3(v: [f32; 3]) -> ColMajorMatrix<f32> {
    let mut q = ColMajorMatrix::with_rows(3);
    q.push_col(&v);
    q
}

fn id_set(ids: &[u64]) -> HashSet<u64> {
    ids.iter().copied().collect()
}

fn seed_five(index: &Index) {
    let vectors = u8_cols(&[[0, 0, 0], [1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]]);
    index.update_batch(&[0, 1, 2, 3, 4], &vectors, None).unwrap();
}

/// Tiny index lifecycle: insert, delete, re-insert, consolidating between
/// every step. Flat and IVF must agree at full probe depth.
fn tiny_lifecycle(uri: &Path, index_type: IndexType, partitions: usize) {
    let params = QueryParams {
        nprobe: partitions.max(1),
        ..QueryParams::default()
    };
    let q = query3([2.0, 2.0, 2.0]);

    let mut index =
        Index::create(uri, index_type, Dtype::U8, 3, partitions, Some(1)).unwrap();
    let res = index.query(&q, 3, &params).unwrap();
    assert_eq!(id_set(res.ids(0)), id_set(&[SENTINEL_ID]));

    seed_five(&index);
    for _ in 0..2 {
        let res = index.query(&q, 3, &params).unwrap();
        assert_eq!(id_set(res.ids(0)), id_set(&[1, 2, 3]));
        index = index.consolidate_updates().unwrap();
    }

    index.delete_batch(&[1, 3], None).unwrap();
    for _ in 0..2 {
        let res = index.query(&q, 3, &params).unwrap();
        assert_eq!(id_set(res.ids(0)), id_set(&[0, 2, 4]));
        index = index.consolidate_updates().unwrap();
    }

    index
        .update_batch(&[1, 3], &u8_cols(&[[1, 1, 1], [3, 3, 3]]), None)
        .unwrap();
    for _ in 0..2 {
        let res = index.query(&q, 3, &params).unwrap();
        assert_eq!(id_set(res.ids(0)), id_set(&[1, 2, 3]));
        index = index.consolidate_updates().unwrap();
    }
}

#[test]
fn flat_tiny_lifecycle() {
    let dir = tempdir().unwrap();
    tiny_lifecycle(&dir.path().join("flat"), IndexType::Flat, 0);
}

#[test]
fn ivf_tiny_lifecycle() {
    let dir = tempdir().unwrap();
    tiny_lifecycle(&dir.path().join("ivf"), IndexType::IvfFlat, 10);
}

#[test]
fn query_shape_is_validated() {
    let dir = tempdir().unwrap();
    for (name, index_type, partitions) in
        [("flat", IndexType::Flat, 0), ("ivf", IndexType::IvfFlat, 4)]
    {
        let index = Index::create(
            &dir.path().join(name),
            index_type,
            Dtype::U8,
            3,
            partitions,
            Some(1),
        )
        .unwrap();
        seed_five(&index);
        for wrong in [1usize, 2, 4] {
            let mut q = ColMajorMatrix::<f32>::with_rows(wrong);
            q.push_col(&vec![1.0; wrong]);
            assert!(matches!(
                index.query(&q, 1, &QueryParams::default()),
                Err(Error::ShapeMismatch(_))
            ));
        }
        index
            .query(&query3([1.0, 1.0, 1.0]), 1, &QueryParams::default())
            .unwrap();
    }
}

/// Clustered synthetic dataset: `centers` well-separated blobs of
/// `per_center` vectors each, plus one query aimed at every sampled center.
fn clustered_dataset(
    d: usize,
    centers: usize,
    per_center: usize,
    nqueries: usize,
    seed: u64,
) -> (ColMajorMatrix<f32>, ColMajorMatrix<f32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut center_cols = Vec::with_capacity(centers);
    for _ in 0..centers {
        let c: Vec<f32> = (0..d).map(|_| rng.gen_range(0.0..100.0)).collect();
        center_cols.push(c);
    }
    let mut data = ColMajorMatrix::with_rows(d);
    for c in &center_cols {
        for _ in 0..per_center {
            let col: Vec<f32> = c.iter().map(|&v| v + rng.gen_range(-0.5..0.5)).collect();
            data.push_col(&col);
        }
    }
    let mut queries = ColMajorMatrix::with_rows(d);
    for qi in 0..nqueries {
        let c = &center_cols[qi % centers];
        let col: Vec<f32> = c.iter().map(|&v| v + rng.gen_range(-0.5..0.5)).collect();
        queries.push_col(&col);
    }
    (data, queries)
}

fn recall(result: &quiver::Neighbors, truth: &quiver::Neighbors) -> f64 {
    let mut found = 0;
    let mut total = 0;
    for qi in 0..truth.nqueries() {
        let expected: HashSet<u64> = truth.ids(qi).iter().copied().collect();
        total += truth.k();
        found += result
            .ids(qi)
            .iter()
            .filter(|id| expected.contains(id))
            .count();
    }
    found as f64 / total as f64
}

#[test]
fn ivf_recall_floor_on_clustered_data() {
    let dir = tempdir().unwrap();
    let uri = dir.path().join("g");
    let (data, queries) = clustered_dataset(128, 100, 100, 10, 9);

    let params = IngestParams {
        training_sample_size: 1_000,
        kmeans: KmeansParams {
            max_iter: 4,
            seed: Some(11),
            ..KmeansParams::default()
        },
        index_timestamp: Some(1),
        ..IngestParams::ivf_flat(100)
    };
    ingest::ingest(&uri, &AnyMatrix::F32(data.clone()), None, &params).unwrap();
    let index = Index::open(&uri, Timestamp::Latest).unwrap();

    let ids: Vec<u64> = (0..data.ncols() as u64).collect();
    let truth = FlatIndex::new(AnyMatrix::F32(data), ids)
        .unwrap()
        .query(&queries, 100, Select::Heap)
        .unwrap();

    let probed = index
        .query(
            &queries,
            100,
            &QueryParams {
                nprobe: 20,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert!(recall(&probed, &truth) >= 0.90);

    // Distances are non-decreasing along every row and every returned id
    // names a live vector.
    for qi in 0..probed.nqueries() {
        let dists = probed.distances(qi);
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        assert!(probed
            .ids(qi)
            .iter()
            .all(|&id| id == SENTINEL_ID || id < 10_000));
    }
}

#[test]
fn ivf_full_probe_matches_brute_force() {
    let dir = tempdir().unwrap();
    let uri = dir.path().join("g");
    let (data, queries) = clustered_dataset(16, 8, 40, 6, 21);

    let params = IngestParams {
        kmeans: KmeansParams {
            seed: Some(5),
            ..KmeansParams::default()
        },
        index_timestamp: Some(1),
        ..IngestParams::ivf_flat(8)
    };
    ingest::ingest(&uri, &AnyMatrix::F32(data.clone()), None, &params).unwrap();
    let index = Index::open(&uri, Timestamp::Latest).unwrap();

    let ids: Vec<u64> = (0..data.ncols() as u64).collect();
    let truth = FlatIndex::new(AnyMatrix::F32(data), ids)
        .unwrap()
        .query(&queries, 10, Select::Heap)
        .unwrap();
    let full = index
        .query(
            &queries,
            10,
            &QueryParams {
                nprobe: 8,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert!((recall(&full, &truth) - 1.0).abs() < f64::EPSILON);
}

#[test]
fn memory_budget_does_not_change_results() {
    let dir = tempdir().unwrap();
    let uri = dir.path().join("g");
    let (data, queries) = clustered_dataset(8, 10, 50, 5, 33);
    let total_bytes = data.ncols() * (4 * 8 + 8);

    let params = IngestParams {
        kmeans: KmeansParams {
            seed: Some(2),
            ..KmeansParams::default()
        },
        index_timestamp: Some(1),
        ..IngestParams::ivf_flat(10)
    };
    ingest::ingest(&uri, &AnyMatrix::F32(data), None, &params).unwrap();
    let index = Index::open(&uri, Timestamp::Latest).unwrap();

    let unbounded = index
        .query(
            &queries,
            20,
            &QueryParams {
                nprobe: 10,
                ..QueryParams::default()
            },
        )
        .unwrap();
    let budgeted = index
        .query(
            &queries,
            20,
            &QueryParams {
                nprobe: 10,
                memory_budget: Some(total_bytes / 4),
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert_eq!(budgeted, unbounded);
}

fn travel_vector(i: u64) -> Vec<f32> {
    vec![i as f32, i as f32 / 2.0, i as f32 * 0.25, 1.0]
}

#[test]
fn time_travel_sees_each_epoch() {
    let dir = tempdir().unwrap();
    let uri = dir.path().join("g");
    const OFFSET: u64 = 1000;

    let mut data = ColMajorMatrix::<f32>::with_rows(4);
    for i in 0..120 {
        data.push_col(&travel_vector(i));
    }
    let params = IngestParams {
        index_timestamp: Some(1),
        ..IngestParams::flat()
    };
    ingest::ingest(&uri, &AnyMatrix::F32(data), None, &params).unwrap();
    let index = Index::open(&uri, Timestamp::Latest).unwrap();

    // Replace id i with id i+OFFSET (same vector) at timestamp i.
    for i in 2..=101u64 {
        index.delete(i, Some(i)).unwrap();
        let mut v = ColMajorMatrix::<f32>::with_rows(4);
        v.push_col(&travel_vector(i));
        index.update(i + OFFSET, &AnyMatrix::F32(v), Some(i)).unwrap();
    }

    let check = |at: Timestamp, i: u64, expect: u64| {
        let view = Index::open(&uri, at).unwrap();
        let mut q = ColMajorMatrix::with_rows(4);
        q.push_col(&travel_vector(i));
        let res = view.query(&q, 1, &QueryParams::default()).unwrap();
        assert_eq!(res.ids(0), &[expect], "{at:?} at id {i}");
    };

    // All replacements applied.
    check(Timestamp::At(101), 5, 5 + OFFSET);
    check(Timestamp::At(101), 101, 101 + OFFSET);
    check(Timestamp::At(101), 110, 110);
    // The original snapshot.
    check(Timestamp::At(1), 5, 5);
    check(Timestamp::At(1), 101, 101);
    // Half-way: only the first 50 replacements happened.
    check(Timestamp::At(51), 5, 5 + OFFSET);
    check(Timestamp::At(51), 51, 51 + OFFSET);
    check(Timestamp::At(51), 52, 52);
    // A window starting inside the history is an updates-only view.
    check(Timestamp::Range(2, 101), 5, 5 + OFFSET);
    check(Timestamp::Range(0, 101), 5, 5 + OFFSET);
}

#[test]
fn consolidation_preserves_historical_queries() {
    let dir = tempdir().unwrap();
    let uri = dir.path().join("g");
    const OFFSET: u64 = 1000;

    let mut data = ColMajorMatrix::<f32>::with_rows(4);
    for i in 0..60 {
        data.push_col(&travel_vector(i));
    }
    let params = IngestParams {
        index_timestamp: Some(1),
        ..IngestParams::flat()
    };
    ingest::ingest(&uri, &AnyMatrix::F32(data), None, &params).unwrap();
    let index = Index::open(&uri, Timestamp::Latest).unwrap();
    for i in 2..=41u64 {
        index.delete(i, Some(i)).unwrap();
        let mut v = ColMajorMatrix::<f32>::with_rows(4);
        v.push_col(&travel_vector(i));
        index.update(i + OFFSET, &AnyMatrix::F32(v), Some(i)).unwrap();
    }

    let snapshot = |at: Timestamp| {
        let view = Index::open(&uri, at).unwrap();
        let mut q = ColMajorMatrix::with_rows(4);
        q.push_col(&travel_vector(21));
        view.query(&q, 5, &QueryParams::default()).unwrap()
    };

    let latest_before = snapshot(Timestamp::Latest);
    let mid_before = snapshot(Timestamp::At(21));

    let index = index.consolidate_updates().unwrap();
    assert_eq!(index.ingestion_timestamps().len(), 2);

    assert_eq!(snapshot(Timestamp::Latest), latest_before);
    assert_eq!(snapshot(Timestamp::At(21)), mid_before);
}

#[test]
fn update_round_trip_returns_updated_id() {
    let dir = tempdir().unwrap();
    let index = Index::create(
        &dir.path().join("g"),
        IndexType::Flat,
        Dtype::U8,
        3,
        0,
        Some(1),
    )
    .unwrap();
    seed_five(&index);
    index.update(77, &u8_cols(&[[9, 1, 9]]), None).unwrap();
    let res = index
        .query(&query3([9.0, 1.0, 9.0]), 1, &QueryParams::default())
        .unwrap();
    assert_eq!(res.ids(0), &[77]);
    assert_eq!(res.distances(0), &[0.0]);
}

#[test]
fn delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let index = Index::create(
        &dir.path().join("g"),
        IndexType::Flat,
        Dtype::U8,
        3,
        0,
        Some(1),
    )
    .unwrap();
    seed_five(&index);
    index.delete(2, None).unwrap();
    let once = index
        .query(&query3([2.0, 2.0, 2.0]), 5, &QueryParams::default())
        .unwrap();
    index.delete(2, None).unwrap();
    let twice = index
        .query(&query3([2.0, 2.0, 2.0]), 5, &QueryParams::default())
        .unwrap();
    assert_eq!(once, twice);
    assert!(!once.ids(0).contains(&2));
}

#[test]
fn replace_supersedes_older_value() {
    let dir = tempdir().unwrap();
    let index = Index::create(
        &dir.path().join("g"),
        IndexType::Flat,
        Dtype::U8,
        3,
        0,
        Some(1),
    )
    .unwrap();
    index.update(1, &u8_cols(&[[10, 10, 10]]), Some(5)).unwrap();
    index.update(1, &u8_cols(&[[200, 200, 200]]), Some(6)).unwrap();

    let near_new = index
        .query(&query3([200.0, 200.0, 200.0]), 1, &QueryParams::default())
        .unwrap();
    assert_eq!(near_new.ids(0), &[1]);
    assert_eq!(near_new.distances(0), &[0.0]);

    // The superseded value is gone: id 1 now sits far from the old spot.
    let near_old = index
        .query(&query3([10.0, 10.0, 10.0]), 1, &QueryParams::default())
        .unwrap();
    assert_eq!(near_old.ids(0), &[1]);
    assert!(near_old.distances(0)[0] > 0.0);
}

#[test]
fn live_ids_grow_monotonically_between_snapshots() {
    let dir = tempdir().unwrap();
    let index = Index::create(
        &dir.path().join("g"),
        IndexType::Flat,
        Dtype::U8,
        3,
        0,
        Some(1),
    )
    .unwrap();
    for (i, ts) in [(10u64, 2u64), (11, 3), (12, 4)] {
        index
            .update(i, &u8_cols(&[[i as u8, 0, 0]]), Some(ts))
            .unwrap();
    }

    let live_at = |t: u64| {
        let view = Index::open(index.uri(), Timestamp::At(t)).unwrap();
        let res = view
            .query(&query3([11.0, 0.0, 0.0]), 5, &QueryParams::default())
            .unwrap();
        res.ids(0)
            .iter()
            .copied()
            .filter(|&id| id != SENTINEL_ID)
            .collect::<HashSet<u64>>()
    };
    let at_2 = live_at(2);
    let at_4 = live_at(4);
    assert!(at_2.is_subset(&at_4));
    assert_eq!(at_4.len(), 3);
}
