//! Index-group metadata: the process-addressable handle tying together the
//! base-snapshot arrays, the updates log and the ingestion history.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::{self, ArraySchema};
use crate::{Dtype, Error, Result};

pub const STORAGE_VERSION: &str = "0.2";
const GROUP_FILE: &str = "group.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    Flat,
    IvfFlat,
}

impl IndexType {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            IndexType::Flat => "FLAT",
            IndexType::IvfFlat => "IVF_FLAT",
        }
    }

    pub fn parse(name: &str) -> Result<IndexType> {
        match name {
            "FLAT" => Ok(IndexType::Flat),
            "IVF_FLAT" => Ok(IndexType::IvfFlat),
            other => Err(Error::InvalidArgument(format!(
                "unknown index type {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum ArrayKind {
    Parts,
    Ids,
    Centroids,
    Offsets,
    Updates,
}

/// Sub-array naming is keyed by `storage_version` so older groups keep
/// resolving; new groups are written at [`STORAGE_VERSION`].
fn array_name(storage_version: &str, kind: ArrayKind) -> Result<&'static str> {
    match storage_version {
        "0.1" => Ok(match kind {
            ArrayKind::Parts => "parts.tdb",
            ArrayKind::Ids => "ids.tdb",
            ArrayKind::Centroids => "centroids.tdb",
            ArrayKind::Offsets => "index.tdb",
            ArrayKind::Updates => "updates.tdb",
        }),
        "0.2" => Ok(match kind {
            ArrayKind::Parts => "parts",
            ArrayKind::Ids => "ids",
            ArrayKind::Centroids => "centroids",
            ArrayKind::Offsets => "index",
            ArrayKind::Updates => "updates",
        }),
        other => Err(Error::Corrupt(format!(
            "unsupported storage version {other:?}"
        ))),
    }
}

/// Group handle. One entry of `ingestion_timestamps` / `partition_history` /
/// `base_sizes` per published base snapshot, strictly increasing by
/// timestamp; only the last snapshot is open for consolidation.
#[derive(Clone, Debug)]
pub struct IndexGroup {
    uri: PathBuf,
    pub storage_version: String,
    pub index_version: u64,
    pub index_type: IndexType,
    pub dtype: Dtype,
    pub dimensions: usize,
    pub ingestion_timestamps: Vec<u64>,
    pub partition_history: Vec<u64>,
    pub base_sizes: Vec<u64>,
}

impl IndexGroup {
    /// Creates a new group directory with empty sub-arrays and no published
    /// snapshot. The first ingestion publishes the first timestamp.
    pub fn create(
        uri: &Path,
        index_type: IndexType,
        dtype: Dtype,
        dimensions: usize,
    ) -> Result<IndexGroup> {
        if dimensions == 0 {
            return Err(Error::InvalidArgument(
                "vector dimension must be positive".to_string(),
            ));
        }
        if !matches!(dtype, Dtype::U8 | Dtype::I8 | Dtype::F32) {
            return Err(Error::TypeMismatch(format!(
                "{} is not a vector element type",
                dtype.name()
            )));
        }
        if uri.join(GROUP_FILE).exists() {
            return Err(Error::InvalidArgument(format!(
                "group {} already exists",
                uri.display()
            )));
        }
        fs::create_dir_all(uri)?;
        let group = IndexGroup {
            uri: uri.to_path_buf(),
            storage_version: STORAGE_VERSION.to_string(),
            index_version: 0,
            index_type,
            dtype,
            dimensions,
            ingestion_timestamps: Vec::new(),
            partition_history: Vec::new(),
            base_sizes: Vec::new(),
        };
        storage::create(
            &group.parts_uri()?,
            &ArraySchema::Dense {
                dtype,
                rows: dimensions as u64,
            },
        )?;
        storage::create(
            &group.ids_uri()?,
            &ArraySchema::Dense {
                dtype: Dtype::U64,
                rows: 1,
            },
        )?;
        storage::create(&group.updates_uri()?, &ArraySchema::Sparse { dtype })?;
        if index_type == IndexType::IvfFlat {
            storage::create(
                &group.centroids_uri()?,
                &ArraySchema::Dense {
                    dtype: Dtype::F32,
                    rows: dimensions as u64,
                },
            )?;
            storage::create(
                &group.offsets_uri()?,
                &ArraySchema::Dense {
                    dtype: Dtype::U64,
                    rows: 1,
                },
            )?;
        }
        group.save()?;
        Ok(group)
    }

    pub fn open(uri: &Path) -> Result<IndexGroup> {
        let bytes = fs::read(uri.join(GROUP_FILE))?;
        let map: BTreeMap<String, String> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Corrupt(e.to_string()))?;
        Self::from_map(uri, &map)
    }

    /// Atomically rewrites the group metadata. Publishing a snapshot is a
    /// single rename, so readers never observe a half-written group.
    pub fn save(&self) -> Result<()> {
        let map = self.to_map();
        let bytes =
            serde_json::to_vec_pretty(&map).map_err(|e| Error::Corrupt(e.to_string()))?;
        let path = self.uri.join(GROUP_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("storage_version".into(), self.storage_version.clone());
        map.insert("index_version".into(), self.index_version.to_string());
        map.insert("index_type".into(), self.index_type.name().to_string());
        map.insert("dtype".into(), self.dtype.name().to_string());
        map.insert("dimensions".into(), self.dimensions.to_string());
        map.insert(
            "ingestion_timestamps".into(),
            serde_json::to_string(&self.ingestion_timestamps).unwrap_or_default(),
        );
        map.insert(
            "partition_history".into(),
            serde_json::to_string(&self.partition_history).unwrap_or_default(),
        );
        map.insert(
            "base_sizes".into(),
            serde_json::to_string(&self.base_sizes).unwrap_or_default(),
        );
        map
    }

    fn from_map(uri: &Path, map: &BTreeMap<String, String>) -> Result<IndexGroup> {
        let get = |key: &str| -> Result<&String> {
            map.get(key)
                .ok_or_else(|| Error::Corrupt(format!("group metadata missing {key:?}")))
        };
        let parse_list = |key: &str| -> Result<Vec<u64>> {
            serde_json::from_str(get(key)?).map_err(|e| Error::Corrupt(e.to_string()))
        };
        let group = IndexGroup {
            uri: uri.to_path_buf(),
            storage_version: get("storage_version")?.clone(),
            index_version: get("index_version")?
                .parse()
                .map_err(|_| Error::Corrupt("bad index_version".to_string()))?,
            index_type: IndexType::parse(get("index_type")?)?,
            dtype: Dtype::parse(get("dtype")?)?,
            dimensions: get("dimensions")?
                .parse()
                .map_err(|_| Error::Corrupt("bad dimensions".to_string()))?,
            ingestion_timestamps: parse_list("ingestion_timestamps")?,
            partition_history: parse_list("partition_history")?,
            base_sizes: parse_list("base_sizes")?,
        };
        if !group
            .ingestion_timestamps
            .windows(2)
            .all(|w| w[0] < w[1])
        {
            return Err(Error::Corrupt(
                "ingestion timestamps are not strictly increasing".to_string(),
            ));
        }
        if group.partition_history.len() != group.ingestion_timestamps.len()
            || group.base_sizes.len() != group.ingestion_timestamps.len()
        {
            return Err(Error::Corrupt(
                "ingestion history lengths disagree".to_string(),
            ));
        }
        Ok(group)
    }

    #[must_use]
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    pub fn parts_uri(&self) -> Result<PathBuf> {
        Ok(self
            .uri
            .join(array_name(&self.storage_version, ArrayKind::Parts)?))
    }

    pub fn ids_uri(&self) -> Result<PathBuf> {
        Ok(self
            .uri
            .join(array_name(&self.storage_version, ArrayKind::Ids)?))
    }

    pub fn centroids_uri(&self) -> Result<PathBuf> {
        Ok(self
            .uri
            .join(array_name(&self.storage_version, ArrayKind::Centroids)?))
    }

    pub fn offsets_uri(&self) -> Result<PathBuf> {
        Ok(self
            .uri
            .join(array_name(&self.storage_version, ArrayKind::Offsets)?))
    }

    pub fn updates_uri(&self) -> Result<PathBuf> {
        Ok(self
            .uri
            .join(array_name(&self.storage_version, ArrayKind::Updates)?))
    }

    #[must_use]
    pub fn latest_ingestion(&self) -> Option<u64> {
        self.ingestion_timestamps.last().copied()
    }

    /// Greatest published ingestion timestamp `<= t`, i.e. the snapshot a
    /// time-travel read at `t` resolves to.
    #[must_use]
    pub fn select_base_ts(&self, t: u64) -> Option<u64> {
        self.ingestion_timestamps
            .iter()
            .rev()
            .find(|&&ts| ts <= t)
            .copied()
    }

    fn ingestion_pos(&self, base_ts: u64) -> Result<usize> {
        self.ingestion_timestamps
            .iter()
            .position(|&ts| ts == base_ts)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{base_ts} is not an ingestion timestamp"))
            })
    }

    pub fn base_size_at(&self, base_ts: u64) -> Result<u64> {
        Ok(self.base_sizes[self.ingestion_pos(base_ts)?])
    }

    pub fn partitions_at(&self, base_ts: u64) -> Result<u64> {
        Ok(self.partition_history[self.ingestion_pos(base_ts)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let uri = dir.path().join("group");
        let mut group = IndexGroup::create(&uri, IndexType::IvfFlat, Dtype::U8, 3).unwrap();
        group.ingestion_timestamps = vec![10, 20];
        group.partition_history = vec![4, 4];
        group.base_sizes = vec![100, 120];
        group.index_version = 2;
        group.save().unwrap();

        let reopened = IndexGroup::open(&uri).unwrap();
        assert_eq!(reopened.index_type, IndexType::IvfFlat);
        assert_eq!(reopened.dtype, Dtype::U8);
        assert_eq!(reopened.dimensions, 3);
        assert_eq!(reopened.ingestion_timestamps, vec![10, 20]);
        assert_eq!(reopened.base_size_at(20).unwrap(), 120);
        assert_eq!(reopened.partitions_at(10).unwrap(), 4);
    }

    #[test]
    fn base_ts_selection() {
        let dir = tempdir().unwrap();
        let uri = dir.path().join("group");
        let mut group = IndexGroup::create(&uri, IndexType::Flat, Dtype::F32, 2).unwrap();
        group.ingestion_timestamps = vec![10, 20];
        group.partition_history = vec![0, 0];
        group.base_sizes = vec![5, 7];
        assert_eq!(group.select_base_ts(9), None);
        assert_eq!(group.select_base_ts(10), Some(10));
        assert_eq!(group.select_base_ts(15), Some(10));
        assert_eq!(group.select_base_ts(25), Some(20));
    }

    #[test]
    fn create_rejects_u64_vectors() {
        let dir = tempdir().unwrap();
        let uri = dir.path().join("group");
        assert!(matches!(
            IndexGroup::create(&uri, IndexType::Flat, Dtype::U64, 2),
            Err(Error::TypeMismatch(_))
        ));
    }
}
