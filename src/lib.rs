#![doc = include_str!("../README.md")]

use num_traits::AsPrimitive;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod error;

pub use error::{Error, Result};

pub mod matrix;

pub use matrix::{AnyMatrix, ColMajorMatrix};

pub mod storage;

pub mod distances;
pub mod topk;

pub use topk::{Neighbors, Select};

pub mod flat;
pub mod ivf;

pub use flat::FlatIndex;
pub use ivf::{IvfFlatIndex, ScanOrder};

pub mod updates;

pub mod group;

pub use group::{IndexGroup, IndexType};

pub mod index;

pub use index::{Index, QueryParams, Timestamp};

pub mod ingest;
pub mod kmeans;

pub use ingest::IngestParams;

pub mod io;

/// Reserved external id. Never identifies a stored vector; results shorter
/// than `k` are padded with `(f32::INFINITY, SENTINEL_ID)`.
pub const SENTINEL_ID: u64 = u64::MAX;

/// Element type tag for stored arrays. Query vectors are always `f32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum Dtype {
    U8,
    I8,
    F32,
    U64,
}

impl Dtype {
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::F32 => 4,
            Dtype::U64 => 8,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::U8 => "uint8",
            Dtype::I8 => "int8",
            Dtype::F32 => "float32",
            Dtype::U64 => "uint64",
        }
    }

    pub fn parse(name: &str) -> Result<Dtype> {
        match name {
            "uint8" => Ok(Dtype::U8),
            "int8" => Ok(Dtype::I8),
            "float32" => Ok(Dtype::F32),
            "uint64" => Ok(Dtype::U64),
            other => Err(Error::TypeMismatch(format!("unknown dtype {other:?}"))),
        }
    }
}

/// Marker for types stored as vector elements.
///
/// The engine is generic over the element type of base vectors; every kernel
/// is monomorphized per element type through the tagged [`AnyMatrix`] variant
/// rather than dispatched per element at runtime.
pub trait ElemType:
    AsPrimitive<f32>
    + Copy
    + Default
    + PartialEq
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    const DTYPE: Dtype;

    /// Little-endian encoding used for variable-length cells in the updates
    /// log.
    fn to_bytes(values: &[Self]) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> Result<Vec<Self>>;

    /// Extracts the matching variant of a tagged matrix.
    fn from_any(matrix: AnyMatrix) -> Result<ColMajorMatrix<Self>>;

    fn into_any(matrix: ColMajorMatrix<Self>) -> AnyMatrix;
}

impl ElemType for u8 {
    const DTYPE: Dtype = Dtype::U8;

    fn to_bytes(values: &[Self]) -> Vec<u8> {
        values.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<Self>> {
        Ok(bytes.to_vec())
    }

    fn from_any(matrix: AnyMatrix) -> Result<ColMajorMatrix<Self>> {
        match matrix {
            AnyMatrix::U8(m) => Ok(m),
            other => Err(Error::TypeMismatch(format!(
                "expected uint8 data, found {}",
                other.dtype().name()
            ))),
        }
    }

    fn into_any(matrix: ColMajorMatrix<Self>) -> AnyMatrix {
        AnyMatrix::U8(matrix)
    }
}

impl ElemType for i8 {
    const DTYPE: Dtype = Dtype::I8;

    fn to_bytes(values: &[Self]) -> Vec<u8> {
        values.iter().map(|&v| v as u8).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<Self>> {
        Ok(bytes.iter().map(|&b| b as i8).collect())
    }

    fn from_any(matrix: AnyMatrix) -> Result<ColMajorMatrix<Self>> {
        match matrix {
            AnyMatrix::I8(m) => Ok(m),
            other => Err(Error::TypeMismatch(format!(
                "expected int8 data, found {}",
                other.dtype().name()
            ))),
        }
    }

    fn into_any(matrix: ColMajorMatrix<Self>) -> AnyMatrix {
        AnyMatrix::I8(matrix)
    }
}

impl ElemType for f32 {
    const DTYPE: Dtype = Dtype::F32;

    fn to_bytes(values: &[Self]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<Self>> {
        if bytes.len() % 4 != 0 {
            return Err(Error::Corrupt(format!(
                "float32 cell of {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn from_any(matrix: AnyMatrix) -> Result<ColMajorMatrix<Self>> {
        match matrix {
            AnyMatrix::F32(m) => Ok(m),
            other => Err(Error::TypeMismatch(format!(
                "expected float32 data, found {}",
                other.dtype().name()
            ))),
        }
    }

    fn into_any(matrix: ColMajorMatrix<Self>) -> AnyMatrix {
        AnyMatrix::F32(matrix)
    }
}

impl ElemType for u64 {
    const DTYPE: Dtype = Dtype::U64;

    fn to_bytes(values: &[Self]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<Self>> {
        if bytes.len() % 8 != 0 {
            return Err(Error::Corrupt(format!(
                "uint64 cell of {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    fn from_any(matrix: AnyMatrix) -> Result<ColMajorMatrix<Self>> {
        match matrix {
            AnyMatrix::U64(m) => Ok(m),
            other => Err(Error::TypeMismatch(format!(
                "expected uint64 data, found {}",
                other.dtype().name()
            ))),
        }
    }

    fn into_any(matrix: ColMajorMatrix<Self>) -> AnyMatrix {
        AnyMatrix::U64(matrix)
    }
}
