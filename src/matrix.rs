use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::{Dtype, Error, Result};

/// Dense column-major matrix: `rows` is the vector dimension, every column
/// is one vector. The backing buffer is contiguous, so column `j` lives at
/// `data[j * rows .. (j + 1) * rows]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColMajorMatrix<T> {
    rows: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> ColMajorMatrix<T> {
    /// Zero-filled matrix of `rows x cols`.
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        assert!(rows > 0, "matrix needs at least one row");
        Self {
            rows,
            data: vec![T::default(); rows * cols],
        }
    }

    pub fn from_data(rows: usize, data: Vec<T>) -> Result<Self> {
        if rows == 0 || data.len() % rows != 0 {
            return Err(Error::ShapeMismatch(format!(
                "{} values do not form columns of {} rows",
                data.len(),
                rows
            )));
        }
        Ok(Self { rows, data })
    }

    /// Empty matrix with a fixed row count, ready for `push_col`.
    #[must_use]
    pub fn with_rows(rows: usize) -> Self {
        assert!(rows > 0, "matrix needs at least one row");
        Self {
            rows,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn ncols(&self) -> usize {
        self.data.len() / self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn col(&self, j: usize) -> &[T] {
        &self.data[j * self.rows..(j + 1) * self.rows]
    }

    pub fn push_col(&mut self, col: &[T]) {
        assert_eq!(col.len(), self.rows);
        self.data.extend_from_slice(col);
    }

    pub fn iter_cols(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.data.chunks_exact(self.rows)
    }

    /// Copies all columns of `src` into this matrix starting at `dst_col`.
    /// Columns falling outside this matrix are dropped.
    pub fn overlay(&mut self, src: &ColMajorMatrix<T>, dst_col: usize) {
        assert_eq!(src.rows, self.rows);
        let ncols = self.ncols();
        for (j, col) in src.iter_cols().enumerate() {
            let dst = dst_col + j;
            if dst >= ncols {
                break;
            }
            self.data[dst * self.rows..(dst + 1) * self.rows].clone_from_slice(col);
        }
    }

    #[must_use]
    pub fn cols_range(&self, lo: usize, hi: usize) -> ColMajorMatrix<T> {
        ColMajorMatrix {
            rows: self.rows,
            data: self.data[lo * self.rows..hi * self.rows].to_vec(),
        }
    }

    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }
}

impl<T: AsPrimitive<f32>> ColMajorMatrix<T> {
    /// Widens every element to f32, keeping the layout.
    #[must_use]
    pub fn to_f32(&self) -> ColMajorMatrix<f32> {
        ColMajorMatrix {
            rows: self.rows,
            data: self.data.iter().map(|v| v.as_()).collect(),
        }
    }
}

/// Tagged matrix over the supported element types. Kernels pattern-match
/// once at the top of a query and run monomorphized from there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnyMatrix {
    U8(ColMajorMatrix<u8>),
    I8(ColMajorMatrix<i8>),
    F32(ColMajorMatrix<f32>),
    U64(ColMajorMatrix<u64>),
}

impl AnyMatrix {
    #[must_use]
    pub fn with_rows(dtype: Dtype, rows: usize) -> Self {
        match dtype {
            Dtype::U8 => AnyMatrix::U8(ColMajorMatrix::with_rows(rows)),
            Dtype::I8 => AnyMatrix::I8(ColMajorMatrix::with_rows(rows)),
            Dtype::F32 => AnyMatrix::F32(ColMajorMatrix::with_rows(rows)),
            Dtype::U64 => AnyMatrix::U64(ColMajorMatrix::with_rows(rows)),
        }
    }

    #[must_use]
    pub fn zeroed(dtype: Dtype, rows: usize, cols: usize) -> Self {
        match dtype {
            Dtype::U8 => AnyMatrix::U8(ColMajorMatrix::new(rows, cols)),
            Dtype::I8 => AnyMatrix::I8(ColMajorMatrix::new(rows, cols)),
            Dtype::F32 => AnyMatrix::F32(ColMajorMatrix::new(rows, cols)),
            Dtype::U64 => AnyMatrix::U64(ColMajorMatrix::new(rows, cols)),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> Dtype {
        match self {
            AnyMatrix::U8(_) => Dtype::U8,
            AnyMatrix::I8(_) => Dtype::I8,
            AnyMatrix::F32(_) => Dtype::F32,
            AnyMatrix::U64(_) => Dtype::U64,
        }
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        match self {
            AnyMatrix::U8(m) => m.nrows(),
            AnyMatrix::I8(m) => m.nrows(),
            AnyMatrix::F32(m) => m.nrows(),
            AnyMatrix::U64(m) => m.nrows(),
        }
    }

    #[must_use]
    pub fn ncols(&self) -> usize {
        match self {
            AnyMatrix::U8(m) => m.ncols(),
            AnyMatrix::I8(m) => m.ncols(),
            AnyMatrix::F32(m) => m.ncols(),
            AnyMatrix::U64(m) => m.ncols(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ncols() == 0
    }

    /// Overlays `src` at column `dst_col`; both sides must share dtype and
    /// row count.
    pub fn overlay(&mut self, src: &AnyMatrix, dst_col: usize) -> Result<()> {
        match (self, src) {
            (AnyMatrix::U8(dst), AnyMatrix::U8(s)) => dst.overlay(s, dst_col),
            (AnyMatrix::I8(dst), AnyMatrix::I8(s)) => dst.overlay(s, dst_col),
            (AnyMatrix::F32(dst), AnyMatrix::F32(s)) => dst.overlay(s, dst_col),
            (AnyMatrix::U64(dst), AnyMatrix::U64(s)) => dst.overlay(s, dst_col),
            (dst, s) => {
                return Err(Error::TypeMismatch(format!(
                    "cannot overlay {} data onto {} array",
                    s.dtype().name(),
                    dst.dtype().name()
                )))
            }
        }
        Ok(())
    }

    /// Reads a `1 x n` uint64 matrix back as a plain vector. The `ids` and
    /// partition-offset arrays are stored this way.
    pub fn into_u64_row(self) -> Result<Vec<u64>> {
        match self {
            AnyMatrix::U64(m) if m.nrows() == 1 => Ok(m.into_data()),
            other => Err(Error::Corrupt(format!(
                "expected a single-row uint64 array, found {} with {} rows",
                other.dtype().name(),
                other.nrows()
            ))),
        }
    }
}

/// Wraps a plain u64 vector as the `1 x n` matrix used for on-disk storage.
#[must_use]
pub fn u64_row(values: &[u64]) -> AnyMatrix {
    AnyMatrix::U64(ColMajorMatrix {
        rows: 1,
        data: values.to_vec(),
    })
}
