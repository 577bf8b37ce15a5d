//! Readers for the common external vector formats: `fvecs`/`ivecs`
//! (per-vector length prefix) and `u8bin`/`f32bin` (one `(n, d)` header,
//! then row-major data).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::matrix::ColMajorMatrix;
use crate::{Error, Result};

fn read_u32_le(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads the next length prefix, or `None` at a clean end of file.
fn read_prefix(reader: &mut impl Read) -> Result<Option<u32>> {
    match read_u32_le(reader) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `fvecs`: per vector an i32 dimension then that many f32s. All vectors
/// must share the dimension.
pub fn read_fvecs(path: &Path) -> Result<ColMajorMatrix<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut matrix: Option<ColMajorMatrix<f32>> = None;
    let mut col = Vec::new();
    while let Some(d) = read_prefix(&mut reader)? {
        let d = d as usize;
        let m = matrix.get_or_insert_with(|| ColMajorMatrix::with_rows(d.max(1)));
        if d != m.nrows() {
            return Err(Error::Corrupt(format!(
                "fvecs dimension changed from {} to {d}",
                m.nrows()
            )));
        }
        col.clear();
        for _ in 0..d {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            col.push(f32::from_le_bytes(buf));
        }
        m.push_col(&col);
    }
    matrix.ok_or_else(|| Error::Corrupt(format!("{} holds no vectors", path.display())))
}

/// `ivecs`: like `fvecs` with i32 payloads; the usual carrier for
/// ground-truth neighbor lists.
pub fn read_ivecs(path: &Path) -> Result<Vec<Vec<i32>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    while let Some(d) = read_prefix(&mut reader)? {
        let mut row = Vec::with_capacity(d as usize);
        for _ in 0..d {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            row.push(i32::from_le_bytes(buf));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// `u8bin`: `(u32 n, u32 d)` header, then `n * d` row-major bytes.
pub fn read_u8bin(path: &Path) -> Result<ColMajorMatrix<u8>> {
    let mut reader = BufReader::new(File::open(path)?);
    let n = read_u32_le(&mut reader)? as usize;
    let d = read_u32_le(&mut reader)? as usize;
    if d == 0 {
        return Err(Error::Corrupt(format!(
            "{} declares zero-dimensional vectors",
            path.display()
        )));
    }
    let mut matrix = ColMajorMatrix::with_rows(d);
    let mut row = vec![0u8; d];
    for _ in 0..n {
        reader.read_exact(&mut row)?;
        matrix.push_col(&row);
    }
    Ok(matrix)
}

/// `f32bin`: `(u32 n, u32 d)` header, then `n * d` row-major f32s.
pub fn read_f32bin(path: &Path) -> Result<ColMajorMatrix<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let n = read_u32_le(&mut reader)? as usize;
    let d = read_u32_le(&mut reader)? as usize;
    if d == 0 {
        return Err(Error::Corrupt(format!(
            "{} declares zero-dimensional vectors",
            path.display()
        )));
    }
    let mut matrix = ColMajorMatrix::with_rows(d);
    let mut row = vec![0u8; d * 4];
    let mut col = vec![0f32; d];
    for _ in 0..n {
        reader.read_exact(&mut row)?;
        for (v, chunk) in col.iter_mut().zip(row.chunks_exact(4)) {
            *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        matrix.push_col(&col);
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn fvecs_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.fvecs");
        let mut f = File::create(&path).unwrap();
        for v in [[1.0f32, 2.0], [3.0, 4.0]] {
            f.write_all(&2i32.to_le_bytes()).unwrap();
            for x in v {
                f.write_all(&x.to_le_bytes()).unwrap();
            }
        }
        drop(f);
        let m = read_fvecs(&path).unwrap();
        assert_eq!(m.ncols(), 2);
        assert_eq!(m.col(1), &[3.0, 4.0]);
    }

    #[test]
    fn fvecs_rejects_ragged_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.fvecs");
        let mut f = File::create(&path).unwrap();
        f.write_all(&2i32.to_le_bytes()).unwrap();
        f.write_all(&1.0f32.to_le_bytes()).unwrap();
        f.write_all(&2.0f32.to_le_bytes()).unwrap();
        f.write_all(&3i32.to_le_bytes()).unwrap();
        for x in [1.0f32, 2.0, 3.0] {
            f.write_all(&x.to_le_bytes()).unwrap();
        }
        drop(f);
        assert!(matches!(read_fvecs(&path), Err(Error::Corrupt(_))));
    }

    #[test]
    fn ivecs_reads_ground_truth_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gt.ivecs");
        let mut f = File::create(&path).unwrap();
        f.write_all(&3i32.to_le_bytes()).unwrap();
        for x in [7i32, 8, 9] {
            f.write_all(&x.to_le_bytes()).unwrap();
        }
        drop(f);
        assert_eq!(read_ivecs(&path).unwrap(), vec![vec![7, 8, 9]]);
    }

    #[test]
    fn u8bin_transposes_rows_to_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.u8bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&2u32.to_le_bytes()).unwrap();
        f.write_all(&3u32.to_le_bytes()).unwrap();
        f.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        drop(f);
        let m = read_u8bin(&path).unwrap();
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.col(0), &[1, 2, 3]);
        assert_eq!(m.col(1), &[4, 5, 6]);
    }

    #[test]
    fn f32bin_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.f32bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&1u32.to_le_bytes()).unwrap();
        f.write_all(&2u32.to_le_bytes()).unwrap();
        for x in [0.5f32, -1.5] {
            f.write_all(&x.to_le_bytes()).unwrap();
        }
        drop(f);
        let m = read_f32bin(&path).unwrap();
        assert_eq!(m.col(0), &[0.5, -1.5]);
    }
}
