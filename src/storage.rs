//! Timestamped fragment store backing every array of an index group.
//!
//! An array is a directory holding a `schema.bin` descriptor plus immutable
//! fragment files. Every append lands in a new fragment stamped with the
//! write timestamp; a read at a timestamp range replays exactly the cells
//! whose timestamp lies inside the inclusive range. Dense arrays replay
//! fragments into a zero-filled buffer (unwritten cells read as zero);
//! sparse arrays return their raw cells and leave conflict resolution to
//! the caller.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::matrix::AnyMatrix;
use crate::{Dtype, Error, Result};

const SCHEMA_FILE: &str = "schema.bin";

/// Wall-clock milliseconds since the epoch, the default write timestamp.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inclusive timestamp range for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsRange {
    pub lo: u64,
    pub hi: u64,
}

impl TsRange {
    #[must_use]
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// Everything written up to and including `hi`.
    #[must_use]
    pub fn up_to(hi: u64) -> Self {
        Self { lo: 0, hi }
    }

    #[must_use]
    pub fn contains(&self, ts: u64) -> bool {
        self.lo <= ts && ts <= self.hi
    }

    /// A range with `lo > hi` selects nothing; used for views where the
    /// updates window is empty.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.lo > self.hi
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArraySchema {
    /// 2-D column-major typed matrix; `rows` is fixed at creation.
    Dense { dtype: Dtype, rows: u64 },
    /// 1-D array keyed by u64 external id with one variable-length typed
    /// attribute. An empty value is a deletion tombstone.
    Sparse { dtype: Dtype },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentInfo {
    pub path: PathBuf,
    pub ts_lo: u64,
    pub ts_hi: u64,
    pub seq: u64,
}

/// One row of a sparse array. `value` is the little-endian element encoding;
/// empty means deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseCell {
    pub id: u64,
    pub ts: u64,
    pub value: Vec<u8>,
}

/// Fixed-size prefix of a dense fragment file: the column range it covers.
/// Reads consult only this prefix to decide whether the fragment body needs
/// to be deserialized at all.
#[derive(Serialize, Deserialize)]
struct DenseHeader {
    col_start: u64,
    ncols: u64,
}

const DENSE_HEADER_BYTES: usize = 16;

fn bincode_err(e: bincode::Error) -> Error {
    Error::Corrupt(e.to_string())
}

/// Creates an array directory with the given schema. Re-creating with the
/// same schema is a no-op; a different schema is rejected.
pub fn create(uri: &Path, array_schema: &ArraySchema) -> Result<()> {
    fs::create_dir_all(uri)?;
    let schema_path = uri.join(SCHEMA_FILE);
    if schema_path.exists() {
        let existing = schema(uri)?;
        if existing != *array_schema {
            return Err(Error::InvalidArgument(format!(
                "array {} already exists with a different schema",
                uri.display()
            )));
        }
        return Ok(());
    }
    let bytes = bincode::serialize(array_schema).map_err(bincode_err)?;
    write_atomic(&schema_path, &bytes)
}

pub fn schema(uri: &Path) -> Result<ArraySchema> {
    let bytes = fs::read(uri.join(SCHEMA_FILE))?;
    bincode::deserialize(&bytes).map_err(bincode_err)
}

/// Lists committed fragments in replay order: ascending timestamp, then
/// creation sequence.
pub fn fragments(uri: &Path) -> Result<Vec<FragmentInfo>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(uri)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(info) = parse_fragment_name(name) {
            out.push(FragmentInfo {
                path: path.clone(),
                ts_lo: info.0,
                ts_hi: info.1,
                seq: info.2,
            });
        }
    }
    out.sort_by_key(|f| (f.ts_lo, f.seq));
    Ok(out)
}

fn parse_fragment_name(name: &str) -> Option<(u64, u64, u64)> {
    let stem = name.strip_prefix("frag-")?.strip_suffix(".bin")?;
    let mut parts = stem.split('-');
    let lo = parts.next()?.parse().ok()?;
    let hi = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((lo, hi, seq))
}

fn next_seq(uri: &Path) -> Result<u64> {
    Ok(fragments(uri)?.iter().map(|f| f.seq + 1).max().unwrap_or(0))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_fragment(uri: &Path, ts_lo: u64, ts_hi: u64, bytes: &[u8]) -> Result<()> {
    let seq = next_seq(uri)?;
    let path = uri.join(format!("frag-{ts_lo}-{ts_hi}-{seq}.bin"));
    write_atomic(&path, bytes)
}

/// Appends a column range to a dense array at timestamp `ts`. The write is
/// visible only to reads whose range includes `ts`.
pub fn append_dense(uri: &Path, cols: &AnyMatrix, col_start: u64, ts: u64) -> Result<()> {
    match schema(uri)? {
        ArraySchema::Dense { dtype, rows } => {
            if cols.dtype() != dtype {
                return Err(Error::TypeMismatch(format!(
                    "writing {} data to {} array {}",
                    cols.dtype().name(),
                    dtype.name(),
                    uri.display()
                )));
            }
            if cols.nrows() as u64 != rows {
                return Err(Error::ShapeMismatch(format!(
                    "writing {} rows to array of {} rows",
                    cols.nrows(),
                    rows
                )));
            }
        }
        ArraySchema::Sparse { .. } => {
            return Err(Error::InvalidArgument(format!(
                "dense write to sparse array {}",
                uri.display()
            )))
        }
    }
    let header = DenseHeader {
        col_start,
        ncols: cols.ncols() as u64,
    };
    let mut bytes = bincode::serialize(&header).map_err(bincode_err)?;
    debug_assert_eq!(bytes.len(), DENSE_HEADER_BYTES);
    bytes.extend(bincode::serialize(cols).map_err(bincode_err)?);
    write_fragment(uri, ts, ts, &bytes)
}

/// Reads columns `[col_lo, col_hi)` of a dense array at `range`. Fragments
/// are replayed in timestamp order into a zero-filled buffer, so later
/// writes overwrite earlier ones and unwritten cells come back as zero.
pub fn read_dense_cols(
    uri: &Path,
    range: TsRange,
    col_lo: u64,
    col_hi: u64,
) -> Result<AnyMatrix> {
    let (dtype, rows) = match schema(uri)? {
        ArraySchema::Dense { dtype, rows } => (dtype, rows),
        ArraySchema::Sparse { .. } => {
            return Err(Error::InvalidArgument(format!(
                "dense read from sparse array {}",
                uri.display()
            )))
        }
    };
    let width = col_hi.saturating_sub(col_lo) as usize;
    let mut out = AnyMatrix::zeroed(dtype, rows as usize, width);
    if width == 0 {
        return Ok(out);
    }
    for frag in fragments(uri)? {
        if !range.contains(frag.ts_lo) {
            continue;
        }
        let mut file = fs::File::open(&frag.path)?;
        let mut header_bytes = [0u8; DENSE_HEADER_BYTES];
        std::io::Read::read_exact(&mut file, &mut header_bytes)?;
        let header: DenseHeader =
            bincode::deserialize(&header_bytes).map_err(bincode_err)?;
        let frag_end = header.col_start + header.ncols;
        if frag_end <= col_lo || header.col_start >= col_hi {
            continue;
        }
        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut body)?;
        let cols: AnyMatrix = bincode::deserialize(&body).map_err(bincode_err)?;
        // Clip the fragment to the requested window before overlaying.
        let skip = col_lo.saturating_sub(header.col_start) as usize;
        let take = (frag_end.min(col_hi) - header.col_start.max(col_lo)) as usize;
        let clipped = clip_cols(&cols, skip, skip + take);
        let dst = (header.col_start.max(col_lo) - col_lo) as usize;
        out.overlay(&clipped, dst)?;
    }
    Ok(out)
}

/// Reads the full domain `[0, ncols)` of a dense array at `range`.
pub fn read_dense(uri: &Path, range: TsRange, ncols: u64) -> Result<AnyMatrix> {
    read_dense_cols(uri, range, 0, ncols)
}

fn clip_cols(cols: &AnyMatrix, lo: usize, hi: usize) -> AnyMatrix {
    match cols {
        AnyMatrix::U8(m) => AnyMatrix::U8(m.cols_range(lo, hi)),
        AnyMatrix::I8(m) => AnyMatrix::I8(m.cols_range(lo, hi)),
        AnyMatrix::F32(m) => AnyMatrix::F32(m.cols_range(lo, hi)),
        AnyMatrix::U64(m) => AnyMatrix::U64(m.cols_range(lo, hi)),
    }
}

/// Appends rows to a sparse array; every cell is stamped with `ts`.
pub fn append_sparse(uri: &Path, rows: &[(u64, Vec<u8>)], ts: u64) -> Result<()> {
    match schema(uri)? {
        ArraySchema::Sparse { .. } => {}
        ArraySchema::Dense { .. } => {
            return Err(Error::InvalidArgument(format!(
                "sparse write to dense array {}",
                uri.display()
            )))
        }
    }
    let mut cells: Vec<SparseCell> = rows
        .iter()
        .map(|(id, value)| SparseCell {
            id: *id,
            ts,
            value: value.clone(),
        })
        .collect();
    cells.sort_by_key(|c| c.id);
    let bytes = bincode::serialize(&cells).map_err(bincode_err)?;
    write_fragment(uri, ts, ts, &bytes)
}

fn read_cells(path: &Path) -> Result<Vec<SparseCell>> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(bincode_err)
}

/// Reads all sparse cells whose timestamp lies in `range`, in replay order
/// (fragment timestamp, then fragment sequence, then in-fragment order).
/// With last-writer-wins folding this makes the later-created fragment win
/// a same-timestamp same-id conflict; which writer that is, is unspecified.
pub fn read_sparse(uri: &Path, range: TsRange) -> Result<Vec<SparseCell>> {
    match schema(uri)? {
        ArraySchema::Sparse { .. } => {}
        ArraySchema::Dense { .. } => {
            return Err(Error::InvalidArgument(format!(
                "sparse read from dense array {}",
                uri.display()
            )))
        }
    }
    let mut out = Vec::new();
    if range.is_degenerate() {
        return Ok(out);
    }
    for frag in fragments(uri)? {
        if frag.ts_hi < range.lo || frag.ts_lo > range.hi {
            continue;
        }
        let cells = read_cells(&frag.path)?;
        out.extend(cells.into_iter().filter(|c| range.contains(c.ts)));
    }
    Ok(out)
}

/// Compacts a sparse array's fragments into one, preserving every cell with
/// its original timestamp. Reads at any range are unaffected. Consumed
/// fragments are renamed aside and removed by [`vacuum`].
pub fn consolidate(uri: &Path) -> Result<()> {
    match schema(uri)? {
        ArraySchema::Sparse { .. } => {}
        // Dense fragments are immutable column ranges; nothing to compact.
        ArraySchema::Dense { .. } => return Ok(()),
    }
    let frags = fragments(uri)?;
    if frags.len() < 2 {
        return Ok(());
    }
    let mut cells = Vec::new();
    for frag in &frags {
        cells.append(&mut read_cells(&frag.path)?);
    }
    // Stable by (id, ts): same-timestamp duplicates keep their replay order.
    cells.sort_by_key(|c| (c.id, c.ts));
    let ts_lo = cells.iter().map(|c| c.ts).min().unwrap_or(0);
    let ts_hi = cells.iter().map(|c| c.ts).max().unwrap_or(0);
    debug!(
        "consolidating {} fragments ({} cells) of {}",
        frags.len(),
        cells.len(),
        uri.display()
    );
    let bytes = bincode::serialize(&cells).map_err(bincode_err)?;
    write_fragment(uri, ts_lo, ts_hi, &bytes)?;
    for frag in &frags {
        fs::rename(&frag.path, frag.path.with_extension("consumed"))?;
    }
    Ok(())
}

/// Removes fragments consumed by a previous [`consolidate`] and any
/// interrupted temporary writes.
pub fn vacuum(uri: &Path) -> Result<()> {
    for entry in fs::read_dir(uri)? {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("consumed") | Some("tmp") => fs::remove_file(&path)?,
            _ => {}
        }
    }
    Ok(())
}
