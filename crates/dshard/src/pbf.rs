//! Binary partition file: a fixed header of twelve little-endian `u64`
//! fields followed by `nonzero` `(row, col, value)` entries.
//!
//! Header ranges are inclusive. Files written with `origin == 1` store
//! 1-based indices; the reader converts them to 0-based.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use strads_core::{ParamRange, ShardKind, TaskRange};
use tracing::{debug, info};

use crate::error::ShardError;
use crate::shard::{DataShard, ShardTag};

/// Marker stored in `validhash` by [`write_pbf`].
pub const PBF_MAGIC: u64 = 0x5354_5241_4453_5042;

pub const PBF_HEADER_LEN: usize = 12 * 8;
pub const NZ_ENTRY_LEN: usize = 24;

/// `valtype` for 64-bit float values.
pub const VALTYPE_F64: u64 = 0;
/// `idxtype` for 64-bit unsigned indices.
pub const IDXTYPE_U64: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbfHeader {
    pub maxrow: u64,
    pub maxcol: u64,
    pub row_s: u64,
    pub row_end: u64,
    pub col_s: u64,
    pub col_end: u64,
    pub nonzero: u64,
    pub valtype: u64,
    pub idxtype: u64,
    pub physicalsort: u64,
    pub origin: u64,
    pub validhash: u64,
}

impl PbfHeader {
    /// Header for a whole `maxrow x maxcol` matrix.
    pub fn whole(maxrow: u64, maxcol: u64, nonzero: u64) -> Self {
        Self {
            maxrow,
            maxcol,
            row_s: 0,
            row_end: maxrow.saturating_sub(1),
            col_s: 0,
            col_end: maxcol.saturating_sub(1),
            nonzero,
            valtype: VALTYPE_F64,
            idxtype: IDXTYPE_U64,
            physicalsort: 0,
            origin: 0,
            validhash: PBF_MAGIC,
        }
    }

    pub fn rows(&self) -> TaskRange {
        TaskRange::new(self.row_s, self.row_end)
    }

    pub fn cols(&self) -> TaskRange {
        TaskRange::new(self.col_s, self.col_end)
    }

    pub fn to_bytes(&self) -> [u8; PBF_HEADER_LEN] {
        let fields = [
            self.maxrow,
            self.maxcol,
            self.row_s,
            self.row_end,
            self.col_s,
            self.col_end,
            self.nonzero,
            self.valtype,
            self.idxtype,
            self.physicalsort,
            self.origin,
            self.validhash,
        ];
        let mut out = [0u8; PBF_HEADER_LEN];
        for (chunk, v) in out.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ShardError> {
        if data.len() < PBF_HEADER_LEN {
            return Err(ShardError::SizeMismatch {
                expected: PBF_HEADER_LEN as u64,
                actual: data.len() as u64,
            });
        }
        let field = |i: usize| read_u64(data, i * 8);
        let header = Self {
            maxrow: field(0),
            maxcol: field(1),
            row_s: field(2),
            row_end: field(3),
            col_s: field(4),
            col_end: field(5),
            nonzero: field(6),
            valtype: field(7),
            idxtype: field(8),
            physicalsort: field(9),
            origin: field(10),
            validhash: field(11),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), ShardError> {
        if self.validhash != PBF_MAGIC {
            return Err(ShardError::Header(format!(
                "bad validhash {:#x}",
                self.validhash
            )));
        }
        if self.valtype != VALTYPE_F64 || self.idxtype != IDXTYPE_U64 {
            return Err(ShardError::Header(format!(
                "unsupported valtype {} / idxtype {}",
                self.valtype, self.idxtype
            )));
        }
        if self.origin > 1 {
            return Err(ShardError::Header(format!("origin {} is not 0 or 1", self.origin)));
        }
        if self.row_s > self.row_end
            || self.col_s > self.col_end
            || self.row_end >= self.maxrow
            || self.col_end >= self.maxcol
        {
            return Err(ShardError::Header(format!(
                "declared range rows {} cols {} does not fit a {}x{} matrix",
                self.rows(),
                self.cols(),
                self.maxrow,
                self.maxcol
            )));
        }
        Ok(())
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NzEntry {
    pub row: u64,
    pub col: u64,
    pub val: f64,
}

/// A memory-mapped, validated partition file.
pub struct PbfFile {
    header: PbfHeader,
    data: Mmap,
}

impl PbfFile {
    /// Map the file and check its length against the declared nonzero count.
    pub fn open(path: &Path) -> Result<Self, ShardError> {
        let file = fs::File::open(path)?;
        let data = unsafe { Mmap::map(&file)? };
        let header = PbfHeader::parse(&data)?;

        let expected = PBF_HEADER_LEN as u64 + header.nonzero * NZ_ENTRY_LEN as u64;
        if data.len() as u64 != expected {
            return Err(ShardError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }
        debug!(path = %path.display(), nonzero = header.nonzero, "partition file mapped");
        Ok(Self { header, data })
    }

    pub fn header(&self) -> &PbfHeader {
        &self.header
    }

    /// Iterate all entries as 0-based indices, checking matrix bounds.
    pub fn entries(&self) -> impl Iterator<Item = Result<NzEntry, ShardError>> + '_ {
        let h = self.header;
        let shift = h.origin;
        self.data[PBF_HEADER_LEN..]
            .chunks_exact(NZ_ENTRY_LEN)
            .map(move |raw| {
                let row = read_u64(raw, 0);
                let col = read_u64(raw, 8);
                let val = f64::from_bits(read_u64(raw, 16));
                if row < shift || col < shift || row - shift >= h.maxrow || col - shift >= h.maxcol
                {
                    return Err(ShardError::EntryOutOfBounds {
                        row,
                        col,
                        maxrow: h.maxrow,
                        maxcol: h.maxcol,
                    });
                }
                Ok(NzEntry {
                    row: row - shift,
                    col: col - shift,
                    val,
                })
            })
    }

    /// Read the entries inside `rows x cols` whose column also lies in one of
    /// `select` (all of `cols` when `select` is `None`).
    ///
    /// The requested range must be contained in the file's declared range.
    pub fn read_partial(
        &self,
        rows: TaskRange,
        cols: TaskRange,
        select: Option<&[ParamRange]>,
    ) -> Result<Vec<NzEntry>, ShardError> {
        let h = &self.header;
        if !h.rows().covers(&rows) || !h.cols().covers(&cols) {
            return Err(ShardError::RangeOutOfBounds(format!(
                "requested rows {rows} cols {cols}, file declares rows {} cols {}",
                h.rows(),
                h.cols()
            )));
        }
        if let Some(ranges) = select {
            if let Some(p) = ranges.iter().find(|p| !cols.covers(&p.range())) {
                return Err(ShardError::RangeOutOfBounds(format!(
                    "partition {} columns {} outside {cols}",
                    p.gid,
                    p.range()
                )));
            }
        }

        let wanted = |col: u64| match select {
            Some(ranges) => ranges.iter().any(|p| p.range().contains(col)),
            None => true,
        };

        let mut out = Vec::new();
        for entry in self.entries() {
            let e = entry?;
            if rows.contains(e.row) && cols.contains(e.col) && wanted(e.col) {
                out.push(e);
            }
        }
        Ok(out)
    }
}

/// `(maxrow, maxcol, nonzero)` of a partition file.
pub fn read_size(path: &Path) -> Result<(u64, u64, u64), ShardError> {
    let h = PbfFile::open(path)?.header;
    Ok((h.maxrow, h.maxcol, h.nonzero))
}

/// Write a whole-matrix partition file with 0-based indices.
pub fn write_pbf(
    path: &Path,
    maxrow: u64,
    maxcol: u64,
    entries: &[NzEntry],
) -> Result<PbfHeader, ShardError> {
    if let Some(e) = entries.iter().find(|e| e.row >= maxrow || e.col >= maxcol) {
        return Err(ShardError::EntryOutOfBounds {
            row: e.row,
            col: e.col,
            maxrow,
            maxcol,
        });
    }
    let header = PbfHeader::whole(maxrow, maxcol, entries.len() as u64);

    let mut out = BufWriter::new(fs::File::create(path)?);
    out.write_all(&header.to_bytes())?;
    for e in entries {
        out.write_all(&e.row.to_le_bytes())?;
        out.write_all(&e.col.to_le_bytes())?;
        out.write_all(&e.val.to_bits().to_le_bytes())?;
    }
    out.flush()?;
    Ok(header)
}

/// Load the columns `cols` of a partition file into a new shard.
///
/// With `select`, only those partitions' columns are read and the shard is
/// tagged with the out-of-core group in `tag`.
pub fn load_shard(
    path: &Path,
    alias: &str,
    kind: ShardKind,
    cols: TaskRange,
    select: Option<&[ParamRange]>,
    tag: ShardTag,
) -> Result<DataShard, ShardError> {
    let file = PbfFile::open(path)?;
    let h = *file.header();
    let rows = h.rows();
    let entries = file.read_partial(rows, cols, select)?;

    let loaded = match select {
        Some(ranges) => ranges.iter().map(ParamRange::range).collect(),
        None => vec![cols],
    };
    let shard = DataShard::from_triplets(
        alias,
        kind,
        h.maxrow,
        cols,
        loaded,
        tag,
        entries.into_iter().map(|e| (e.row, e.col, e.val)),
    )?;
    info!(
        alias,
        path = %path.display(),
        columns = %cols,
        h_modulo = tag.h_modulo,
        oocdpartitions = tag.oocdpartitions,
        nonzero = shard.nonzero(),
        "data shard loaded"
    );
    Ok(shard)
}
