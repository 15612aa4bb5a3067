//! Chunks: bounded batches of rows in a device-transferable image.
//!
//! A chunk is one contiguous byte image that is copied to the device as-is.
//!
//! ```text
//! +------------------+-----------------+----------------------+ ... +---------+
//! | KernDataStore    | ColumnDesc x n  | row index / slots    |     | tuples  |
//! | (32 bytes)       | (8 bytes each)  | (grows forward)      |     | (tail)  |
//! +------------------+-----------------+----------------------+ ... +---------+
//! ```
//!
//! - Row format: a `u32` index per row pointing at a tuple packed from the
//!   tail of the image (see [`layout`]).
//! - Slot format: `nrooms * ncols` datums, then `nrooms * ncols` null flags,
//!   then free space; variable-length payloads are packed from the tail.
//!
//! `usage` in the header counts the tail bytes in use. Source chunks are
//! always row format; the projection kernel may produce either.

pub mod arrow;
pub mod layout;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, ScanError};
use crate::types::{DataType, Row, Schema, SchemaRef};
use layout::{maxalign, read_u32, write_u32, TupleLayout};

pub use store::{ChunkBudget, ChunkCursor, ChunkRead, ChunkStore, MemoryChunkStore};

pub const KDS_HEADER_SIZE: usize = 32;
pub const COLUMN_DESC_SIZE: usize = 8;
/// Smallest byte budget a chunk is given.
pub const MIN_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChunkFormat {
    #[default]
    Row,
    Slot,
}

impl ChunkFormat {
    pub(crate) fn code(&self) -> u32 {
        match self {
            ChunkFormat::Row => 0,
            ChunkFormat::Slot => 1,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ChunkFormat::Row),
            1 => Some(ChunkFormat::Slot),
            _ => None,
        }
    }
}

impl FromStr for ChunkFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "row" => Ok(ChunkFormat::Row),
            "slot" => Ok(ChunkFormat::Slot),
            other => Err(format!("unknown chunk format {other:?}")),
        }
    }
}

impl fmt::Display for ChunkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkFormat::Row => "row",
            ChunkFormat::Slot => "slot",
        })
    }
}

// ── KernDataStore (32 bytes, matches `kern_data_store` in the device library) ──
//
//   offset 0:  length   (u32)  total image bytes
//   offset 4:  usage    (u32)  tail bytes in use
//   offset 8:  nitems   (u32)  rows stored
//   offset 12: nrooms   (u32)  row capacity (slot format)
//   offset 16: ncols    (u32)
//   offset 20: format   (u32)  0 = row, 1 = slot
//   offset 24: _pad     (u32 x 2)
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct KernDataStore {
    pub length: u32,
    pub usage: u32,
    pub nitems: u32,
    pub nrooms: u32,
    pub ncols: u32,
    pub format: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct ColumnDesc {
    pub type_id: u32,
    pub attlen: i16,
    pub attalign: u16,
}

/// Bytes before the row index (row format) or the slot arrays (slot format).
pub const fn head_length(ncols: usize) -> usize {
    maxalign(KDS_HEADER_SIZE + COLUMN_DESC_SIZE * ncols)
}

pub(crate) const fn row_index_at(ncols: usize, index: usize) -> usize {
    head_length(ncols) + 4 * index
}

pub(crate) const fn slot_datums_at(ncols: usize, index: usize) -> usize {
    head_length(ncols) + 8 * ncols * index
}

pub(crate) const fn slot_nulls_at(ncols: usize, nrooms: usize, index: usize) -> usize {
    head_length(ncols) + 8 * ncols * nrooms + ncols * index
}

/// Bytes of a slot image before its free space.
pub const fn slot_area_length(ncols: usize, nrooms: usize) -> usize {
    head_length(ncols) + 8 * ncols * nrooms + maxalign(ncols * nrooms)
}

/// Write header and column descriptors at the start of `image`.
pub(crate) fn write_head(image: &mut [u8], header: &KernDataStore, layout: &TupleLayout) -> Result<()> {
    let head = head_length(layout.natts());
    if image.len() < head {
        return Err(ScanError::Layout(format!(
            "image of {} bytes cannot hold a {head}-byte head",
            image.len()
        )));
    }
    image[..KDS_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(header));
    for (j, t) in layout.types().iter().enumerate() {
        let desc = ColumnDesc {
            type_id: t.type_id(),
            attlen: t.attlen(),
            attalign: t.attalign() as u16,
        };
        let at = KDS_HEADER_SIZE + COLUMN_DESC_SIZE * j;
        image[at..at + COLUMN_DESC_SIZE].copy_from_slice(bytemuck::bytes_of(&desc));
    }
    image[KDS_HEADER_SIZE + COLUMN_DESC_SIZE * layout.natts()..head].fill(0);
    Ok(())
}

pub(crate) fn read_header(image: &[u8]) -> Result<KernDataStore> {
    let bytes = image
        .get(..KDS_HEADER_SIZE)
        .ok_or_else(|| ScanError::Layout("image shorter than its header".into()))?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

pub(crate) fn update_header(image: &mut [u8], f: impl FnOnce(&mut KernDataStore)) -> Result<()> {
    let mut header = read_header(image)?;
    f(&mut header);
    image[..KDS_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    Ok(())
}

/// Head of an empty destination image; the projection kernel fills the rest.
pub(crate) fn empty_image_head(layout: &TupleLayout, format: ChunkFormat, length: usize, nrooms: usize) -> Result<Vec<u8>> {
    let mut head = vec![0u8; head_length(layout.natts())];
    let header = KernDataStore {
        length: length as u32,
        usage: 0,
        nitems: 0,
        nrooms: nrooms as u32,
        ncols: layout.natts() as u32,
        format: format.code(),
        _pad: [0; 2],
    };
    write_head(&mut head, &header, layout)?;
    Ok(head)
}

/// Read-only view over a chunk image, shared by the host and the emulated device.
pub struct ChunkView<'a> {
    image: &'a [u8],
    header: KernDataStore,
    format: ChunkFormat,
    layout: TupleLayout,
}

impl<'a> ChunkView<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self> {
        let header = read_header(image)?;
        let format = ChunkFormat::from_code(header.format)
            .ok_or_else(|| ScanError::Layout(format!("unknown format code {}", header.format)))?;
        if header.length as usize > image.len() {
            return Err(ScanError::Layout(format!(
                "header claims {} bytes, image has {}",
                header.length,
                image.len()
            )));
        }
        let ncols = header.ncols as usize;
        if head_length(ncols) > image.len() {
            return Err(ScanError::Layout(format!("{ncols} column descriptors overrun the image")));
        }
        let mut types = Vec::with_capacity(ncols);
        for j in 0..ncols {
            let at = KDS_HEADER_SIZE + COLUMN_DESC_SIZE * j;
            let desc: ColumnDesc = bytemuck::pod_read_unaligned(&image[at..at + COLUMN_DESC_SIZE]);
            types.push(
                DataType::from_type_id(desc.type_id)
                    .ok_or_else(|| ScanError::Layout(format!("unknown type id {}", desc.type_id)))?,
            );
        }
        Ok(Self {
            image,
            header,
            format,
            layout: TupleLayout::new(types),
        })
    }

    pub fn header(&self) -> &KernDataStore {
        &self.header
    }

    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn nitems(&self) -> usize {
        self.header.nitems as usize
    }

    pub fn layout(&self) -> &TupleLayout {
        &self.layout
    }

    pub fn row(&self, index: usize) -> Result<Row> {
        if index >= self.nitems() {
            return Err(ScanError::Layout(format!(
                "row {index} out of range ({} rows)",
                self.nitems()
            )));
        }
        let ncols = self.layout.natts();
        match self.format {
            ChunkFormat::Row => {
                let at = read_u32(self.image, row_index_at(ncols, index))? as usize;
                let tuple = self
                    .image
                    .get(at..)
                    .ok_or_else(|| ScanError::Layout(format!("tuple offset {at} out of range")))?;
                self.layout.read_tuple(tuple)
            }
            ChunkFormat::Slot => {
                let nrooms = self.header.nrooms as usize;
                self.layout.read_slot(
                    self.image,
                    slot_datums_at(ncols, index),
                    slot_nulls_at(ncols, nrooms, index),
                )
            }
        }
    }
}

/// An immutable, filled chunk.
#[derive(Clone)]
pub struct Chunk {
    schema: SchemaRef,
    image: Arc<[u8]>,
    nitems: usize,
    usage: usize,
    format: ChunkFormat,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk {{ format: {}, nitems: {}, bytes: {} }}",
            self.format,
            self.nitems,
            self.image.len()
        )
    }
}

impl Chunk {
    /// Adopt an image, checking it against `schema`.
    pub fn from_image(schema: SchemaRef, image: Vec<u8>) -> Result<Self> {
        let (nitems, usage, format) = {
            let view = ChunkView::parse(&image)?;
            let expected: Vec<DataType> = schema.types().collect();
            if view.layout().types() != expected.as_slice() {
                return Err(ScanError::Layout("image column types do not match the schema".into()));
            }
            (view.nitems(), view.header().usage as usize, view.format())
        };
        Ok(Self {
            schema,
            image: Arc::from(image),
            nitems,
            usage,
            format,
        })
    }

    /// Pack `rows` into one row-format chunk with no budget.
    pub fn from_rows(schema: SchemaRef, rows: &[Row]) -> Result<Self> {
        let mut builder = ChunkBuilder::new(schema, ChunkBudget::unbounded());
        for row in rows {
            builder.try_push(row)?;
        }
        builder.finish()
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn is_empty(&self) -> bool {
        self.nitems == 0
    }

    pub fn len_bytes(&self) -> usize {
        self.image.len()
    }

    /// Bytes of packed tuples or variable-length payloads at the tail.
    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn image(&self) -> &Arc<[u8]> {
        &self.image
    }

    pub fn view(&self) -> Result<ChunkView<'_>> {
        ChunkView::parse(&self.image)
    }

    pub fn row(&self, index: usize) -> Result<Row> {
        self.view()?.row(index)
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        let view = self.view()?;
        (0..view.nitems()).map(|i| view.row(i)).collect()
    }

    /// Two chunks holding the first and second half of the rows.
    pub fn split(&self) -> Result<(Chunk, Chunk)> {
        let rows = self.rows()?;
        let mid = rows.len() / 2;
        Ok((
            Chunk::from_rows(self.schema.clone(), &rows[..mid])?,
            Chunk::from_rows(self.schema.clone(), &rows[mid..])?,
        ))
    }
}

/// Fills a row-format chunk up to a byte and row budget.
pub struct ChunkBuilder {
    schema: SchemaRef,
    layout: TupleLayout,
    budget: ChunkBudget,
    tuples: Vec<u8>,
    sizes: Vec<usize>,
}

impl ChunkBuilder {
    pub fn new(schema: SchemaRef, budget: ChunkBudget) -> Self {
        let layout = TupleLayout::new(schema.types());
        Self {
            schema,
            layout,
            budget,
            tuples: Vec::new(),
            sizes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    fn image_length(&self, nitems: usize, usage: usize) -> usize {
        maxalign(row_index_at(self.layout.natts(), nitems)) + usage
    }

    /// Append `row` if it fits the budget. Returns `false` once full; the
    /// first row is always accepted so oversized rows still make progress.
    pub fn try_push(&mut self, row: &[crate::types::Datum]) -> Result<bool> {
        let size = self.layout.tuple_size(row)?;
        let nitems = self.sizes.len();
        if nitems > 0 {
            if nitems >= self.budget.max_rows {
                return Ok(false);
            }
            if self.image_length(nitems + 1, self.tuples.len() + size) > self.budget.max_bytes {
                return Ok(false);
            }
        }
        if self.tuples.len() + size > u32::MAX as usize {
            return Err(ScanError::Layout("chunk image exceeds 4 GiB".into()));
        }
        let at = self.tuples.len();
        self.tuples.resize(at + size, 0);
        self.layout.write_tuple(row, &mut self.tuples[at..])?;
        self.sizes.push(size);
        Ok(true)
    }

    /// Lay the image out with the first row's tuple at the very end.
    pub fn finish(self) -> Result<Chunk> {
        let nitems = self.sizes.len();
        let usage = self.tuples.len();
        let length = self.image_length(nitems, usage);
        let mut image = vec![0u8; length];
        let header = KernDataStore {
            length: length as u32,
            usage: usage as u32,
            nitems: nitems as u32,
            nrooms: nitems as u32,
            ncols: self.layout.natts() as u32,
            format: ChunkFormat::Row.code(),
            _pad: [0; 2],
        };
        write_head(&mut image, &header, &self.layout)?;

        let ncols = self.layout.natts();
        let mut src = 0usize;
        let mut dst = length;
        for (i, size) in self.sizes.iter().enumerate() {
            dst -= size;
            image[dst..dst + size].copy_from_slice(&self.tuples[src..src + size]);
            write_u32(&mut image, row_index_at(ncols, i), dst as u32)?;
            src += size;
        }
        Chunk::from_image(self.schema, image)
    }
}

/// Schema with the given column types and generated names.
pub fn anonymous_schema(types: &[DataType]) -> Schema {
    Schema::new(
        types
            .iter()
            .enumerate()
            .map(|(i, t)| crate::types::Field::new(format!("c{i}"), *t))
            .collect(),
    )
}
