//! Byte layout of one row inside a chunk image.
//!
//! # Row format
//! ```text
//! +--------+---------+------------+-----------+--------+-----+
//! | t_len  | t_natts | t_infomask | null bits | values | pad |
//! | u32    | u16     | u16        | (natts+7)/8 bytes          |
//! +--------+---------+------------+-----------+--------+-----+
//! ```
//! The header plus bitmap is `MAXALIGN`ed; each non-null value is aligned to
//! its type's alignment; a variable-length value is a `u32` byte length
//! followed by the bytes. A set bitmap bit means "not null". `t_len` is the
//! `MAXALIGN`ed total.
//!
//! # Slot format
//! Each column is one 8-byte datum plus a null flag. Fixed-width values are
//! stored inline (little-endian, zero-extended). Variable-length values live
//! in the chunk's extra area and the datum holds `offset | (length << 32)`,
//! offset counted from the start of the image.
//!
//! # Sizing and writing
//! Every pass walks the attributes through [`TupleLayout::visit`], so the
//! sizing pass and the writing pass see the same order and the same null
//! decisions. The generated device code follows the same walk.

use crate::error::{Result, ScanError};
use crate::types::{DataType, Datum, Row};

pub const MAXIMUM_ALIGNOF: usize = 8;
pub const VARHDRSZ: usize = 4;
pub const TUPLE_HEADER_SIZE: usize = 8;
pub const HEAP_HASNULL: u16 = 0x0001;

#[inline]
pub const fn typealign(align: usize, len: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

#[inline]
pub const fn maxalign(len: usize) -> usize {
    typealign(MAXIMUM_ALIGNOF, len)
}

/// Bytes taken by the tuple header and null bitmap.
#[inline]
pub const fn tuple_header_length(natts: usize) -> usize {
    maxalign(TUPLE_HEADER_SIZE + natts.div_ceil(8))
}

/// One attribute as the traversal sees it.
enum Step<'a> {
    Null,
    Fixed { align: usize, bytes: [u8; 8], len: usize },
    Varlena { bytes: &'a [u8] },
}

fn layout_err(msg: impl Into<String>) -> ScanError {
    ScanError::Layout(msg.into())
}

fn put(dst: &mut [u8], at: usize, bytes: &[u8]) -> Result<()> {
    dst.get_mut(at..at + bytes.len())
        .ok_or_else(|| layout_err(format!("write of {} bytes at {at} overruns buffer", bytes.len())))?
        .copy_from_slice(bytes);
    Ok(())
}

fn get(src: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    src.get(at..at + len)
        .ok_or_else(|| layout_err(format!("read of {len} bytes at {at} overruns buffer")))
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> Result<u32> {
    let b = get(src, at, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn write_u32(dst: &mut [u8], at: usize, v: u32) -> Result<()> {
    put(dst, at, &v.to_le_bytes())
}

pub(crate) fn read_u64(src: &[u8], at: usize) -> Result<u64> {
    let b = get(src, at, 8)?;
    let mut w = [0u8; 8];
    w.copy_from_slice(b);
    Ok(u64::from_le_bytes(w))
}

pub(crate) fn write_u64(dst: &mut [u8], at: usize, v: u64) -> Result<()> {
    put(dst, at, &v.to_le_bytes())
}

/// Fixed-width value bytes, or `None` for variable-length types.
pub(crate) fn fixed_bytes(dtype: DataType, value: &Datum) -> Result<Option<[u8; 8]>> {
    let mut out = [0u8; 8];
    let src: &[u8] = match (dtype, value) {
        (DataType::Bool, Datum::Bool(v)) => &[*v as u8],
        (DataType::Int16, Datum::Int16(v)) => &v.to_le_bytes(),
        (DataType::Int32, Datum::Int32(v)) => &v.to_le_bytes(),
        (DataType::Date, Datum::Date(v)) => &v.to_le_bytes(),
        (DataType::Int64, Datum::Int64(v)) => &v.to_le_bytes(),
        (DataType::Float32, Datum::Float32(v)) => &v.to_bits().to_le_bytes(),
        (DataType::Float64, Datum::Float64(v)) => &v.to_bits().to_le_bytes(),
        (DataType::Text, Datum::Text(_)) | (DataType::Json, Datum::Json(_)) => return Ok(None),
        (t, v) => return Err(layout_err(format!("value {v} does not fit a {t} column"))),
    };
    out[..src.len()].copy_from_slice(src);
    Ok(Some(out))
}

pub(crate) fn decode_fixed(dtype: DataType, b: &[u8]) -> Datum {
    let mut w = [0u8; 8];
    w[..b.len()].copy_from_slice(b);
    let word = u64::from_le_bytes(w);
    match dtype {
        DataType::Bool => Datum::Bool(word & 0xff != 0),
        DataType::Int16 => Datum::Int16(word as u16 as i16),
        DataType::Int32 => Datum::Int32(word as u32 as i32),
        DataType::Date => Datum::Date(word as u32 as i32),
        DataType::Int64 => Datum::Int64(word as i64),
        DataType::Float32 => Datum::Float32(f32::from_bits(word as u32)),
        DataType::Float64 => Datum::Float64(f64::from_bits(word)),
        DataType::Text | DataType::Json => Datum::Null,
    }
}

pub(crate) fn decode_varlena(dtype: DataType, b: &[u8]) -> Result<Datum> {
    let s = std::str::from_utf8(b).map_err(|e| layout_err(format!("invalid utf-8 in {dtype} value: {e}")))?;
    Ok(match dtype {
        DataType::Json => Datum::Json(s.to_owned()),
        _ => Datum::Text(s.to_owned()),
    })
}

/// Attribute layout of a row schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleLayout {
    types: Vec<DataType>,
}

impl TupleLayout {
    pub fn new(types: impl IntoIterator<Item = DataType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }

    pub fn natts(&self) -> usize {
        self.types.len()
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    /// Sum of the aligned fixed widths plus the tuple header. Variable-length
    /// columns count only their length word.
    pub fn fixed_width(&self) -> usize {
        let mut off = tuple_header_length(self.natts());
        for t in &self.types {
            off = if t.is_varlena() {
                typealign(4, off) + VARHDRSZ
            } else {
                typealign(t.attalign(), off) + t.attlen() as usize
            };
        }
        maxalign(off)
    }

    /// The one traversal both passes share.
    fn visit<'a>(
        &self,
        values: &'a [Datum],
        mut f: impl FnMut(usize, Step<'a>) -> Result<()>,
    ) -> Result<()> {
        if values.len() != self.types.len() {
            return Err(layout_err(format!(
                "row has {} values, layout has {} columns",
                values.len(),
                self.types.len()
            )));
        }
        for (j, (dtype, value)) in self.types.iter().zip(values).enumerate() {
            let step = match value {
                Datum::Null => Step::Null,
                Datum::Text(s) | Datum::Json(s) if dtype.is_varlena() => {
                    if !value.conforms_to(*dtype) {
                        return Err(layout_err(format!("value {value} does not fit a {dtype} column")));
                    }
                    Step::Varlena { bytes: s.as_bytes() }
                }
                _ => match fixed_bytes(*dtype, value)? {
                    Some(bytes) => Step::Fixed {
                        align: dtype.attalign(),
                        bytes,
                        len: dtype.attlen() as usize,
                    },
                    None => return Err(layout_err(format!("value {value} does not fit a {dtype} column"))),
                },
            };
            f(j, step)?;
        }
        Ok(())
    }

    // ── Row format ──────────────────────────────────────────────────────────

    /// Sizing pass: bytes `write_tuple` will produce for `values`.
    pub fn tuple_size(&self, values: &[Datum]) -> Result<usize> {
        let mut off = tuple_header_length(self.natts());
        self.visit(values, |_, step| {
            match step {
                Step::Null => {}
                Step::Fixed { align, len, .. } => off = typealign(align, off) + len,
                Step::Varlena { bytes } => off = typealign(4, off) + VARHDRSZ + bytes.len(),
            }
            Ok(())
        })?;
        Ok(maxalign(off))
    }

    /// Writing pass: serialize `values` at the start of `dst` and return the
    /// number of bytes written.
    pub fn write_tuple(&self, values: &[Datum], dst: &mut [u8]) -> Result<usize> {
        let natts = self.natts();
        let hoff = tuple_header_length(natts);
        let header = dst
            .get_mut(..hoff)
            .ok_or_else(|| layout_err("no room for tuple header"))?;
        header.fill(0);

        let mut off = hoff;
        let mut infomask = 0u16;
        self.visit(values, |j, step| {
            match step {
                Step::Null => {
                    infomask |= HEAP_HASNULL;
                    return Ok(());
                }
                Step::Fixed { align, bytes, len } => {
                    let start = typealign(align, off);
                    put(dst, off, &[0u8; 8][..start - off])?;
                    put(dst, start, &bytes[..len])?;
                    off = start + len;
                }
                Step::Varlena { bytes } => {
                    let start = typealign(4, off);
                    put(dst, off, &[0u8; 8][..start - off])?;
                    write_u32(dst, start, bytes.len() as u32)?;
                    put(dst, start + VARHDRSZ, bytes)?;
                    off = start + VARHDRSZ + bytes.len();
                }
            }
            dst[TUPLE_HEADER_SIZE + j / 8] |= 1 << (j % 8);
            Ok(())
        })?;

        let end = maxalign(off);
        put(dst, off, &[0u8; 8][..end - off])?;
        write_u32(dst, 0, end as u32)?;
        put(dst, 4, &(natts as u16).to_le_bytes())?;
        put(dst, 6, &infomask.to_le_bytes())?;
        Ok(end)
    }

    /// Decode a tuple written by `write_tuple`.
    pub fn read_tuple(&self, src: &[u8]) -> Result<Row> {
        let natts = u16::from_le_bytes([get(src, 4, 1)?[0], get(src, 5, 1)?[0]]) as usize;
        if natts != self.natts() {
            return Err(layout_err(format!(
                "tuple has {natts} attributes, layout has {}",
                self.natts()
            )));
        }
        let t_len = read_u32(src, 0)? as usize;
        let src = get(src, 0, t_len)?;
        let mut off = tuple_header_length(natts);
        let mut row = Vec::with_capacity(natts);
        for (j, dtype) in self.types.iter().enumerate() {
            let notnull = get(src, TUPLE_HEADER_SIZE + j / 8, 1)?[0] & (1 << (j % 8)) != 0;
            if !notnull {
                row.push(Datum::Null);
                continue;
            }
            if dtype.is_varlena() {
                let start = typealign(4, off);
                let len = read_u32(src, start)? as usize;
                row.push(decode_varlena(*dtype, get(src, start + VARHDRSZ, len)?)?);
                off = start + VARHDRSZ + len;
            } else {
                let start = typealign(dtype.attalign(), off);
                let len = dtype.attlen() as usize;
                row.push(decode_fixed(*dtype, get(src, start, len)?));
                off = start + len;
            }
        }
        Ok(row)
    }

    // ── Slot format ─────────────────────────────────────────────────────────

    /// Sizing pass for the extra area one slot row needs.
    pub fn extra_size(&self, values: &[Datum]) -> Result<usize> {
        let mut sz = 0usize;
        self.visit(values, |_, step| {
            if let Step::Varlena { bytes } = step {
                sz = typealign(4, sz) + bytes.len();
            }
            Ok(())
        })?;
        Ok(maxalign(sz))
    }

    /// Writing pass for one slot row.
    ///
    /// Datums go to `image[datums_at..]`, null flags to `image[nulls_at..]`
    /// and variable-length payloads to `image[extra_at..]`. Returns the
    /// number of extra bytes consumed.
    pub fn write_slot(
        &self,
        values: &[Datum],
        image: &mut [u8],
        datums_at: usize,
        nulls_at: usize,
        extra_at: usize,
    ) -> Result<usize> {
        let mut pos = 0usize;
        self.visit(values, |j, step| {
            let (word, isnull) = match step {
                Step::Null => (0u64, 1u8),
                Step::Fixed { bytes, .. } => (u64::from_le_bytes(bytes), 0u8),
                Step::Varlena { bytes } => {
                    let start = typealign(4, pos);
                    put(image, extra_at + pos, &[0u8; 4][..start - pos])?;
                    put(image, extra_at + start, bytes)?;
                    pos = start + bytes.len();
                    let offset = (extra_at + start) as u64;
                    (offset | ((bytes.len() as u64) << 32), 0u8)
                }
            };
            write_u64(image, datums_at + 8 * j, word)?;
            put(image, nulls_at + j, &[isnull])
        })?;
        let end = maxalign(pos);
        put(image, extra_at + pos, &[0u8; 8][..end - pos])?;
        Ok(end)
    }

    /// Decode one slot row.
    pub fn read_slot(&self, image: &[u8], datums_at: usize, nulls_at: usize) -> Result<Row> {
        let mut row = Vec::with_capacity(self.natts());
        for (j, dtype) in self.types.iter().enumerate() {
            if get(image, nulls_at + j, 1)?[0] != 0 {
                row.push(Datum::Null);
                continue;
            }
            let word = read_u64(image, datums_at + 8 * j)?;
            if dtype.is_varlena() {
                let offset = (word & 0xffff_ffff) as usize;
                let len = (word >> 32) as usize;
                row.push(decode_varlena(*dtype, get(image, offset, len)?)?);
            } else {
                row.push(decode_fixed(*dtype, &word.to_le_bytes()[..dtype.attlen() as usize]));
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> TupleLayout {
        TupleLayout::new([DataType::Bool, DataType::Int64, DataType::Text, DataType::Int16])
    }

    #[test]
    fn header_length_is_maxaligned() {
        assert_eq!(tuple_header_length(1), 16);
        assert_eq!(tuple_header_length(8), 16);
        assert_eq!(tuple_header_length(9), 16);
        assert_eq!(tuple_header_length(64), 16);
        assert_eq!(tuple_header_length(65), 24);
    }

    #[test]
    fn tuple_sizing_matches_writing() {
        let l = layout();
        let rows = [
            vec![Datum::Bool(true), Datum::Int64(-5), Datum::Text("hello".into()), Datum::Int16(7)],
            vec![Datum::Null, Datum::Int64(1), Datum::Null, Datum::Null],
            vec![Datum::Bool(false), Datum::Null, Datum::Text(String::new()), Datum::Int16(-1)],
        ];
        for row in &rows {
            let size = l.tuple_size(row).unwrap();
            let mut buf = vec![0xAAu8; size];
            assert_eq!(l.write_tuple(row, &mut buf).unwrap(), size);
            assert_eq!(&l.read_tuple(&buf).unwrap(), row);
        }
    }

    #[test]
    fn slot_sizing_matches_writing() {
        let l = layout();
        let row = vec![Datum::Bool(true), Datum::Int64(9), Datum::Text("abcde".into()), Datum::Null];
        let extra = l.extra_size(&row).unwrap();
        assert_eq!(extra, 8);
        let mut image = vec![0u8; 64 + extra];
        let used = l.write_slot(&row, &mut image, 0, 32, 64).unwrap();
        assert_eq!(used, extra);
        assert_eq!(l.read_slot(&image, 0, 32).unwrap(), row);
    }

    #[test]
    fn short_buffer_is_an_error_not_a_panic() {
        let l = layout();
        let row = vec![Datum::Bool(true), Datum::Int64(9), Datum::Text("abcde".into()), Datum::Int16(1)];
        let mut buf = vec![0u8; 20];
        assert!(l.write_tuple(&row, &mut buf).is_err());
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let l = TupleLayout::new([DataType::Int32]);
        assert!(l.tuple_size(&[Datum::Text("x".into())]).is_err());
        assert!(l.tuple_size(&[Datum::Int64(1)]).is_err());
    }
}
