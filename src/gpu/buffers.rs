//! Task control block shared by the host and the scan kernels.
//!
//! One control block per task holds:
//! - `KernGpuScan` header with the kernel error buffer and section offsets
//! - `KernParamBuf`: the bound parameter values the program reads as `KPARAM_n`
//! - `KernResultBuf`: row-visibility result header followed by `u32` indices
//!
//! # Transfer extents
//! The DMA send covers everything up to and including the result header; the
//! result indices are written by the device. The DMA receive covers the same
//! prefix and, when the task has no destination chunk, the indices too.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::chunk::layout::{decode_fixed, decode_varlena, fixed_bytes, maxalign, read_u32, write_u32};
use crate::error::{Result, ScanError};
use crate::gpu::device::KernelKind;
use crate::types::{DataType, Datum};

// ── Kernel error codes (must match gpuscan.cuh) ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernErrorCode {
    Success,
    /// The device could not decide; the host re-evaluates the whole chunk.
    CpuReCheck,
    /// The destination chunk was too small.
    DataStoreNoSpace,
    DivisionByZero,
    InvalidData,
}

impl KernErrorCode {
    pub fn raw(&self) -> i32 {
        match self {
            KernErrorCode::Success => 0,
            KernErrorCode::CpuReCheck => 1,
            KernErrorCode::DataStoreNoSpace => 2,
            KernErrorCode::DivisionByZero => 3,
            KernErrorCode::InvalidData => 4,
        }
    }

    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => KernErrorCode::Success,
            1 => KernErrorCode::CpuReCheck,
            2 => KernErrorCode::DataStoreNoSpace,
            3 => KernErrorCode::DivisionByZero,
            _ => KernErrorCode::InvalidData,
        }
    }

    /// Codes the scan cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernErrorCode::DivisionByZero | KernErrorCode::InvalidData)
    }
}

impl fmt::Display for KernErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KernErrorCode::Success => "success",
            KernErrorCode::CpuReCheck => "cpu recheck",
            KernErrorCode::DataStoreNoSpace => "data store no space",
            KernErrorCode::DivisionByZero => "division by zero",
            KernErrorCode::InvalidData => "invalid data",
        })
    }
}

// ── KernErrorBuf (16 bytes) ────────────────────────────────────────────────
//
//   offset 0:  errcode  (i32)
//   offset 4:  kernel   (i32)   1 = exec_quals, 2 = projection
//   offset 8:  lineno   (i32)   row index that raised the error
//   offset 12: _pad     (i32)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernErrorBuf {
    pub errcode: i32,
    pub kernel: i32,
    pub lineno: i32,
    pub _pad: i32,
}

impl KernErrorBuf {
    pub fn code(&self) -> KernErrorCode {
        KernErrorCode::from_raw(self.errcode)
    }

    pub fn kernel_kind(&self) -> Option<KernelKind> {
        KernelKind::from_code(self.kernel)
    }
}

// ── KernGpuScan (32 bytes) ─────────────────────────────────────────────────
//
//   offset 0:  kerror          (KernErrorBuf, 16 bytes)
//   offset 16: kparams_offset  (u32)
//   offset 20: kparams_length  (u32)
//   offset 24: kresults_offset (u32)
//   offset 28: _pad            (u32)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct KernGpuScan {
    pub kerror: KernErrorBuf,
    pub kparams_offset: u32,
    pub kparams_length: u32,
    pub kresults_offset: u32,
    pub _pad: u32,
}

pub const GPUSCAN_HEADER_SIZE: usize = std::mem::size_of::<KernGpuScan>();

// ── KernParamBuf header (8 bytes) ──────────────────────────────────────────
//
//   offset 0: length  (u32)  whole buffer, MAXALIGNed
//   offset 4: nparams (u32)
//   then nparams u32 value offsets relative to the buffer (0 = NULL),
//   then the values: fixed-width types at their natural width, variable
//   length types as u32 length + bytes, each value starting MAXALIGNed.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct KernParamBuf {
    pub length: u32,
    pub nparams: u32,
}

const PARAM_HEADER_SIZE: usize = std::mem::size_of::<KernParamBuf>();

// ── KernResultBuf header (16 bytes) ────────────────────────────────────────
//
//   offset 0:  nrels       (u32)
//   offset 4:  nrooms      (u32)
//   offset 8:  nitems      (u32)  written by the device
//   offset 12: all_visible (u32)  no quals: every source row is visible
//   then nrooms u32 row indices.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct KernResultBuf {
    pub nrels: u32,
    pub nrooms: u32,
    pub nitems: u32,
    pub all_visible: u32,
}

pub const RESULT_HEADER_SIZE: usize = std::mem::size_of::<KernResultBuf>();

fn corrupt(msg: impl Into<String>) -> ScanError {
    ScanError::Layout(msg.into())
}

/// Serialize parameter values in program order.
pub fn encode_params(params: &[(Datum, DataType)]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; maxalign(PARAM_HEADER_SIZE + 4 * params.len())];
    for (i, (value, dtype)) in params.iter().enumerate() {
        if value.is_null() {
            continue;
        }
        let at = buf.len();
        if dtype.is_varlena() {
            let bytes = match value {
                Datum::Text(s) | Datum::Json(s) if value.conforms_to(*dtype) => s.as_bytes(),
                other => return Err(corrupt(format!("parameter {i}: {other} is not {dtype}"))),
            };
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        } else {
            let bytes = fixed_bytes(*dtype, value)?
                .ok_or_else(|| corrupt(format!("parameter {i}: {value} is not {dtype}")))?;
            buf.extend_from_slice(&bytes[..dtype.attlen() as usize]);
        }
        buf.resize(maxalign(buf.len()), 0);
        write_u32(&mut buf, PARAM_HEADER_SIZE + 4 * i, at as u32)?;
    }
    let header = KernParamBuf {
        length: buf.len() as u32,
        nparams: params.len() as u32,
    };
    buf[..PARAM_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    Ok(buf)
}

/// Inverse of [`encode_params`]; `types` gives the type of each slot.
pub fn decode_params(buf: &[u8], types: &[DataType]) -> Result<Vec<Datum>> {
    let bytes = buf
        .get(..PARAM_HEADER_SIZE)
        .ok_or_else(|| corrupt("parameter buffer shorter than its header"))?;
    let header: KernParamBuf = bytemuck::pod_read_unaligned(bytes);
    if header.nparams as usize != types.len() {
        return Err(corrupt(format!(
            "parameter buffer holds {} values, program expects {}",
            header.nparams,
            types.len()
        )));
    }
    let mut out = Vec::with_capacity(types.len());
    for (i, dtype) in types.iter().enumerate() {
        let at = read_u32(buf, PARAM_HEADER_SIZE + 4 * i)? as usize;
        if at == 0 {
            out.push(Datum::Null);
            continue;
        }
        if dtype.is_varlena() {
            let len = read_u32(buf, at)? as usize;
            let payload = buf
                .get(at + 4..at + 4 + len)
                .ok_or_else(|| corrupt(format!("parameter {i} overruns the buffer")))?;
            out.push(decode_varlena(*dtype, payload)?);
        } else {
            let len = dtype.attlen() as usize;
            let payload = buf
                .get(at..at + len)
                .ok_or_else(|| corrupt(format!("parameter {i} overruns the buffer")))?;
            out.push(decode_fixed(*dtype, payload));
        }
    }
    Ok(out)
}

/// Host-side image of one task's control block.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    image: Vec<u8>,
    kresults_offset: usize,
    nrooms: usize,
}

impl ControlBlock {
    /// Build a control block for a source chunk of `nrooms` rows.
    pub fn new(params: &[u8], nrooms: usize, all_visible: bool) -> Self {
        let kparams_offset = GPUSCAN_HEADER_SIZE;
        let kresults_offset = kparams_offset + maxalign(params.len());
        let total = kresults_offset + RESULT_HEADER_SIZE + 4 * nrooms;
        let mut image = vec![0u8; maxalign(total)];

        let header = KernGpuScan {
            kerror: KernErrorBuf::default(),
            kparams_offset: kparams_offset as u32,
            kparams_length: params.len() as u32,
            kresults_offset: kresults_offset as u32,
            _pad: 0,
        };
        image[..GPUSCAN_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        image[kparams_offset..kparams_offset + params.len()].copy_from_slice(params);
        let results = KernResultBuf {
            nrels: 1,
            nrooms: nrooms as u32,
            nitems: if all_visible { nrooms as u32 } else { 0 },
            all_visible: all_visible as u32,
        };
        image[kresults_offset..kresults_offset + RESULT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&results));
        Self {
            image,
            kresults_offset,
            nrooms,
        }
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn dma_send_length(&self) -> usize {
        self.kresults_offset + RESULT_HEADER_SIZE
    }

    /// Bytes copied back; the row indices are only needed without a destination chunk.
    pub fn dma_recv_length(&self, with_results: bool) -> usize {
        if with_results {
            self.kresults_offset + RESULT_HEADER_SIZE + 4 * self.nrooms
        } else {
            self.dma_send_length()
        }
    }

    /// The part of the image the DMA send moves.
    pub fn send_image(&self) -> &[u8] {
        &self.image[..self.dma_send_length()]
    }
}

/// Parsed view over a control block, used by the kernels on the device side
/// and by the host after the DMA receive.
pub struct ControlView<'a> {
    image: &'a [u8],
    header: KernGpuScan,
}

impl<'a> ControlView<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self> {
        let bytes = image
            .get(..GPUSCAN_HEADER_SIZE)
            .ok_or_else(|| corrupt("control block shorter than its header"))?;
        let header: KernGpuScan = bytemuck::pod_read_unaligned(bytes);
        if header.kresults_offset as usize + RESULT_HEADER_SIZE > image.len() {
            return Err(corrupt("result header lies past the control block"));
        }
        Ok(Self { image, header })
    }

    pub fn kerror(&self) -> KernErrorBuf {
        self.header.kerror
    }

    pub fn params(&self) -> Result<&'a [u8]> {
        let at = self.header.kparams_offset as usize;
        self.image
            .get(at..at + self.header.kparams_length as usize)
            .ok_or_else(|| corrupt("parameter buffer lies past the control block"))
    }

    pub fn results(&self) -> KernResultBuf {
        let at = self.header.kresults_offset as usize;
        bytemuck::pod_read_unaligned(&self.image[at..at + RESULT_HEADER_SIZE])
    }

    /// Visible row indices; `None` when every source row is visible.
    pub fn visible_rows(&self) -> Result<Option<Vec<u32>>> {
        let results = self.results();
        if results.all_visible != 0 {
            return Ok(None);
        }
        let base = self.header.kresults_offset as usize + RESULT_HEADER_SIZE;
        (0..results.nitems as usize)
            .map(|i| read_u32(self.image, base + 4 * i))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

/// Record a kernel error unless one is already set.
pub(crate) fn set_kerror(image: &mut [u8], code: KernErrorCode, kernel: KernelKind, lineno: usize) -> Result<()> {
    let bytes = image
        .get_mut(..std::mem::size_of::<KernErrorBuf>())
        .ok_or_else(|| corrupt("control block shorter than its error buffer"))?;
    let current: KernErrorBuf = bytemuck::pod_read_unaligned(bytes);
    if current.errcode == KernErrorCode::Success.raw() {
        let kerror = KernErrorBuf {
            errcode: code.raw(),
            kernel: kernel.code(),
            lineno: lineno as i32,
            _pad: 0,
        };
        bytes.copy_from_slice(bytemuck::bytes_of(&kerror));
    }
    Ok(())
}

/// Store the visible row indices in the result buffer.
pub(crate) fn write_results(image: &mut [u8], rows: &[u32]) -> Result<()> {
    let header: KernGpuScan = bytemuck::pod_read_unaligned(
        image
            .get(..GPUSCAN_HEADER_SIZE)
            .ok_or_else(|| corrupt("control block shorter than its header"))?,
    );
    let at = header.kresults_offset as usize;
    let mut results: KernResultBuf = bytemuck::pod_read_unaligned(
        image
            .get(at..at + RESULT_HEADER_SIZE)
            .ok_or_else(|| corrupt("result header lies past the control block"))?,
    );
    if rows.len() > results.nrooms as usize {
        return Err(corrupt(format!("{} results for {} rooms", rows.len(), results.nrooms)));
    }
    for (i, row) in rows.iter().enumerate() {
        write_u32(image, at + RESULT_HEADER_SIZE + 4 * i, *row)?;
    }
    results.nitems = rows.len() as u32;
    results.all_visible = 0;
    image[at..at + RESULT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&results));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_device_layout() {
        assert_eq!(std::mem::size_of::<KernErrorBuf>(), 16);
        assert_eq!(GPUSCAN_HEADER_SIZE, 32);
        assert_eq!(RESULT_HEADER_SIZE, 16);
    }

    #[test]
    fn params_survive_the_buffer() {
        let params = vec![
            (Datum::Int32(-7), DataType::Int32),
            (Datum::Null, DataType::Int64),
            (Datum::Text("abc".into()), DataType::Text),
            (Datum::Float64(2.5), DataType::Float64),
        ];
        let buf = encode_params(&params).unwrap();
        assert_eq!(buf.len() % 8, 0);
        let types: Vec<_> = params.iter().map(|(_, t)| *t).collect();
        let decoded = decode_params(&buf, &types).unwrap();
        let expected: Vec<_> = params.into_iter().map(|(d, _)| d).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn param_count_mismatch_is_corrupt() {
        let buf = encode_params(&[(Datum::Int32(1), DataType::Int32)]).unwrap();
        assert!(decode_params(&buf, &[]).is_err());
    }

    #[test]
    fn dma_extents() {
        let params = encode_params(&[(Datum::Int64(1), DataType::Int64)]).unwrap();
        let block = ControlBlock::new(&params, 10, false);
        let send = block.dma_send_length();
        assert_eq!(send, GPUSCAN_HEADER_SIZE + params.len() + RESULT_HEADER_SIZE);
        assert_eq!(block.dma_recv_length(false), send);
        assert_eq!(block.dma_recv_length(true), send + 40);
        assert!(block.len() >= block.dma_recv_length(true));
    }

    #[test]
    fn first_kernel_error_wins_and_results_round_trip() {
        let mut block = ControlBlock::new(&encode_params(&[]).unwrap(), 4, false).image().to_vec();
        write_results(&mut block, &[0, 3]).unwrap();
        set_kerror(&mut block, KernErrorCode::CpuReCheck, KernelKind::ExecQuals, 2).unwrap();
        set_kerror(&mut block, KernErrorCode::DivisionByZero, KernelKind::Projection, 1).unwrap();

        let view = ControlView::parse(&block).unwrap();
        assert_eq!(view.kerror().code(), KernErrorCode::CpuReCheck);
        assert_eq!(view.kerror().kernel_kind(), Some(KernelKind::ExecQuals));
        assert_eq!(view.visible_rows().unwrap(), Some(vec![0, 3]));
        assert!(write_results(&mut block, &[0, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn all_visible_needs_no_indices() {
        let block = ControlBlock::new(&encode_params(&[]).unwrap(), 5, true);
        let view = ControlView::parse(block.image()).unwrap();
        assert_eq!(view.visible_rows().unwrap(), None);
        assert_eq!(view.results().nitems, 5);
    }
}
