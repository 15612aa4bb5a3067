//! Host emulation of the entry kernels in `cuda_lib/gpuscan.cuh`.
//!
//! Rows are split into blocks of the launch block size and evaluated in
//! parallel with rayon, one task per block. Space is then reserved block by
//! block the way the device does it: an exclusive prefix sum inside the
//! block plus one bump of a shared counter per block. The reservation runs
//! in block order, so results are deterministic.
//!
//! Kernel errors go to the control block's error buffer, not the device
//! status; a malformed control block or chunk image is a device fault.

use rayon::prelude::*;

use crate::chunk::{
    read_header, row_index_at, slot_area_length, slot_datums_at, slot_nulls_at, update_header, ChunkFormat,
    ChunkView,
};
use crate::chunk::layout::write_u32;
use crate::error::{EvalError, ScanError};
use crate::gpu::buffers::{decode_params, set_kerror, write_results, ControlView, KernErrorCode};
use crate::gpu::codegen::KernelProgram;
use crate::gpu::device::{DeviceCode, DeviceError, DeviceStatus, KernelKind};
use crate::transpiler::eval::{eval, eval_quals};
use crate::types::Datum;

#[derive(Debug, Clone, Copy)]
struct LaneError {
    code: KernErrorCode,
    lineno: usize,
}

fn kern_code(e: &EvalError) -> KernErrorCode {
    match e {
        EvalError::DivisionByZero => KernErrorCode::DivisionByZero,
        // Precise overflow reporting is left to the host.
        EvalError::Overflow(_) => KernErrorCode::CpuReCheck,
        _ => KernErrorCode::InvalidData,
    }
}

fn fault(e: ScanError) -> DeviceError {
    DeviceError::new(DeviceCode::IllegalAddress, e.to_string())
}

/// Exclusive prefix sum and total, as `stairlike_sum` computes it per block.
pub(crate) fn stairlike_sum(values: &[usize]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(values.len());
    let mut total = 0;
    for v in values {
        offsets.push(total);
        total += v;
    }
    (offsets, total)
}

fn load_params(program: &KernelProgram, control: &[u8]) -> Result<Vec<Datum>, DeviceError> {
    let view = ControlView::parse(control).map_err(fault)?;
    decode_params(view.params().map_err(fault)?, &program.param_types()).map_err(fault)
}

fn record_first(
    control: &mut [u8],
    errors: impl IntoIterator<Item = LaneError>,
    kernel: KernelKind,
) -> DeviceStatus {
    if let Some(e) = errors.into_iter().next() {
        set_kerror(control, e.code, kernel, e.lineno).map_err(fault)?;
    }
    Ok(())
}

/// `gpuscan_exec_quals`: mark the source rows that pass every device qual.
pub(crate) fn exec_quals(program: &KernelProgram, control: &mut [u8], src: &[u8], block_size: usize) -> DeviceStatus {
    let params = load_params(program, control)?;
    let view = ChunkView::parse(src).map_err(fault)?;
    let lanes: Vec<usize> = (0..view.nitems()).collect();

    let blocks: Vec<(Vec<u32>, Option<LaneError>)> = lanes
        .par_chunks(block_size.max(1))
        .map(|block| {
            let mut visible = Vec::new();
            let mut error = None;
            for &index in block {
                let outcome = view
                    .row(index)
                    .map_err(|_| KernErrorCode::InvalidData)
                    .and_then(|row| eval_quals(program.quals(), &row, &params).map_err(|e| kern_code(&e)));
                match outcome {
                    Ok(true) => visible.push(index as u32),
                    Ok(false) => {}
                    Err(code) => {
                        error.get_or_insert(LaneError { code, lineno: index });
                    }
                }
            }
            (visible, error)
        })
        .collect();

    let mut results = Vec::new();
    for (visible, _) in &blocks {
        let (offsets, count) = stairlike_sum(&vec![1; visible.len()]);
        let base = results.len();
        results.resize(base + count, 0);
        for (row, offset) in visible.iter().zip(offsets) {
            results[base + offset] = *row;
        }
    }
    write_results(control, &results).map_err(fault)?;
    record_first(control, blocks.iter().filter_map(|(_, e)| *e), KernelKind::ExecQuals)
}

/// `gpuscan_projection`: evaluate the targets for every visible row and
/// write them into the destination image.
pub(crate) fn exec_projection(
    program: &KernelProgram,
    control: &mut [u8],
    src: &[u8],
    dst: &mut [u8],
    block_size: usize,
) -> DeviceStatus {
    let projection = program
        .projection()
        .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, "program has no projection"))?;
    let params = load_params(program, control)?;
    let ctl = ControlView::parse(control).map_err(fault)?;
    let view = ChunkView::parse(src).map_err(fault)?;
    let visible: Vec<usize> = match ctl.visible_rows().map_err(fault)? {
        None => (0..view.nitems()).collect(),
        Some(rows) => rows.into_iter().map(|r| r as usize).collect(),
    };

    let header = read_header(dst).map_err(fault)?;
    let format = ChunkFormat::from_code(header.format)
        .ok_or_else(|| DeviceError::new(DeviceCode::IllegalAddress, "destination has an unknown format"))?;
    let (ncols, nrooms, length) = (header.ncols as usize, header.nrooms as usize, header.length as usize);
    if ncols != projection.layout.natts() || length > dst.len() {
        return Err(DeviceError::new(
            DeviceCode::IllegalAddress,
            "destination header does not match the projection",
        ));
    }
    let layout = &projection.layout;

    // values and sizing pass
    type Lane = Result<(Vec<Datum>, usize), LaneError>;
    let blocks: Vec<Vec<Lane>> = visible
        .par_chunks(block_size.max(1))
        .map(|block| {
            block
                .iter()
                .map(|&index| {
                    let lane_err = |code| LaneError { code, lineno: index };
                    let row = view.row(index).map_err(|_| lane_err(KernErrorCode::InvalidData))?;
                    let values = projection
                        .targets
                        .iter()
                        .map(|t| eval(t, &row, &params))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| lane_err(kern_code(&e)))?;
                    let size = match format {
                        ChunkFormat::Row => layout.tuple_size(&values),
                        ChunkFormat::Slot => layout.extra_size(&values),
                    }
                    .map_err(|_| lane_err(KernErrorCode::InvalidData))?;
                    Ok((values, size))
                })
                .collect()
        })
        .collect();

    // reservation and writing pass
    let head = match format {
        ChunkFormat::Row => row_index_at(ncols, nrooms),
        ChunkFormat::Slot => slot_area_length(ncols, nrooms),
    };
    let mut usage = header.usage as usize;
    let mut nitems = header.nitems as usize;
    let mut errors = Vec::new();
    let lanes_per_block = block_size.max(1);
    for (b, block) in blocks.iter().enumerate() {
        let sizes: Vec<usize> = block.iter().map(|l| l.as_ref().map_or(0, |(_, sz)| *sz)).collect();
        let (offsets, total) = stairlike_sum(&sizes);
        let (usage_base, index_base) = (usage, nitems);
        usage += total;
        nitems += block.len();

        for (k, lane) in block.iter().enumerate() {
            let (values, size) = match lane {
                Ok(lane) => lane,
                Err(e) => {
                    errors.push(*e);
                    continue;
                }
            };
            let lineno = visible[b * lanes_per_block + k];
            let dst_index = index_base + k;
            let end = usage_base + offsets[k] + size;
            if dst_index >= nrooms || head + end > length {
                errors.push(LaneError {
                    code: KernErrorCode::DataStoreNoSpace,
                    lineno,
                });
                continue;
            }
            let written = match format {
                ChunkFormat::Row => {
                    let at = length - end;
                    let written = layout.write_tuple(values, &mut dst[at..at + size]);
                    write_u32(dst, row_index_at(ncols, dst_index), at as u32).map_err(fault)?;
                    written
                }
                ChunkFormat::Slot => layout.write_slot(
                    values,
                    dst,
                    slot_datums_at(ncols, dst_index),
                    slot_nulls_at(ncols, nrooms, dst_index),
                    head + usage_base + offsets[k],
                ),
            };
            // The sizing pass must have predicted the writing pass exactly.
            if written.ok() != Some(*size) {
                errors.push(LaneError {
                    code: KernErrorCode::InvalidData,
                    lineno,
                });
            }
        }
    }
    update_header(dst, |h| {
        h.usage = usage as u32;
        h.nitems = nitems as u32;
    })
    .map_err(fault)?;
    record_first(control, errors, KernelKind::Projection)
}
