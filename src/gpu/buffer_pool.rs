//! Device memory pool for amortizing per-task allocation overhead.
//!
//! # Problem
//! Every submitted task needs one device allocation holding its control
//! block, source chunk and destination chunk. A scan over many chunks would
//! otherwise call into the driver twice per chunk.
//!
//! # Design
//! A size-class free-list pool. Allocations are bucketed by their rounded
//! size (next power of two, minimum 64 KiB). `acquire` pops a recycled
//! allocation or asks the device for a fresh one; `release` returns it to its
//! bucket or frees it when the bucket is full. When the device reports out of
//! memory the pool frees its idle allocations and tries once more before
//! handing the failure back to the caller.
//!
//! Memory whose task failed is returned with `discard` and always freed.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::gpu::device::{DeviceCode, DeviceError, DevicePtr, DeviceRuntime};

/// Minimum size class: 64 KiB.
const MIN_SIZE_CLASS: usize = 64 * 1024;

/// Maximum number of idle allocations kept per size class.
const MAX_PER_BUCKET: usize = 4;

/// A device allocation handed out by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledAllocation {
    pub ptr: DevicePtr,
    /// Size class; at least the requested size.
    pub size: usize,
}

#[derive(Default)]
pub struct DevicePool {
    free_lists: Mutex<HashMap<usize, Vec<DevicePtr>>>,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevicePool {{ idle_allocations: {} }}", self.idle_count())
    }
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn size_class(needed: usize) -> usize {
        needed.next_power_of_two().max(MIN_SIZE_CLASS)
    }

    pub fn acquire(&self, device: &dyn DeviceRuntime, needed: usize) -> Result<PooledAllocation, DeviceError> {
        let size = Self::size_class(needed);
        if let Some(ptr) = self.free_lists.lock().get_mut(&size).and_then(|v| v.pop()) {
            return Ok(PooledAllocation { ptr, size });
        }
        match device.alloc(size) {
            Ok(ptr) => Ok(PooledAllocation { ptr, size }),
            Err(e) if e.code == DeviceCode::OutOfMemory => {
                let freed = self.trim(device);
                if freed == 0 {
                    return Err(e);
                }
                debug!(target: "gpuscan", freed, size, "retrying allocation after trimming the pool");
                device.alloc(size).map(|ptr| PooledAllocation { ptr, size })
            }
            Err(e) => Err(e),
        }
    }

    /// Return an allocation for reuse; frees it when its bucket is full.
    pub fn release(&self, device: &dyn DeviceRuntime, alloc: PooledAllocation) {
        {
            let mut lists = self.free_lists.lock();
            let bucket = lists.entry(alloc.size).or_default();
            if bucket.len() < MAX_PER_BUCKET {
                bucket.push(alloc.ptr);
                return;
            }
        }
        self.discard(device, alloc);
    }

    /// Free an allocation without pooling it.
    pub fn discard(&self, device: &dyn DeviceRuntime, alloc: PooledAllocation) {
        if let Err(e) = device.free(alloc.ptr) {
            warn!(target: "gpuscan", error = %e, "failed to free device memory");
        }
    }

    /// Free every idle allocation; returns the bytes given back to the device.
    pub fn trim(&self, device: &dyn DeviceRuntime) -> usize {
        let drained: Vec<(usize, Vec<DevicePtr>)> = self.free_lists.lock().drain().collect();
        let mut freed = 0;
        for (size, ptrs) in drained {
            for ptr in ptrs {
                if device.free(ptr).is_ok() {
                    freed += size;
                }
            }
        }
        freed
    }

    /// Number of idle allocations currently held in the pool.
    pub fn idle_count(&self) -> usize {
        self.free_lists.lock().values().map(|v| v.len()).sum()
    }
}
