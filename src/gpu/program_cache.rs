//! Compiled device program cache.
//!
//! # Problem
//! Compiling a generated program takes milliseconds to seconds, and the same
//! scan shape is planned again and again. Rescans and concurrent scans with
//! identical source must share one compiled module.
//!
//! # Design
//! Entries are keyed by `(device id, program signature)`. Lookups take a
//! reference that is held by the scan through a [`ProgramHandle`]; dropping
//! the handle gives it back. Compilation runs outside the lock, so two scans
//! racing on the same new program may both compile it; the first to insert
//! wins and the other module is dropped. Failed compilations are not cached.
//! Unreferenced entries stay until [`ProgramCache::evict_unused`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Phase, Result, ScanError};
use crate::gpu::codegen::KernelProgram;
use crate::gpu::device::{CompiledModule, DeviceCode, DeviceRuntime};

/// Process-wide cache shared by every scan.
pub static PROGRAM_CACHE: LazyLock<Arc<ProgramCache>> = LazyLock::new(|| Arc::new(ProgramCache::default()));

type CacheKey = (u64, u64);

#[derive(Debug)]
struct CacheEntry {
    module: Arc<dyn CompiledModule>,
    refs: usize,
}

#[derive(Debug, Default)]
pub struct ProgramCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ProgramCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Compiled module for `program` on `device`, compiling it on a miss.
    pub fn acquire(self: &Arc<Self>, device: &Arc<dyn DeviceRuntime>, program: &Arc<KernelProgram>) -> Result<ProgramHandle> {
        let key = (device.id(), program.signature());
        if let Some(entry) = self.entries.lock().get_mut(&key) {
            entry.refs += 1;
            return Ok(self.handle(key, entry.module.clone()));
        }

        let module = device.compile(program).map_err(|e| match e.code {
            DeviceCode::CompileFailed => ScanError::Compile {
                signature: program.signature(),
                message: e.message,
            },
            _ => ScanError::device(Phase::Compile, e),
        })?;
        info!(
            target: "gpuscan",
            device = %device.name(),
            signature = %format_args!("{:016x}", program.signature()),
            extra = %program.extra_flags(),
            "device program built"
        );

        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert(CacheEntry { module, refs: 0 });
        entry.refs += 1;
        Ok(self.handle(key, entry.module.clone()))
    }

    fn handle(self: &Arc<Self>, key: CacheKey, module: Arc<dyn CompiledModule>) -> ProgramHandle {
        ProgramHandle {
            cache: self.clone(),
            key,
            module,
        }
    }

    fn put_back(&self, key: CacheKey) {
        if let Some(entry) = self.entries.lock().get_mut(&key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Drop every entry nobody holds. Returns how many were removed.
    pub fn evict_unused(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.refs > 0);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(target: "gpuscan", removed, "evicted unused device programs");
        }
        removed
    }

    /// Drop every entry compiled for `device_id`, e.g. after its context was lost.
    pub fn forget_device(&self, device_id: u64) {
        self.entries.lock().retain(|(dev, _), _| *dev != device_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding handles for a program, `None` if it is not cached.
    pub fn refcount(&self, device_id: u64, signature: u64) -> Option<usize> {
        self.entries.lock().get(&(device_id, signature)).map(|e| e.refs)
    }
}

/// A held reference to a cached module.
#[derive(Debug)]
pub struct ProgramHandle {
    cache: Arc<ProgramCache>,
    key: CacheKey,
    module: Arc<dyn CompiledModule>,
}

impl ProgramHandle {
    pub fn module(&self) -> &Arc<dyn CompiledModule> {
        &self.module
    }

    pub fn signature(&self) -> u64 {
        self.key.1
    }
}

impl Drop for ProgramHandle {
    fn drop(&mut self) {
        self.cache.put_back(self.key);
    }
}
