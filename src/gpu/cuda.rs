//! CUDA backend through `cudarc`.
//!
//! Programs are compiled with NVRTC and loaded as modules. Each
//! [`StreamHandle`] is a [`CommandStream`] worker that owns a CUDA stream and
//! runs its commands on it one at a time, synchronizing after each so a
//! failure is attributed to the command that caused it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cudarc::driver::safe::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::driver::{DevicePtr as _, DriverError};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use parking_lot::Mutex;
use tracing::debug;

use crate::gpu::codegen::KernelProgram;
use crate::gpu::device::{
    CompiledModule, CompletionFn, DeviceCode, DeviceError, DevicePtr, DeviceRuntime, DeviceSlice, DeviceStatus,
    EventHandle, HostBuffer, KernelArgs, KernelKind, StreamHandle,
};
use crate::gpu::stream::{Command, CommandExecutor, CommandStream};
use crate::gpu::{grid_size, CUDA_BLOCK_SIZE};

fn driver_error(e: DriverError) -> DeviceError {
    DeviceError::new(DeviceCode::from_raw(e.0 as i32), format!("{e:?}"))
}

#[derive(Debug)]
pub struct CudaProgram {
    signature: u64,
    module: Arc<CudaModule>,
    functions: Mutex<HashMap<KernelKind, CudaFunction>>,
}

impl CudaProgram {
    fn function(&self, kernel: KernelKind) -> Result<CudaFunction, DeviceError> {
        let mut functions = self.functions.lock();
        if let Some(f) = functions.get(&kernel) {
            return Ok(f.clone());
        }
        let f = self.module.load_function(kernel.entry_name()).map_err(driver_error)?;
        functions.insert(kernel, f.clone());
        Ok(f)
    }
}

impl CompiledModule for CudaProgram {
    fn signature(&self) -> u64 {
        self.signature
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One device allocation. The map in [`Inner`] only hands out clones, so a
/// free never waits for a copy or kernel that is using the memory; the last
/// clone releases it.
struct Allocation {
    len: usize,
    buf: Mutex<CudaSlice<u8>>,
}

struct Inner {
    ordinal: usize,
    ctx: Arc<CudaContext>,
    /// Stream used for allocation and frees.
    alloc_stream: Arc<CudaStream>,
    allocations: Mutex<HashMap<u64, Arc<Allocation>>>,
    used: AtomicU64,
    streams: Mutex<HashMap<u64, CommandStream>>,
    events: Mutex<HashMap<u64, Option<Instant>>>,
    next_handle: AtomicU64,
}

impl Inner {
    fn allocation(&self, slice: DeviceSlice) -> Result<Arc<Allocation>, DeviceError> {
        let alloc = self
            .allocations
            .lock()
            .get(&slice.ptr.0)
            .cloned()
            .ok_or_else(|| DeviceError::new(DeviceCode::IllegalAddress, format!("no allocation {}", slice.ptr.0)))?;
        if slice.end() > alloc.len {
            return Err(DeviceError::new(DeviceCode::IllegalAddress, "range outside allocation"));
        }
        Ok(alloc)
    }
}

struct CudaExecutor {
    inner: Weak<Inner>,
    stream: Arc<CudaStream>,
}

impl CudaExecutor {
    fn inner(&self) -> Result<Arc<Inner>, DeviceError> {
        self.inner
            .upgrade()
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidContext, "device was dropped"))
    }
}

impl CommandExecutor for CudaExecutor {
    fn copy_htod(&self, dst: DeviceSlice, src: &[u8]) -> DeviceStatus {
        let alloc = self.inner()?.allocation(dst)?;
        let mut buf = alloc.buf.lock();
        let mut view = buf.slice_mut(dst.offset..dst.end());
        self.stream.memcpy_htod(src, &mut view).map_err(driver_error)?;
        self.stream.synchronize().map_err(driver_error)
    }

    fn copy_dtoh(&self, src: DeviceSlice, dst: &HostBuffer) -> DeviceStatus {
        let alloc = self.inner()?.allocation(src)?;
        let buf = alloc.buf.lock();
        let view = buf.slice(src.offset..src.end());
        let mut host = dst.lock();
        let target = host
            .get_mut(..src.len)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, "host buffer too small"))?;
        self.stream.memcpy_dtoh(&view, target).map_err(driver_error)?;
        self.stream.synchronize().map_err(driver_error)
    }

    fn launch(&self, module: &Arc<dyn CompiledModule>, kernel: KernelKind, args: &KernelArgs) -> DeviceStatus {
        let inner = self.inner()?;
        let program = module
            .as_any()
            .downcast_ref::<CudaProgram>()
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidHandle, "module was not built by this device"))?;
        let function = program.function(kernel)?;
        let dst = match (kernel, args.dst) {
            (KernelKind::Projection, Some(dst)) => Some(dst),
            (KernelKind::Projection, None) => {
                return Err(DeviceError::new(DeviceCode::InvalidValue, "projection without destination"))
            }
            (KernelKind::ExecQuals, _) => None,
        };
        let slices: Vec<DeviceSlice> = [Some(args.control), Some(args.src), dst].into_iter().flatten().collect();

        // Slices of one task usually share an allocation; lock each once.
        let mut held: Vec<(u64, Arc<Allocation>)> = Vec::new();
        for slice in &slices {
            if !held.iter().any(|(id, _)| *id == slice.ptr.0) {
                held.push((slice.ptr.0, inner.allocation(*slice)?));
            }
        }
        let locked: Vec<_> = held.iter().map(|(id, a)| (*id, a.buf.lock())).collect();
        // The recorded events must follow the kernel, so these outlive it.
        let mut syncs = Vec::with_capacity(locked.len());
        let mut addresses = Vec::with_capacity(slices.len());
        for (id, buf) in &locked {
            let (base, sync) = buf.device_ptr(&self.stream);
            syncs.push(sync);
            for slice in slices.iter().filter(|s| s.ptr.0 == *id) {
                addresses.push((slice.ptr.0, slice.offset, base + slice.offset as u64));
            }
        }
        let address = |slice: DeviceSlice| {
            addresses
                .iter()
                .find(|(id, offset, _)| *id == slice.ptr.0 && *offset == slice.offset)
                .map(|(_, _, addr)| *addr)
                .ok_or_else(|| DeviceError::new(DeviceCode::IllegalAddress, "unresolved kernel argument"))
        };
        let control = address(args.control)?;
        let src = address(args.src)?;
        let dst = dst.map(address).transpose()?;

        let config = LaunchConfig {
            grid_dim: (grid_size(args.nitems.max(1)), 1, 1),
            block_dim: (CUDA_BLOCK_SIZE, 1, 1),
            shared_mem_bytes: CUDA_BLOCK_SIZE * 4,
        };
        let mut builder = self.stream.launch_builder(&function);
        builder.arg(&control).arg(&src);
        if let Some(dst) = &dst {
            builder.arg(dst);
        }
        // SAFETY: the arguments match the kernel prototypes in gpuscan.cuh and
        // every address was checked against its allocation above.
        unsafe { builder.launch(config) }.map_err(driver_error)?;
        let status = self.stream.synchronize().map_err(driver_error);
        drop(syncs);
        drop(locked);
        status
    }

    fn record(&self, event: EventHandle) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(slot) = inner.events.lock().get_mut(&event.0) {
                *slot = Some(Instant::now());
            }
        }
    }
}

/// A CUDA device opened through the driver API.
pub struct CudaDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice").field("ordinal", &self.inner.ordinal).finish()
    }
}

impl CudaDevice {
    pub fn open(ordinal: usize) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(ordinal).map_err(driver_error)?;
        let alloc_stream = ctx.default_stream();
        Ok(Self {
            inner: Arc::new(Inner {
                ordinal,
                ctx,
                alloc_stream,
                allocations: Mutex::new(HashMap::new()),
                used: AtomicU64::new(0),
                streams: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn with_stream(&self, stream: StreamHandle, command: Command) -> DeviceStatus {
        let streams = self.inner.streams.lock();
        let s = streams
            .get(&stream.0)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidHandle, format!("unknown stream {}", stream.0)))?;
        s.submit(command)
    }
}

impl DeviceRuntime for CudaDevice {
    fn id(&self) -> u64 {
        // Ordinals are unique per process; keep them clear of emulator ids.
        (1 << 63) | self.inner.ordinal as u64
    }

    fn name(&self) -> String {
        format!("cuda:{}", self.inner.ordinal)
    }

    fn memory_in_use(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed) as usize
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        let buf = self.inner.alloc_stream.alloc_zeros::<u8>(bytes).map_err(driver_error)?;
        let id = self.next_handle();
        self.inner.allocations.lock().insert(
            id,
            Arc::new(Allocation {
                len: bytes,
                buf: Mutex::new(buf),
            }),
        );
        self.inner.used.fetch_add(bytes as u64, Ordering::Relaxed);
        Ok(DevicePtr(id))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let alloc = self
            .inner
            .allocations
            .lock()
            .remove(&ptr.0)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, format!("double free of {}", ptr.0)))?;
        self.inner.used.fetch_sub(alloc.len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn compile(&self, program: &Arc<KernelProgram>) -> Result<Arc<dyn CompiledModule>, DeviceError> {
        let options = CompileOptions {
            options: vec!["--std=c++14".into()],
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(program.full_source(), options)
            .map_err(|e| DeviceError::new(DeviceCode::CompileFailed, e.to_string()))?;
        let module = self.inner.ctx.load_module(ptx).map_err(driver_error)?;
        debug!(target: "gpuscan", device = %self.name(), signature = program.signature(), "loaded CUDA module");
        Ok(Arc::new(CudaProgram {
            signature: program.signature(),
            module,
            functions: Mutex::new(HashMap::new()),
        }))
    }

    fn create_stream(&self) -> Result<StreamHandle, DeviceError> {
        let id = self.next_handle();
        let stream = self.inner.ctx.new_stream().map_err(driver_error)?;
        let executor = CudaExecutor {
            inner: Arc::downgrade(&self.inner),
            stream,
        };
        let stream = CommandStream::spawn(id, Arc::new(executor))?;
        self.inner.streams.lock().insert(id, stream);
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) {
        self.inner.streams.lock().remove(&stream.0);
    }

    fn create_event(&self) -> Result<EventHandle, DeviceError> {
        let id = self.next_handle();
        self.inner.events.lock().insert(id, None);
        Ok(EventHandle(id))
    }

    fn destroy_event(&self, event: EventHandle) {
        self.inner.events.lock().remove(&event.0);
    }

    fn enqueue_copy_htod(&self, stream: StreamHandle, dst: DeviceSlice, src: Arc<[u8]>) -> DeviceStatus {
        self.with_stream(stream, Command::CopyHtoD { dst, src })
    }

    fn enqueue_copy_dtoh(&self, stream: StreamHandle, src: DeviceSlice, dst: HostBuffer) -> DeviceStatus {
        self.with_stream(stream, Command::CopyDtoH { src, dst })
    }

    fn enqueue_kernel(
        &self,
        stream: StreamHandle,
        module: &Arc<dyn CompiledModule>,
        kernel: KernelKind,
        args: KernelArgs,
    ) -> DeviceStatus {
        self.with_stream(
            stream,
            Command::Launch {
                module: module.clone(),
                kernel,
                args,
            },
        )
    }

    fn enqueue_record(&self, stream: StreamHandle, event: EventHandle) -> DeviceStatus {
        self.with_stream(stream, Command::Record(event))
    }

    fn elapsed(&self, start: EventHandle, stop: EventHandle) -> Option<Duration> {
        let events = self.inner.events.lock();
        let (a, b) = ((*events.get(&start.0)?)?, (*events.get(&stop.0)?)?);
        Some(b.saturating_duration_since(a))
    }

    fn enqueue_callback(&self, stream: StreamHandle, callback: CompletionFn) -> DeviceStatus {
        self.with_stream(stream, Command::Callback(callback))
    }

    fn synchronize(&self, stream: StreamHandle) -> DeviceStatus {
        let streams = self.inner.streams.lock();
        let s = streams
            .get(&stream.0)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidHandle, format!("unknown stream {}", stream.0)))?;
        s.synchronize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Option<CudaDevice> {
        match CudaDevice::open(0) {
            Ok(dev) => Some(dev),
            Err(e) => {
                eprintln!("skipping: no CUDA device ({e})");
                None
            }
        }
    }

    #[test]
    fn free_does_not_wait_for_memory_in_use() {
        let Some(dev) = open() else { return };
        let ptr = dev.alloc(4096).unwrap();
        let slice = DeviceSlice { ptr, offset: 0, len: 4096 };
        let alloc = dev.inner.allocation(slice).unwrap();
        // Stands in for a copy in progress on a task stream.
        let busy = alloc.buf.lock();
        dev.free(ptr).unwrap();
        assert_eq!(dev.memory_in_use(), 0);
        assert!(dev.inner.allocation(slice).is_err());
        assert_eq!(busy.len(), 4096);
    }

    #[test]
    fn copies_on_different_streams_do_not_share_a_lock() {
        let Some(dev) = open() else { return };
        let a = dev.alloc(4096).unwrap();
        let b = dev.alloc(4096).unwrap();
        let held = dev.inner.allocation(DeviceSlice { ptr: a, offset: 0, len: 4096 }).unwrap();
        let _busy = held.buf.lock();
        let stream = dev.create_stream().unwrap();
        let dst = DeviceSlice { ptr: b, offset: 0, len: 16 };
        dev.enqueue_copy_htod(stream, dst, Arc::from(vec![7u8; 16])).unwrap();
        let host = HostBuffer::zeroed(16);
        dev.enqueue_copy_dtoh(stream, dst, host.clone()).unwrap();
        dev.synchronize(stream).unwrap();
        assert_eq!(host.to_vec(), vec![7u8; 16]);
        dev.destroy_stream(stream);
    }
}
