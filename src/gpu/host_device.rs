//! In-process device emulator.
//!
//! Implements [`DeviceRuntime`] on host memory: allocations are byte vectors
//! with a capacity limit, streams are worker threads and the scan kernels run
//! through [`crate::gpu::host_kernels`]. Compilation checks the assembled
//! source for the things a real compiler would reject first (unbalanced
//! brackets, `#error`, missing entry functions).
//!
//! Faults can be injected for tests: compile errors, out-of-memory on the
//! next allocations, a kernel fault, a forced CPU recheck, or a lost context.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::gpu::buffers::{set_kerror, KernErrorCode};
use crate::gpu::codegen::KernelProgram;
use crate::gpu::device::{
    CompiledModule, CompletionFn, DeviceCode, DeviceError, DevicePtr, DeviceRuntime, DeviceSlice, DeviceStatus,
    EventHandle, HostBuffer, KernelArgs, KernelKind, StreamHandle,
};
use crate::gpu::stream::{Command, CommandExecutor, CommandStream};
use crate::gpu::{host_kernels, CUDA_BLOCK_SIZE};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct HostDeviceConfig {
    /// Bytes of emulated device memory.
    pub memory_capacity: usize,
    /// Rows per emulated thread block.
    pub block_size: usize,
    /// Extra latency added to each kernel launch.
    pub launch_latency: Duration,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1 << 30,
            block_size: CUDA_BLOCK_SIZE as usize,
            launch_latency: Duration::ZERO,
        }
    }
}

/// A fault to inject into the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next compilation fails with this message.
    CompileError(String),
    /// The next `n` allocations report out of memory.
    OutOfMemory(usize),
    /// The next kernel launch fails with an illegal address.
    KernelFault,
    /// The next kernel launch asks the host to recheck its chunk.
    CpuReCheck,
    /// Every later call fails with an invalid context.
    ContextLost,
}

#[derive(Debug, Default)]
struct Faults {
    compile: Option<String>,
    oom: usize,
    kernel_fault: bool,
    cpu_recheck: bool,
}

#[derive(Debug, Default)]
struct Memory {
    used: usize,
    next_ptr: u64,
    allocations: HashMap<u64, Arc<Mutex<Vec<u8>>>>,
}

#[derive(Debug, Default)]
struct Counters {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    compiles: AtomicUsize,
    launches: AtomicUsize,
}

struct Inner {
    id: u64,
    config: HostDeviceConfig,
    memory: Mutex<Memory>,
    streams: Mutex<HashMap<u64, CommandStream>>,
    events: Mutex<HashMap<u64, Option<Instant>>>,
    next_handle: AtomicU64,
    faults: Mutex<Faults>,
    context_lost: AtomicBool,
    counters: Counters,
}

impl Inner {
    fn check_context(&self) -> DeviceStatus {
        if self.context_lost.load(Ordering::Acquire) {
            return Err(DeviceError::new(DeviceCode::InvalidContext, "device context was destroyed"));
        }
        Ok(())
    }

    fn allocation(&self, ptr: DevicePtr) -> Result<Arc<Mutex<Vec<u8>>>, DeviceError> {
        self.memory
            .lock()
            .allocations
            .get(&ptr.0)
            .cloned()
            .ok_or_else(|| DeviceError::new(DeviceCode::IllegalAddress, format!("no allocation at {:#x}", ptr.0)))
    }

    fn stream<R>(&self, stream: StreamHandle, f: impl FnOnce(&CommandStream) -> R) -> Result<R, DeviceError> {
        self.check_context()?;
        let streams = self.streams.lock();
        let s = streams
            .get(&stream.0)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidHandle, format!("unknown stream {}", stream.0)))?;
        Ok(f(s))
    }
}

/// Stream-side view of the device. Holds a weak reference so stream threads
/// never keep a dropped device alive.
struct Executor(Weak<Inner>);

impl Executor {
    fn inner(&self) -> Result<Arc<Inner>, DeviceError> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidContext, "device was dropped"))?;
        inner.check_context()?;
        Ok(inner)
    }
}

fn out_of_range(slice: DeviceSlice, len: usize) -> DeviceError {
    DeviceError::new(
        DeviceCode::IllegalAddress,
        format!("range {}..{} outside a {len}-byte allocation", slice.offset, slice.end()),
    )
}

impl CommandExecutor for Executor {
    fn copy_htod(&self, dst: DeviceSlice, src: &[u8]) -> DeviceStatus {
        let inner = self.inner()?;
        let alloc = inner.allocation(dst.ptr)?;
        let mut mem = alloc.lock();
        let len = mem.len();
        let target = mem.get_mut(dst.offset..dst.end()).ok_or_else(|| out_of_range(dst, len))?;
        if src.len() != target.len() {
            return Err(DeviceError::new(DeviceCode::InvalidValue, "copy length mismatch"));
        }
        target.copy_from_slice(src);
        Ok(())
    }

    fn copy_dtoh(&self, src: DeviceSlice, dst: &HostBuffer) -> DeviceStatus {
        let inner = self.inner()?;
        let alloc = inner.allocation(src.ptr)?;
        let mem = alloc.lock();
        let source = mem.get(src.offset..src.end()).ok_or_else(|| out_of_range(src, mem.len()))?;
        let mut host = dst.lock();
        let target = host
            .get_mut(..source.len())
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, "host buffer too small"))?;
        target.copy_from_slice(source);
        Ok(())
    }

    fn launch(&self, module: &Arc<dyn CompiledModule>, kernel: KernelKind, args: &KernelArgs) -> DeviceStatus {
        let inner = self.inner()?;
        inner.counters.launches.fetch_add(1, Ordering::Relaxed);
        if !inner.config.launch_latency.is_zero() {
            thread::sleep(inner.config.launch_latency);
        }
        let module = module
            .as_any()
            .downcast_ref::<HostModule>()
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidHandle, "module was not built by this device"))?;
        let (kernel_fault, cpu_recheck) = {
            let mut faults = inner.faults.lock();
            (
                std::mem::take(&mut faults.kernel_fault),
                std::mem::take(&mut faults.cpu_recheck),
            )
        };
        if kernel_fault {
            return Err(DeviceError::new(DeviceCode::IllegalAddress, format!("injected fault in {kernel}")));
        }

        // Control, source and destination share one allocation, in that order.
        let alloc = inner.allocation(args.control.ptr)?;
        let same_alloc = args.src.ptr == args.control.ptr && args.dst.map_or(true, |d| d.ptr == args.control.ptr);
        let ordered = args.control.end() <= args.src.offset && args.dst.map_or(true, |d| args.src.end() <= d.offset);
        if !same_alloc || !ordered {
            return Err(DeviceError::new(DeviceCode::InvalidValue, "unexpected kernel argument layout"));
        }
        let mut mem = alloc.lock();
        let total = mem.len();
        let limit = args.dst.map_or(args.src.end(), |d| d.end());
        if limit > total {
            return Err(out_of_range(args.dst.unwrap_or(args.src), total));
        }
        let (head, rest) = mem.split_at_mut(args.src.offset);
        let control = &mut head[args.control.offset..args.control.end()];
        if cpu_recheck {
            return set_kerror(control, KernErrorCode::CpuReCheck, kernel, 0)
                .map_err(|e| DeviceError::new(DeviceCode::IllegalAddress, e.to_string()));
        }
        let block_size = inner.config.block_size;
        match kernel {
            KernelKind::ExecQuals => {
                host_kernels::exec_quals(&module.program, control, &rest[..args.src.len], block_size)
            }
            KernelKind::Projection => {
                let dst = args
                    .dst
                    .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, "projection without destination"))?;
                let (src, tail) = rest.split_at_mut(dst.offset - args.src.offset);
                host_kernels::exec_projection(
                    &module.program,
                    control,
                    &src[..args.src.len],
                    &mut tail[..dst.len],
                    block_size,
                )
            }
        }
    }

    fn record(&self, event: EventHandle) {
        if let Some(inner) = self.0.upgrade() {
            if let Some(slot) = inner.events.lock().get_mut(&event.0) {
                *slot = Some(Instant::now());
            }
        }
    }
}

#[derive(Debug)]
pub struct HostModule {
    program: Arc<KernelProgram>,
}

impl CompiledModule for HostModule {
    fn signature(&self) -> u64 {
        self.program.signature()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Check what a compiler would reject before looking at semantics.
fn check_source(source: &str, program: &KernelProgram) -> Result<(), String> {
    let mut stack = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' | '\'' => {
                let mut escaped = false;
                for q in chars.by_ref() {
                    if q == '\n' {
                        return Err(format!("line {line}: missing terminating {c} character"));
                    }
                    if !escaped && q == c {
                        break;
                    }
                    escaped = !escaped && q == '\\';
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((o, _)) if o == open => {}
                    _ => return Err(format!("line {line}: unexpected '{c}'")),
                }
            }
            _ => {}
        }
    }
    if let Some((c, at)) = stack.pop() {
        return Err(format!("line {at}: unclosed '{c}'"));
    }
    if let Some(directive) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
        return Err(directive.trim().to_string());
    }
    if program.has_quals() && !source.contains("gpuscan_quals_eval(") {
        return Err("gpuscan_quals_eval is not defined".into());
    }
    if program.projection().is_some() && !source.contains("gpuscan_projection_write(") {
        return Err("gpuscan_projection_write is not defined".into());
    }
    Ok(())
}

/// Host-memory device. Cheap to clone; clones share the same device.
#[derive(Clone)]
pub struct HostDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.inner.id)
            .field("memory_in_use", &self.memory_in_use())
            .field("capacity", &self.inner.config.memory_capacity)
            .finish()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(HostDeviceConfig::default())
    }
}

impl HostDevice {
    pub fn new(config: HostDeviceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
                config,
                memory: Mutex::new(Memory::default()),
                streams: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                faults: Mutex::new(Faults::default()),
                context_lost: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn inject(&self, fault: Fault) {
        let mut faults = self.inner.faults.lock();
        match fault {
            Fault::CompileError(message) => faults.compile = Some(message),
            Fault::OutOfMemory(n) => faults.oom = n,
            Fault::KernelFault => faults.kernel_fault = true,
            Fault::CpuReCheck => faults.cpu_recheck = true,
            Fault::ContextLost => self.inner.context_lost.store(true, Ordering::Release),
        }
    }

    pub fn config(&self) -> &HostDeviceConfig {
        &self.inner.config
    }

    /// Allocations currently live.
    pub fn live_allocations(&self) -> usize {
        self.inner.memory.lock().allocations.len()
    }

    pub fn live_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn compile_count(&self) -> usize {
        self.inner.counters.compiles.load(Ordering::Relaxed)
    }

    pub fn launch_count(&self) -> usize {
        self.inner.counters.launches.load(Ordering::Relaxed)
    }

    pub fn alloc_count(&self) -> usize {
        self.inner.counters.allocs.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.inner.counters.frees.load(Ordering::Relaxed)
    }

    fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl DeviceRuntime for HostDevice {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn name(&self) -> String {
        format!("host emulator #{}", self.inner.id)
    }

    fn memory_in_use(&self) -> usize {
        self.inner.memory.lock().used
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        self.inner.check_context()?;
        {
            let mut faults = self.inner.faults.lock();
            if faults.oom > 0 {
                faults.oom -= 1;
                return Err(DeviceError::new(DeviceCode::OutOfMemory, format!("injected: {bytes} bytes")));
            }
        }
        let mut memory = self.inner.memory.lock();
        if memory.used + bytes > self.inner.config.memory_capacity {
            return Err(DeviceError::new(
                DeviceCode::OutOfMemory,
                format!("{bytes} bytes requested, {} of {} in use", memory.used, self.inner.config.memory_capacity),
            ));
        }
        memory.next_ptr += 1;
        // Keep pointers looking like addresses.
        let ptr = memory.next_ptr << 20;
        memory.used += bytes;
        memory.allocations.insert(ptr, Arc::new(Mutex::new(vec![0; bytes])));
        self.inner.counters.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut memory = self.inner.memory.lock();
        let alloc = memory
            .allocations
            .remove(&ptr.0)
            .ok_or_else(|| DeviceError::new(DeviceCode::InvalidValue, format!("double free of {:#x}", ptr.0)))?;
        // A kernel still running on this memory keeps its own reference.
        memory.used -= alloc.lock().len();
        self.inner.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn compile(&self, program: &Arc<KernelProgram>) -> Result<Arc<dyn CompiledModule>, DeviceError> {
        self.inner.check_context()?;
        self.inner.counters.compiles.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = self.inner.faults.lock().compile.take() {
            return Err(DeviceError::new(DeviceCode::CompileFailed, message));
        }
        check_source(&program.full_source(), program)
            .map_err(|message| DeviceError::new(DeviceCode::CompileFailed, message))?;
        debug!(target: "gpuscan", signature = %format_args!("{:016x}", program.signature()), "compiled device program");
        Ok(Arc::new(HostModule {
            program: program.clone(),
        }))
    }

    fn create_stream(&self) -> Result<StreamHandle, DeviceError> {
        self.inner.check_context()?;
        let id = self.next_handle();
        let stream = CommandStream::spawn(id, Arc::new(Executor(Arc::downgrade(&self.inner))))?;
        self.inner.streams.lock().insert(id, stream);
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) {
        self.inner.streams.lock().remove(&stream.0);
    }

    fn create_event(&self) -> Result<EventHandle, DeviceError> {
        self.inner.check_context()?;
        let id = self.next_handle();
        self.inner.events.lock().insert(id, None);
        Ok(EventHandle(id))
    }

    fn destroy_event(&self, event: EventHandle) {
        self.inner.events.lock().remove(&event.0);
    }

    fn enqueue_copy_htod(&self, stream: StreamHandle, dst: DeviceSlice, src: Arc<[u8]>) -> DeviceStatus {
        self.inner.stream(stream, |s| s.submit(Command::CopyHtoD { dst, src }))?
    }

    fn enqueue_copy_dtoh(&self, stream: StreamHandle, src: DeviceSlice, dst: HostBuffer) -> DeviceStatus {
        self.inner.stream(stream, |s| s.submit(Command::CopyDtoH { src, dst }))?
    }

    fn enqueue_kernel(
        &self,
        stream: StreamHandle,
        module: &Arc<dyn CompiledModule>,
        kernel: KernelKind,
        args: KernelArgs,
    ) -> DeviceStatus {
        let module = module.clone();
        self.inner
            .stream(stream, |s| s.submit(Command::Launch { module, kernel, args }))?
    }

    fn enqueue_record(&self, stream: StreamHandle, event: EventHandle) -> DeviceStatus {
        self.inner.stream(stream, |s| s.submit(Command::Record(event)))?
    }

    fn elapsed(&self, start: EventHandle, stop: EventHandle) -> Option<Duration> {
        let events = self.inner.events.lock();
        let (a, b) = ((*events.get(&start.0)?)?, (*events.get(&stop.0)?)?);
        Some(b.saturating_duration_since(a))
    }

    fn enqueue_callback(&self, stream: StreamHandle, callback: CompletionFn) -> DeviceStatus {
        self.inner.stream(stream, |s| s.submit(Command::Callback(callback)))?
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
    use crate::types::{DataType, Field, Schema};

    fn program() -> Arc<KernelProgram> {
        use crate::gpu::codegen::KernelSourceBuilder;
        use crate::transpiler::{CompareOp, CudaTranspiler, Expr};
        use crate::types::Datum;
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64)]));
        let q = Expr::compare(CompareOp::Lt, Expr::col(0, DataType::Int64), Expr::lit(Datum::Int64(3)));
        Arc::new(KernelSourceBuilder::new(&CudaTranspiler).build(&schema, &[q], None).unwrap())
    }

    #[test]
    fn allocation_respects_capacity() {
        let dev = HostDevice::new(HostDeviceConfig {
            memory_capacity: 1000,
            ..HostDeviceConfig::default()
        });
        let a = dev.alloc(600).unwrap();
        let err = dev.alloc(600).unwrap_err();
        assert_eq!(err.code, DeviceCode::OutOfMemory);
        dev.free(a).unwrap();
        assert!(dev.free(a).is_err());
        dev.alloc(600).unwrap();
        assert_eq!(dev.memory_in_use(), 600);
    }

    #[test]
    fn generated_program_compiles() {
        let dev = HostDevice::default();
        let module = dev.compile(&program()).unwrap();
        assert_eq!(module.signature(), program().signature());
    }

    #[test]
    fn injected_compile_error_is_one_shot() {
        let dev = HostDevice::default();
        dev.inject(Fault::CompileError("syntax error".into()));
        let err = dev.compile(&program()).unwrap_err();
        assert_eq!(err.code, DeviceCode::CompileFailed);
        assert!(dev.compile(&program()).is_ok());
    }

    #[test]
    fn source_checks() {
        let p = program();
        assert!(check_source("int f() { return (1); }", &p).is_err());
        assert!(check_source("gpuscan_quals_eval() { \"}\" }", &p).is_ok());
        assert!(check_source("gpuscan_quals_eval() { (", &p).unwrap_err().contains("unclosed"));
        assert!(check_source("gpuscan_quals_eval()\n#error broken\n", &p).unwrap_err().contains("broken"));
    }

    #[test]
    fn copies_round_trip_through_a_stream() {
        let dev = HostDevice::default();
        let stream = dev.create_stream().unwrap();
        let ptr = dev.alloc(16).unwrap();
        let slice = DeviceSlice { ptr, offset: 4, len: 8 };
        dev.enqueue_copy_htod(stream, slice, Arc::from(vec![7u8; 8])).unwrap();
        let host = HostBuffer::zeroed(8);
        dev.enqueue_copy_dtoh(stream, slice, host.clone()).unwrap();
        dev.synchronize(stream).unwrap();
        assert_eq!(host.to_vec(), vec![7u8; 8]);
        dev.destroy_stream(stream);
        assert_eq!(dev.live_streams(), 0);
    }

    #[test]
    fn lost_context_fails_every_call() {
        let dev = HostDevice::default();
        dev.inject(Fault::ContextLost);
        assert_eq!(dev.alloc(1).unwrap_err().code, DeviceCode::InvalidContext);
        assert_eq!(dev.create_stream().unwrap_err().code, DeviceCode::InvalidContext);
    }

    #[test]
    fn events_measure_elapsed_time() {
        let dev = HostDevice::default();
        let stream = dev.create_stream().unwrap();
        let (a, b) = (dev.create_event().unwrap(), dev.create_event().unwrap());
        assert!(dev.elapsed(a, b).is_none());
        dev.enqueue_record(stream, a).unwrap();
        dev.enqueue_record(stream, b).unwrap();
        dev.synchronize(stream).unwrap();
        assert!(dev.elapsed(a, b).is_some());
    }
}
