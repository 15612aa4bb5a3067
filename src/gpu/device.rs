//! The accelerator runtime seam.
//!
//! Everything the scan asks of a device goes through [`DeviceRuntime`]:
//! memory, program compilation, asynchronous streams, events and completion
//! callbacks. Two runtimes implement it: the in-process emulator in
//! [`crate::gpu::host_device`] and, behind the `cuda` feature, a cudarc-backed
//! one.
//!
//! # Design
//!
//! Operations enqueued on one stream run in enqueue order. The first failing
//! operation poisons the stream: later copies and launches are skipped and the
//! error is handed to the next completion callback. This is the contract the
//! scan's completion queue is built on.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::chunk::ChunkFormat;
use crate::error::Phase;
use crate::gpu::codegen::KernelProgram;

/// Driver-level status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCode {
    InvalidValue,
    OutOfMemory,
    InvalidContext,
    InvalidHandle,
    CompileFailed,
    IllegalAddress,
    LaunchFailed,
    Unknown(i32),
}

impl DeviceCode {
    /// Numeric code as the CUDA driver API reports it.
    pub fn raw(&self) -> i32 {
        match self {
            DeviceCode::InvalidValue => 1,
            DeviceCode::OutOfMemory => 2,
            DeviceCode::InvalidContext => 201,
            DeviceCode::InvalidHandle => 400,
            DeviceCode::CompileFailed => 218,
            DeviceCode::IllegalAddress => 700,
            DeviceCode::LaunchFailed => 719,
            DeviceCode::Unknown(code) => *code,
        }
    }

    pub fn from_raw(code: i32) -> Self {
        match code {
            1 => DeviceCode::InvalidValue,
            2 => DeviceCode::OutOfMemory,
            201 => DeviceCode::InvalidContext,
            400 => DeviceCode::InvalidHandle,
            218 => DeviceCode::CompileFailed,
            700 => DeviceCode::IllegalAddress,
            719 => DeviceCode::LaunchFailed,
            other => DeviceCode::Unknown(other),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceCode::OutOfMemory => ErrorClass::ResourceExhaustion,
            DeviceCode::InvalidContext => ErrorClass::ContextGone,
            _ => ErrorClass::KernelLogic,
        }
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceCode::InvalidValue => "invalid value",
            DeviceCode::OutOfMemory => "out of memory",
            DeviceCode::InvalidContext => "invalid context",
            DeviceCode::InvalidHandle => "invalid handle",
            DeviceCode::CompileFailed => "compile failed",
            DeviceCode::IllegalAddress => "illegal address",
            DeviceCode::LaunchFailed => "launch failed",
            DeviceCode::Unknown(_) => "unknown error",
        };
        write!(f, "{name} (code {})", self.raw())
    }
}

/// How the scan reacts to a device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later, possibly with a smaller chunk.
    ResourceExhaustion,
    /// Fatal for the query.
    KernelLogic,
    /// The device context is being destroyed; the error is not reported.
    ContextGone,
}

/// Which asynchronous operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Alloc,
    Compile,
    CopyHtoD,
    CopyDtoH,
    Launch(KernelKind),
}

impl DeviceOp {
    pub fn phase(&self) -> Phase {
        match self {
            DeviceOp::Alloc => Phase::Allocate,
            DeviceOp::Compile => Phase::Compile,
            DeviceOp::CopyHtoD | DeviceOp::CopyDtoH => Phase::Copy,
            DeviceOp::Launch(_) => Phase::Launch,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DeviceError {
    pub code: DeviceCode,
    pub op: Option<DeviceOp>,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: DeviceCode, message: impl Into<String>) -> Self {
        Self {
            code,
            op: None,
            message: message.into(),
        }
    }

    pub fn during(mut self, op: DeviceOp) -> Self {
        self.op.get_or_insert(op);
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    /// Phase for reporting; errors with no recorded operation count as launch
    /// failures since that is where a poisoned stream surfaces them.
    pub fn phase(&self) -> Phase {
        self.op.map_or(Phase::Launch, |op| op.phase())
    }
}

pub type DeviceStatus = Result<(), DeviceError>;

/// Callback run on the stream's thread once everything enqueued before it
/// has finished, with the first error of the stream if there was one.
pub type CompletionFn = Box<dyn FnOnce(DeviceStatus) + Send + 'static>;

/// Entry functions of a scan program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    ExecQuals,
    Projection,
}

impl KernelKind {
    pub fn entry_name(&self) -> &'static str {
        match self {
            KernelKind::ExecQuals => "gpuscan_exec_quals",
            KernelKind::Projection => "gpuscan_projection",
        }
    }

    pub(crate) fn code(&self) -> i32 {
        match self {
            KernelKind::ExecQuals => 1,
            KernelKind::Projection => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(KernelKind::ExecQuals),
            2 => Some(KernelKind::Projection),
            _ => None,
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_name())
    }
}

/// Base address of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

/// A byte range inside one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSlice {
    pub ptr: DevicePtr,
    pub offset: usize,
    pub len: usize,
}

impl DeviceSlice {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Host memory a device-to-host copy lands in. Shared between the task that
/// owns it and the stream that fills it.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

/// Launch arguments shared by both scan kernels.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs {
    /// Control block: error buffer, parameters and the result index.
    pub control: DeviceSlice,
    /// Source chunk image.
    pub src: DeviceSlice,
    /// Destination image when the scan projects.
    pub dst: Option<DeviceSlice>,
    /// Rows in the source chunk; sets the grid size.
    pub nitems: u32,
    pub format: ChunkFormat,
}

/// A program loaded on a device.
pub trait CompiledModule: Send + Sync + fmt::Debug {
    fn signature(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Unique per runtime instance; compiled programs are cached per device.
    fn id(&self) -> u64;

    fn name(&self) -> String;

    /// Bytes of device memory currently allocated.
    fn memory_in_use(&self) -> usize;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    fn compile(&self, program: &Arc<KernelProgram>) -> Result<Arc<dyn CompiledModule>, DeviceError>;

    fn create_stream(&self) -> Result<StreamHandle, DeviceError>;

    fn destroy_stream(&self, stream: StreamHandle);

    fn create_event(&self) -> Result<EventHandle, DeviceError>;

    fn destroy_event(&self, event: EventHandle);

    /// `src.len()` must equal `dst.len`.
    fn enqueue_copy_htod(&self, stream: StreamHandle, dst: DeviceSlice, src: Arc<[u8]>) -> DeviceStatus;

    /// Copies `src` into the first `src.len` bytes of `dst`.
    fn enqueue_copy_dtoh(&self, stream: StreamHandle, src: DeviceSlice, dst: HostBuffer) -> DeviceStatus;

    fn enqueue_kernel(
        &self,
        stream: StreamHandle,
        module: &Arc<dyn CompiledModule>,
        kernel: KernelKind,
        args: KernelArgs,
    ) -> DeviceStatus;

    fn enqueue_record(&self, stream: StreamHandle, event: EventHandle) -> DeviceStatus;

    /// Time between two recorded events, if both have fired.
    fn elapsed(&self, start: EventHandle, stop: EventHandle) -> Option<Duration>;

    fn enqueue_callback(&self, stream: StreamHandle, callback: CompletionFn) -> DeviceStatus;

    /// Block until everything enqueued on `stream` has run.
    fn synchronize(&self, stream: StreamHandle) -> DeviceStatus;
}
