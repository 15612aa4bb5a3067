//! gpuscan: a chunked table scan that offloads filters and projections to
//! an accelerator.
//!
//! A scan is planned once from its quals and target list ([`ScanPlan`]).
//! Expressions the device can evaluate are turned into one generated kernel
//! program, compiled once per device and cached. The scan then reads its
//! input in chunks from a [`ChunkStore`], submits each chunk as an
//! asynchronous device task and returns the surviving rows, running the
//! remaining quals and targets on the host.
//!
//! ```text
//! ScanPlan ─► KernelSourceBuilder ─► ProgramCache ─┐
//!                                                   ▼
//! ChunkStore ─► GpuScan ─► Task ─► Orchestrator ─► DeviceRuntime
//!                  ▲                                  │ callback
//!                  └────────── CompletionQueue ◄──────┘
//! ```
//!
//! Without a device, or with `enable_device` off in the [`ScanConfig`], every
//! chunk is evaluated on the host with the same results. The `GPUSCAN_*`
//! environment variables (`GPUSCAN_ENABLED=off` among them) only take effect
//! through [`ScanConfig::from_env`].

pub mod chunk;
pub mod config;
pub mod error;
pub mod gpu;
pub mod scan;
pub mod transpiler;
pub mod types;

pub use chunk::{Chunk, ChunkBudget, ChunkFormat, ChunkStore, MemoryChunkStore};
pub use config::ScanConfig;
pub use error::{EvalError, Phase, Result, ScanError};
pub use gpu::context::{is_gpu_available, DeviceContext, GPU_CONTEXT};
pub use scan::plan::ScanPlan;
pub use scan::{GpuScan, ScanStats, ScanVariant};
pub use transpiler::{CudaTranspiler, Expr, ExprTranspiler};
pub use types::{DataType, Datum, Field, Row, Schema, SchemaRef};
