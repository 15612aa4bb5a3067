//! Device side of the scan pipeline.
//!
//! The pipeline talks to an accelerator only through [`device::DeviceRuntime`]:
//! allocate, compile, enqueue copies and kernels on ordered streams, and get
//! a callback when a stream reaches a point. Two runtimes implement it:
//!
//! 1. [`host_device::HostDevice`] emulates a device in process. Streams are
//!    worker threads and the generated kernels are evaluated on the host with
//!    the same launch geometry and output layout as the CUDA code.
//! 2. `cuda::CudaDevice` (feature `cuda`) compiles the generated source with
//!    NVRTC and runs it through `cudarc`.
//!
//! [`codegen`] turns expressions into a [`codegen::KernelProgram`];
//! [`program_cache`] compiles each distinct program once per device.

pub mod buffer_pool;
pub mod buffers;
pub mod codegen;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod host_device;
mod host_kernels;
pub mod program_cache;
mod stream;

/// CUDA block size for kernel launches.
pub const CUDA_BLOCK_SIZE: u32 = 256;

/// Calculate grid size for a given number of elements.
pub fn grid_size(n: u32) -> u32 {
    n.div_ceil(CUDA_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_every_row() {
        assert_eq!(grid_size(1), 1);
        assert_eq!(grid_size(256), 1);
        assert_eq!(grid_size(257), 2);
    }
}
