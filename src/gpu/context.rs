//! Process-wide device selection.
//!
//! Provides a global `GPU_CONTEXT` singleton. Initialization is lazy; the
//! device is only opened on first access. It is `None` when:
//! - `GPUSCAN_DISABLE_GPU` is set
//! - the requested backend is not compiled in or fails to open
//!
//! ## Device selection
//!
//! `GPUSCAN_DEVICE` picks the backend before first use:
//! - `host` (default): the in-process emulator. `GPUSCAN_DEVICE_MEMORY`
//!   sets its memory size in bytes.
//! - `cuda` or `cuda:N`: CUDA device `N` (default 0). Needs the `cuda` feature.

use std::sync::{Arc, LazyLock};

use tracing::{info, warn};

use crate::gpu::buffer_pool::DevicePool;
use crate::gpu::device::DeviceRuntime;
use crate::gpu::host_device::{HostDevice, HostDeviceConfig};

/// Global device context. `None` if offload is unavailable.
pub static GPU_CONTEXT: LazyLock<Option<Arc<DeviceContext>>> = LazyLock::new(|| {
    if std::env::var("GPUSCAN_DISABLE_GPU").is_ok() {
        info!(target: "gpuscan", "device offload disabled by GPUSCAN_DISABLE_GPU");
        return None;
    }
    let selector = std::env::var("GPUSCAN_DEVICE").unwrap_or_else(|_| "host".into());
    let context = DeviceContext::open(&selector);
    match &context {
        Some(ctx) => info!(target: "gpuscan", device = %ctx.device.name(), "device selected"),
        None => warn!(target: "gpuscan", selector = %selector, "no usable device; scans run on the host"),
    }
    context.map(Arc::new)
});

/// A device together with the allocation pool scans draw from.
#[derive(Debug)]
pub struct DeviceContext {
    pub device: Arc<dyn DeviceRuntime>,
    pub pool: DevicePool,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            device,
            pool: DevicePool::new(),
        }
    }

    /// Context over a fresh emulated device.
    pub fn host(config: HostDeviceConfig) -> Self {
        Self::new(Arc::new(HostDevice::new(config)))
    }

    fn open(selector: &str) -> Option<Self> {
        let selector = selector.trim().to_ascii_lowercase();
        if selector == "host" {
            let mut config = HostDeviceConfig::default();
            if let Some(bytes) = std::env::var("GPUSCAN_DEVICE_MEMORY").ok().and_then(|v| v.parse().ok()) {
                config.memory_capacity = bytes;
            }
            return Some(Self::host(config));
        }
        let ordinal = match selector.strip_prefix("cuda") {
            Some("") => 0,
            Some(rest) => rest.strip_prefix(':')?.parse().ok()?,
            None => {
                warn!(target: "gpuscan", selector = %selector, "unknown GPUSCAN_DEVICE value");
                return None;
            }
        };
        Self::open_cuda(ordinal)
    }

    #[cfg(feature = "cuda")]
    fn open_cuda(ordinal: usize) -> Option<Self> {
        match crate::gpu::cuda::CudaDevice::open(ordinal) {
            Ok(device) => Some(Self::new(Arc::new(device))),
            Err(e) => {
                warn!(target: "gpuscan", ordinal, error = %e, "cannot open CUDA device");
                None
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn open_cuda(ordinal: usize) -> Option<Self> {
        warn!(target: "gpuscan", ordinal, "built without the `cuda` feature");
        None
    }

    /// Give idle pooled memory back to the device.
    pub fn trim(&self) -> usize {
        self.pool.trim(self.device.as_ref())
    }
}

/// Whether a device context is available.
pub fn is_gpu_available() -> bool {
    GPU_CONTEXT.is_some()
}
