//! Error types for the scan pipeline.
//!
//! `ScanError` is what every public scan operation returns. Device failures
//! carry the phase they happened in so a failed query reports e.g.
//! `launch failed: illegal address (code 700)`.

use std::fmt;

use datafusion::arrow::error::ArrowError;

use crate::gpu::buffers::KernErrorCode;
use crate::gpu::device::{DeviceError, KernelKind};

/// Step of the task pipeline a device error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Allocate,
    Compile,
    Copy,
    Launch,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Allocate => "allocate",
            Phase::Compile => "compile",
            Phase::Copy => "copy",
            Phase::Launch => "launch",
        })
    }
}

/// Row-level evaluation failure, raised by the host evaluator and mirrored by
/// the kernel error codes the device reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0} out of range")]
    Overflow(&'static str),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("no value bound for parameter ${0}")]
    UnboundParam(usize),
    #[error("column index {0} is out of range")]
    BadColumn(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("{phase} failed: {source}")]
    Device {
        phase: Phase,
        #[source]
        source: DeviceError,
    },

    #[error("compile failed for device program {signature:016x}: {message}")]
    Compile { signature: u64, message: String },

    #[error("kernel {kernel} raised {code}: {message}")]
    Kernel {
        kernel: KernelKind,
        code: KernErrorCode,
        message: String,
    },

    #[error("allocate failed: {bytes} bytes do not fit in device memory even for a single row")]
    OutOfDeviceMemory { bytes: usize },

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("invalid scan plan: {0}")]
    Plan(String),

    #[error("chunk store: {0}")]
    Storage(String),

    #[error("corrupt chunk image: {0}")]
    Layout(String),

    #[error("scan was torn down")]
    Aborted,

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl ScanError {
    /// Phase named by this error, if it came out of the device pipeline.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ScanError::Device { phase, .. } => Some(*phase),
            ScanError::Compile { .. } => Some(Phase::Compile),
            ScanError::Kernel { .. } => Some(Phase::Launch),
            ScanError::OutOfDeviceMemory { .. } => Some(Phase::Allocate),
            _ => None,
        }
    }

    pub(crate) fn device(phase: Phase, source: DeviceError) -> Self {
        ScanError::Device { phase, source }
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::DeviceCode;

    #[test]
    fn device_error_names_phase_and_code() {
        let err = ScanError::device(
            Phase::Copy,
            DeviceError::new(DeviceCode::IllegalAddress, "htod copy"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("copy failed"), "{msg}");
        assert!(msg.contains("700"), "{msg}");
        assert_eq!(err.phase(), Some(Phase::Copy));
    }

    #[test]
    fn compile_error_reports_compile_phase() {
        let err = ScanError::Compile {
            signature: 0xabc,
            message: "expected ';'".into(),
        };
        assert!(err.to_string().contains("compile"));
        assert_eq!(err.phase(), Some(Phase::Compile));
    }
}
