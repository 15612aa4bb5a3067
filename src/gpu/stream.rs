//! In-order command streams backed by a worker thread.
//!
//! Each stream owns one thread draining a `crossbeam_channel`. Commands run in
//! the order they were sent. Once a command fails the stream is poisoned:
//! copies and launches are skipped until the next callback, which receives
//! the error and clears it.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::gpu::device::{
    CompiledModule, CompletionFn, DeviceCode, DeviceError, DeviceOp, DeviceSlice, DeviceStatus,
    EventHandle, HostBuffer, KernelArgs, KernelKind,
};

pub(crate) enum Command {
    CopyHtoD {
        dst: DeviceSlice,
        src: Arc<[u8]>,
    },
    CopyDtoH {
        src: DeviceSlice,
        dst: HostBuffer,
    },
    Launch {
        module: Arc<dyn CompiledModule>,
        kernel: KernelKind,
        args: KernelArgs,
    },
    Record(EventHandle),
    Callback(CompletionFn),
    Barrier(Sender<()>),
}

/// The device side of a stream: what actually moves bytes and runs kernels.
pub(crate) trait CommandExecutor: Send + Sync + 'static {
    fn copy_htod(&self, dst: DeviceSlice, src: &[u8]) -> DeviceStatus;

    fn copy_dtoh(&self, src: DeviceSlice, dst: &HostBuffer) -> DeviceStatus;

    fn launch(&self, module: &Arc<dyn CompiledModule>, kernel: KernelKind, args: &KernelArgs) -> DeviceStatus;

    fn record(&self, event: EventHandle);
}

pub(crate) struct CommandStream {
    id: u64,
    sender: Sender<Command>,
}

impl CommandStream {
    pub fn spawn(id: u64, executor: Arc<dyn CommandExecutor>) -> Result<Self, DeviceError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name(format!("gpuscan-stream-{id}"))
            .spawn(move || run(id, executor, receiver))
            .map_err(|e| DeviceError::new(DeviceCode::InvalidValue, format!("cannot start stream worker: {e}")))?;
        Ok(Self { id, sender })
    }

    pub fn submit(&self, command: Command) -> DeviceStatus {
        self.sender
            .send(command)
            .map_err(|_| DeviceError::new(DeviceCode::InvalidHandle, format!("stream {} has shut down", self.id)))
    }

    pub fn synchronize(&self) -> DeviceStatus {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(Command::Barrier(tx))?;
        rx.recv()
            .map_err(|_| DeviceError::new(DeviceCode::InvalidHandle, format!("stream {} has shut down", self.id)))
    }
}

// Dropping the stream closes the channel; the worker finishes the commands
// already queued, including their callbacks, and exits on its own.

fn run(id: u64, executor: Arc<dyn CommandExecutor>, receiver: Receiver<Command>) {
    let mut sticky: Option<DeviceError> = None;
    for command in receiver {
        match command {
            Command::Callback(callback) => {
                let status = sticky.take().map_or(Ok(()), Err);
                callback(status);
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::Record(event) => executor.record(event),
            _ if sticky.is_some() => trace!(target: "gpuscan", stream = id, "skipping command on failed stream"),
            Command::CopyHtoD { dst, src } => {
                if let Err(e) = executor.copy_htod(dst, &src) {
                    sticky = Some(e.during(DeviceOp::CopyHtoD));
                }
            }
            Command::CopyDtoH { src, dst } => {
                if let Err(e) = executor.copy_dtoh(src, &dst) {
                    sticky = Some(e.during(DeviceOp::CopyDtoH));
                }
            }
            Command::Launch { module, kernel, args } => {
                if let Err(e) = executor.launch(&module, kernel, &args) {
                    sticky = Some(e.during(DeviceOp::Launch(kernel)));
                }
            }
        }
    }
    debug!(target: "gpuscan", stream = id, "stream worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkFormat;
    use crate::gpu::device::DevicePtr;
    use parking_lot::Mutex;
    use std::any::Any;

    #[derive(Debug)]
    struct NullModule;

    impl CompiledModule for NullModule {
        fn signature(&self) -> u64 {
            0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        fail_launch: bool,
    }

    impl CommandExecutor for Recorder {
        fn copy_htod(&self, dst: DeviceSlice, _src: &[u8]) -> DeviceStatus {
            self.log.lock().push(format!("htod {}", dst.offset));
            Ok(())
        }

        fn copy_dtoh(&self, src: DeviceSlice, _dst: &HostBuffer) -> DeviceStatus {
            self.log.lock().push(format!("dtoh {}", src.offset));
            Ok(())
        }

        fn launch(&self, _m: &Arc<dyn CompiledModule>, kernel: KernelKind, _a: &KernelArgs) -> DeviceStatus {
            self.log.lock().push(format!("launch {kernel}"));
            if self.fail_launch {
                return Err(DeviceError::new(DeviceCode::IllegalAddress, "boom"));
            }
            Ok(())
        }

        fn record(&self, _event: EventHandle) {}
    }

    fn slice(offset: usize) -> DeviceSlice {
        DeviceSlice {
            ptr: DevicePtr(1),
            offset,
            len: 0,
        }
    }

    fn args() -> KernelArgs {
        KernelArgs {
            control: slice(0),
            src: slice(0),
            dst: None,
            nitems: 0,
            format: ChunkFormat::Row,
        }
    }

    fn run_commands(fail_launch: bool) -> (Vec<String>, DeviceStatus) {
        let recorder = Arc::new(Recorder {
            log: Mutex::default(),
            fail_launch,
        });
        let stream = CommandStream::spawn(7, recorder.clone()).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        stream.submit(Command::CopyHtoD { dst: slice(1), src: Arc::from(vec![]) }).unwrap();
        stream
            .submit(Command::Launch {
                module: Arc::new(NullModule),
                kernel: KernelKind::ExecQuals,
                args: args(),
            })
            .unwrap();
        stream.submit(Command::CopyDtoH { src: slice(2), dst: HostBuffer::default() }).unwrap();
        stream
            .submit(Command::Callback(Box::new(move |status| {
                tx.send(status).unwrap();
            })))
            .unwrap();
        let status = rx.recv().unwrap();
        let log = recorder.log.lock().clone();
        (log, status)
    }

    #[test]
    fn commands_run_in_order() {
        let (log, status) = run_commands(false);
        assert!(status.is_ok());
        assert_eq!(log, vec!["htod 1", "launch gpuscan_exec_quals", "dtoh 2"]);
    }

    #[test]
    fn failure_skips_rest_and_reaches_callback() {
        let (log, status) = run_commands(true);
        assert_eq!(log, vec!["htod 1", "launch gpuscan_exec_quals"]);
        let err = status.unwrap_err();
        assert_eq!(err.code, DeviceCode::IllegalAddress);
        assert_eq!(err.op, Some(DeviceOp::Launch(KernelKind::ExecQuals)));
    }

    #[test]
    fn synchronize_waits_for_queue() {
        let stream = CommandStream::spawn(1, Arc::new(Recorder::default())).unwrap();
        stream.synchronize().unwrap();
    }
}
