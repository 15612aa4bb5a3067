//! Issues one task's device work on its own stream.
//!
//! # Design
//! A task gets one pooled allocation holding, in this order, its control
//! block, the source chunk image and (with a device projection) the
//! destination image, each starting on a 256-byte boundary. The stream then
//! carries a fixed sequence:
//!
//! ```text
//! htod control ─► htod source ─► htod destination head
//!   ─► exec_quals (when there are device quals)
//!   ─► projection (when there is a destination)
//!   ─► dtoh control ─► dtoh destination ─► callback
//! ```
//!
//! The task is linked into the running set before the callback is enqueued,
//! so the callback always finds it there. Submission never waits on the
//! device.

use std::sync::Arc;

use tracing::debug;

use crate::chunk::{empty_image_head, ChunkFormat};
use crate::error::ScanError;
use crate::gpu::buffers::ControlBlock;
use crate::gpu::context::DeviceContext;
use crate::gpu::device::{
    DeviceError, DeviceOp, DeviceRuntime, DeviceSlice, ErrorClass, EventHandle, HostBuffer, KernelArgs,
    KernelKind, StreamHandle,
};
use crate::gpu::program_cache::ProgramHandle;
use crate::scan::completion::CompletionQueue;
use crate::scan::plan::ScanPlan;
use crate::scan::task::{DeviceResources, RecvBuffers, Task, TaskEvents, TaskLayout, TaskState};

/// Alignment of each part inside a task's allocation.
const SEGMENT_ALIGN: usize = 256;

fn align_segment(offset: usize) -> usize {
    offset.next_multiple_of(SEGMENT_ALIGN)
}

/// What one submission moved, for the performance counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Submission {
    pub bytes_sent: usize,
    pub bytes_recv: usize,
    pub num_sent: usize,
    pub num_recv: usize,
    pub quals_kernel: bool,
    pub projection_kernel: bool,
}

pub(crate) enum SubmitError {
    /// Device memory ran out; the task comes back without resources.
    OutOfMemory(Task),
    /// The device context went away; the task comes back without resources.
    ContextGone(Task),
    Fatal(ScanError),
}

pub(crate) struct Orchestrator {
    ctx: Arc<DeviceContext>,
    program: ProgramHandle,
    queue: Arc<CompletionQueue>,
    /// Encoded parameter buffer, shared by every task of the scan.
    params: Vec<u8>,
    format: ChunkFormat,
    perfmon: bool,
}

impl Orchestrator {
    pub fn new(
        ctx: Arc<DeviceContext>,
        program: ProgramHandle,
        queue: Arc<CompletionQueue>,
        params: Vec<u8>,
        format: ChunkFormat,
        perfmon: bool,
    ) -> Self {
        Self {
            ctx,
            program,
            queue,
            params,
            format,
            perfmon,
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn signature(&self) -> u64 {
        self.program.signature()
    }

    /// Allocate, enqueue the task's commands and hand it to the running set.
    pub fn submit(&self, plan: &ScanPlan, mut task: Task, growth: usize) -> Result<Submission, SubmitError> {
        let device = self.ctx.device.clone();
        let src = task.source().clone();
        let nitems = src.nitems();
        let has_quals = plan.program().has_quals();

        let control = ControlBlock::new(&self.params, if has_quals { nitems } else { 0 }, !has_quals);
        let src_offset = align_segment(control.len());
        let dst_len = plan.dst_length(&src, self.format, growth);
        let dst_offset = align_segment(src_offset + src.len_bytes());
        let total = match dst_len {
            Some(len) => dst_offset + len,
            None => src_offset + src.len_bytes(),
        };

        let alloc = match self.ctx.pool.acquire(device.as_ref(), total) {
            Ok(alloc) => alloc,
            Err(e) => return Err(classify(task, e.during(DeviceOp::Alloc))),
        };
        let slice = |offset, len| DeviceSlice {
            ptr: alloc.ptr,
            offset,
            len,
        };
        let layout = TaskLayout {
            control: slice(0, control.dma_send_length()),
            src: slice(src_offset, src.len_bytes()),
            dst: dst_len.map(|len| slice(dst_offset, len)),
        };
        task.device = Some(DeviceResources {
            ctx: self.ctx.clone(),
            alloc,
            layout,
            stream: None,
            events: None,
        });
        task.set_state(TaskState::MemAllocated);

        let stream = match device.create_stream() {
            Ok(stream) => stream,
            Err(e) => return Err(classify(task, e.during(DeviceOp::Alloc))),
        };
        if let Some(res) = task.device.as_mut() {
            res.stream = Some(stream);
        }
        let events = if self.perfmon {
            match create_events(device.as_ref()) {
                Ok(events) => Some(events),
                Err(e) => return Err(classify(task, e.during(DeviceOp::Alloc))),
            }
        } else {
            None
        };
        if let Some(res) = task.device.as_mut() {
            res.events = events;
        }

        let recv = RecvBuffers {
            control: HostBuffer::zeroed(control.len()),
            dst: dst_len.map(HostBuffer::zeroed),
        };
        task.recv = Some(recv.clone());
        task.set_state(TaskState::Submitted);

        let dst_head = match &layout.dst {
            Some(dst) => {
                let projection = plan.program().projection().ok_or_else(|| {
                    SubmitError::Fatal(ScanError::Plan("destination without a device projection".into()))
                })?;
                match empty_image_head(&projection.layout, self.format, dst.len, nitems) {
                    Ok(head) => Some((*dst, head)),
                    Err(e) => return Err(SubmitError::Fatal(e)),
                }
            }
            None => None,
        };

        let mut sub = Submission::default();
        let issued = (|| -> Result<(), DeviceError> {
            let record = |e: Option<EventHandle>| e.map_or(Ok(()), |e| device.enqueue_record(stream, e));
            record(events.map(|e| e.dma_send_start))?;

            let send = control.send_image();
            device
                .enqueue_copy_htod(stream, layout.control, Arc::from(send))
                .map_err(|e| e.during(DeviceOp::CopyHtoD))?;
            device
                .enqueue_copy_htod(stream, layout.src, src.image().clone())
                .map_err(|e| e.during(DeviceOp::CopyHtoD))?;
            sub.bytes_sent += send.len() + src.len_bytes();
            sub.num_sent += 2;
            if let Some((dst, head)) = &dst_head {
                let head_slice = DeviceSlice {
                    len: head.len(),
                    ..*dst
                };
                sub.bytes_sent += head.len();
                sub.num_sent += 1;
                device
                    .enqueue_copy_htod(stream, head_slice, Arc::from(head.as_slice()))
                    .map_err(|e| e.during(DeviceOp::CopyHtoD))?;
            }
            record(events.map(|e| e.dma_send_stop))?;

            let args = KernelArgs {
                control: slice(0, control.len()),
                src: layout.src,
                dst: layout.dst,
                nitems: nitems as u32,
                format: self.format,
            };
            if has_quals {
                launch(device.as_ref(), stream, &self.program, KernelKind::ExecQuals, args)?;
                sub.quals_kernel = true;
            }
            if layout.dst.is_some() {
                launch(device.as_ref(), stream, &self.program, KernelKind::Projection, args)?;
                sub.projection_kernel = true;
            }

            record(events.map(|e| e.dma_recv_start))?;
            let recv_len = control.dma_recv_length(layout.dst.is_none());
            device
                .enqueue_copy_dtoh(stream, slice(0, recv_len), recv.control.clone())
                .map_err(|e| e.during(DeviceOp::CopyDtoH))?;
            sub.bytes_recv += recv_len;
            sub.num_recv += 1;
            if let (Some(dst), Some(buf)) = (layout.dst, &recv.dst) {
                device
                    .enqueue_copy_dtoh(stream, dst, buf.clone())
                    .map_err(|e| e.during(DeviceOp::CopyDtoH))?;
                sub.bytes_recv += dst.len;
                sub.num_recv += 1;
            }
            record(events.map(|e| e.dma_recv_stop))
        })();
        if let Err(e) = issued {
            return Err(classify(task, e));
        }

        let task_id = task.id();
        self.queue.insert_running(task);
        if let Err(e) = device.enqueue_callback(stream, self.queue.callback(task_id)) {
            return match self.queue.remove_running(task_id) {
                Some(task) => Err(classify(task, e)),
                None => Err(SubmitError::Fatal(ScanError::Aborted)),
            };
        }
        debug!(target: "gpuscan", task = task_id, nitems, bytes = total, "task submitted");
        Ok(sub)
    }
}

fn launch(
    device: &dyn DeviceRuntime,
    stream: StreamHandle,
    program: &ProgramHandle,
    kernel: KernelKind,
    args: KernelArgs,
) -> Result<(), DeviceError> {
    device
        .enqueue_kernel(stream, program.module(), kernel, args)
        .map_err(|e| e.during(DeviceOp::Launch(kernel)))
}

fn create_events(device: &dyn DeviceRuntime) -> Result<TaskEvents, DeviceError> {
    let mut handles = Vec::with_capacity(4);
    for _ in 0..4 {
        match device.create_event() {
            Ok(e) => handles.push(e),
            Err(err) => {
                for e in handles {
                    device.destroy_event(e);
                }
                return Err(err);
            }
        }
    }
    Ok(TaskEvents {
        dma_send_start: handles[0],
        dma_send_stop: handles[1],
        dma_recv_start: handles[2],
        dma_recv_stop: handles[3],
    })
}

/// Release whatever the task got and sort the failure by class.
fn classify(task: Task, e: DeviceError) -> SubmitError {
    match e.class() {
        ErrorClass::ResourceExhaustion => SubmitError::OutOfMemory(task.abandon()),
        ErrorClass::ContextGone => SubmitError::ContextGone(task.abandon()),
        ErrorClass::KernelLogic => SubmitError::Fatal(ScanError::device(e.phase(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::error::Phase;
    use crate::gpu::device::DeviceCode;
    use crate::gpu::buffers::{encode_params, ControlView, KernErrorCode};
    use crate::gpu::host_device::{Fault, HostDevice, HostDeviceConfig};
    use crate::gpu::program_cache::ProgramCache;
    use crate::scan::task::TaskOutcome;
    use crate::transpiler::{ArithOp, CompareOp, CudaTranspiler, Expr};
    use crate::types::{DataType, Datum, Field, Row, Schema, SchemaRef};
    use std::time::Duration;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("a", DataType::Int64)]))
    }

    fn chunk(n: i64) -> Chunk {
        let rows: Vec<Row> = (0..n).map(|i| vec![Datum::Int64(i)]).collect();
        Chunk::from_rows(schema(), &rows).unwrap()
    }

    struct Rig {
        device: HostDevice,
        queue: Arc<CompletionQueue>,
        orchestrator: Orchestrator,
        plan: ScanPlan,
    }

    fn rig(targets: Option<Vec<Expr>>) -> Rig {
        let device = HostDevice::default();
        let ctx = Arc::new(DeviceContext::new(Arc::new(device.clone())));
        let q = Expr::compare(CompareOp::GtEq, Expr::col(0, DataType::Int64), Expr::lit(Datum::Int64(5)));
        let plan = ScanPlan::new(schema(), vec![q], targets, &CudaTranspiler).unwrap();
        let handle = ProgramCache::new().acquire(&ctx.device, plan.program()).unwrap();
        let params = encode_params(&plan.program().resolve_params(&[]).unwrap()).unwrap();
        let queue = CompletionQueue::new();
        let orchestrator = Orchestrator::new(ctx, handle, queue.clone(), params, ChunkFormat::Row, true);
        Rig {
            device,
            queue,
            orchestrator,
            plan,
        }
    }

    fn wait_for(queue: &CompletionQueue) -> Task {
        for _ in 0..500 {
            if let Some(task) = queue.pop_completed() {
                return task;
            }
            queue.wait(Duration::from_millis(10));
        }
        panic!("task never completed");
    }

    #[test]
    fn filter_task_runs_to_completion() {
        let rig = rig(None);
        let sub = rig.orchestrator.submit(&rig.plan, Task::new(1, 0..1, chunk(10)), 1).ok().unwrap();
        assert!(sub.quals_kernel && !sub.projection_kernel);
        assert_eq!(sub.num_sent, 2);

        let mut task = wait_for(&rig.queue);
        assert_eq!(task.state(), TaskState::CompletedOk);
        assert!(matches!(task.outcome, Some(TaskOutcome::Finished)));
        let control = task.recv.as_ref().unwrap().control.to_vec();
        let view = ControlView::parse(&control).unwrap();
        assert_eq!(view.kerror().code(), KernErrorCode::Success);
        assert_eq!(view.visible_rows().unwrap(), Some((5..10).collect()));
        task.collect_timings();
        assert!(task.timings.is_some());
        task.release();
        assert_eq!(rig.device.live_streams(), 0);
    }

    #[test]
    fn projection_fills_the_destination() {
        let doubled = Expr::arith(ArithOp::Mul, Expr::col(0, DataType::Int64), Expr::lit(Datum::Int64(2)));
        let rig = rig(Some(vec![doubled]));
        let sub = rig.orchestrator.submit(&rig.plan, Task::new(1, 0..1, chunk(8)), 1).ok().unwrap();
        assert!(sub.projection_kernel);
        assert_eq!(sub.num_recv, 2);

        let task = wait_for(&rig.queue);
        let image = task.recv.as_ref().unwrap().dst.as_ref().unwrap().to_vec();
        let out = Chunk::from_image(rig.plan.scan_schema().clone(), image).unwrap();
        let values: Vec<Row> = out.rows().unwrap();
        assert_eq!(values, vec![vec![Datum::Int64(10)], vec![Datum::Int64(12)], vec![Datum::Int64(14)]]);
    }

    #[test]
    fn allocation_failure_returns_the_task() {
        let rig = rig(None);
        rig.device.inject(Fault::OutOfMemory(1));
        match rig.orchestrator.submit(&rig.plan, Task::new(1, 0..1, chunk(4)), 1) {
            Err(SubmitError::OutOfMemory(task)) => {
                assert!(!task.has_device_memory());
                assert_eq!(task.state(), TaskState::Created);
            }
            _ => panic!("expected an out-of-memory submission"),
        }
        assert_eq!(rig.queue.running_len(), 0);
    }

    #[test]
    fn kernel_fault_surfaces_through_the_callback() {
        let rig = rig(None);
        rig.device.inject(Fault::KernelFault);
        assert!(rig.orchestrator.submit(&rig.plan, Task::new(1, 0..1, chunk(4)), 1).is_ok());
        let task = wait_for(&rig.queue);
        match &task.outcome {
            Some(TaskOutcome::Failed(e)) => {
                assert_eq!(e.phase(), Phase::Launch);
                assert_eq!(e.code, DeviceCode::IllegalAddress);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
