//! One chunk's worth of in-flight device work.
//!
//! ```text
//! Created ─► MemAllocated ─► Submitted ─► Running ─► CompletedOk ─┐
//!    │            │              │           │     └► CompletedError ┤
//!    └────────────┴──────────────┴───────────┴──────────────────────┴─► Released
//! ```
//!
//! A task holds device resources exactly while it is between `MemAllocated`
//! and its release. [`Task::release`] takes them out of their `Option`
//! before freeing, so calling it again, or dropping the task afterwards,
//! does nothing.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::gpu::buffer_pool::PooledAllocation;
use crate::gpu::buffers::{ControlView, KernErrorBuf, KernErrorCode};
use crate::gpu::context::DeviceContext;
use crate::gpu::device::{DeviceError, DeviceSlice, EventHandle, HostBuffer, StreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    MemAllocated,
    Submitted,
    Running,
    CompletedOk,
    CompletedError,
    Released,
}

impl TaskState {
    /// Between allocation and completion; counts against the in-flight bound.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskState::MemAllocated | TaskState::Submitted | TaskState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::CompletedOk | TaskState::CompletedError | TaskState::Released)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Created => "created",
            TaskState::MemAllocated => "mem-allocated",
            TaskState::Submitted => "submitted",
            TaskState::Running => "running",
            TaskState::CompletedOk => "completed",
            TaskState::CompletedError => "failed",
            TaskState::Released => "released",
        })
    }
}

/// Where each part of a task lives inside its one device allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskLayout {
    pub control: DeviceSlice,
    pub src: DeviceSlice,
    pub dst: Option<DeviceSlice>,
}

/// Phase markers recorded on the task's stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskEvents {
    pub dma_send_start: EventHandle,
    pub dma_send_stop: EventHandle,
    pub dma_recv_start: EventHandle,
    pub dma_recv_stop: EventHandle,
}

/// Device timings of one task, read back from its events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskTimings {
    pub dma_send: Duration,
    pub kern_exec: Duration,
    pub dma_recv: Duration,
}

pub(crate) struct DeviceResources {
    pub ctx: Arc<DeviceContext>,
    pub alloc: PooledAllocation,
    pub layout: TaskLayout,
    pub stream: Option<StreamHandle>,
    pub events: Option<TaskEvents>,
}

/// Host copies of what the device sends back.
#[derive(Debug, Clone)]
pub(crate) struct RecvBuffers {
    pub control: HostBuffer,
    pub dst: Option<HostBuffer>,
}

/// How a task ended, as seen by the completion callback.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    /// The stream ran through; the kernel status is in the control block.
    Finished,
    /// A device call on the stream failed.
    Failed(DeviceError),
    /// The device context went away underneath the task.
    Lost,
}

pub struct Task {
    id: u64,
    order: Range<u64>,
    state: TaskState,
    src: Chunk,
    attempts: u32,
    pub(crate) device: Option<DeviceResources>,
    pub(crate) recv: Option<RecvBuffers>,
    pub(crate) outcome: Option<TaskOutcome>,
    pub(crate) timings: Option<TaskTimings>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("order", &self.order)
            .field("state", &self.state)
            .field("nitems", &self.src.nitems())
            .field("has_device_memory", &self.device.is_some())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(id: u64, order: Range<u64>, src: Chunk) -> Self {
        Self {
            id,
            order,
            state: TaskState::Created,
            src,
            attempts: 0,
            device: None,
            recv: None,
            outcome: None,
            timings: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Position of this task's rows in chunk submission order.
    pub fn order(&self) -> Range<u64> {
        self.order.clone()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn source(&self) -> &Chunk {
        &self.src
    }

    /// Times the chunk was resubmitted after the device ran out of room.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_device_memory(&self) -> bool {
        self.device.is_some()
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        trace!(target: "gpuscan", task = self.id, from = %self.state, to = %state, "task state");
        self.state = state;
    }

    /// The kernel status copied back with the control block.
    pub(crate) fn kerror(&self) -> Option<KernErrorBuf> {
        let recv = self.recv.as_ref()?;
        let image = recv.control.lock();
        ControlView::parse(&image).ok().map(|v| v.kerror())
    }

    pub(crate) fn kernel_failed(&self) -> bool {
        self.kerror().is_some_and(|k| k.code() != KernErrorCode::Success)
    }

    /// A fresh task over the same chunk for another attempt.
    pub(crate) fn retry(&self, id: u64) -> Task {
        let mut task = Task::new(id, self.order.clone(), self.src.clone());
        task.attempts = self.attempts + 1;
        task
    }

    /// Give up any device resources and start over as an unallocated task
    /// with the same identity.
    pub(crate) fn abandon(mut self) -> Task {
        self.release();
        let mut fresh = Task::new(self.id, self.order.clone(), self.src.clone());
        fresh.attempts = self.attempts;
        fresh
    }

    /// Two tasks over the halves of this chunk, splitting its order range.
    pub(crate) fn split(&self, first_id: u64) -> crate::error::Result<(Task, Task)> {
        let (a, b) = self.src.split()?;
        let mid = self.order.start + (self.order.end - self.order.start) / 2;
        Ok((
            Task::new(first_id, self.order.start..mid, a),
            Task::new(first_id + 1, mid..self.order.end, b),
        ))
    }

    /// Read phase timings from the task's events, if it recorded any.
    pub(crate) fn collect_timings(&mut self) {
        let Some(res) = &self.device else { return };
        let Some(ev) = res.events else { return };
        let device = &res.ctx.device;
        let span = |a, b| device.elapsed(a, b).unwrap_or_default();
        self.timings = Some(TaskTimings {
            dma_send: span(ev.dma_send_start, ev.dma_send_stop),
            kern_exec: span(ev.dma_send_stop, ev.dma_recv_start),
            dma_recv: span(ev.dma_recv_start, ev.dma_recv_stop),
        });
    }

    /// Free every device resource the task holds. Safe to call any number
    /// of times.
    ///
    /// Memory goes back to the pool only when the stream finished cleanly;
    /// a failed task or one torn down mid-flight frees its memory outright.
    pub fn release(&mut self) {
        let Some(res) = self.device.take() else {
            if self.state != TaskState::Created {
                self.state = TaskState::Released;
            }
            return;
        };
        let device = res.ctx.device.as_ref();
        if let Some(ev) = res.events {
            for e in [ev.dma_send_start, ev.dma_send_stop, ev.dma_recv_start, ev.dma_recv_stop] {
                device.destroy_event(e);
            }
        }
        if let Some(stream) = res.stream {
            device.destroy_stream(stream);
        }
        if self.state == TaskState::CompletedOk {
            res.ctx.pool.release(device, res.alloc);
        } else {
            if self.state.is_in_flight() {
                debug!(target: "gpuscan", task = self.id, state = %self.state, "releasing a task that has not completed");
            }
            res.ctx.pool.discard(device, res.alloc);
        }
        self.set_state(TaskState::Released);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::DeviceRuntime;
    use crate::gpu::host_device::HostDeviceConfig;
    use crate::types::{DataType, Datum, Field, Row, Schema};

    fn chunk(n: i32) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32)]));
        let rows: Vec<Row> = (0..n).map(|i| vec![Datum::Int32(i)]).collect();
        Chunk::from_rows(schema, &rows).unwrap()
    }

    fn with_memory(ctx: &Arc<DeviceContext>, task: &mut Task) {
        let alloc = ctx.pool.acquire(ctx.device.as_ref(), 1024).unwrap();
        let slice = DeviceSlice {
            ptr: alloc.ptr,
            offset: 0,
            len: 16,
        };
        task.device = Some(DeviceResources {
            ctx: ctx.clone(),
            alloc,
            layout: TaskLayout {
                control: slice,
                src: slice,
                dst: None,
            },
            stream: Some(ctx.device.create_stream().unwrap()),
            events: None,
        });
        task.set_state(TaskState::MemAllocated);
    }

    #[test]
    fn release_is_idempotent() {
        let ctx = Arc::new(DeviceContext::host(HostDeviceConfig::default()));
        let mut task = Task::new(1, 0..10, chunk(4));
        with_memory(&ctx, &mut task);
        assert!(task.has_device_memory());
        task.release();
        task.release();
        assert_eq!(task.state(), TaskState::Released);
        assert!(!task.has_device_memory());
        drop(task);
        assert_eq!(ctx.device.memory_in_use(), 0);
    }

    #[test]
    fn completed_tasks_recycle_their_memory() {
        let ctx = Arc::new(DeviceContext::host(HostDeviceConfig::default()));
        let mut task = Task::new(1, 0..10, chunk(4));
        with_memory(&ctx, &mut task);
        task.set_state(TaskState::CompletedOk);
        task.release();
        assert_eq!(ctx.pool.idle_count(), 1);
        ctx.trim();
        assert_eq!(ctx.device.memory_in_use(), 0);
    }

    #[test]
    fn dropping_an_in_flight_task_frees_its_memory() {
        let ctx = Arc::new(DeviceContext::host(HostDeviceConfig::default()));
        let mut task = Task::new(1, 0..10, chunk(4));
        with_memory(&ctx, &mut task);
        task.set_state(TaskState::Running);
        drop(task);
        assert_eq!(ctx.pool.idle_count(), 0);
        assert_eq!(ctx.device.memory_in_use(), 0);
    }

    #[test]
    fn split_halves_the_order_range() {
        let task = Task::new(7, 100..200, chunk(5));
        let (a, b) = task.split(8).unwrap();
        assert_eq!((a.order(), b.order()), (100..150, 150..200));
        assert_eq!((a.source().nitems(), b.source().nitems()), (2, 3));
        let again = task.retry(9);
        assert_eq!(again.attempts(), 1);
        assert_eq!(again.order(), 100..200);
    }
}
