//! The scan context: chunk producer, task pipeline and result consumer.
//!
//! # Problem
//! A scan reads its input in chunks and wants the device to filter and
//! project chunk *i* while chunk *i+1* is being copied in, without holding
//! more than a few chunks' worth of device memory and without the host
//! thread ever blocking on a particular chunk.
//!
//! # Design
//! ```text
//!   ChunkStore ──► next_chunk_task ──► pending ──► Orchestrator ──► running
//!                                                                     │ callback
//!   advance ◄── next_result_row ◄── ready (by chunk order) ◄── reap ◄─ completed
//! ```
//!
//! - At most `max_inflight` tasks are between allocation and completion.
//!   When the device runs out of memory the bound drops to the number of
//!   tasks still running and climbs back one step per successful task; with
//!   nothing running the chunk is split in half instead.
//! - Finished tasks are reaped on the host thread: device memory goes back
//!   to the pool and the task's rows become a result. Results are drained in
//!   chunk order (`ordered`) or in whatever order they are ready.
//! - A kernel that asks for a recheck, or a device whose context vanished,
//!   gets its chunk evaluated on the host with the same two-stage semantics.
//! - The first fatal error tears the scan down; later calls return
//!   [`ScanError::Aborted`].

pub mod completion;
pub mod explain;
mod orchestrator;
pub mod perfmon;
pub mod plan;
pub mod task;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use datafusion::arrow::record_batch::RecordBatch;
use tracing::{debug, info, warn};

use crate::chunk::arrow::rows_to_record_batch;
use crate::chunk::{Chunk, ChunkBudget, ChunkCursor, ChunkStore, MIN_CHUNK_BYTES};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::gpu::buffers::{encode_params, ControlView, KernErrorCode};
use crate::gpu::context::{DeviceContext, GPU_CONTEXT};
use crate::gpu::device::{ErrorClass, KernelKind};
use crate::gpu::program_cache::PROGRAM_CACHE;
use crate::types::{DataType, Datum, Row, SchemaRef};

use completion::CompletionQueue;
use orchestrator::{Orchestrator, SubmitError};
use perfmon::PerfMon;
use plan::ScanPlan;
use task::{RecvBuffers, Task, TaskOutcome, TaskState};

/// Chunk `k` owns the order range `k << ORDER_SHIFT .. (k + 1) << ORDER_SHIFT`;
/// split chunks share it out.
const ORDER_SHIFT: u32 = 32;

/// Cap on the destination growth factor.
const MAX_GROWTH: usize = 1 << 12;

/// Which execution path a scan takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanVariant {
    /// Chunks go through the device filter and projection.
    #[default]
    GpuScan,
    /// Whole source chunks are handed out through
    /// [`GpuScan::next_bulk_chunk`]; rows pulled through `advance()` are
    /// evaluated on the host.
    BulkScan,
}

impl fmt::Display for ScanVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanVariant::GpuScan => "GpuScan",
            ScanVariant::BulkScan => "BulkScan",
        })
    }
}

/// Row and task counters of one scan, cumulative across rescans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub chunks_read: u64,
    pub rows_read: u64,
    pub rows_returned: u64,
    pub rows_removed_by_device_filter: u64,
    pub rows_removed_by_host_filter: u64,
    /// Rows evaluated on the host after a recheck request or a lost device.
    pub rows_rechecked: u64,
    pub nospace_retries: u64,
    pub oom_deferrals: u64,
    pub oom_splits: u64,
    /// Most tasks running on the device at once.
    pub peak_in_flight: usize,
}

/// Rows a finished task contributes, before the host stage.
enum TaskResult {
    /// Source rows; `visible` lists the ones that passed the device quals.
    Source { chunk: Chunk, visible: Option<Vec<u32>> },
    /// Destination chunk of a device projection.
    Projected(Chunk),
    /// Rows already run through the device stage on the host.
    Rows(std::vec::IntoIter<Row>),
}

struct ResultCursor {
    result: TaskResult,
    pos: usize,
}

impl ResultCursor {
    fn new(result: TaskResult) -> Self {
        Self { result, pos: 0 }
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let index = match &mut self.result {
            TaskResult::Rows(rows) => return Ok(rows.next()),
            TaskResult::Source {
                chunk,
                visible: Some(visible),
            } => match visible.get(self.pos) {
                Some(&i) => (chunk, i as usize),
                None => return Ok(None),
            },
            TaskResult::Source { chunk, visible: None } | TaskResult::Projected(chunk) => {
                if self.pos >= chunk.nitems() {
                    return Ok(None);
                }
                (chunk, self.pos)
            }
        };
        let row = index.0.row(index.1)?;
        self.pos += 1;
        Ok(Some(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Active,
    Ended,
    Failed,
}

pub struct GpuScan {
    plan: ScanPlan,
    params: Vec<Datum>,
    config: ScanConfig,
    store: Box<dyn ChunkStore>,
    cursor: ChunkCursor,
    end_of_input: bool,
    budget: ChunkBudget,
    orchestrator: Option<Orchestrator>,
    queue: Arc<CompletionQueue>,
    /// Tasks waiting for device capacity, retried ones first.
    pending: VecDeque<Task>,
    next_task_id: u64,
    next_chunk: u64,
    effective_inflight: usize,
    growth: usize,
    /// Finished results keyed by order start, with their order end.
    ready: BTreeMap<u64, (u64, TaskResult)>,
    next_due: u64,
    current: Option<ResultCursor>,
    stats: ScanStats,
    perf: PerfMon,
    state: ScanState,
}

impl fmt::Debug for GpuScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuScan")
            .field("variant", &self.plan.variant())
            .field("on_device", &self.orchestrator.is_some())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("queue", &self.queue)
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl GpuScan {
    /// Start a scan on the process-wide device, if there is one.
    pub fn begin(store: Box<dyn ChunkStore>, plan: ScanPlan, params: Vec<Datum>, config: ScanConfig) -> Result<Self> {
        Self::with_context(store, plan, params, config, GPU_CONTEXT.clone())
    }

    /// Start a scan on `ctx`, or on the host when it is `None`.
    ///
    /// The device program is compiled here; a compile failure fails the
    /// scan before any task exists.
    pub fn with_context(
        store: Box<dyn ChunkStore>,
        plan: ScanPlan,
        params: Vec<Datum>,
        config: ScanConfig,
        ctx: Option<Arc<DeviceContext>>,
    ) -> Result<Self> {
        let config = config.normalized();
        let expected: Vec<DataType> = plan.input_schema().types().collect();
        let actual: Vec<DataType> = store.schema().types().collect();
        if expected != actual {
            return Err(ScanError::Plan(format!(
                "chunk store columns {actual:?} do not match the scan input {expected:?}"
            )));
        }
        let resolved = plan.program().resolve_params(&params)?;

        let queue = CompletionQueue::new();
        let orchestrator = match ctx {
            Some(ctx) if config.enable_device && plan.variant() == ScanVariant::GpuScan => {
                match PROGRAM_CACHE.acquire(&ctx.device, plan.program()) {
                    Ok(handle) => Some(Orchestrator::new(
                        ctx,
                        handle,
                        queue.clone(),
                        encode_params(&resolved)?,
                        config.result_format,
                        config.perfmon,
                    )),
                    Err(ScanError::Device { source, .. }) if source.class() == ErrorClass::ContextGone => {
                        warn!(target: "gpuscan", error = %source, "device context gone; scan runs on the host");
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };
        info!(
            target: "gpuscan",
            variant = %plan.variant(),
            on_device = orchestrator.is_some(),
            device_quals = plan.device_quals().len(),
            host_quals = plan.host_quals().len(),
            projection = plan.projection().is_some(),
            "scan started"
        );

        Ok(Self {
            budget: ChunkBudget {
                max_bytes: config.chunk_bytes,
                max_rows: config.chunk_rows,
            },
            effective_inflight: config.max_inflight,
            plan,
            params,
            store,
            cursor: ChunkCursor::default(),
            end_of_input: false,
            orchestrator,
            queue,
            pending: VecDeque::new(),
            next_task_id: 1,
            next_chunk: 0,
            growth: 1,
            ready: BTreeMap::new(),
            next_due: 0,
            current: None,
            stats: ScanStats::default(),
            perf: PerfMon::default(),
            state: ScanState::Active,
            config,
        })
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Schema of the rows `advance()` returns.
    pub fn output_schema(&self) -> &SchemaRef {
        self.plan.output_schema()
    }

    pub fn stats(&self) -> ScanStats {
        ScanStats {
            peak_in_flight: self.queue.peak_running(),
            ..self.stats
        }
    }

    pub fn perf(&self) -> &PerfMon {
        &self.perf
    }

    /// Whether chunks currently go to a device.
    pub fn is_on_device(&self) -> bool {
        self.orchestrator.is_some()
    }

    /// Tasks submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.queue.running_len()
    }

    /// Tasks waiting for device capacity.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current bound on tasks in flight.
    pub fn effective_inflight(&self) -> usize {
        self.effective_inflight
    }

    // ── Producer ───────────────────────────────────────────────────────────

    /// Read the next non-empty chunk and wrap it in a task. `None` once the
    /// store is exhausted.
    pub fn next_chunk_task(&mut self) -> Result<Option<Task>> {
        self.check_active()?;
        let r = self.read_task();
        self.guard(r)
    }

    fn read_task(&mut self) -> Result<Option<Task>> {
        while !self.end_of_input {
            let started = Instant::now();
            let read = self.store.read_chunk(self.cursor, self.budget);
            self.perf.time_outer_load += started.elapsed();
            let read = read?;
            self.cursor = read.cursor;
            self.end_of_input = read.end_of_input;
            if read.chunk.is_empty() {
                continue;
            }
            self.stats.chunks_read += 1;
            self.stats.rows_read += read.chunk.nitems() as u64;
            let seq = self.next_chunk;
            self.next_chunk += 1;
            let id = self.take_task_ids(1);
            debug!(target: "gpuscan", task = id, chunk = seq, rows = read.chunk.nitems(), "chunk read");
            return Ok(Some(Task::new(id, seq << ORDER_SHIFT..(seq + 1) << ORDER_SHIFT, read.chunk)));
        }
        Ok(None)
    }

    /// Hand a task to the pipeline. Returns without waiting for the device;
    /// the task waits in line while the in-flight bound is reached.
    pub fn submit_task(&mut self, task: Task) -> Result<()> {
        self.check_active()?;
        self.pending.push_back(task);
        let r = self.flush_pending();
        self.guard(r)
    }

    fn has_capacity(&self) -> bool {
        self.orchestrator.is_none() || self.queue.running_len() < self.effective_inflight
    }

    fn flush_pending(&mut self) -> Result<()> {
        while self.has_capacity() {
            let Some(task) = self.pending.pop_front() else { break };
            self.dispatch(task)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, task: Task) -> Result<()> {
        let Some(orchestrator) = &self.orchestrator else {
            return self.run_on_host(task, false);
        };
        match orchestrator.submit(&self.plan, task, self.growth) {
            Ok(sub) => {
                self.perf.record_submission(&sub);
                Ok(())
            }
            Err(SubmitError::OutOfMemory(task)) => self.out_of_memory(task),
            Err(SubmitError::ContextGone(task)) => {
                self.lose_device();
                self.run_on_host(task, true)
            }
            Err(SubmitError::Fatal(e)) => Err(e),
        }
    }

    fn out_of_memory(&mut self, task: Task) -> Result<()> {
        let running = self.queue.running_len();
        if running > 0 {
            debug!(target: "gpuscan", task = task.id(), running, "device memory exhausted; task deferred");
            self.stats.oom_deferrals += 1;
            self.effective_inflight = running;
            self.pending.push_front(task);
            return Ok(());
        }
        // Finished but unreaped tasks still hold their allocations.
        if self.queue.completed_len() > 0 {
            debug!(target: "gpuscan", task = task.id(), "device memory exhausted; reaping finished tasks first");
            self.stats.oom_deferrals += 1;
            self.reap()?;
            return self.dispatch(task);
        }
        if task.source().nitems() <= 1 {
            return Err(ScanError::OutOfDeviceMemory {
                bytes: task.source().len_bytes(),
            });
        }
        let (first, second) = task.split(self.take_task_ids(2))?;
        warn!(
            target: "gpuscan",
            rows = task.source().nitems(),
            "device memory exhausted with nothing running; splitting the chunk"
        );
        self.stats.oom_splits += 1;
        self.budget.max_bytes = (self.budget.max_bytes / 2).max(MIN_CHUNK_BYTES);
        self.budget.max_rows = (self.budget.max_rows / 2).max(1);
        self.pending.push_front(second);
        self.pending.push_front(first);
        Ok(())
    }

    /// Evaluate a task's chunk on the host. `recheck` marks chunks the device
    /// was supposed to handle.
    fn run_on_host(&mut self, mut task: Task, recheck: bool) -> Result<()> {
        let started = Instant::now();
        let source = task.source().rows()?;
        let nitems = source.len();
        let mut rows = Vec::with_capacity(nitems);
        for row in &source {
            if let Some(out) = self.plan.device_stage(row, &self.params)? {
                rows.push(out);
            }
        }
        if recheck {
            self.stats.rows_rechecked += nitems as u64;
            self.perf.time_host_recheck += started.elapsed();
        }
        self.stats.rows_removed_by_device_filter += (nitems - rows.len()) as u64;
        task.set_state(TaskState::CompletedOk);
        task.release();
        self.push_ready(task.order(), TaskResult::Rows(rows.into_iter()));
        Ok(())
    }

    fn lose_device(&mut self) {
        if let Some(orchestrator) = self.orchestrator.take() {
            let device = orchestrator.context().device.clone();
            warn!(target: "gpuscan", device = %device.name(), "device context lost; remaining chunks run on the host");
            drop(orchestrator);
            PROGRAM_CACHE.forget_device(device.id());
        }
    }

    // ── Consumer ───────────────────────────────────────────────────────────

    fn reap(&mut self) -> Result<()> {
        while let Some(task) = self.queue.pop_completed() {
            self.finish_task(task)?;
        }
        Ok(())
    }

    fn finish_task(&mut self, mut task: Task) -> Result<()> {
        if self.config.perfmon {
            task.collect_timings();
            if let Some(t) = task.timings {
                self.perf.record_timings(&t);
            }
        }
        let kerror = task.kerror();
        let recv = task.recv.take();
        let outcome = task.outcome.take();
        task.release();

        match outcome {
            Some(TaskOutcome::Finished) => {}
            Some(TaskOutcome::Failed(e)) if e.class() == ErrorClass::ResourceExhaustion => {
                debug!(target: "gpuscan", task = task.id(), error = %e, "device ran out of memory mid-task; resubmitting");
                self.stats.oom_deferrals += 1;
                self.pending.push_front(task.abandon());
                return Ok(());
            }
            Some(TaskOutcome::Failed(e)) => return Err(ScanError::device(e.phase(), e)),
            Some(TaskOutcome::Lost) | None => {
                self.lose_device();
                return self.run_on_host(task, true);
            }
        }
        self.effective_inflight = (self.effective_inflight + 1).min(self.config.max_inflight);

        let kerror = kerror.ok_or_else(|| ScanError::Layout("control block came back unreadable".into()))?;
        match kerror.code() {
            KernErrorCode::Success => {}
            KernErrorCode::CpuReCheck => {
                debug!(target: "gpuscan", task = task.id(), "device asked for a host recheck");
                return self.run_on_host(task, true);
            }
            KernErrorCode::DataStoreNoSpace if task.attempts() < self.config.max_nospace_retries => {
                self.growth = (self.growth * 2).min(MAX_GROWTH);
                self.stats.nospace_retries += 1;
                debug!(target: "gpuscan", task = task.id(), growth = self.growth, "destination too small; resubmitting");
                let retry = task.retry(self.take_task_ids(1));
                self.pending.push_front(retry);
                return Ok(());
            }
            code => {
                let chunk = task.order().start >> ORDER_SHIFT;
                return Err(ScanError::Kernel {
                    kernel: kerror.kernel_kind().unwrap_or(KernelKind::ExecQuals),
                    code,
                    message: format!("at row {} of chunk {chunk}", kerror.lineno),
                });
            }
        }

        let recv = recv.ok_or_else(|| ScanError::Layout("task finished without receive buffers".into()))?;
        let (result, kept) = self.decode_result(&task, recv)?;
        self.stats.rows_removed_by_device_filter += (task.source().nitems() - kept) as u64;
        debug!(target: "gpuscan", task = task.id(), rows = kept, "task completed");
        self.push_ready(task.order(), result);
        Ok(())
    }

    fn decode_result(&self, task: &Task, recv: RecvBuffers) -> Result<(TaskResult, usize)> {
        if let Some(dst) = recv.dst {
            let chunk = Chunk::from_image(self.plan.scan_schema().clone(), dst.to_vec())?;
            let kept = chunk.nitems();
            return Ok((TaskResult::Projected(chunk), kept));
        }
        let visible = {
            let control = recv.control.lock();
            ControlView::parse(&control)?.visible_rows()?
        };
        let chunk = task.source().clone();
        Ok(match visible {
            Some(mut rows) => {
                // Kernels reserve result slots per block, not per row.
                rows.sort_unstable();
                let kept = rows.len();
                (
                    TaskResult::Source {
                        chunk,
                        visible: Some(rows),
                    },
                    kept,
                )
            }
            None => {
                let kept = chunk.nitems();
                (TaskResult::Source { chunk, visible: None }, kept)
            }
        })
    }

    fn push_ready(&mut self, order: Range<u64>, result: TaskResult) {
        self.ready.insert(order.start, (order.end, result));
    }

    fn take_ready(&mut self) -> Option<TaskResult> {
        let (&start, _) = self.ready.first_key_value()?;
        if self.config.ordered && start != self.next_due {
            return None;
        }
        let (end, result) = self.ready.remove(&start)?;
        self.next_due = end;
        Some(result)
    }

    /// Next row of the finished tasks, in result order. `None` means nothing
    /// is ready right now: submit more chunks or poll again.
    pub fn next_result_row(&mut self) -> Result<Option<Row>> {
        self.check_active()?;
        let r = self.poll_row();
        self.guard(r)
    }

    fn poll_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(cursor) = &mut self.current {
                let started = Instant::now();
                let next = cursor.next_row()?;
                self.perf.time_materialize += started.elapsed();
                match next {
                    Some(row) => match self.plan.host_stage(row, &self.params)? {
                        Some(out) => {
                            self.stats.rows_returned += 1;
                            return Ok(Some(out));
                        }
                        None => {
                            self.stats.rows_removed_by_host_filter += 1;
                            continue;
                        }
                    },
                    None => self.current = None,
                }
            }
            self.reap()?;
            self.flush_pending()?;
            match self.take_ready() {
                Some(result) => self.current = Some(ResultCursor::new(result)),
                None => return Ok(None),
            }
        }
    }

    /// Results held back beyond this many wait for the consumer.
    fn ready_limit(&self) -> usize {
        2 * self.config.max_inflight
    }

    /// Read and submit chunks while there is room. Returns whether anything
    /// new entered the pipeline.
    fn fill_pipeline(&mut self) -> Result<bool> {
        let mut progressed = false;
        while self.has_capacity() && self.pending.is_empty() && self.ready.len() < self.ready_limit() {
            let Some(task) = self.read_task()? else { break };
            self.pending.push_back(task);
            self.flush_pending()?;
            progressed = true;
            if self.orchestrator.is_none() {
                break;
            }
        }
        Ok(progressed)
    }

    fn is_drained(&self) -> bool {
        self.end_of_input
            && self.current.is_none()
            && self.pending.is_empty()
            && self.ready.is_empty()
            && self.queue.running_len() == 0
            && self.queue.completed_len() == 0
    }

    /// Next output row, waiting for the device as needed. `None` at the end
    /// of the scan.
    pub fn advance(&mut self) -> Result<Option<Row>> {
        self.check_active()?;
        let r = self.drive();
        self.guard(r)
    }

    fn drive(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.poll_row()? {
                return Ok(Some(row));
            }
            if self.fill_pipeline()? {
                continue;
            }
            if self.is_drained() {
                return Ok(None);
            }
            let idle = self.pending.is_empty()
                && self.queue.running_len() == 0
                && self.queue.completed_len() == 0
                && self.end_of_input;
            if idle {
                // Every outstanding result is ready; nothing else can fill the gap.
                if let Some((&start, _)) = self.ready.first_key_value() {
                    warn!(target: "gpuscan", expected = self.next_due, found = start, "gap in chunk order");
                    self.next_due = start;
                }
                continue;
            }
            self.queue.wait(self.config.poll_interval);
        }
    }

    /// Every remaining row.
    pub fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.advance()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Every remaining row as one Arrow batch of the output schema.
    pub fn collect_batch(&mut self) -> Result<RecordBatch> {
        let rows = self.collect_rows()?;
        rows_to_record_batch(self.plan.output_schema(), &rows)
    }

    // ── Bulk variant ───────────────────────────────────────────────────────

    /// Next whole source chunk, for consumers that take chunks rather than
    /// rows. Only a [`ScanVariant::BulkScan`] produces them.
    pub fn next_bulk_chunk(&mut self) -> Result<Option<Chunk>> {
        self.check_active()?;
        if self.plan.variant() != ScanVariant::BulkScan {
            return Err(ScanError::Plan(format!("{} does not produce bulk chunks", self.plan.variant())));
        }
        let r = self.read_task().map(|t| t.map(|task| task.source().clone()));
        self.guard(r)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    fn take_task_ids(&mut self, n: u64) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += n;
        id
    }

    fn check_active(&self) -> Result<()> {
        match self.state {
            ScanState::Active => Ok(()),
            ScanState::Ended | ScanState::Failed => Err(ScanError::Aborted),
        }
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(target: "gpuscan", error = %e, "scan failed");
            self.teardown();
            self.state = ScanState::Failed;
        }
        result
    }

    /// Release every task whatever its state. Running tasks lose their
    /// memory at once; their callbacks find nothing to do.
    fn teardown(&mut self) {
        let tasks = self.queue.drain();
        let dropped = tasks.len() + self.pending.len();
        drop(tasks);
        self.pending.clear();
        self.ready.clear();
        self.current = None;
        if dropped > 0 {
            debug!(target: "gpuscan", tasks = dropped, "scan torn down");
        }
    }

    /// Start over from the first chunk. Task ids keep counting so callbacks
    /// from before the rescan cannot match new tasks.
    pub fn rescan(&mut self) -> Result<()> {
        self.check_active()?;
        self.teardown();
        self.cursor = ChunkCursor::default();
        self.end_of_input = false;
        self.next_chunk = 0;
        self.next_due = 0;
        self.growth = 1;
        self.effective_inflight = self.config.max_inflight;
        self.budget = ChunkBudget {
            max_bytes: self.config.chunk_bytes,
            max_rows: self.config.chunk_rows,
        };
        debug!(target: "gpuscan", "scan rewound");
        Ok(())
    }

    /// Tear the scan down and give back its program. Later calls return
    /// [`ScanError::Aborted`].
    pub fn end(&mut self) {
        self.teardown();
        self.orchestrator = None;
        if self.state == ScanState::Active {
            self.state = ScanState::Ended;
        }
    }
}

impl Drop for GpuScan {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Iterator for GpuScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != ScanState::Active {
            return None;
        }
        self.advance().transpose()
    }
}
