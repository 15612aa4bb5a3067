//! Completion queue between stream callbacks and the scan's poll loop.
//!
//! # Problem
//! Tasks finish on a stream's own thread while the scan keeps running on the
//! caller's thread. The two sides share the set of running tasks and the
//! list of finished ones, and either side may go away first: a scan can be
//! torn down while callbacks are still queued on its streams.
//!
//! # Design
//! One `parking_lot::Mutex` guards both lists and is held only to move tasks
//! between them, never across a device call. A callback holds a `Weak`
//! reference to the queue and the id of its task; if the queue is gone or
//! the task is no longer in the running set (teardown, rescan) it does
//! nothing. Failed tasks go to the front of the completed list so the
//! consumer sees the error before draining results queued behind it.
//!
//! A callback reporting that the device context is gone is not an error:
//! the task is queued as lost and the consumer evaluates its chunk on the
//! host.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::gpu::device::{CompletionFn, DeviceStatus, ErrorClass};
use crate::scan::task::{Task, TaskOutcome, TaskState};

#[derive(Default)]
struct TaskLists {
    running: HashMap<u64, Task>,
    completed: VecDeque<Task>,
}

#[derive(Default)]
pub struct CompletionQueue {
    lists: Mutex<TaskLists>,
    latch: Condvar,
    peak_running: AtomicUsize,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.lock();
        f.debug_struct("CompletionQueue")
            .field("running", &lists.running.len())
            .field("completed", &lists.completed.len())
            .finish()
    }
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Link a submitted task into the running set. Must happen before its
    /// callback is enqueued.
    pub(crate) fn insert_running(&self, mut task: Task) {
        task.set_state(TaskState::Running);
        let mut lists = self.lists.lock();
        lists.running.insert(task.id(), task);
        self.peak_running.fetch_max(lists.running.len(), Ordering::Relaxed);
    }

    /// Take back a task whose callback never made it onto the stream.
    pub(crate) fn remove_running(&self, task_id: u64) -> Option<Task> {
        self.lists.lock().running.remove(&task_id)
    }

    /// The callback to enqueue last on a task's stream.
    pub(crate) fn callback(self: &Arc<Self>, task_id: u64) -> CompletionFn {
        let queue = Arc::downgrade(self);
        Box::new(move |status| match queue.upgrade() {
            Some(queue) => queue.complete(task_id, status),
            None => trace!(target: "gpuscan", task = task_id, "completion after the scan was dropped"),
        })
    }

    fn complete(&self, task_id: u64, status: DeviceStatus) {
        let mut lists = self.lists.lock();
        let Some(mut task) = lists.running.remove(&task_id) else {
            trace!(target: "gpuscan", task = task_id, "completion for a task that is no longer running");
            return;
        };
        let urgent = match status {
            Ok(()) => {
                task.outcome = Some(TaskOutcome::Finished);
                task.set_state(TaskState::CompletedOk);
                task.kernel_failed()
            }
            Err(e) if e.class() == ErrorClass::ContextGone => {
                debug!(target: "gpuscan", task = task_id, error = %e, "device context gone; task dropped");
                task.outcome = Some(TaskOutcome::Lost);
                task.set_state(TaskState::CompletedError);
                false
            }
            Err(e) => {
                task.outcome = Some(TaskOutcome::Failed(e));
                task.set_state(TaskState::CompletedError);
                true
            }
        };
        if urgent {
            lists.completed.push_front(task);
        } else {
            lists.completed.push_back(task);
        }
        drop(lists);
        self.latch.notify_all();
    }

    pub(crate) fn pop_completed(&self) -> Option<Task> {
        self.lists.lock().completed.pop_front()
    }

    /// Wait up to `timeout` for a completion. Returns whether one is queued.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut lists = self.lists.lock();
        if lists.completed.is_empty() && !lists.running.is_empty() {
            self.latch.wait_for(&mut lists, timeout);
        }
        !lists.completed.is_empty()
    }

    /// Tasks between submission and their callback.
    pub fn running_len(&self) -> usize {
        self.lists.lock().running.len()
    }

    pub fn completed_len(&self) -> usize {
        self.lists.lock().completed.len()
    }

    /// Most tasks ever running at once.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::Relaxed)
    }

    /// Unlink every task. The caller drops them, outside the lock.
    pub(crate) fn drain(&self) -> Vec<Task> {
        let mut lists = self.lists.lock();
        let mut tasks: Vec<Task> = lists.running.drain().map(|(_, t)| t).collect();
        tasks.extend(lists.completed.drain(..));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::gpu::device::{DeviceCode, DeviceError};
    use crate::types::{DataType, Datum, Field, Schema};

    fn task(id: u64) -> Task {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32)]));
        let chunk = Chunk::from_rows(schema, &[vec![Datum::Int32(1)]]).unwrap();
        Task::new(id, id..id + 1, chunk)
    }

    #[test]
    fn errors_jump_the_queue() {
        let queue = CompletionQueue::new();
        for id in 1..=3 {
            queue.insert_running(task(id));
        }
        queue.callback(1)(Ok(()));
        queue.callback(2)(Ok(()));
        queue.callback(3)(Err(DeviceError::new(DeviceCode::IllegalAddress, "boom")));
        let first = queue.pop_completed().unwrap();
        assert_eq!(first.id(), 3);
        assert_eq!(first.state(), TaskState::CompletedError);
        assert!(matches!(first.outcome, Some(TaskOutcome::Failed(_))));
        assert_eq!(queue.pop_completed().unwrap().id(), 1);
        assert_eq!(queue.pop_completed().unwrap().id(), 2);
        assert_eq!(queue.peak_running(), 3);
    }

    #[test]
    fn lost_context_is_not_an_error() {
        let queue = CompletionQueue::new();
        queue.insert_running(task(1));
        queue.callback(1)(Err(DeviceError::new(DeviceCode::InvalidContext, "gone")));
        let t = queue.pop_completed().unwrap();
        assert!(matches!(t.outcome, Some(TaskOutcome::Lost)));
    }

    #[test]
    fn stale_callbacks_do_nothing() {
        let queue = CompletionQueue::new();
        queue.insert_running(task(1));
        let late = queue.callback(1);
        let tasks = queue.drain();
        assert_eq!(tasks.len(), 1);
        drop(tasks);
        late(Ok(()));
        assert_eq!(queue.completed_len(), 0);

        let orphan = queue.callback(2);
        drop(queue);
        orphan(Ok(()));
    }

    #[test]
    fn wait_wakes_on_completion() {
        let queue = CompletionQueue::new();
        queue.insert_running(task(1));
        let cb = queue.callback(1);
        let handle = std::thread::spawn(move || cb(Ok(())));
        let mut done = false;
        for _ in 0..100 {
            if queue.wait(Duration::from_millis(20)) {
                done = true;
                break;
            }
        }
        handle.join().unwrap();
        assert!(done);
        assert_eq!(queue.running_len(), 0);
    }
}
