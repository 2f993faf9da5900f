use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::Result;

/// A unit of deferred work. The on-queue flag keeps a task from being
/// queued twice; it is cleared just before the work runs, so a task may
/// re-queue itself.
pub struct Task {
    work: Box<dyn Fn() + Send + Sync>,
    onqueue: AtomicBool,
}

impl Task {
    pub fn new(work: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            work: Box::new(work),
            onqueue: AtomicBool::new(false),
        })
    }

    /// Claim the on-queue flag. Returns false if the task is already
    /// pending somewhere.
    fn set_queued(&self) -> bool {
        !self.onqueue.swap(true, Ordering::AcqRel)
    }

    fn clear_queued(&self) {
        self.onqueue.store(false, Ordering::Release);
    }

    fn run(&self) {
        (self.work)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("onqueue", &self.onqueue.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn signal_pair() -> (Arc<Task>, Arc<(Mutex<bool>, Condvar)>) {
    let signal = Arc::new((Mutex::new(false), Condvar::new()));
    let fired = signal.clone();
    let task = Task::new(move || {
        let (done, cv) = &*fired;
        *done.lock() = true;
        cv.notify_all();
    });
    (task, signal)
}

fn wait_signal(signal: &(Mutex<bool>, Condvar)) {
    let (done, cv) = signal;
    let mut done = done.lock();
    while !*done {
        cv.wait(&mut done);
    }
}

struct SerializerState {
    owned: bool,
    tasks: VecDeque<Arc<Task>>,
}

/// Serializes work on one transmit queue. The first thread to submit a
/// task becomes the owner and drains the list, including tasks queued
/// while it runs, before giving ownership up. A task submitted from
/// inside a running task is appended, never run recursively.
pub struct Serializer {
    state: Mutex<SerializerState>,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SerializerState {
                owned: false,
                tasks: VecDeque::new(),
            }),
        }
    }

    /// Queue `task`, then drain the list unless another thread already
    /// owns it. Tasks run without the serializer lock held.
    pub fn run(&self, task: &Arc<Task>) {
        if !task.set_queued() {
            return;
        }
        let mut state = self.state.lock();
        state.tasks.push_back(task.clone());
        if state.owned {
            // The owner picks it up before releasing ownership.
            return;
        }
        state.owned = true;
        while let Some(next) = state.tasks.pop_front() {
            next.clear_queued();
            drop(state);
            next.run();
            state = self.state.lock();
        }
        state.owned = false;
    }

    /// Block until every task submitted before this call has run.
    /// Returns immediately when nothing is in flight. Must not be called
    /// from inside a task on this serializer.
    pub fn barrier(&self) {
        {
            let state = self.state.lock();
            if !state.owned {
                return;
            }
        }
        let (task, signal) = signal_pair();
        self.run(&task);
        wait_signal(&signal);
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Serializer")
            .field("owned", &state.owned)
            .field("pending", &state.tasks.len())
            .finish()
    }
}

/// A worker thread draining dispatched tasks in FIFO order, used for
/// deferred receive-side protocol processing. Dropping the queue shuts
/// the worker down after it finishes what is already queued.
pub struct TaskQueue {
    tx: Option<Sender<Arc<Task>>>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded::<Arc<Task>>();
        debug!(name, "spawn task queue worker");
        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            for task in rx.iter() {
                task.clear_queued();
                task.run();
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue `task` on the worker unless it is already pending.
    pub fn dispatch(&self, task: &Arc<Task>) {
        if !task.set_queued() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(task.clone());
        }
    }

    /// Block until every task dispatched before this call has run.
    pub fn barrier(&self) {
        let (task, signal) = signal_pair();
        self.dispatch(&task);
        wait_signal(&signal);
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Closing the channel stops the worker once it drains.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test_log::test]
    fn test_serializer_runs_submitted_task() {
        let serializer = Serializer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        serializer.run(&task);
        serializer.run(&task);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test_log::test]
    fn test_task_submitted_from_task_runs_before_release() {
        // The inner task must run in the same drain, not recursively.
        let serializer = Arc::new(Serializer::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_order = order.clone();
        let inner = Task::new(move || {
            inner_order.lock().push("inner");
        });

        let outer_order = order.clone();
        let outer_serializer = serializer.clone();
        let inner_clone = inner.clone();
        let outer = Task::new(move || {
            outer_order.lock().push("outer");
            outer_serializer.run(&inner_clone);
            outer_order.lock().push("outer done");
        });

        serializer.run(&outer);
        assert_eq!(*order.lock(), vec!["outer", "outer done", "inner"]);
    }

    #[test_log::test]
    fn test_barrier_idle_returns_immediately() {
        let serializer = Serializer::new();
        serializer.barrier();
    }

    #[test_log::test]
    fn test_task_queue_dispatch_dedup() {
        let queue = TaskQueue::new("test-taskq").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        // A slow first task so the duplicate dispatches land while the
        // task is still flagged pending.
        let h = hits.clone();
        let slow = Task::new(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            h.fetch_add(1, Ordering::SeqCst);
        });
        let hold = Task::new(|| thread::sleep(std::time::Duration::from_millis(10)));
        queue.dispatch(&hold);
        queue.dispatch(&slow);
        queue.dispatch(&slow);
        queue.dispatch(&slow);
        queue.barrier();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_task_queue_barrier_orders_after_pending_work() {
        let queue = TaskQueue::new("test-taskq").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let h = hits.clone();
            let task = Task::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            queue.dispatch(&task);
        }
        queue.barrier();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
