//! # strand-pool
//!
//! A fixed-cap thread pool with lazy worker growth. Workers are spawned one
//! at a time, only when a task is pushed while every existing worker is busy
//! and the cap still allows growth. Tasks are joinable (plain or timed) or
//! detachable; a detached task is released by the worker that ran it.
//!
//! Two lock domains, ordered pool-then-task: the pool mutex guards the task
//! queue and the stop flag, each task's own mutex guards its status
//! transitions. Workers hold no lock while the task closure runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

/// Hard cap on workers for any pool.
pub const MAX_THREADS: usize = 20;
/// Hard cap on queued (not yet dequeued) tasks.
pub const MAX_TASKS: usize = 100_000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Worker cap of zero, or above `MAX_THREADS`.
    #[error("invalid worker count")]
    InvalidArgument,

    /// The queue already holds `MAX_TASKS` tasks.
    #[error("task queue is full")]
    TooManyTasks,

    /// Shutdown attempted while tasks are queued or running.
    #[error("pool still has queued or running tasks")]
    HasTasks,

    /// Join or detach on a task that was never pushed.
    #[error("task was never pushed to a pool")]
    TaskNotPushed,

    /// Delete on a task the pool still owns.
    #[error("task is owned by a pool")]
    TaskInPool,

    /// Timed join expired before the task finished.
    #[error("timed out waiting for the task")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TaskStatus {
    New = 0,
    Waiting = 1,
    Running = 2,
    Finished = 3,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskStatus::New,
            1 => TaskStatus::Waiting,
            2 => TaskStatus::Running,
            _ => TaskStatus::Finished,
        }
    }
}

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

struct TaskInner {
    /// Written under `lock`; read without it by the advisory getters.
    status: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
    func: Mutex<Option<TaskFn>>,
}

impl TaskInner {
    fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

/// A unit of work. Create with [`Task::new`], hand to [`Pool::push`], then
/// either `join`/`timed_join` it or `detach` it.
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                status: AtomicU8::new(TaskStatus::New as u8),
                lock: Mutex::new(()),
                cv: Condvar::new(),
                func: Mutex::new(Some(Box::new(func))),
            }),
        }
    }

    /// Advisory: may be stale the moment it returns. `join` is the barrier.
    pub fn is_running(&self) -> bool {
        self.inner.status() == TaskStatus::Running
    }

    /// Advisory: may be stale the moment it returns. `join` is the barrier.
    pub fn is_finished(&self) -> bool {
        self.inner.status() == TaskStatus::Finished
    }

    /// Block until the task finishes. Returns only after the closure has
    /// returned.
    pub fn join(&self) -> Result<()> {
        match self.inner.status() {
            TaskStatus::New => return Err(PoolError::TaskNotPushed),
            TaskStatus::Finished => return Ok(()),
            _ => {}
        }
        let mut guard = self.inner.lock.lock().unwrap();
        while self.inner.status() != TaskStatus::Finished {
            guard = self.inner.cv.wait(guard).unwrap();
        }
        Ok(())
    }

    /// Like `join`, bounded by `timeout`. A zero timeout on an unfinished
    /// task fails immediately.
    pub fn timed_join(&self, timeout: Duration) -> Result<()> {
        match self.inner.status() {
            TaskStatus::New => return Err(PoolError::TaskNotPushed),
            TaskStatus::Finished => return Ok(()),
            _ => {}
        }
        if timeout.is_zero() {
            return Err(PoolError::Timeout);
        }
        let guard = self.inner.lock.lock().unwrap();
        let (_guard, wait) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |_| {
                self.inner.status() != TaskStatus::Finished
            })
            .unwrap();
        if wait.timed_out() && self.inner.status() != TaskStatus::Finished {
            return Err(PoolError::Timeout);
        }
        Ok(())
    }

    /// Give up the handle. If the task already finished it is released here;
    /// otherwise the worker running it holds the last reference and releases
    /// the task when the closure returns.
    pub fn detach(self) -> Result<()> {
        match self.inner.status() {
            TaskStatus::New => Err(PoolError::TaskNotPushed),
            _ => Ok(()),
        }
    }

    /// Explicit release. Refused while the pool owns the task; note the
    /// handle is consumed either way, and a refused delete leaves the task
    /// alive through the pool's own reference until it finishes.
    pub fn delete(self) -> Result<()> {
        match self.inner.status() {
            TaskStatus::Waiting | TaskStatus::Running => Err(PoolError::TaskInPool),
            _ => Ok(()),
        }
    }
}

struct PoolQueue {
    tasks: VecDeque<Arc<TaskInner>>,
    stopping: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    cv: Condvar,
    /// Workers currently between dequeue and `Finished`.
    busy: AtomicUsize,
}

/// The pool. Spawns at most `worker_cap` workers, lazily.
pub struct Pool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_cap: usize,
    stopped: AtomicBool,
}

impl Pool {
    pub fn new(worker_cap: usize) -> Result<Self> {
        if worker_cap == 0 || worker_cap > MAX_THREADS {
            return Err(PoolError::InvalidArgument);
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(PoolQueue {
                    tasks: VecDeque::new(),
                    stopping: false,
                }),
                cv: Condvar::new(),
                busy: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::with_capacity(worker_cap)),
            worker_cap,
            stopped: AtomicBool::new(false),
        })
    }

    /// Queue a task. Spawns a worker first when every existing worker is busy
    /// and the cap allows; otherwise an idle worker picks the task up.
    pub fn push(&self, task: &Task) -> Result<()> {
        if self.shared.queue.lock().unwrap().tasks.len() == MAX_TASKS {
            return Err(PoolError::TooManyTasks);
        }

        {
            let mut workers = self.workers.lock().unwrap();
            let spawned = workers.len();
            if self.shared.busy.load(Ordering::SeqCst) == spawned && spawned < self.worker_cap {
                let shared = Arc::clone(&self.shared);
                workers.push(thread::spawn(move || worker_loop(shared)));
                debug!(workers = spawned + 1, cap = self.worker_cap, "worker spawned");
            }
        }

        let mut queue = self.shared.queue.lock().unwrap();
        task.inner.set_status(TaskStatus::Waiting);
        queue.tasks.push_back(Arc::clone(&task.inner));
        drop(queue);
        self.shared.cv.notify_one();
        Ok(())
    }

    /// Number of workers spawned so far.
    pub fn thread_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Stop and join every worker. Fails with `HasTasks` while tasks are
    /// queued or running; the pool is untouched in that case.
    pub fn shutdown(&self) -> Result<()> {
        let mut queue = self.shared.queue.lock().unwrap();
        if !queue.tasks.is_empty() || self.shared.busy.load(Ordering::SeqCst) > 0 {
            return Err(PoolError::HasTasks);
        }
        queue.stopping = true;
        drop(queue);
        self.shared.cv.notify_all();

        for handle in std::mem::take(&mut *self.workers.lock().unwrap()) {
            let _ = handle.join();
        }
        self.stopped.store(true, Ordering::SeqCst);
        debug!("pool shut down");
        Ok(())
    }
}

impl Drop for Pool {
    /// Last-resort teardown: workers drain whatever is still queued, then
    /// exit and are joined.
    fn drop(&mut self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.shared.queue.lock().unwrap().stopping = true;
        self.shared.cv.notify_all();
        for handle in std::mem::take(&mut *self.workers.lock().unwrap()) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.stopping {
                    break None;
                }
                queue = shared.cv.wait(queue).unwrap();
            }
        };
        let Some(task) = task else {
            trace!("worker exiting");
            return;
        };

        {
            let _guard = task.lock.lock().unwrap();
            shared.busy.fetch_add(1, Ordering::SeqCst);
            task.set_status(TaskStatus::Running);
        }

        // No lock held while the closure runs.
        let func = task.func.lock().unwrap().take();
        if let Some(func) = func {
            func();
        }

        {
            let _guard = task.lock.lock().unwrap();
            // Drop out of busy before publishing Finished, so a joiner that
            // observes Finished can immediately shut the pool down.
            shared.busy.fetch_sub(1, Ordering::SeqCst);
            task.set_status(TaskStatus::Finished);
        }
        task.cv.notify_one();
        trace!("task finished");
        // If the task was detached, this clone is the last reference and the
        // task is released here, exactly once.
        drop(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_worker_caps() {
        assert_eq!(Pool::new(0).err(), Some(PoolError::InvalidArgument));
        assert_eq!(
            Pool::new(MAX_THREADS + 1).err(),
            Some(PoolError::InvalidArgument)
        );
        assert!(Pool::new(MAX_THREADS).is_ok());
    }

    #[test]
    fn no_workers_before_first_push() {
        let pool = Pool::new(4).unwrap();
        assert_eq!(pool.thread_count(), 0);
        pool.shutdown().unwrap();
    }

    #[test]
    fn join_before_push_is_an_error() {
        let task = Task::new(|| {});
        assert_eq!(task.join(), Err(PoolError::TaskNotPushed));
        assert_eq!(task.timed_join(Duration::from_millis(5)), Err(PoolError::TaskNotPushed));
    }

    #[test]
    fn detach_before_push_is_an_error() {
        let task = Task::new(|| {});
        assert_eq!(task.detach(), Err(PoolError::TaskNotPushed));
    }

    #[test]
    fn delete_new_and_finished_tasks_is_allowed() {
        let task = Task::new(|| {});
        task.delete().unwrap();

        let pool = Pool::new(1).unwrap();
        let task = Task::new(|| {});
        pool.push(&task).unwrap();
        task.join().unwrap();
        task.delete().unwrap();
        pool.shutdown().unwrap();
    }
}
