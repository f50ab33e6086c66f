//! Bounded worker pool with fair dispatch.
//!
//! Workers share one FIFO task queue guarded by a mutex and a condition
//! variable. Idle workers also form an ordered list: only the worker at the
//! head of that list (the one idle longest) may take the next task, and it
//! rejoins the tail once the task is done. Load is therefore spread
//! round-robin instead of letting whichever thread wakes first take
//! everything.
//!
//! # Submission
//!
//! - [`WorkerPool::submit`] queues a fire-and-forget job. A panic inside it is
//!   caught and logged, and is otherwise lost.
//! - [`WorkerPool::submit_for_result`] queues a fallible computation and
//!   returns a [`TaskHandle`] that yields its value, its error, or the panic
//!   message.
//! - [`WorkerPool::submit_for_result_with`] does the same and also runs a
//!   callback with the outcome before the handle wakes its waiter.
//!
//! # Disposal
//!
//! [`WorkerPool::dispose`] (also run on drop) stops accepting work, lets the
//! running tasks finish, joins every worker and drops the tasks that never
//! started. Execution is at-most-once: handles of dropped tasks resolve to
//! [`TaskError::Abandoned`].

use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::handle::{self, Callback, Completion, TaskHandle};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A queued unit of work.
enum Task {
    FireAndForget(Job),
    WithResult(Box<dyn ResultJob>),
}

/// A result-bearing computation bound to the completion side of its handle.
trait ResultJob: Send {
    fn run(self: Box<Self>);
}

struct BoundJob<F, T> {
    f: F,
    completion: Completion<T>,
}

impl<F, T> ResultJob for BoundJob<F, T>
where
    F: FnOnce() -> anyhow::Result<T> + Send,
    T: Send,
{
    fn run(self: Box<Self>) {
        let BoundJob { f, completion } = *self;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        completion.complete(outcome);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Lifecycle state of a single worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

/// Per-worker counters reported by [`WorkerPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub state: WorkerState,
    /// Tasks this worker has finished executing.
    pub executed: u64,
}

/// Point-in-time snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    /// Tasks waiting in the queue.
    pub queued: usize,
}

impl PoolStats {
    pub fn executed(&self) -> u64 {
        self.workers.iter().map(|w| w.executed).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    ShuttingDown,
    Disposed,
}

struct State {
    queue: VecDeque<Task>,
    /// Idle worker indices; the front has been idle longest.
    idle: VecDeque<usize>,
    workers: Vec<WorkerStats>,
    lifecycle: Lifecycle,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    available: Condvar,
}

/// A fixed-size (optionally growing) pool of OS worker threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    grow_on_demand: bool,
    max_workers: Option<usize>,
}

impl WorkerPool {
    /// Spawns `config.workers` threads.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let pool = Self {
            shared: Arc::new(Shared {
                name: config.name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    idle: VecDeque::with_capacity(config.workers),
                    workers: Vec::with_capacity(config.workers),
                    lifecycle: Lifecycle::Running,
                }),
                available: Condvar::new(),
            }),
            threads: Mutex::new(Vec::with_capacity(config.workers)),
            grow_on_demand: config.grow_on_demand,
            max_workers: config.max_workers,
        };

        {
            let mut state = pool.shared.state.lock();
            for _ in 0..config.workers {
                // On failure the partially built pool is disposed by Drop.
                pool.spawn_worker(&mut state)?;
            }
        }
        debug!(
            pool = %pool.shared.name,
            workers = config.workers,
            grow = pool.grow_on_demand,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Convenience constructor with default settings and `workers` threads.
    pub fn with_workers(workers: usize) -> Result<Self, PoolError> {
        Self::new(PoolConfig::with_workers(workers))
    }

    /// Queues a fire-and-forget job.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Task::FireAndForget(Box::new(job)))
    }

    /// Queues a fallible computation and returns a handle to its outcome.
    pub fn submit_for_result<T, E, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
        T: Send + 'static,
    {
        self.submit_bound(f, None)
    }

    /// Like [`submit_for_result`](Self::submit_for_result), and also calls
    /// `on_complete` with the outcome once the task resolves.
    ///
    /// The callback runs on the worker thread (or, for a task dropped by
    /// [`dispose`](Self::dispose), on the disposing thread) before the handle
    /// wakes its waiter. A panic in the callback is logged and otherwise
    /// ignored.
    pub fn submit_for_result_with<T, E, F, C>(
        &self,
        f: F,
        on_complete: C,
    ) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
        T: Send + 'static,
        C: FnOnce(&Result<T, TaskError>) + Send + 'static,
    {
        self.submit_bound(f, Some(Box::new(on_complete)))
    }

    fn submit_bound<T, E, F>(
        &self,
        f: F,
        on_complete: Option<Callback<T>>,
    ) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
        T: Send + 'static,
    {
        let (completion, handle) = handle::pair_with(on_complete);
        let job = BoundJob {
            f: move || f().map_err(Into::<anyhow::Error>::into),
            completion,
        };
        self.enqueue(Task::WithResult(Box::new(job)))?;
        Ok(handle)
    }

    fn enqueue(&self, task: Task) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        match state.lifecycle {
            Lifecycle::Running => {}
            Lifecycle::ShuttingDown => return Err(PoolError::ShuttingDown),
            Lifecycle::Disposed => return Err(PoolError::Disposed),
        }
        state.queue.push_back(task);

        if self.grow_on_demand
            && state.queue.len() > state.idle.len()
            && self.below_ceiling(&state)
        {
            // The task stays queued for the existing workers if the spawn fails.
            if let Err(err) = self.spawn_worker(&mut state) {
                warn!(pool = %self.shared.name, error = %err, "could not grow worker pool");
            }
        }
        self.shared.available.notify_all();
        Ok(())
    }

    fn below_ceiling(&self, state: &State) -> bool {
        self.max_workers
            .map_or(true, |max| state.workers.len() < max)
    }

    /// Spawns one worker and appends it to the idle list. Called with the
    /// state lock held so the new worker cannot run before it is registered.
    fn spawn_worker(&self, state: &mut State) -> Result<(), PoolError> {
        let id = state.workers.len();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.shared.name, id))
            .spawn(move || worker_loop(shared, id))
            .map_err(PoolError::Spawn)?;

        state.workers.push(WorkerStats {
            state: WorkerState::Idle,
            executed: 0,
        });
        state.idle.push_back(id);
        self.threads.lock().push(handle);
        trace!(pool = %self.shared.name, worker = id, "worker spawned");
        Ok(())
    }

    /// Stops the pool and joins every worker.
    ///
    /// Running tasks are allowed to finish; queued tasks are dropped. Calling
    /// this again, or after drop has already disposed the pool, is a no-op.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.lifecycle != Lifecycle::Running {
                return;
            }
            state.lifecycle = Lifecycle::ShuttingDown;
            mem::take(&mut state.queue)
        };
        self.shared.available.notify_all();

        if !dropped.is_empty() {
            debug!(pool = %self.shared.name, tasks = dropped.len(), "dropping queued tasks");
        }
        // Resolves the handles of result-bearing tasks as abandoned.
        drop(dropped);

        let threads = mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "worker thread exited by panic");
            }
        }

        self.shared.state.lock().lifecycle = Lifecycle::Disposed;
        debug!(pool = %self.shared.name, "worker pool disposed");
    }

    /// Returns `true` while the pool accepts submissions.
    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Running
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.workers.clone(),
            queued: state.queue.len(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    trace!(pool = %shared.name, worker = id, "worker running");
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.lifecycle != Lifecycle::Running {
                    break None;
                }
                if state.idle.front() == Some(&id) && !state.queue.is_empty() {
                    state.idle.pop_front();
                    state.workers[id].state = WorkerState::Busy;
                    let task = state.queue.pop_front();
                    // The new head of the idle list may take the next task.
                    shared.available.notify_all();
                    break task;
                }
                shared.available.wait(&mut state);
            }
        };
        let Some(task) = task else {
            break;
        };

        run_task(task, id);

        let mut state = shared.state.lock();
        let stats = &mut state.workers[id];
        stats.executed += 1;
        stats.state = WorkerState::Idle;
        state.idle.push_back(id);
        if !state.queue.is_empty() {
            shared.available.notify_all();
        }
    }

    shared.state.lock().workers[id].state = WorkerState::Stopped;
    trace!(pool = %shared.name, worker = id, "worker stopped");
}

fn run_task(task: Task, worker: usize) {
    match task {
        Task::FireAndForget(job) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                warn!(
                    worker,
                    panic = %panic_message(payload.as_ref()),
                    "fire-and-forget task panicked"
                );
            }
        }
        Task::WithResult(job) => job.run(),
    }
}
