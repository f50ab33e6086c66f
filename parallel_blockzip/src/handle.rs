//! Completion handles for result-bearing pool tasks.
//!
//! A handle and its completion side share one slot. The worker resolves the
//! slot exactly once, either with the task's outcome or, if the task is dropped
//! unrun, with [`TaskError::Abandoned`].
//!
//! An optional completion callback sees the outcome by reference on the
//! resolving thread, outside the slot lock, just before waiters are woken.

use crate::error::TaskError;
use crate::pool::panic_message;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Called once with the outcome of a task.
pub(crate) type Callback<T> = Box<dyn FnOnce(&Result<T, TaskError>) + Send>;

enum Outcome<T> {
    Pending,
    Ready(Result<T, TaskError>),
}

struct Slot<T> {
    outcome: Mutex<Outcome<T>>,
    done: Condvar,
}

impl<T> Slot<T> {
    fn resolve(&self, result: Result<T, TaskError>) {
        let mut outcome = self.outcome.lock();
        debug_assert!(matches!(*outcome, Outcome::Pending));
        *outcome = Outcome::Ready(result);
        self.done.notify_all();
    }
}

/// Creates a linked completion/handle pair.
#[cfg(test)]
pub(crate) fn pair<T>() -> (Completion<T>, TaskHandle<T>) {
    pair_with(None)
}

/// Creates a linked completion/handle pair that runs `on_complete` when the
/// task resolves.
pub(crate) fn pair_with<T>(on_complete: Option<Callback<T>>) -> (Completion<T>, TaskHandle<T>) {
    let slot = Arc::new(Slot {
        outcome: Mutex::new(Outcome::Pending),
        done: Condvar::new(),
    });
    (
        Completion {
            slot: Some(Arc::clone(&slot)),
            on_complete,
        },
        TaskHandle { slot },
    )
}

/// Worker side of a handle. Dropping it unresolved abandons the task.
pub(crate) struct Completion<T> {
    slot: Option<Arc<Slot<T>>>,
    on_complete: Option<Callback<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn complete(mut self, result: Result<T, TaskError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<T, TaskError>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Some(callback) = self.on_complete.take() {
            // A panicking callback must not take the worker down with it.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&result))) {
                warn!(
                    panic = %panic_message(payload.as_ref()),
                    "completion callback panicked"
                );
            }
        }
        slot.resolve(result);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.finish(Err(TaskError::Abandoned));
    }
}

/// Handle to the eventual outcome of a task submitted with
/// [`WorkerPool::submit_for_result`](crate::WorkerPool::submit_for_result).
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has completed and returns its value or the
    /// captured failure.
    ///
    /// Never call this from a task running on the same pool: if every worker
    /// is waiting on a queued task, nothing is left to run it.
    pub fn wait(self) -> Result<T, TaskError> {
        let mut outcome = self.slot.outcome.lock();
        loop {
            match mem::replace(&mut *outcome, Outcome::Pending) {
                Outcome::Ready(result) => return result,
                Outcome::Pending => self.slot.done.wait(&mut outcome),
            }
        }
    }

    /// Returns `true` once the task has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(*self.slot.outcome.lock(), Outcome::Ready(_))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}
