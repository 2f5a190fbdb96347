//! A unit of schedulable work.
//!
//! A [`Task`] runs its job exactly once, records the outcome, wakes every
//! thread blocked in [`Task::wait`] and then fires its completion callback.
//! A panicking job is caught and recorded as [`TaskError::Panicked`]; it never
//! takes the process down.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use super::{Affinity, TaskError};

/// Outcome of a task.
pub type TaskResult = Result<(), TaskError>;

type Callback = Box<dyn FnOnce(&TaskResult) + Send>;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created or queued, not started.
    Pending,
    /// Job is executing.
    Running,
    /// Outcome recorded. Terminal.
    Completed,
}

enum Job<C> {
    Detached(Box<dyn FnOnce() -> TaskResult + Send>),
    Context(Box<dyn FnOnce(&mut C) -> TaskResult + Send>),
}

struct State {
    status: TaskStatus,
    result: Option<TaskResult>,
    callback: Option<Callback>,
}

/// Work item with completion signaling.
///
/// `C` is the context handed to jobs created with [`Task::with_context`];
/// only the owner of MAIN can provide it.
pub struct Task<C> {
    id: Uuid,
    job: Mutex<Option<Job<C>>>,
    state: Mutex<State>,
    done: Condvar,
}

impl<C> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<C> Task<C> {
    /// Task that needs no context. Runs on any thread.
    pub fn new(job: impl FnOnce() -> TaskResult + Send + 'static) -> Self {
        Self::from_job(Job::Detached(Box::new(job)))
    }

    /// Task that needs the MAIN context.
    pub fn with_context(job: impl FnOnce(&mut C) -> TaskResult + Send + 'static) -> Self {
        Self::from_job(Job::Context(Box::new(job)))
    }

    fn from_job(job: Job<C>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: Mutex::new(Some(job)),
            state: Mutex::new(State {
                status: TaskStatus::Pending,
                result: None,
                callback: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Register the completion callback.
    ///
    /// If the task already completed the callback runs immediately on the
    /// calling thread. A second registration replaces a pending first one.
    pub fn on_complete(&self, callback: impl FnOnce(&TaskResult) + Send + 'static) {
        let mut state = self.lock_state();
        if state.status == TaskStatus::Completed {
            let result = state.result.clone().unwrap_or(Err(TaskError::AlreadyRun));
            drop(state);
            callback(&result);
            return;
        }
        state.callback = Some(Box::new(callback));
    }

    /// Unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    /// Whether the outcome has been recorded.
    pub fn is_complete(&self) -> bool {
        self.status() == TaskStatus::Completed
    }

    /// Recorded outcome, `None` until complete.
    pub fn result(&self) -> Option<TaskResult> {
        self.lock_state().result.clone()
    }

    /// Whether the task completed successfully.
    pub fn succeeded(&self) -> bool {
        matches!(self.result(), Some(Ok(())))
    }

    /// Block until the task completes.
    pub fn wait(&self) -> TaskResult {
        let state = self.lock_state();
        let state = self
            .done
            .wait_while(state, |s| s.status != TaskStatus::Completed)
            .unwrap_or_else(PoisonError::into_inner);
        state.result.clone().unwrap_or(Err(TaskError::AlreadyRun))
    }

    /// Block until the task completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        let state = self.lock_state();
        let (state, _) = self
            .done
            .wait_timeout_while(state, timeout, |s| s.status != TaskStatus::Completed)
            .unwrap_or_else(PoisonError::into_inner);
        state.result.clone()
    }

    /// Execute the job on the calling thread.
    ///
    /// `context` is `None` off MAIN; a context job then fails with
    /// [`TaskError::ContextUnavailable`]. Running a task twice returns
    /// [`TaskError::AlreadyRun`] without touching the recorded outcome.
    pub fn run(&self, context: Option<&mut C>) -> TaskResult {
        let job = self
            .job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(job) = job else {
            return Err(TaskError::AlreadyRun);
        };

        self.lock_state().status = TaskStatus::Running;

        let outcome = catch_unwind(AssertUnwindSafe(move || match job {
            Job::Detached(f) => f(),
            Job::Context(f) => match context {
                Some(ctx) => f(ctx),
                None => Err(TaskError::ContextUnavailable(Affinity::Pool)),
            },
        }));
        let result =
            outcome.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_text(&*payload))));

        self.complete(result.clone());
        result
    }

    /// Complete the task without running it.
    ///
    /// No effect if it already completed.
    pub fn abort(&self, error: TaskError) {
        self.job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.complete(Err(error));
    }

    fn complete(&self, result: TaskResult) {
        let mut state = self.lock_state();
        if state.status == TaskStatus::Completed {
            return;
        }
        state.status = TaskStatus::Completed;
        state.result = Some(result.clone());
        let callback = state.callback.take();
        drop(state);

        self.done.notify_all();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
                tracing::error!(task = %self.id, "task completion callback panicked");
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
