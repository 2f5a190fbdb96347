//! Thread-affine task scheduler.
//!
//! Two affinities exist:
//! - [`Affinity::Pool`]: the task gets a freshly spawned OS thread. There is
//!   no pooling and no concurrency cap.
//! - [`Affinity::Main`]: the task is queued and runs during the next
//!   [`Scheduler::update`] on the thread that owns MAIN, with mutable access
//!   to the MAIN context `C` (the kernel).
//!
//! [`Scheduler::call_main`] is the blocking RPC other threads use to read or
//! mutate MAIN-owned state.

mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use tracing::{debug, error, warn};

pub use task::{Task, TaskResult, TaskStatus};

/// Thread a task is constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// The kernel thread.
    Main,
    /// A dedicated, detached worker thread.
    Pool,
}

impl std::fmt::Display for Affinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Main => "MAIN",
            Self::Pool => "POOL",
        })
    }
}

/// Failures recorded in a task's completion state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The job returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The job panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The job needed a context that is not available on this thread.
    #[error("task context unavailable on {0} thread")]
    ContextUnavailable(Affinity),

    /// A blocking MAIN call was issued from MAIN itself.
    #[error("blocking call onto MAIN issued from MAIN")]
    WouldDeadlock,

    /// The task was already executed.
    #[error("task already ran")]
    AlreadyRun,

    /// The MAIN queue was closed before the task could run.
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Scheduler for tasks whose MAIN context is `C`.
pub struct Scheduler<C: 'static> {
    main_queue: Mutex<VecDeque<Arc<Task<C>>>>,
    main_ready: Condvar,
    main_thread: Mutex<Option<ThreadId>>,
    closed: AtomicBool,
    spawned: AtomicU64,
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Self {
            main_queue: Mutex::new(VecDeque::new()),
            main_ready: Condvar::new(),
            main_thread: Mutex::new(None),
            closed: AtomicBool::new(false),
            spawned: AtomicU64::new(0),
        }
    }
}

impl<C: 'static> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("main_queued", &self.queued(Affinity::Main))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: 'static> Scheduler<C> {
    /// Create a scheduler with an empty MAIN queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the calling thread as the owner of `affinity`.
    ///
    /// Only MAIN has an owner; registering POOL is a no-op.
    pub fn register_thread(&self, affinity: Affinity) {
        if affinity == Affinity::Main {
            *self
                .main_thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(std::thread::current().id());
        }
    }

    /// Whether the calling thread owns MAIN.
    pub fn is_main_thread(&self) -> bool {
        *self
            .main_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(std::thread::current().id())
    }

    /// Submit a task.
    ///
    /// POOL tasks start immediately on a new thread. MAIN tasks are queued
    /// until the next [`Scheduler::update`]; once the scheduler is closed
    /// they are aborted with [`TaskError::ShutDown`] instead.
    pub fn enqueue(&self, task: Arc<Task<C>>, affinity: Affinity) {
        match affinity {
            Affinity::Pool => {
                let n = self.spawned.fetch_add(1, Ordering::Relaxed);
                let worker = Arc::clone(&task);
                let spawned = std::thread::Builder::new()
                    .name(format!("pool-{n}"))
                    .spawn(move || {
                        if let Err(e) = worker.run(None) {
                            warn!(task = %worker.id(), error = %e, "pool task failed");
                        }
                    });
                if let Err(e) = spawned {
                    error!(task = %task.id(), error = %e, "failed to spawn pool thread");
                    task.abort(TaskError::Failed(format!("spawn failed: {e}")));
                }
            }
            Affinity::Main => {
                let mut queue = self.lock_queue();
                if self.closed.load(Ordering::Acquire) {
                    drop(queue);
                    task.abort(TaskError::ShutDown);
                    return;
                }
                queue.push_back(task);
                drop(queue);
                self.main_ready.notify_all();
            }
        }
    }

    /// Drain the tasks queued for `affinity` at call time.
    ///
    /// Tasks enqueued while draining wait for the next call. Returns the
    /// number of tasks executed.
    pub fn update(&self, affinity: Affinity, context: &mut C) -> usize {
        if affinity == Affinity::Pool {
            return 0;
        }
        if !self.owner_matches() {
            error!("update(MAIN) called from a thread that does not own MAIN");
            return 0;
        }

        let pending = self.lock_queue().len();
        let mut ran = 0usize;
        for _ in 0..pending {
            let Some(task) = self.lock_queue().pop_front() else {
                break;
            };
            if let Err(e) = task.run(Some(&mut *context)) {
                warn!(task = %task.id(), error = %e, "main task failed");
            }
            ran = ran.saturating_add(1);
        }
        ran
    }

    /// Block until a MAIN task is queued, the scheduler closes or `timeout`
    /// elapses. Returns whether MAIN work is pending.
    pub fn wait_for_main(&self, timeout: Duration) -> bool {
        let queue = self.lock_queue();
        let (queue, _) = self
            .main_ready
            .wait_timeout_while(queue, timeout, |q| {
                q.is_empty() && !self.closed.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        !queue.is_empty()
    }

    /// Number of tasks waiting for `affinity`.
    pub fn queued(&self, affinity: Affinity) -> usize {
        match affinity {
            Affinity::Main => self.lock_queue().len(),
            Affinity::Pool => 0,
        }
    }

    /// Stop accepting MAIN tasks and abort those still queued.
    ///
    /// Threads blocked in [`Scheduler::call_main`] wake with
    /// [`TaskError::ShutDown`].
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut queue = self.lock_queue();
            self.closed.store(true, Ordering::Release);
            queue.drain(..).collect()
        };
        self.main_ready.notify_all();
        if !drained.is_empty() {
            debug!(count = drained.len(), "aborting queued main tasks");
        }
        for task in drained {
            task.abort(TaskError::ShutDown);
        }
    }

    /// Whether [`Scheduler::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` on MAIN and block until it returns.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::WouldDeadlock`] when called from MAIN, or the
    /// task's failure (panic, shutdown).
    pub fn call_main<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> T + Send + 'static,
    {
        let (task, rx) = self.prepare_call(f)?;
        task.wait()?;
        rx.try_recv()
            .map_err(|_| TaskError::Failed("main call produced no value".to_owned()))
    }

    /// [`Scheduler::call_main`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// As [`Scheduler::call_main`], plus [`TaskError::Failed`] on timeout.
    /// A timed-out task stays queued and still runs later.
    pub fn call_main_timeout<T, F>(&self, timeout: Duration, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> T + Send + 'static,
    {
        let (task, rx) = self.prepare_call(f)?;
        match task.wait_timeout(timeout) {
            Some(result) => result?,
            None => {
                return Err(TaskError::Failed(format!(
                    "main call timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
        rx.try_recv()
            .map_err(|_| TaskError::Failed("main call produced no value".to_owned()))
    }

    #[allow(clippy::type_complexity)]
    fn prepare_call<T, F>(
        &self,
        f: F,
    ) -> Result<(Arc<Task<C>>, std::sync::mpsc::Receiver<T>), TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> T + Send + 'static,
    {
        if self.is_main_thread() {
            return Err(TaskError::WouldDeadlock);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let task = Arc::new(Task::with_context(move |ctx: &mut C| {
            let _ = tx.send(f(ctx));
            Ok(())
        }));
        self.enqueue(Arc::clone(&task), Affinity::Main);
        Ok((task, rx))
    }

    fn owner_matches(&self) -> bool {
        match *self
            .main_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(owner) => owner == std::thread::current().id(),
            None => true,
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Arc<Task<C>>>> {
        self.main_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
