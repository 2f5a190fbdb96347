//! Blocking reads of kernel state for module threads.

use std::sync::Arc;
use std::time::Duration;

use super::{Kernel, KernelControl};
use crate::config::ConfigTree;
use crate::scheduler::{Scheduler, TaskError};

/// Queues a MAIN task per call and blocks until the kernel ran it.
///
/// Must not be used from MAIN itself: every call would return
/// [`TaskError::WouldDeadlock`].
#[derive(Clone, Debug)]
pub struct CoreApi {
    scheduler: Arc<Scheduler<Kernel>>,
}

impl CoreApi {
    /// API bound to `scheduler`'s MAIN queue.
    pub fn new(scheduler: Arc<Scheduler<Kernel>>) -> Self {
        Self { scheduler }
    }

    /// Current configuration version.
    ///
    /// # Errors
    ///
    /// Fails if the kernel is shut down or the call is made from MAIN.
    pub fn config_version(&self) -> Result<u64, TaskError> {
        self.scheduler.call_main(|k| k.store().config_version())
    }

    /// General configuration, version included.
    ///
    /// # Errors
    ///
    /// See [`CoreApi::config_version`].
    pub fn kernel_config(&self) -> Result<ConfigTree, TaskError> {
        self.scheduler.call_main(|k| k.store().get_general_config())
    }

    /// Configured instance name.
    ///
    /// # Errors
    ///
    /// See [`CoreApi::config_version`].
    pub fn instance_name(&self) -> Result<String, TaskError> {
        self.scheduler.call_main(|k| k.store().instance_name())
    }

    /// Time since the kernel started.
    ///
    /// # Errors
    ///
    /// See [`CoreApi::config_version`].
    pub fn uptime(&self) -> Result<Duration, TaskError> {
        self.scheduler.call_main(|k| k.uptime())
    }

    /// Names of every loaded module, in start order.
    ///
    /// # Errors
    ///
    /// See [`CoreApi::config_version`].
    pub fn modules_names(&self) -> Result<Vec<String>, TaskError> {
        self.scheduler.call_main(|k| k.supervisor().known_modules())
    }

    /// Local control endpoint.
    pub fn control(&self) -> KernelControl {
        KernelControl::new(Arc::clone(&self.scheduler))
    }
}
