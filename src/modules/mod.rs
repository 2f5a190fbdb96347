//! Pluggable modules.
//!
//! A module is a unit of functionality (hardware driver, protocol bridge)
//! running on its own thread. The kernel knows it only through two traits:
//!
//! - [`ModuleFactory`]: registered under a backing file name, reports the
//!   module's name and builds a running instance from a [`ModuleContext`]
//! - [`Module`]: the running instance, polled by its thread and asked for a
//!   configuration dump or to stop through its control channel
//!
//! Factories are statically linked and collected in a [`ModuleRegistry`];
//! the [`supervisor`] resolves configured files against it.

pub mod monitor;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::bus::BusHandle;
use crate::config::{ConfigChecker, ConfigError, ConfigTree};
use crate::kernel::{CoreApi, ServiceRegistry};

pub use supervisor::ModuleSupervisor;

/// Module lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// No configuration is stored for the module.
    #[error("no configuration stored for module `{0}`")]
    MissingConfig(String),

    /// The module is already loaded.
    #[error("module `{0}` is already loaded")]
    AlreadyLoaded(String),

    /// No search directory contains the backing file.
    #[error("cannot find `{file}` for module `{name}` in any plugin directory")]
    FileNotFound {
        /// Module name.
        name: String,
        /// Configured backing file.
        file: String,
    },

    /// The backing file is not a known module implementation.
    #[error("`{0}` does not provide a known module")]
    UnknownImplementation(String),

    /// The implementation reports a different name than configured.
    #[error("module configured as `{configured}` reports itself as `{reported}`")]
    NameMismatch {
        /// Name from configuration.
        configured: String,
        /// Name reported by the implementation.
        reported: String,
    },

    /// The module is not loaded.
    #[error("module `{0}` is not loaded")]
    NotLoaded(String),

    /// The module is loaded but not running.
    #[error("module `{0}` is not running")]
    NotRunning(String),

    /// The module failed to start.
    #[error("module `{name}` failed to start: {reason}")]
    StartFailed {
        /// Module name.
        name: String,
        /// Failure reported by the module.
        reason: String,
    },

    /// The module did not answer a control request in time.
    #[error("module `{0}` did not answer in time")]
    Timeout(String),

    /// The module thread could not be spawned.
    #[error("failed to spawn thread for module `{name}`: {source}")]
    Spawn {
        /// Module name.
        name: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A runtime failure inside a module.
    #[error("{0}")]
    Runtime(String),

    /// Invalid module configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How a module is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the current iteration and exit; stays known to the supervisor.
    Soft,
    /// Exit and be forgotten by the supervisor.
    Hard,
}

/// A module's answer to a configuration dump request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDump {
    /// The module's current settings (`module_config`).
    pub module_config: ConfigTree,
    /// Extra files `(path, content)` the configuration depends on.
    pub additional_files: Vec<(String, String)>,
}

/// Kernel services shared with every module.
#[derive(Clone, Debug)]
pub struct SharedServices {
    /// Event bus.
    pub bus: BusHandle,
    /// Blocking RPC onto the kernel thread.
    pub core: CoreApi,
    /// Object-existence checker.
    pub checker: Arc<ConfigChecker>,
    /// Service registry.
    pub services: Arc<ServiceRegistry>,
    /// Async runtime for modules that do network I/O.
    pub runtime: Handle,
    /// Whether dangling object references are fatal.
    pub strict: bool,
}

/// Everything a module receives when it starts.
#[derive(Clone, Debug)]
pub struct ModuleContext {
    /// Configured module name.
    pub name: String,
    /// The `module_config` sub-tree.
    pub config: ConfigTree,
    /// Kernel services.
    pub shared: SharedServices,
}

/// A running module instance, owned by its thread.
pub trait Module: Send {
    /// Do one iteration of work, blocking at most about `timeout`.
    ///
    /// # Errors
    ///
    /// An error ends the module thread.
    fn poll(&mut self, timeout: Duration) -> Result<(), ModuleError>;

    /// Current configuration, for replication and saving.
    fn dump_config(&self) -> ConfigDump;

    /// Called once before the thread exits on request.
    fn stop(&mut self, _mode: StopMode) {}
}

/// Builds module instances. One factory per backing file.
pub trait ModuleFactory: Send + Sync {
    /// Name the implementation reports for itself.
    fn module_name(&self) -> &str;

    /// Create a running instance. Called on the module's own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable.
    fn start(&self, ctx: ModuleContext) -> Result<Box<dyn Module>, ModuleError>;
}

/// Module implementations keyed by backing file name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut files: Vec<_> = self.factories.keys().collect();
        files.sort();
        f.debug_struct("ModuleRegistry").field("files", &files).finish()
    }
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the modules shipped with the kernel.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(monitor::MODULE_FILE, Arc::new(monitor::MonitorFactory));
        registry
    }

    /// Bind `file` to a factory, replacing any previous binding.
    pub fn register(&mut self, file: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        self.factories.insert(file.into(), factory);
    }

    /// Factory bound to `file`.
    pub fn get(&self, file: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories.get(file).cloned()
    }
}
