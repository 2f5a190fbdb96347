//! Module supervisor.
//!
//! Loads module descriptors from stored configuration, orders them by
//! `level` (ties in load order), starts one thread per module and stops them
//! in reverse order. Owned and driven by the kernel thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{
    ConfigDump, Module, ModuleContext, ModuleError, ModuleFactory, ModuleRegistry,
    SharedServices, StopMode,
};
use crate::config::{ConfigStore, ConfigTree, ModuleEntry};

/// Upper bound for one module iteration.
pub const MODULE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a module may take to start or to exit.
pub const MODULE_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(5);

enum Control {
    Dump(mpsc::SyncSender<ConfigDump>),
    Stop(StopMode),
}

struct RunningModule {
    control: mpsc::Sender<Control>,
    exited: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

struct ModuleDescriptor {
    name: String,
    file: PathBuf,
    level: i64,
    seq: u64,
    entry: ConfigTree,
    factory: Arc<dyn ModuleFactory>,
    instance: Option<RunningModule>,
}

/// A module's full configuration entry, as replication and `SAVE` need it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfigDump {
    /// Module name.
    pub name: String,
    /// `{ name, file, level, module_config }` with the live `module_config`.
    pub entry: ConfigTree,
    /// Extra files `(path, content)` the module attached.
    pub additional_files: Vec<(String, String)>,
}

/// Loads, orders, starts and stops modules.
pub struct ModuleSupervisor {
    registry: ModuleRegistry,
    search_path: Vec<PathBuf>,
    modules: Vec<ModuleDescriptor>,
    next_seq: u64,
    shared: SharedServices,
}

impl std::fmt::Debug for ModuleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSupervisor")
            .field("search_path", &self.search_path)
            .field("modules", &self.known_modules())
            .finish()
    }
}

impl ModuleSupervisor {
    /// Create a supervisor with an empty search path.
    pub fn new(registry: ModuleRegistry, shared: SharedServices) -> Self {
        Self {
            registry,
            search_path: Vec::new(),
            modules: Vec::new(),
            next_seq: 0,
            shared,
        }
    }

    /// Append a directory to the search path. Duplicates are ignored.
    pub fn add_to_path(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if !self.search_path.contains(&dir) {
            debug!(dir = %dir.display(), "plugin directory added");
            self.search_path.push(dir);
        }
    }

    /// Directories searched for backing files, in order.
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Update whether modules started from now on run in strict mode.
    pub fn set_strict(&mut self, strict: bool) {
        self.shared.strict = strict;
    }

    /// Load every module that has stored configuration.
    ///
    /// # Errors
    ///
    /// Stops at the first module that fails to load.
    pub fn load_modules(&mut self, store: &ConfigStore) -> Result<(), ModuleError> {
        for name in store.module_names() {
            self.load_module(store, &name)?;
        }
        Ok(())
    }

    /// Create the descriptor for `name` from its stored configuration.
    ///
    /// # Errors
    ///
    /// Fails when no configuration is stored, the module is already loaded,
    /// no search directory contains the backing file, or the file is not a
    /// known implementation.
    pub fn load_module(&mut self, store: &ConfigStore, name: &str) -> Result<(), ModuleError> {
        let entry = store
            .load_config(name)
            .ok_or_else(|| ModuleError::MissingConfig(name.to_owned()))?;
        if self.is_known(name) {
            return Err(ModuleError::AlreadyLoaded(name.to_owned()));
        }
        let parsed: ModuleEntry = entry.deserialize_into()?;

        let file = self
            .resolve(&parsed.file)
            .ok_or_else(|| ModuleError::FileNotFound {
                name: name.to_owned(),
                file: parsed.file.clone(),
            })?;
        let file_name = Path::new(&parsed.file)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(parsed.file.as_str());
        let factory = self
            .registry
            .get(file_name)
            .ok_or_else(|| ModuleError::UnknownImplementation(parsed.file.clone()))?;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        let level = parsed.level;
        let at = self.modules.partition_point(|d| d.level <= level);
        self.modules.insert(
            at,
            ModuleDescriptor {
                name: name.to_owned(),
                file: file.clone(),
                level,
                seq,
                entry: entry.clone(),
                factory,
                instance: None,
            },
        );
        info!(module = %name, file = %file.display(), level, "module loaded");
        Ok(())
    }

    fn resolve(&self, file: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(file))
            .find(|candidate| candidate.is_file())
    }

    /// Start every loaded module that is not running, in level order.
    ///
    /// # Errors
    ///
    /// Stops at the first module that fails to start.
    pub fn init_modules(&mut self) -> Result<(), ModuleError> {
        let pending: Vec<String> = self
            .modules
            .iter()
            .filter(|d| d.instance.is_none())
            .map(|d| d.name.clone())
            .collect();
        for name in pending {
            self.init_module(&name)?;
        }
        Ok(())
    }

    /// Start one loaded module on its own thread.
    ///
    /// The implementation's reported name must equal the configured one.
    /// Blocks until the module reports that it started.
    ///
    /// # Errors
    ///
    /// Fails on a name mismatch, a spawn failure or a module start failure.
    pub fn init_module(&mut self, name: &str) -> Result<(), ModuleError> {
        let shared = self.shared.clone();
        let descriptor = self
            .modules
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| ModuleError::NotLoaded(name.to_owned()))?;
        if descriptor.instance.is_some() {
            return Ok(());
        }

        let reported = descriptor.factory.module_name();
        if reported != name {
            return Err(ModuleError::NameMismatch {
                configured: name.to_owned(),
                reported: reported.to_owned(),
            });
        }

        let ctx = ModuleContext {
            name: name.to_owned(),
            config: descriptor.entry.child("module_config").unwrap_or_default(),
            shared,
        };
        let factory = Arc::clone(&descriptor.factory);
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let (exit_tx, exit_rx) = mpsc::channel::<()>();

        let thread_name = name.to_owned();
        let thread = std::thread::Builder::new()
            .name(format!("module-{name}"))
            .spawn(move || {
                let _exit = exit_tx;
                let module = match factory.start(ctx) {
                    Ok(module) => {
                        let _ = ready_tx.send(Ok(()));
                        module
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                module_loop(&thread_name, module, &control_rx);
            })
            .map_err(|source| ModuleError::Spawn {
                name: name.to_owned(),
                source,
            })?;

        match ready_rx.recv_timeout(MODULE_LIFECYCLE_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(ModuleError::StartFailed {
                    name: name.to_owned(),
                    reason,
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                return Err(ModuleError::StartFailed {
                    name: name.to_owned(),
                    reason: "module thread exited during start".to_owned(),
                });
            }
            Err(RecvTimeoutError::Timeout) => return Err(ModuleError::Timeout(name.to_owned())),
        }

        descriptor.instance = Some(RunningModule {
            control: control_tx,
            exited: exit_rx,
            thread,
        });
        info!(module = %name, level = descriptor.level, "module started");
        Ok(())
    }

    /// Stop every running module, last started first.
    ///
    /// A soft stop keeps the descriptors loaded so the modules can be
    /// started again. A hard stop forgets them.
    pub fn stop_modules(&mut self, mode: StopMode) {
        for descriptor in self.modules.iter_mut().rev() {
            if let Some(instance) = descriptor.instance.take() {
                stop_instance(&descriptor.name, instance, mode);
            }
        }
        if mode == StopMode::Hard {
            for descriptor in self.modules.drain(..) {
                debug!(module = %descriptor.name, "module unloaded");
            }
        }
    }

    /// Stop one module.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NotLoaded`] for an unknown module.
    pub fn stop_module(&mut self, name: &str, mode: StopMode) -> Result<(), ModuleError> {
        let index = self
            .modules
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| ModuleError::NotLoaded(name.to_owned()))?;
        if let Some(instance) = self.modules.get_mut(index).and_then(|d| d.instance.take()) {
            stop_instance(name, instance, mode);
        }
        if mode == StopMode::Hard {
            self.modules.remove(index);
        }
        Ok(())
    }

    /// Ask a running module for its configuration.
    ///
    /// # Errors
    ///
    /// Fails if the module is not loaded, not running, or does not answer
    /// within `timeout`.
    pub fn dump_config(&self, name: &str, timeout: Duration) -> Result<ModuleConfigDump, ModuleError> {
        let descriptor = self
            .modules
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ModuleError::NotLoaded(name.to_owned()))?;
        let instance = descriptor
            .instance
            .as_ref()
            .ok_or_else(|| ModuleError::NotRunning(name.to_owned()))?;

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        instance
            .control
            .send(Control::Dump(reply_tx))
            .map_err(|_| ModuleError::NotRunning(name.to_owned()))?;
        let dump = reply_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ModuleError::Timeout(name.to_owned()),
            RecvTimeoutError::Disconnected => ModuleError::NotRunning(name.to_owned()),
        })?;

        let mut entry = descriptor.entry.clone();
        entry.insert_child("module_config", dump.module_config);
        Ok(ModuleConfigDump {
            name: name.to_owned(),
            entry,
            additional_files: dump.additional_files,
        })
    }

    /// Names of modules whose thread is alive, in start order.
    pub fn running_modules(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|d| {
                d.instance
                    .as_ref()
                    .is_some_and(|i| !i.thread.is_finished())
            })
            .map(|d| d.name.clone())
            .collect()
    }

    /// Names of every loaded module, in start order.
    pub fn known_modules(&self) -> Vec<String> {
        self.modules.iter().map(|d| d.name.clone()).collect()
    }

    /// Whether `name` is loaded.
    pub fn is_known(&self, name: &str) -> bool {
        self.modules.iter().any(|d| d.name == name)
    }

    /// Resolved backing file of a loaded module.
    pub fn module_file(&self, name: &str) -> Option<&Path> {
        self.modules
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.file.as_path())
    }

    /// Load order key of a loaded module: `(level, sequence)`.
    pub fn order_key(&self, name: &str) -> Option<(i64, u64)> {
        self.modules
            .iter()
            .find(|d| d.name == name)
            .map(|d| (d.level, d.seq))
    }
}

impl Drop for ModuleSupervisor {
    fn drop(&mut self) {
        self.stop_modules(StopMode::Hard);
    }
}

fn module_loop(name: &str, mut module: Box<dyn Module>, control: &mpsc::Receiver<Control>) {
    loop {
        match control.try_recv() {
            Ok(Control::Dump(reply)) => {
                let _ = reply.send(module.dump_config());
                continue;
            }
            Ok(Control::Stop(mode)) => {
                module.stop(mode);
                debug!(module = %name, ?mode, "module thread exiting");
                return;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                module.stop(StopMode::Hard);
                return;
            }
        }
        if let Err(e) = module.poll(MODULE_POLL_INTERVAL) {
            error!(module = %name, error = %e, "module stopped on error");
            return;
        }
    }
}

fn stop_instance(name: &str, instance: RunningModule, mode: StopMode) {
    let _ = instance.control.send(Control::Stop(mode));
    match instance.exited.recv_timeout(MODULE_LIFECYCLE_TIMEOUT) {
        Err(RecvTimeoutError::Timeout) => {
            warn!(module = %name, "module did not exit in time, detaching its thread");
        }
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if instance.thread.join().is_err() {
                error!(module = %name, "module thread panicked");
            }
            info!(module = %name, ?mode, "module stopped");
        }
    }
}
