//! The kernel: owner of the MAIN thread.
//!
//! The kernel holds every piece of state that must only be mutated on MAIN
//! (configuration store, module supervisor) and runs the loop that drains
//! MAIN tasks. Other threads reach it only through tasks:
//!
//! - [`CoreApi`]: blocking reads for module threads
//! - [`KernelControl`]: local control requests (restart, reset, netconfig)
//! - [`KernelHandle`]: shutdown, restart and reload notifications, used by
//!   signal handlers
//! - remote control requests, queued by the server's request sink

pub mod control;
pub mod core_api;
pub mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{topics, BusHandle, EventBus};
use crate::config::{ConfigChecker, ConfigError, ConfigStore, ConfigTree, RuntimePaths};
use crate::message::Message;
use crate::modules::supervisor::ModuleConfigDump;
use crate::modules::{ModuleError, ModuleRegistry, ModuleSupervisor, SharedServices, StopMode};
use crate::remote::{
    self, KeyPair, RemoteControlSecurity, RemoteHost, RemoteServer, RemoteSession, RequestSink,
    SyncRequest,
};
use crate::replication::{
    self, RemoteConfig, RemoteConfigCollector, ReplicationHost, SyncError, SyncOptions,
};
use crate::scheduler::{Affinity, Scheduler, Task};

pub use control::KernelControl;
pub use core_api::CoreApi;
pub use services::{ServiceError, ServiceRegistry};

/// Upper bound of one MAIN loop wait.
pub const MAIN_LOOP_TIMEOUT: Duration = Duration::from_millis(25);

/// Time the loop keeps running after modules were asked to stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bound for a module's answer to a configuration dump request.
pub const MODULE_DUMP_TIMEOUT: Duration = Duration::from_secs(1);

/// The MAIN context.
pub struct Kernel {
    store: ConfigStore,
    supervisor: ModuleSupervisor,
    scheduler: Arc<Scheduler<Kernel>>,
    checker: Arc<ConfigChecker>,
    services: Arc<ServiceRegistry>,
    security: Arc<RemoteControlSecurity>,
    bus: BusHandle,
    runtime: Handle,
    remote: Option<RemoteServer>,
    paths: RuntimePaths,
    running: bool,
    want_restart: bool,
    start_time: Instant,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("instance", &self.store.instance_name())
            .field("version", &self.store.config_version())
            .field("modules", &self.supervisor.known_modules())
            .field("remote", &self.remote_addr())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Build a kernel from a loaded configuration.
    ///
    /// Starts the event bus and, when a `[remote]` section is present, binds
    /// the remote control endpoint. Requests received before [`Kernel::run`]
    /// wait in the MAIN queue. Must be called outside async code, since
    /// binding blocks on `runtime`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid `[remote]` section, bad keys or a port that
    /// cannot be bound.
    pub fn new(
        store: ConfigStore,
        runtime: Handle,
        registry: ModuleRegistry,
        paths: RuntimePaths,
    ) -> anyhow::Result<Self> {
        let remote_settings = store
            .remote_settings()
            .context("invalid [remote] section")?;
        let security = match &remote_settings {
            Some(settings) => RemoteControlSecurity::from_settings(settings.security.as_ref())
                .context("invalid remote security section")?,
            None => RemoteControlSecurity::open(),
        };

        let scheduler = Arc::new(Scheduler::new());
        let checker = Arc::new(ConfigChecker::new());
        let services = Arc::new(ServiceRegistry::new());
        let bus = EventBus::start(&runtime);

        let shared = SharedServices {
            bus: bus.clone(),
            core: CoreApi::new(Arc::clone(&scheduler)),
            checker: Arc::clone(&checker),
            services: Arc::clone(&services),
            runtime: runtime.clone(),
            strict: store.strict_mode(),
        };
        let mut supervisor = ModuleSupervisor::new(registry, shared);
        for dir in store.plugin_directories() {
            supervisor.add_to_path(dir);
        }

        let mut kernel = Self {
            store,
            supervisor,
            scheduler,
            checker,
            services,
            security: Arc::new(security),
            bus,
            runtime,
            remote: None,
            paths,
            running: true,
            want_restart: false,
            start_time: Instant::now(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        };

        if let Some(settings) = remote_settings {
            let keypair = KeyPair::from_base64(&settings.secret_key, &settings.public_key)
                .context("invalid remote control key pair")?;
            let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
            let sink = kernel.request_sink();
            let server = kernel
                .runtime
                .block_on(RemoteServer::bind(addr, keypair, sink))
                .with_context(|| format!("failed to bind remote control on port {}", settings.port))?;
            kernel.remote = Some(server);
        }

        info!(
            instance = %kernel.store.instance_name(),
            version = kernel.store.config_version(),
            "kernel created"
        );
        Ok(kernel)
    }

    /// Change how long the loop keeps running after the soft stop.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Handle for signal handlers and tests.
    pub fn handle(&self) -> KernelHandle {
        KernelHandle {
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// Blocking RPC entry point handed to modules.
    pub fn core_api(&self) -> CoreApi {
        CoreApi::new(Arc::clone(&self.scheduler))
    }

    /// Address of the remote control endpoint, if one is bound.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote.as_ref().map(RemoteServer::local_addr)
    }

    /// Configuration store.
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Module supervisor.
    pub fn supervisor(&self) -> &ModuleSupervisor {
        &self.supervisor
    }

    /// Event bus.
    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Service registry shared with modules.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Object-existence checker shared with modules.
    pub fn checker(&self) -> &Arc<ConfigChecker> {
        &self.checker
    }

    /// Paths resolved from the environment.
    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Time since the kernel was created.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether the loop keeps going.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the kernel asked to be rebuilt after it returns.
    pub fn restart_requested(&self) -> bool {
        self.want_restart
    }

    /// Leave the loop at the end of the current iteration.
    pub fn shutdown_later(&mut self) {
        self.running = false;
    }

    /// Leave the loop and ask the caller to rebuild the kernel.
    pub fn restart_later(&mut self) {
        info!("kernel restart requested");
        self.want_restart = true;
        self.running = false;
    }

    /// Boot the modules and run the MAIN loop until shutdown.
    ///
    /// Returns whether a restart was requested.
    ///
    /// # Errors
    ///
    /// Module load or start failures abort the boot.
    pub fn run(mut self) -> anyhow::Result<bool> {
        self.scheduler.register_thread(Affinity::Main);

        self.supervisor
            .load_modules(&self.store)
            .context("failed to load modules")?;
        self.supervisor
            .init_modules()
            .context("failed to start modules")?;

        self.publish_notice(topics::SYSTEM_READY);
        info!(
            modules = ?self.supervisor.running_modules(),
            remote = ?self.remote_addr(),
            "kernel ready"
        );

        while self.running {
            self.poll_once();
        }

        self.shutdown();
        Ok(self.want_restart)
    }

    /// Wait for MAIN work up to [`MAIN_LOOP_TIMEOUT`] and drain it.
    /// Returns the number of tasks executed.
    pub fn poll_once(&mut self) -> usize {
        self.scheduler.wait_for_main(MAIN_LOOP_TIMEOUT);
        let scheduler = Arc::clone(&self.scheduler);
        scheduler.update(Affinity::Main, self)
    }

    fn shutdown(&mut self) {
        info!(grace_ms = self.shutdown_grace.as_millis(), "kernel shutting down");
        let autosave = self.store.autosave();
        if autosave {
            self.refresh_module_configs();
        }
        self.supervisor.stop_modules(StopMode::Soft);

        let deadline = Instant::now()
            .checked_add(self.shutdown_grace)
            .unwrap_or_else(Instant::now);
        while Instant::now() < deadline {
            self.poll_once();
        }

        self.scheduler.close();
        if let Some(server) = self.remote.take() {
            server.shutdown();
        }
        self.supervisor.stop_modules(StopMode::Hard);

        if autosave {
            match self.store.save() {
                Ok(()) => info!("configuration saved on shutdown"),
                Err(e) => error!(error = %e, "autosave failed"),
            }
        }
        debug!("kernel stopped");
    }

    fn publish_notice(&self, notice: &str) {
        let msg = Message::new().with(topics::KERNEL).with(notice);
        if let Err(e) = self.bus.publish(msg) {
            warn!(notice, error = %e, "failed to publish kernel notice");
        }
    }

    /// Ask every running module for its configuration and store it, then
    /// write the configuration file.
    ///
    /// # Errors
    ///
    /// Fails if there is no backing file or it cannot be written.
    pub fn save_config(&mut self) -> Result<(), ConfigError> {
        self.refresh_module_configs();
        self.store.save()
    }

    /// Replace each running module's stored entry with its live dump.
    fn refresh_module_configs(&mut self) {
        for name in self.supervisor.running_modules() {
            match self.supervisor.dump_config(&name, MODULE_DUMP_TIMEOUT) {
                Ok(dump) => {
                    self.store.store_config(&name, dump.entry);
                }
                Err(e) => warn!(module = %name, error = %e, "keeping stored configuration"),
            }
        }
    }

    fn request_sink(&self) -> RequestSink {
        let scheduler = Arc::clone(&self.scheduler);
        let security = Arc::clone(&self.security);
        Arc::new(move |session: RemoteSession, msg: Message| {
            let security = Arc::clone(&security);
            let task = Arc::new(Task::with_context(move |kernel: &mut Kernel| {
                let reply = remote::dispatch(kernel, &security, &session, msg);
                if !session.reply(reply) {
                    debug!(client = %session.peer_key(), "client left before the reply");
                }
                Ok(())
            }));
            scheduler.enqueue(task, Affinity::Main);
        })
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // Callers blocked in `call_main` must not wait on a dead loop.
        self.scheduler.close();
    }
}

// ---------------------------------------------------------------------------
// Remote control and replication
// ---------------------------------------------------------------------------

impl RemoteHost for Kernel {
    fn running_modules(&self) -> Vec<String> {
        self.supervisor.running_modules()
    }

    fn module_config(&self, name: &str) -> Result<ModuleConfigDump, ModuleError> {
        self.supervisor.dump_config(name, MODULE_DUMP_TIMEOUT)
    }

    fn exportable_general_config(&self) -> Result<ConfigTree, ConfigError> {
        self.store.get_exportable_general_config()
    }

    fn config_version(&self) -> u64 {
        self.store.config_version()
    }

    fn save_config(&mut self) -> Result<(), ConfigError> {
        Kernel::save_config(self)
    }

    fn sync_from(&mut self, request: SyncRequest, session: RemoteSession) -> Uuid {
        let source = RemoteConfigCollector::new(
            request.endpoint,
            request.remote_pubkey,
            self.runtime.clone(),
        );
        let options = SyncOptions {
            autocommit: request.autocommit,
            sync_general_config: request.sync_general_config,
        };
        replication::start_sync(
            &self.scheduler,
            Box::new(source),
            self.store.config_version(),
            session,
            options,
        )
    }
}

impl ReplicationHost for Kernel {
    fn apply_remote_config(
        &mut self,
        remote: &RemoteConfig,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        let report = replication::sync::apply(
            &mut self.store,
            &mut self.supervisor,
            &self.checker,
            remote,
            options,
        )?;
        if report.restart_required {
            self.restart_later();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable, thread-safe way to poke a running kernel.
#[derive(Clone, Debug)]
pub struct KernelHandle {
    scheduler: Arc<Scheduler<Kernel>>,
}

impl KernelHandle {
    fn post(&self, f: impl FnOnce(&mut Kernel) + Send + 'static) {
        let task = Arc::new(Task::with_context(move |kernel: &mut Kernel| {
            f(kernel);
            Ok(())
        }));
        self.scheduler.enqueue(task, Affinity::Main);
    }

    /// Stop the kernel without restarting it.
    pub fn shutdown(&self) {
        self.post(|kernel| {
            info!("shutdown requested");
            kernel.shutdown_later();
        });
    }

    /// Stop the kernel and ask for a restart.
    pub fn restart(&self) {
        self.post(Kernel::restart_later);
    }

    /// Broadcast a reload notice to modules.
    pub fn reload(&self) {
        self.post(|kernel| {
            info!("reload requested");
            kernel.publish_notice(topics::SIGHUP);
        });
    }

    /// Local control endpoint.
    pub fn control(&self) -> KernelControl {
        KernelControl::new(Arc::clone(&self.scheduler))
    }

    /// Blocking RPC entry point.
    pub fn core_api(&self) -> CoreApi {
        CoreApi::new(Arc::clone(&self.scheduler))
    }
}
