//! Peer-to-peer configuration replication.
//!
//! `SYNC_FROM` starts two chained tasks:
//!
//! 1. fetch (POOL): a [`ConfigSource`] collects the peer's general config,
//!    module list and every module's config. Any failing call aborts.
//! 2. sync (MAIN): scheduled only when the peer's version is strictly newer
//!    than the local one captured when the request was accepted; applies the
//!    configuration through [`ReplicationHost::apply_remote_config`].
//!
//! The outcome is always delivered by one more MAIN task replying to the
//! requesting client, so the remote control endpoint never waits on the
//! network-bound fetch.

pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::codec::{self, ConfigFormat};
use crate::config::{ConfigError, ConfigTree};
use crate::message::Message;
use crate::modules::ModuleError;
use crate::remote::{commands, RemoteClient, RemoteError, RemoteSession, KO, OK};
use crate::scheduler::{Affinity, Scheduler, Task, TaskError};

pub use sync::SyncReport;

/// Bound for each call to the peer.
pub const FETCH_CALL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Failures while applying a peer configuration.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Configuration store failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Module reload failure.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Writing an additional file failed.
    #[error("failed to write {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An additional file path is relative or climbs with `..`.
    #[error("refusing to write additional file at `{0}`")]
    UnsafePath(String),

    /// The fetched data lacks a module it lists.
    #[error("peer listed module `{0}` but sent no configuration for it")]
    Incomplete(String),

    /// Restoring the previous configuration failed too.
    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        /// Original failure.
        cause: String,
        /// Rollback failure.
        rollback: String,
    },
}

// ---------------------------------------------------------------------------
// Fetched data
// ---------------------------------------------------------------------------

/// Everything fetched from a peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfig {
    general_config: ConfigTree,
    modules: Vec<String>,
    configs: HashMap<String, ConfigTree>,
    additional_files: HashMap<String, Vec<(String, String)>>,
}

impl RemoteConfig {
    /// Start from the peer's exportable general configuration.
    pub fn new(general_config: ConfigTree) -> Self {
        Self {
            general_config,
            ..Self::default()
        }
    }

    /// Record one module, in the peer's order.
    pub fn add_module(
        &mut self,
        name: impl Into<String>,
        entry: ConfigTree,
        additional_files: Vec<(String, String)>,
    ) {
        let name = name.into();
        if !self.modules.contains(&name) {
            self.modules.push(name.clone());
        }
        self.configs.insert(name.clone(), entry);
        self.additional_files.insert(name, additional_files);
    }

    /// Peer's general configuration.
    pub fn general_config(&self) -> &ConfigTree {
        &self.general_config
    }

    /// Version the peer reported, `0` when absent.
    pub fn version(&self) -> u64 {
        self.general_config
            .get_integer("version")
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    }

    /// Module names in the peer's order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Whether the peer runs `name`.
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m == name)
    }

    /// Configuration entry of `name`.
    pub fn module_config(&self, name: &str) -> Option<&ConfigTree> {
        self.configs.get(name)
    }

    /// Files attached to `name`.
    pub fn additional_files(&self, name: &str) -> &[(String, String)] {
        self.additional_files
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Where a replication fetch gets its data.
pub trait ConfigSource: Send {
    /// Collect the peer configuration.
    ///
    /// # Errors
    ///
    /// Any failing call aborts the whole fetch.
    fn fetch(&mut self) -> Result<RemoteConfig, RemoteError>;
}

/// Fetches a peer configuration over the remote control protocol with an
/// ephemeral client key.
#[derive(Debug, Clone)]
pub struct RemoteConfigCollector {
    endpoint: String,
    server_pubkey: String,
    runtime: Handle,
    call_timeout: Duration,
}

impl RemoteConfigCollector {
    /// Collector for the peer at `endpoint` with base64 key `server_pubkey`.
    pub fn new(endpoint: impl Into<String>, server_pubkey: impl Into<String>, runtime: Handle) -> Self {
        Self {
            endpoint: endpoint.into(),
            server_pubkey: server_pubkey.into(),
            runtime,
            call_timeout: FETCH_CALL_TIMEOUT,
        }
    }

    /// Change the per-call bound.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Async body of [`ConfigSource::fetch`].
    ///
    /// # Errors
    ///
    /// See [`ConfigSource::fetch`].
    pub async fn collect(&self) -> Result<RemoteConfig, RemoteError> {
        let mut client = tokio::time::timeout(
            self.call_timeout,
            RemoteClient::connect(&self.endpoint, &self.server_pubkey, None),
        )
        .await
        .map_err(|_| RemoteError::Timeout(format!("connection to {}", self.endpoint)))??
        .with_timeout(self.call_timeout);

        let mut reply = client
            .request_ok(&format_request(Message::new().with(commands::GENERAL_CONFIG)))
            .await?;
        let blob = single_frame(&mut reply, commands::GENERAL_CONFIG)?;
        let mut remote = RemoteConfig::new(codec::decode(&blob, ConfigFormat::Binary)?);

        let reply = client
            .request_ok(&Message::new().with(commands::MODULE_LIST))
            .await?;
        let names: Vec<String> = reply
            .parts()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();

        for name in names {
            let request = format_request(Message::new().with(commands::MODULE_CONFIG).with(name.as_str()));
            let mut reply = client.request_ok(&request).await?;
            let echoed = reply.pop_string()?;
            if echoed != name {
                return Err(RemoteError::Protocol(format!(
                    "asked for module {name}, got {echoed}"
                )));
            }
            let blob = reply.pop_front().ok_or_else(|| {
                RemoteError::Protocol(format!("no configuration for module {name}"))
            })?;
            if reply.len() % 2 != 0 {
                return Err(RemoteError::Protocol(format!(
                    "odd number of additional file frames for module {name}"
                )));
            }
            let mut files = Vec::with_capacity(reply.len() / 2);
            while !reply.is_empty() {
                files.push((reply.pop_string()?, reply.pop_string()?));
            }
            remote.add_module(&name, codec::decode(&blob, ConfigFormat::Binary)?, files);
        }

        info!(
            endpoint = %self.endpoint,
            version = remote.version(),
            modules = remote.modules().len(),
            "peer configuration fetched"
        );
        Ok(remote)
    }
}

fn format_request(mut msg: Message) -> Message {
    msg.push_u8(ConfigFormat::Binary.as_byte());
    msg
}

fn single_frame(reply: &mut Message, command: &str) -> Result<Vec<u8>, RemoteError> {
    if reply.len() != 1 {
        return Err(RemoteError::Protocol(format!(
            "{command} reply has {} frames, expected 1",
            reply.len()
        )));
    }
    reply
        .pop_front()
        .ok_or_else(|| RemoteError::Protocol(format!("empty {command} reply")))
}

impl ConfigSource for RemoteConfigCollector {
    fn fetch(&mut self) -> Result<RemoteConfig, RemoteError> {
        self.runtime.block_on(self.collect())
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// `SYNC_FROM` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Persist after a successful sync.
    pub autocommit: bool,
    /// Also replace the kernel settings (requires a restart).
    pub sync_general_config: bool,
}

/// Final result reported to the requesting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Fetched and applied.
    Success,
    /// Nothing was applied: fetch failed or the peer is not newer.
    Aborted(String),
    /// Applying failed.
    Failed(String),
}

impl ReplicationOutcome {
    /// Reply frames: `OK, id, SUCCESS` or `KO, id, ABORTED|FAILED, reason`.
    pub fn to_message(&self, id: Uuid) -> Message {
        let id = id.to_string();
        match self {
            Self::Success => Message::new().with(OK).with(id).with("SUCCESS"),
            Self::Aborted(reason) => Message::new()
                .with(KO)
                .with(id)
                .with("ABORTED")
                .with(reason.as_str()),
            Self::Failed(reason) => Message::new()
                .with(KO)
                .with(id)
                .with("FAILED")
                .with(reason.as_str()),
        }
    }
}

/// MAIN-side state a sync mutates.
pub trait ReplicationHost: 'static {
    /// Apply the peer configuration.
    ///
    /// # Errors
    ///
    /// Any failure is reported to the client as `FAILED`.
    fn apply_remote_config(
        &mut self,
        remote: &RemoteConfig,
        options: &SyncOptions,
    ) -> Result<(), SyncError>;
}

type FetchSlot = Arc<Mutex<Option<Result<RemoteConfig, RemoteError>>>>;

/// Start a replication. Returns the correlation id of the `DELAYED` reply.
///
/// `local_version` is the version at request time; the sync only runs if
/// the peer's is strictly greater.
pub fn start_sync<H: ReplicationHost>(
    scheduler: &Arc<Scheduler<H>>,
    mut source: Box<dyn ConfigSource>,
    local_version: u64,
    session: RemoteSession,
    options: SyncOptions,
) -> Uuid {
    let slot: FetchSlot = Arc::new(Mutex::new(None));

    let fetch_slot = Arc::clone(&slot);
    let fetch = Arc::new(Task::<H>::new(move || {
        let fetched = source.fetch();
        let result = match &fetched {
            Ok(_) => Ok(()),
            Err(e) => Err(TaskError::Failed(e.to_string())),
        };
        *fetch_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(fetched);
        result
    }));
    let id = fetch.id();

    let sched = Arc::clone(scheduler);
    fetch.on_complete(move |_| {
        let fetched = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match fetched {
            Some(Ok(remote)) if remote.version() > local_version => {
                schedule_apply(&sched, remote, id, session, options);
            }
            Some(Ok(remote)) => {
                let reason = format!(
                    "remote version {} is not newer than local version {local_version}",
                    remote.version()
                );
                info!(sync = %id, "{reason}");
                deliver(&sched, id, session, ReplicationOutcome::Aborted(reason));
            }
            Some(Err(e)) => {
                warn!(sync = %id, error = %e, "fetching peer configuration failed");
                deliver(&sched, id, session, ReplicationOutcome::Aborted(e.to_string()));
            }
            None => deliver(
                &sched,
                id,
                session,
                ReplicationOutcome::Aborted("fetch task did not run".to_owned()),
            ),
        }
    });

    scheduler.enqueue(fetch, Affinity::Pool);
    id
}

fn schedule_apply<H: ReplicationHost>(
    scheduler: &Arc<Scheduler<H>>,
    remote: RemoteConfig,
    id: Uuid,
    session: RemoteSession,
    options: SyncOptions,
) {
    let apply = Arc::new(Task::<H>::with_context(move |host: &mut H| {
        host.apply_remote_config(&remote, &options)
            .map_err(|e| TaskError::Failed(e.to_string()))
    }));

    let sched = Arc::clone(scheduler);
    apply.on_complete(move |result| {
        let outcome = match result {
            Ok(()) => ReplicationOutcome::Success,
            Err(TaskError::Failed(reason)) => ReplicationOutcome::Failed(reason.clone()),
            Err(e) => ReplicationOutcome::Failed(e.to_string()),
        };
        deliver(&sched, id, session, outcome);
    });
    scheduler.enqueue(apply, Affinity::Main);
}

fn deliver<H: ReplicationHost>(
    scheduler: &Arc<Scheduler<H>>,
    id: Uuid,
    session: RemoteSession,
    outcome: ReplicationOutcome,
) {
    let task = Arc::new(Task::<H>::new(move || {
        if !session.reply(outcome.to_message(id)) {
            warn!(sync = %id, "client left before the sync outcome was delivered");
        }
        Ok(())
    }));
    scheduler.enqueue(task, Affinity::Main);
}
