//! Remote control service.
//!
//! - [`transport`]: Noise-authenticated TCP transport for [`Message`]s
//! - [`permission`]: per-client command permissions
//! - [`client`]: request/reply client used by replication and the CLI
//!
//! The server accepts connections on the runtime and hands every request to
//! a [`RequestSink`]; the kernel's sink queues a MAIN task that runs
//! [`dispatch`] against the kernel and replies through the [`RemoteSession`].
//!
//! Commands (first frame), arguments and replies:
//!
//! | command          | arguments                                        | reply                                   |
//! |------------------|--------------------------------------------------|-----------------------------------------|
//! | `MODULE_LIST`    |                                                  | `OK, name*`                             |
//! | `MODULE_CONFIG`  | `name, format`                                   | `OK, name, blob, (file, content)*`      |
//! | `GENERAL_CONFIG` | `format`                                         | `OK, blob`                              |
//! | `CONFIG_VERSION` |                                                  | `OK, u64`                               |
//! | `SAVE`           |                                                  | `OK`                                    |
//! | `SYNC_FROM`      | `endpoint, autocommit, pubkey, sync_general`     | `DELAYED, id`, later the outcome        |

pub mod client;
pub mod permission;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::codec::{self, ConfigFormat};
use crate::config::{ConfigError, ConfigTree};
use crate::message::{Message, MessageError};
use crate::modules::supervisor::ModuleConfigDump;
use crate::modules::ModuleError;

pub use client::{request_from_args, RemoteClient};
pub use permission::{PermissionEntry, RemoteControlSecurity};
pub use transport::{KeyPair, SecureChannel};

/// Success status frame.
pub const OK: &str = "OK";
/// Failure status frame.
pub const KO: &str = "KO";
/// Status frame of a request answered later.
pub const DELAYED: &str = "DELAYED";
/// Reason sent for unknown commands.
pub const UNKNOWN_MESSAGE: &str = "UNKNOWN MESSAGE";
/// Reason sent when permissions forbid a command.
pub const PERMISSION_DENIED: &str = "PERMISSION DENIED";

/// Remote command names.
pub mod commands {
    /// List running modules.
    pub const MODULE_LIST: &str = "MODULE_LIST";
    /// Dump one module's configuration.
    pub const MODULE_CONFIG: &str = "MODULE_CONFIG";
    /// Dump the exportable general configuration.
    pub const GENERAL_CONFIG: &str = "GENERAL_CONFIG";
    /// Current configuration version.
    pub const CONFIG_VERSION: &str = "CONFIG_VERSION";
    /// Persist the configuration.
    pub const SAVE: &str = "SAVE";
    /// Replicate from a peer.
    pub const SYNC_FROM: &str = "SYNC_FROM";
}

/// Remote control and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Socket error.
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Noise protocol failure.
    #[error("noise error: {0}")]
    Noise(String),

    /// The peer failed authentication.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A key is not a base64 32-byte key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An operation exceeded its time bound.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The connection closed.
    #[error("connection closed")]
    Closed,

    /// A frame could not be decoded.
    #[error("malformed message: {0}")]
    Message(#[from] MessageError),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered `KO`.
    #[error("peer refused {command}: {reason}")]
    Refused {
        /// Command that was refused.
        command: String,
        /// Reason sent by the peer.
        reason: String,
    },

    /// A configuration payload was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Sessions and requests
// ---------------------------------------------------------------------------

/// Identity of one request's client, used to route replies.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    id: Uuid,
    peer_key: String,
    replies: mpsc::UnboundedSender<Message>,
}

impl RemoteSession {
    /// Session addressed to `replies`.
    pub fn new(peer_key: impl Into<String>, replies: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_key: peer_key.into(),
            replies,
        }
    }

    /// Request identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Client public key, base64.
    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    /// Send a message to the client. Returns `false` if it disconnected.
    pub fn reply(&self, msg: Message) -> bool {
        self.replies.send(msg).is_ok()
    }
}

/// Arguments of `SYNC_FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Peer endpoint, `host:port`.
    pub endpoint: String,
    /// Persist the configuration after a successful sync.
    pub autocommit: bool,
    /// Peer server public key, base64.
    pub remote_pubkey: String,
    /// Also replace the kernel settings.
    pub sync_general_config: bool,
}

/// What the remote service needs from the kernel.
pub trait RemoteHost {
    /// Names of running modules.
    fn running_modules(&self) -> Vec<String>;

    /// Ask a module for its configuration entry.
    ///
    /// # Errors
    ///
    /// Fails if the module is unknown or does not answer.
    fn module_config(&self, name: &str) -> Result<ModuleConfigDump, ModuleError>;

    /// General configuration allowed to leave the unit.
    ///
    /// # Errors
    ///
    /// Fails on an invalid export policy.
    fn exportable_general_config(&self) -> Result<ConfigTree, ConfigError>;

    /// Current configuration version.
    fn config_version(&self) -> u64;

    /// Persist the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be written.
    fn save_config(&mut self) -> Result<(), ConfigError>;

    /// Start replication. The outcome is delivered later through `session`.
    /// Returns the correlation id sent in the `DELAYED` reply.
    fn sync_from(&mut self, request: SyncRequest, session: RemoteSession) -> Uuid;
}

fn ko(reason: impl Into<Vec<u8>>) -> Message {
    Message::new().with(KO).with(reason)
}

fn malformed(command: &str) -> Message {
    ko(format!("Malformed message: {command}"))
}

/// Check permissions and run one remote command against `host`.
///
/// `msg` starts with the command name. Returns the immediate reply.
pub fn dispatch<H: RemoteHost + ?Sized>(
    host: &mut H,
    security: &RemoteControlSecurity,
    session: &RemoteSession,
    mut msg: Message,
) -> Message {
    let Ok(command) = msg.pop_string() else {
        return ko(UNKNOWN_MESSAGE);
    };

    if !security.allow_request(session.peer_key(), &command) {
        warn!(client = %session.peer_key(), command = %command, "remote command denied");
        return ko(PERMISSION_DENIED);
    }
    debug!(client = %session.peer_key(), command = %command, "remote command");

    let reply = match command.as_str() {
        commands::MODULE_LIST => handle_module_list(host, &msg),
        commands::MODULE_CONFIG => handle_module_config(host, &mut msg),
        commands::GENERAL_CONFIG => handle_general_config(host, &mut msg),
        commands::CONFIG_VERSION => handle_config_version(host, &msg),
        commands::SAVE => handle_save(host, &msg),
        commands::SYNC_FROM => handle_sync_from(host, session, &mut msg),
        _ => return ko(UNKNOWN_MESSAGE),
    };
    reply.unwrap_or_else(|| malformed(&command))
}

fn handle_module_list<H: RemoteHost + ?Sized>(host: &H, msg: &Message) -> Option<Message> {
    if !msg.is_empty() {
        return None;
    }
    let mut reply = Message::new().with(OK);
    for name in host.running_modules() {
        reply.push(name);
    }
    Some(reply)
}

fn pop_format(msg: &mut Message) -> Option<ConfigFormat> {
    msg.pop_u8().ok().and_then(ConfigFormat::from_byte)
}

fn handle_module_config<H: RemoteHost + ?Sized>(host: &H, msg: &mut Message) -> Option<Message> {
    if msg.len() != 2 {
        return None;
    }
    let name = msg.pop_string().ok()?;
    let format = pop_format(msg)?;

    let dump = match host.module_config(&name) {
        Ok(dump) => dump,
        Err(e) => return Some(ko(e.to_string())),
    };
    let blob = match codec::encode(&dump.entry, format) {
        Ok(blob) => blob,
        Err(e) => return Some(ko(e.to_string())),
    };
    let mut reply = Message::new().with(OK).with(name).with(blob);
    for (file, content) in dump.additional_files {
        reply.push(file);
        reply.push(content);
    }
    Some(reply)
}

fn handle_general_config<H: RemoteHost + ?Sized>(host: &H, msg: &mut Message) -> Option<Message> {
    if msg.len() != 1 {
        return None;
    }
    let format = pop_format(msg)?;
    let reply = host
        .exportable_general_config()
        .and_then(|tree| codec::encode(&tree, format));
    Some(match reply {
        Ok(blob) => Message::new().with(OK).with(blob),
        Err(e) => ko(e.to_string()),
    })
}

fn handle_config_version<H: RemoteHost + ?Sized>(host: &H, msg: &Message) -> Option<Message> {
    if !msg.is_empty() {
        return None;
    }
    let mut reply = Message::new().with(OK);
    reply.push_u64(host.config_version());
    Some(reply)
}

fn handle_save<H: RemoteHost + ?Sized>(host: &mut H, msg: &Message) -> Option<Message> {
    if !msg.is_empty() {
        return None;
    }
    Some(match host.save_config() {
        Ok(()) => Message::new().with(OK),
        Err(e) => ko(e.to_string()),
    })
}

fn handle_sync_from<H: RemoteHost + ?Sized>(
    host: &mut H,
    session: &RemoteSession,
    msg: &mut Message,
) -> Option<Message> {
    if msg.len() != 4 {
        return None;
    }
    let request = SyncRequest {
        endpoint: msg.pop_string().ok()?,
        autocommit: msg.pop_bool().ok()?,
        remote_pubkey: msg.pop_string().ok()?,
        sync_general_config: msg.pop_bool().ok()?,
    };
    info!(client = %session.peer_key(), endpoint = %request.endpoint, "sync requested");
    let id = host.sync_from(request, session.clone());
    Some(Message::new().with(DELAYED).with(id.to_string()))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Receives every authenticated request with its session.
pub type RequestSink = Arc<dyn Fn(RemoteSession, Message) + Send + Sync>;

/// Running remote control endpoint.
#[derive(Debug)]
pub struct RemoteServer {
    local_addr: SocketAddr,
    accept_loop: tokio::task::JoinHandle<()>,
}

impl RemoteServer {
    /// Listen on `addr` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        keypair: KeyPair,
        sink: RequestSink,
    ) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, key = %keypair.public_base64(), "remote control listening");
        let accept_loop = tokio::spawn(accept_loop(listener, keypair, sink));
        Ok(Self {
            local_addr,
            accept_loop,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        self.accept_loop.abort();
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(listener: TcpListener, keypair: KeyPair, sink: RequestSink) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, keypair.clone(), Arc::clone(&sink)));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    keypair: KeyPair,
    sink: RequestSink,
) {
    let mut channel = match SecureChannel::accept(stream, &keypair).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(peer = %peer, error = %e, "remote handshake failed");
            return;
        }
    };
    let client = channel.peer_key_base64();
    debug!(peer = %peer, client = %client, "remote client connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    loop {
        tokio::select! {
            incoming = channel.recv() => match incoming {
                Ok(Some(msg)) => sink(RemoteSession::new(client.clone(), tx.clone()), msg),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "remote connection error");
                    break;
                }
            },
            Some(reply) = rx.recv() => {
                if let Err(e) = channel.send(&reply).await {
                    warn!(peer = %peer, error = %e, "failed to send remote reply");
                    break;
                }
            }
        }
    }
    debug!(peer = %peer, "remote client disconnected");
}
