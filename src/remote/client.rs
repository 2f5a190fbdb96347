//! Request/reply client for the remote control protocol.

use std::time::Duration;

use tracing::debug;

use super::transport::{decode_key, KeyPair, SecureChannel};
use super::{commands, RemoteError, KO};
use crate::config::ConfigFormat;
use crate::message::Message;

/// Default bound for one request/reply exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

/// Authenticated connection to a remote control endpoint.
#[derive(Debug)]
pub struct RemoteClient {
    channel: SecureChannel,
    timeout: Duration,
}

impl RemoteClient {
    /// Connect to `endpoint`, authenticating the server with its base64
    /// public key. Uses `keypair` as client identity, or an ephemeral one.
    ///
    /// # Errors
    ///
    /// Fails on invalid key, connect error or handshake failure.
    pub async fn connect(
        endpoint: &str,
        server_pubkey: &str,
        keypair: Option<KeyPair>,
    ) -> Result<Self, RemoteError> {
        let server_key = decode_key(server_pubkey)?;
        let keypair = match keypair {
            Some(kp) => kp,
            None => KeyPair::generate()?,
        };
        let channel = SecureChannel::connect(endpoint, &server_key, &keypair).await?;
        debug!(endpoint = %endpoint, "connected to remote control");
        Ok(Self {
            channel,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Change the per-exchange time bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `msg` and wait for the reply.
    ///
    /// # Errors
    ///
    /// Fails on transport error, timeout or closed connection.
    pub async fn request(&mut self, msg: &Message) -> Result<Message, RemoteError> {
        self.channel.send(msg).await?;
        self.receive().await
    }

    /// Send `msg`, wait for the reply and strip the `OK` status frame.
    ///
    /// # Errors
    ///
    /// As [`RemoteClient::request`], plus [`RemoteError::Refused`] when the
    /// peer answers `KO`.
    pub async fn request_ok(&mut self, msg: &Message) -> Result<Message, RemoteError> {
        let command = msg.str_at(0).unwrap_or_default().to_owned();
        let mut reply = self.request(msg).await?;
        let status = reply.pop_string()?;
        if status == KO {
            let reason = reply.pop_string().unwrap_or_default();
            return Err(RemoteError::Refused { command, reason });
        }
        if status != super::OK {
            return Err(RemoteError::Protocol(format!(
                "unexpected status {status:?} for {command}"
            )));
        }
        Ok(reply)
    }

    /// Wait for the next message from the server.
    ///
    /// # Errors
    ///
    /// Fails on transport error, timeout or closed connection.
    pub async fn receive(&mut self) -> Result<Message, RemoteError> {
        self.receive_within(self.timeout).await
    }

    /// [`RemoteClient::receive`] with an explicit bound.
    ///
    /// # Errors
    ///
    /// As [`RemoteClient::receive`].
    pub async fn receive_within(&mut self, timeout: Duration) -> Result<Message, RemoteError> {
        match tokio::time::timeout(timeout, self.channel.recv()).await {
            Ok(Ok(Some(msg))) => Ok(msg),
            Ok(Ok(None)) => Err(RemoteError::Closed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RemoteError::Timeout("remote reply".to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Command-line requests
// ---------------------------------------------------------------------------

fn parse_format(arg: &str) -> Option<u8> {
    match arg.to_ascii_lowercase().as_str() {
        "0" | "binary" => Some(ConfigFormat::Binary.as_byte()),
        "1" | "text" => Some(ConfigFormat::Text.as_byte()),
        _ => None,
    }
}

fn parse_bool(arg: &str) -> Option<bool> {
    match arg.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Build a request from textual arguments.
///
/// Config formats are written `binary`/`text` (or `0`/`1`), booleans
/// `true`/`false` (or `1`/`0`). Arguments of unknown commands are sent
/// verbatim.
///
/// # Errors
///
/// Returns [`RemoteError::Protocol`] when an argument cannot be converted.
pub fn request_from_args(command: &str, args: &[String]) -> Result<Message, RemoteError> {
    let bad = |arg: &str| RemoteError::Protocol(format!("invalid argument {arg:?} for {command}"));
    let mut msg = Message::new().with(command);
    for (index, arg) in args.iter().enumerate() {
        match (command, index) {
            (commands::MODULE_CONFIG, 1) | (commands::GENERAL_CONFIG, 0) => {
                msg.push_u8(parse_format(arg).ok_or_else(|| bad(arg))?);
            }
            (commands::SYNC_FROM, 1 | 3) => {
                msg.push_bool(parse_bool(arg).ok_or_else(|| bad(arg))?);
            }
            _ => msg.push(arg.as_str()),
        }
    }
    Ok(msg)
}
