//! Authenticated, encrypted message transport.
//!
//! TCP stream, length-delimited frames, Noise `IK` handshake: the client
//! must know the server's static public key in advance and proves its own
//! static key during the handshake. After the handshake each frame carries
//! one encrypted chunk of an encoded [`Message`]; the first plaintext byte of
//! a chunk is `1` when more chunks follow.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use snow::{Builder, HandshakeState, TransportState};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::RemoteError;
use crate::message::Message;

/// Noise protocol used for every connection.
pub const NOISE_PARAMS: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// Upper bound for the handshake, connect included.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Plaintext bytes of message data per encrypted frame.
pub const MAX_CHUNK: usize = 65_000;

/// Largest reassembled message accepted.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const NOISE_MAX_MESSAGE: usize = 65_535;
const KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Static X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    public: Vec<u8>,
    secret: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .field("secret", &"__REDACTED__")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Noise`] if the resolver cannot generate keys.
    pub fn generate() -> Result<Self, RemoteError> {
        let keypair = builder()?
            .generate_keypair()
            .map_err(|e| RemoteError::Noise(e.to_string()))?;
        Ok(Self {
            public: keypair.public,
            secret: keypair.private,
        })
    }

    /// Rebuild a key pair from its base64 halves.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidKey`] if either half is not a base64
    /// 32-byte key.
    pub fn from_base64(secret: &str, public: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            public: decode_key(public)?.to_vec(),
            secret: decode_key(secret)?.to_vec(),
        })
    }

    /// Public half, raw.
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Public half, base64.
    pub fn public_base64(&self) -> String {
        STANDARD.encode(&self.public)
    }

    /// Secret half, base64.
    pub fn secret_base64(&self) -> String {
        STANDARD.encode(&self.secret)
    }
}

/// Decode a base64 32-byte public or secret key.
///
/// # Errors
///
/// Returns [`RemoteError::InvalidKey`] on bad base64 or wrong length.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], RemoteError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| RemoteError::InvalidKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RemoteError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len())))
}

fn builder<'a>() -> Result<Builder<'a>, RemoteError> {
    let params = NOISE_PARAMS
        .parse()
        .map_err(|e: snow::Error| RemoteError::Noise(e.to_string()))?;
    Ok(Builder::new(params))
}

fn noise_err(e: snow::Error) -> RemoteError {
    RemoteError::Noise(e.to_string())
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// An established, authenticated connection.
pub struct SecureChannel {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    noise: TransportState,
    peer_key: Vec<u8>,
    partial: Vec<u8>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.peer_key_base64())
            .finish_non_exhaustive()
    }
}

fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(NOISE_MAX_MESSAGE)
        .new_codec();
    Framed::new(stream, codec)
}

impl SecureChannel {
    /// Connect to `endpoint` (`host:port`, optionally `tcp://`-prefixed) and
    /// authenticate against `server_key`.
    ///
    /// # Errors
    ///
    /// Fails on connect error, handshake failure (wrong server key) or
    /// timeout.
    pub async fn connect(
        endpoint: &str,
        server_key: &[u8],
        local: &KeyPair,
    ) -> Result<Self, RemoteError> {
        let addr = strip_scheme(endpoint).to_owned();
        let server_key = server_key.to_vec();
        let local = local.clone();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            let handshake = builder()?
                .local_private_key(&local.secret)
                .remote_public_key(&server_key)
                .build_initiator()
                .map_err(noise_err)?;
            Self::initiate(framed(stream), handshake, server_key).await
        })
        .await
        .map_err(|_| RemoteError::Timeout("handshake".to_owned()))?
    }

    async fn initiate(
        mut framed: Framed<TcpStream, LengthDelimitedCodec>,
        mut handshake: HandshakeState,
        server_key: Vec<u8>,
    ) -> Result<Self, RemoteError> {
        let mut buf = vec![0u8; NOISE_MAX_MESSAGE];
        let len = handshake.write_message(&[], &mut buf).map_err(noise_err)?;
        framed
            .send(Bytes::copy_from_slice(buf.get(..len).unwrap_or_default()))
            .await?;

        let reply = framed.next().await.ok_or(RemoteError::Closed)??;
        handshake
            .read_message(&reply, &mut buf)
            .map_err(|e| RemoteError::Handshake(e.to_string()))?;

        Ok(Self {
            framed,
            noise: handshake.into_transport_mode().map_err(noise_err)?,
            peer_key: server_key,
            partial: Vec::new(),
        })
    }

    /// Run the server side of the handshake on an accepted stream.
    ///
    /// # Errors
    ///
    /// Fails on handshake failure or timeout.
    pub async fn accept(stream: TcpStream, local: &KeyPair) -> Result<Self, RemoteError> {
        let local = local.clone();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async move {
            stream.set_nodelay(true)?;
            let mut framed = framed(stream);
            let mut handshake = builder()?
                .local_private_key(&local.secret)
                .build_responder()
                .map_err(noise_err)?;

            let hello = framed.next().await.ok_or(RemoteError::Closed)??;
            let mut buf = vec![0u8; NOISE_MAX_MESSAGE];
            handshake
                .read_message(&hello, &mut buf)
                .map_err(|e| RemoteError::Handshake(e.to_string()))?;
            let peer_key = handshake
                .get_remote_static()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| RemoteError::Handshake("client sent no static key".to_owned()))?;

            let len = handshake.write_message(&[], &mut buf).map_err(noise_err)?;
            framed
                .send(Bytes::copy_from_slice(buf.get(..len).unwrap_or_default()))
                .await?;

            Ok::<_, RemoteError>(Self {
                framed,
                noise: handshake.into_transport_mode().map_err(noise_err)?,
                peer_key,
                partial: Vec::new(),
            })
        })
        .await
        .map_err(|_| RemoteError::Timeout("handshake".to_owned()))?
    }

    /// Static public key the peer authenticated with.
    pub fn peer_key(&self) -> &[u8] {
        &self.peer_key
    }

    /// Peer key, base64.
    pub fn peer_key_base64(&self) -> String {
        STANDARD.encode(&self.peer_key)
    }

    /// Encrypt and send one message.
    ///
    /// # Errors
    ///
    /// Fails on I/O or encryption error.
    pub async fn send(&mut self, msg: &Message) -> Result<(), RemoteError> {
        let encoded = msg.encode();
        let mut chunks = encoded.chunks(MAX_CHUNK).peekable();
        let mut plain = Vec::with_capacity(MAX_CHUNK.saturating_add(1));
        let mut cipher = vec![0u8; NOISE_MAX_MESSAGE];
        while let Some(chunk) = chunks.next() {
            plain.clear();
            plain.push(u8::from(chunks.peek().is_some()));
            plain.extend_from_slice(chunk);
            let len = self
                .noise
                .write_message(&plain, &mut cipher)
                .map_err(noise_err)?;
            self.framed
                .send(Bytes::copy_from_slice(cipher.get(..len).unwrap_or_default()))
                .await?;
        }
        Ok(())
    }

    /// Receive the next complete message. `None` on clean end of stream.
    ///
    /// Cancel safe: chunks already received are kept for the next call.
    ///
    /// # Errors
    ///
    /// Fails on I/O error, authentication failure, oversize message or a
    /// stream that ends mid-message.
    pub async fn recv(&mut self) -> Result<Option<Message>, RemoteError> {
        let mut plain = vec![0u8; NOISE_MAX_MESSAGE];
        loop {
            let Some(frame) = self.framed.next().await else {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Err(RemoteError::Closed);
            };
            let frame = frame?;
            let len = self
                .noise
                .read_message(&frame, &mut plain)
                .map_err(noise_err)?;
            let Some((&more, data)) = plain.get(..len).and_then(<[u8]>::split_first) else {
                return Err(RemoteError::Protocol("empty chunk".to_owned()));
            };
            if self.partial.len().saturating_add(data.len()) > MAX_MESSAGE_SIZE {
                self.partial.clear();
                return Err(RemoteError::Protocol("message too large".to_owned()));
            }
            self.partial.extend_from_slice(data);
            if more == 0 {
                let encoded = std::mem::take(&mut self.partial);
                return Ok(Some(Message::decode(&encoded)?));
            }
        }
    }
}
