//! Seam between the core and whatever speaks the WhatsApp Web protocol.
//!
//! A [`Backend`] produces [`Connection`]s: a cloneable [`ConnectionHandle`]
//! for outbound commands plus a receiver of [`BackendEvent`]s. The protocol
//! itself (noise handshake, framing, encryption) lives behind this trait.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{HandshakeError, SendError};
use crate::event::{BackendEvent, MessageKey};
use crate::session::Credentials;

/// Outbound command buffer per connection.
pub const COMMAND_BUFFER: usize = 256;

/// Negotiated WhatsApp Web client version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub parts: [u32; 3],
    /// False when we fell back to a pinned version.
    pub is_latest: bool,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c] = self.parts;
        write!(f, "{a}.{b}.{c}")
    }
}

/// Everything the backend needs to start one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub version: ProtocolVersion,
    /// `None` starts the backend's own pairing flow.
    pub credentials: Option<Credentials>,
    /// Browser triple announced to the server (name, platform, version).
    pub browser: [String; 3],
    /// Forwarded visibility flag; the core does not interpret it.
    pub public: bool,
}

/// Commands a connection accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendText {
        to: String,
        text: String,
        quoted: Option<MessageKey>,
    },
    React {
        key: MessageKey,
        emoji: String,
    },
    RejectCall {
        call_id: String,
        from: String,
    },
    /// Close the transport without logging out.
    Close,
}

/// A handle to one live connection. Clones share the same command queue;
/// once the connection is gone every send fails with
/// [`SendError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    user_id: Option<Arc<str>>,
}

impl ConnectionHandle {
    pub fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self {
            cmd_tx,
            user_id: None,
        }
    }

    /// Handle plus the receiving end of its command queue.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer.max(1));
        (Self::new(cmd_tx), cmd_rx)
    }

    /// Copy of this handle that knows which account it is logged in as.
    pub fn bind_user(&self, user_id: &str) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            user_id: Some(Arc::from(user_id)),
        }
    }

    /// Our own JID, known once the connection opened.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), SendError> {
        self.send(Command::SendText {
            to: to.to_string(),
            text: text.to_string(),
            quoted: None,
        })
        .await
    }

    /// Send `text` into the chat of `key`, quoting that message.
    pub async fn reply(&self, key: &MessageKey, text: &str) -> Result<(), SendError> {
        self.send(Command::SendText {
            to: key.remote_jid.clone(),
            text: text.to_string(),
            quoted: Some(key.clone()),
        })
        .await
    }

    pub async fn react(&self, key: &MessageKey, emoji: &str) -> Result<(), SendError> {
        self.send(Command::React {
            key: key.clone(),
            emoji: emoji.to_string(),
        })
        .await
    }

    pub async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), SendError> {
        self.send(Command::RejectCall {
            call_id: call_id.to_string(),
            from: from.to_string(),
        })
        .await
    }

    pub async fn close(&self) -> Result<(), SendError> {
        self.send(Command::Close).await
    }

    async fn send(&self, cmd: Command) -> Result<(), SendError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SendError::ConnectionClosed)
    }
}

/// A started connection attempt. The handshake outcome arrives on `events`
/// as a [`crate::event::ConnectionUpdate`].
pub struct Connection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<BackendEvent>,
}

/// Protocol implementation the supervisor drives.
pub trait Backend: Send + Sync {
    /// Work out which client version to announce.
    fn negotiate_version(&self) -> impl Future<Output = Result<ProtocolVersion, HandshakeError>> + Send;

    /// Start a connection attempt.
    fn connect(
        &self,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<Connection, HandshakeError>> + Send;
}
