//! Error taxonomy for the connection core.
//!
//! Only [`AuthError`] (at startup) and terminal close reasons ever stop the
//! process. Everything else is logged and absorbed where it happens.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::Credentials;
use crate::state::ConnectionState;

/// Credentials missing or unobtainable at startup.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No local bundle and no remote session id configured.
    #[error("no local credentials and no session id configured")]
    MissingSource,

    /// The remote session blob could not be downloaded.
    #[error("failed to fetch session {source_id}: {reason}")]
    Fetch { source_id: String, reason: String },

    /// The local bundle exists but could not be read.
    #[error("failed to read credentials at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A freshly fetched bundle could not be written to disk. The bundle
    /// itself is still usable.
    #[error("failed to store fetched credentials: {source}")]
    Store {
        credentials: Credentials,
        #[source]
        source: PersistenceError,
    },
}

/// Credential write failure. Never fatal; the write is retried on the next
/// credential update.
#[derive(Debug, Error)]
#[error("failed to {action} {}: {source}", path.display())]
pub struct PersistenceError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl PersistenceError {
    pub(crate) fn new(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Failure while negotiating a connection. Always classified as transient
/// once the process has been connected at least once.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("protocol version negotiation failed: {0}")]
    Version(String),

    #[error("transport connect to {addr} failed: {reason}")]
    Transport { addr: String, reason: String },

    #[error("backend rejected the session: {0}")]
    Rejected(String),
}

/// Outbound send on a connection that is no longer usable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is closed")]
    ConnectionClosed,
}

/// Illegal lifecycle transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot {action} while connection is {current:?}")]
    InvalidTransition {
        current: ConnectionState,
        action: &'static str,
    },
}

/// Invalid bot configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("reaction set must contain at least one symbol")]
    EmptyReactions,

    #[error("session url template must contain `{{id}}`: {0}")]
    BadUrlTemplate(String),

    #[error("session id must not be blank")]
    BlankSessionId,

    #[error("unknown mode `{0}`, expected `public` or `private`")]
    UnknownMode(String),
}
