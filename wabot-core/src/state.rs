//! Connection lifecycle state machine and close-reason classification.

use serde::Serialize;

use crate::error::StateError;

/// Disconnect status codes reported by the WhatsApp Web backend.
pub mod status {
    pub const CONNECTION_LOST: u16 = 408;
    pub const MULTIDEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const LOGGED_OUT: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const UNAVAILABLE_SERVICE: u16 = 503;
    pub const RESTART_REQUIRED: u16 = 515;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Credentials were invalidated. Terminal, clean stop.
    LoggedOut,
    /// Another client took over this session. Terminal, clean stop;
    /// reconnecting would just kick the other client off again.
    Replaced,
    /// The account is banned or blocked. Terminal, reported as a failure.
    Forbidden,
    /// Anything else, including network loss. Restart.
    Transient,
}

impl CloseReason {
    /// Map a backend status code to a close reason. Codes we do not know,
    /// and closes without a code, are transient.
    pub fn classify(status_code: Option<u16>) -> Self {
        match status_code {
            Some(status::LOGGED_OUT) => Self::LoggedOut,
            Some(status::CONNECTION_REPLACED) => Self::Replaced,
            Some(status::FORBIDDEN) => Self::Forbidden,
            _ => Self::Transient,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transient)
    }
}

/// Single writer of [`ConnectionState`]. Every transition goes through here.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    last_close: Option<CloseReason>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_close: None,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_close(&self) -> Option<CloseReason> {
        self.last_close
    }

    /// `Idle → Connecting`.
    pub fn begin_connect(&mut self) -> Result<ConnectionState, StateError> {
        self.transition_from(&[ConnectionState::Idle], ConnectionState::Connecting, "connect")
    }

    /// `Connecting → Open`.
    pub fn on_open(&mut self) -> Result<ConnectionState, StateError> {
        self.transition_from(&[ConnectionState::Connecting], ConnectionState::Open, "open")
    }

    /// `Connecting | Open → Closed(reason)`.
    pub fn on_close(&mut self, reason: CloseReason) -> Result<ConnectionState, StateError> {
        let next = self.transition_from(
            &[ConnectionState::Connecting, ConnectionState::Open],
            ConnectionState::Closed,
            "close",
        )?;
        self.last_close = Some(reason);
        Ok(next)
    }

    /// `Closed(Transient) → Idle`. Terminal closes stay closed for good.
    pub fn reset(&mut self) -> Result<ConnectionState, StateError> {
        if self.last_close.is_some_and(|r| r.is_terminal()) {
            return Err(StateError::InvalidTransition {
                current: self.state,
                action: "restart after terminal close",
            });
        }
        self.transition_from(&[ConnectionState::Closed], ConnectionState::Idle, "reset")
    }

    fn transition_from(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &'static str,
    ) -> Result<ConnectionState, StateError> {
        if !expected.contains(&self.state) {
            return Err(StateError::InvalidTransition {
                current: self.state,
                action,
            });
        }
        self.state = next;
        Ok(next)
    }
}
