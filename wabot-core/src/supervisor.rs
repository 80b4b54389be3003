//! Connection supervisor: one connection attempt at a time, forever.
//!
//! Each loop iteration resolves credentials, negotiates a protocol version,
//! opens a connection and pumps its events until it closes. Inbound traffic
//! is fanned out to the dispatcher; credential updates are persisted as they
//! arrive. A transient close starts the next iteration, a terminal close
//! ends [`ConnectionSupervisor::run`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;

use crate::backend::{Backend, ConnectOptions, Connection, ConnectionHandle, ProtocolVersion};
use crate::config::BotConfig;
use crate::dispatch::{Attachment, EventDispatcher, EventSource};
use crate::error::{AuthError, HandshakeError};
use crate::event::{BackendEvent, ConnectionUpdate};
use crate::session::{Credentials, SessionStore};
use crate::state::{CloseReason, ConnectionState, ConnectionStateMachine};

/// Restart pacing.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause before reopening after a connection that was open.
    pub initial_delay: Duration,
    /// Cap for consecutive failed attempts.
    pub max_delay: Duration,
    /// Growth per consecutive failure.
    pub backoff_factor: f64,
    /// How long handlers may keep running after their connection closed.
    pub drain_grace: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            drain_grace: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    /// No waiting at all. Only sensible with a scripted backend.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            drain_grace: Duration::from_secs(5),
        }
    }

    /// Delay before the next attempt given how many attempts in a row
    /// failed to reach `Open`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.initial_delay;
        }
        let max_ms = self.max_delay.as_millis() as u64;
        let grown = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(consecutive_failures.min(16) as i32);
        let base = (grown as u64).min(max_ms);
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..base / 4)
        } else {
            0
        };
        Duration::from_millis((base + jitter).min(max_ms))
    }
}

/// Why [`ConnectionSupervisor::run`] returned.
#[derive(Debug)]
pub enum SupervisorExit {
    LoggedOut,
    Replaced,
    Forbidden,
    /// Credentials could not be obtained.
    AuthFailed(AuthError),
    /// Version negotiation failed before we were ever connected.
    StartupFailed(HandshakeError),
}

impl SupervisorExit {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::LoggedOut | Self::Replaced => 0,
            Self::Forbidden | Self::AuthFailed(_) | Self::StartupFailed(_) => 1,
        }
    }

    fn from_close(reason: CloseReason) -> Option<Self> {
        match reason {
            CloseReason::LoggedOut => Some(Self::LoggedOut),
            CloseReason::Replaced => Some(Self::Replaced),
            CloseReason::Forbidden => Some(Self::Forbidden),
            CloseReason::Transient => None,
        }
    }
}

/// Read-only snapshot published for observers (health endpoint, tests).
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub attempt: u64,
    pub connected_once: bool,
    /// Waiting for the device to be linked from a phone.
    pub pairing: bool,
    pub last_close: Option<CloseReason>,
    pub version: Option<String>,
    pub user_id: Option<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            connected_once: false,
            pairing: false,
            last_close: None,
            version: None,
            user_id: None,
        }
    }
}

/// Mutable bookkeeping owned by the run loop and handed to each attempt.
#[derive(Debug, Default)]
pub struct SupervisorState {
    /// The one-time "connected" notice has been sent.
    pub first_open_done: bool,
    /// Current attempt runs the backend's pairing flow.
    pub pairing: bool,
    pub attempt: u64,
    /// Attempts in a row that never reached `Open`.
    pub consecutive_failures: u32,
    /// Latest credentials whose write failed; retried on the next chance.
    pub pending_credentials: Option<Credentials>,
    pub version: Option<ProtocolVersion>,
}

enum AttemptOutcome {
    Closed { reason: CloseReason, was_open: bool },
    Fatal(SupervisorExit),
}

pub struct ConnectionSupervisor<B> {
    backend: B,
    store: SessionStore,
    config: Arc<BotConfig>,
    dispatcher: EventDispatcher,
    reconnect: ReconnectConfig,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl<B: Backend> ConnectionSupervisor<B> {
    pub fn new(
        backend: B,
        store: SessionStore,
        config: Arc<BotConfig>,
        dispatcher: EventDispatcher,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        Self {
            backend,
            store,
            config,
            dispatcher,
            reconnect,
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Run until a terminal close or an unrecoverable startup error.
    pub async fn run(self) -> SupervisorExit {
        let mut machine = ConnectionStateMachine::default();
        let mut state = SupervisorState::default();

        loop {
            state.attempt += 1;
            let outcome = self.run_attempt(&mut machine, &mut state).await;
            self.flush_pending_credentials(&mut state).await;

            let (reason, was_open) = match outcome {
                AttemptOutcome::Fatal(exit) => {
                    tracing::error!(attempt = state.attempt, ?exit, "Supervisor stopping");
                    return exit;
                }
                AttemptOutcome::Closed { reason, was_open } => (reason, was_open),
            };

            if let Err(e) = machine.on_close(reason) {
                tracing::error!(error = %e, "Unexpected lifecycle state on close");
            }
            self.publish(&machine, &state);

            if let Some(exit) = SupervisorExit::from_close(reason) {
                match reason {
                    CloseReason::LoggedOut => tracing::warn!(
                        "The bot has been logged out; pair the device again to continue"
                    ),
                    CloseReason::Replaced => tracing::warn!(
                        "Session was taken over by another client; not reconnecting"
                    ),
                    _ => tracing::error!("Account is forbidden by the backend; not reconnecting"),
                }
                return exit;
            }

            if was_open {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
            let delay = self.reconnect.delay_for(state.consecutive_failures);
            tracing::info!(
                attempt = state.attempt,
                failures = state.consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let Err(e) = machine.reset() {
                tracing::error!(error = %e, "Lifecycle out of sync, starting from a fresh state");
                machine = ConnectionStateMachine::default();
            }
            self.publish(&machine, &state);
        }
    }

    async fn run_attempt(
        &self,
        machine: &mut ConnectionStateMachine,
        state: &mut SupervisorState,
    ) -> AttemptOutcome {
        let credentials = match self.resolve_credentials(state).await {
            Ok(creds) => creds,
            Err(e) => return AttemptOutcome::Fatal(SupervisorExit::AuthFailed(e)),
        };

        let version = match self.backend.negotiate_version().await {
            Ok(v) => v,
            Err(e) if !state.first_open_done => {
                return AttemptOutcome::Fatal(SupervisorExit::StartupFailed(e));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Version negotiation failed");
                return self.handshake_failed(machine, state);
            }
        };
        tracing::info!(version = %version, is_latest = version.is_latest, "Using WA web version");
        state.version = Some(version.clone());

        if let Err(e) = machine.begin_connect() {
            tracing::error!(error = %e, "Connection attempt out of order");
        }
        self.publish(machine, state);

        let options = ConnectOptions {
            version,
            credentials,
            browser: self.config.browser.clone(),
            public: self.config.is_public(),
        };
        let Connection { handle, mut events } = match self.backend.connect(options).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Handshake failed");
                return AttemptOutcome::Closed {
                    reason: CloseReason::Transient,
                    was_open: false,
                };
            }
        };

        let mut source: Option<EventSource> = None;
        let mut attachment: Option<Attachment> = None;

        let reason = loop {
            let Some(event) = events.recv().await else {
                tracing::warn!("Backend event stream ended without a close");
                break CloseReason::Transient;
            };
            match event {
                BackendEvent::Connection(ConnectionUpdate::Connecting) => {
                    tracing::debug!("Connecting to WhatsApp");
                }
                BackendEvent::Connection(ConnectionUpdate::Open { user_id }) => {
                    if let Err(e) = machine.on_open() {
                        tracing::warn!(error = %e, "Ignoring duplicate open");
                        continue;
                    }
                    let conn = handle.bind_user(&user_id);
                    self.announce_open(state, &conn).await;
                    state.consecutive_failures = 0;
                    self.status_tx.send_modify(|s| s.user_id = Some(user_id.clone()));
                    self.publish(machine, state);

                    let mut src = EventSource::new();
                    attachment = Some(self.dispatcher.attach(&mut src, conn, state.attempt));
                    source = Some(src);
                }
                BackendEvent::Connection(ConnectionUpdate::Close { status_code, reason }) => {
                    let classified = CloseReason::classify(status_code);
                    tracing::warn!(?status_code, %reason, close = ?classified, "Connection closed");
                    break classified;
                }
                BackendEvent::PairingCode(code) => {
                    tracing::info!(%code, "Pairing code received; link this device from the phone");
                }
                BackendEvent::CredentialsUpdated(creds) => {
                    self.persist_credentials(state, creds).await;
                }
                BackendEvent::Inbound(inbound) => match source.as_mut() {
                    Some(src) => {
                        src.publish(inbound);
                    }
                    None => {
                        tracing::warn!(kind = %inbound.kind(), "Dropping inbound event received before open");
                    }
                },
            }
        };

        let was_open = source.is_some();
        drop(source);
        if let Some(attachment) = attachment {
            attachment.shutdown(self.reconnect.drain_grace).await;
        }
        if let Err(e) = handle.close().await {
            tracing::debug!(error = %e, "Backend already gone at close");
        }
        drop(events);

        AttemptOutcome::Closed { reason, was_open }
    }

    fn handshake_failed(
        &self,
        machine: &mut ConnectionStateMachine,
        state: &mut SupervisorState,
    ) -> AttemptOutcome {
        // Negotiation happens before Idle → Connecting; enter Connecting so
        // the close below is a legal transition.
        if machine.begin_connect().is_ok() {
            self.publish(machine, state);
        }
        AttemptOutcome::Closed {
            reason: CloseReason::Transient,
            was_open: false,
        }
    }

    async fn resolve_credentials(&self, state: &mut SupervisorState) -> Result<Option<Credentials>, AuthError> {
        if let Some(pending) = &state.pending_credentials {
            // Newer than whatever is on disk.
            state.pairing = false;
            return Ok(Some(pending.clone()));
        }

        match self.store.load_or_fetch(self.config.session_id.as_deref()).await {
            Ok(creds) => {
                state.pairing = false;
                Ok(Some(creds))
            }
            Err(AuthError::Store { credentials, source }) => {
                tracing::error!(error = %source, "Fetched session could not be saved; will retry");
                state.pairing = false;
                state.pending_credentials = Some(credentials.clone());
                Ok(Some(credentials))
            }
            Err(e) if self.config.allow_pairing => {
                tracing::warn!(error = %e, "No session available, starting device pairing");
                state.pairing = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn announce_open(&self, state: &mut SupervisorState, conn: &ConnectionHandle) {
        if state.first_open_done {
            tracing::info!(attempt = state.attempt, "Connection re-established");
            return;
        }
        state.first_open_done = true;

        let name = &self.config.browser[0];
        tracing::info!(user = conn.user_id().unwrap_or_default(), "{name} connected successfully");
        if let Some(own_id) = conn.user_id() {
            let text = format!("📍 {name} connected successfully ✅");
            if let Err(e) = conn.send_text(own_id, &text).await {
                tracing::warn!(error = %e, "Failed to send connected notice");
            }
        }
    }

    async fn persist_credentials(&self, state: &mut SupervisorState, creds: Credentials) {
        match self.store.persist(&creds).await {
            Ok(()) => {
                if state.pending_credentials.take().is_some() {
                    tracing::info!("Credentials saved after earlier write failure");
                } else {
                    tracing::debug!(bytes = creds.len(), "Credentials saved");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save credentials; will retry on next update");
                state.pending_credentials = Some(creds);
            }
        }
    }

    async fn flush_pending_credentials(&self, state: &mut SupervisorState) {
        if let Some(creds) = state.pending_credentials.clone() {
            self.persist_credentials(state, creds).await;
        }
    }

    fn publish(&self, machine: &ConnectionStateMachine, state: &SupervisorState) {
        self.status_tx.send_modify(|s| {
            s.state = machine.state();
            s.attempt = state.attempt;
            s.connected_once = state.first_open_done;
            s.pairing = state.pairing;
            s.last_close = machine.last_close();
            s.version = state.version.as_ref().map(|v| v.to_string());
        });
    }
}
