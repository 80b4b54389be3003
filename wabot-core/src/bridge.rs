//! Backend that talks to a WhatsApp Web protocol sidecar over TCP.
//!
//! The sidecar owns the actual protocol (noise handshake, signal sessions,
//! media). We exchange newline-delimited JSON frames with it:
//!
//! - client → sidecar: `hello` (version, browser, visibility, credentials),
//!   then `send_text`, `react`, `reject_call`, `close`
//! - sidecar → client: `connection`, `pairing_code`, `creds_update`,
//!   `messages_upsert`, `call`, `group_participants_update`
//!
//! Credentials travel base64-encoded so the opaque bundle survives JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::backend::{
    Backend, COMMAND_BUFFER, Command, ConnectOptions, Connection, ConnectionHandle, ProtocolVersion,
};
use crate::error::HandshakeError;
use crate::event::{
    BackendEvent, CallOffer, ConnectionUpdate, GroupParticipantsUpdate, InboundEvent, MessageBatch,
    MessageKey,
};
use crate::session::Credentials;

/// Published list of the current WhatsApp Web client version.
pub const DEFAULT_VERSION_URL: &str =
    "https://raw.githubusercontent.com/WhiskeySockets/Baileys/master/src/Defaults/baileys-version.json";

/// Used when the published version cannot be fetched.
pub const PINNED_VERSION: [u32; 3] = [2, 3000, 1015901307];

pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:7001";

const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Sidecar address (host:port).
    pub addr: String,
    pub version_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BRIDGE_ADDR.to_string(),
            version_url: DEFAULT_VERSION_URL.to_string(),
        }
    }
}

pub struct BridgeBackend {
    config: BridgeConfig,
    http: reqwest::Client,
}

impl BridgeBackend {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

impl Backend for BridgeBackend {
    async fn negotiate_version(&self) -> Result<ProtocolVersion, HandshakeError> {
        fetch_latest_version(&self.http, &self.config.version_url).await
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Connection, HandshakeError> {
        let addr = &self.config.addr;
        tracing::debug!("Connecting to protocol bridge at {addr}");
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| HandshakeError::Transport {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let (reader, mut writer) = tokio::io::split(tcp);
        let hello = Outbound::Hello {
            version: options.version.parts,
            browser: &options.browser,
            public: options.public,
            credentials: options.credentials.as_ref().map(|c| BASE64.encode(c.as_bytes())),
        };
        write_frame(&mut writer, &hello)
            .await
            .map_err(|e| HandshakeError::Transport {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (handle, cmd_rx) = ConnectionHandle::channel(COMMAND_BUFFER);
        tokio::spawn(async move {
            let reason = match run_bridge(BufReader::new(reader), writer, event_tx.clone(), cmd_rx).await {
                Ok(Some(reason)) => reason,
                Ok(None) => return,
                Err(e) => e.to_string(),
            };
            let _ = event_tx
                .send(BackendEvent::Connection(ConnectionUpdate::Close {
                    status_code: None,
                    reason,
                }))
                .await;
        });

        Ok(Connection { handle, events })
    }
}

#[derive(Deserialize)]
struct VersionDocument {
    version: Vec<u32>,
}

/// Fetch the current client version, falling back to [`PINNED_VERSION`]
/// when the document is unreachable. A document with the wrong shape is an
/// error: it means the source changed, not that the network is down.
pub async fn fetch_latest_version(http: &reqwest::Client, url: &str) -> Result<ProtocolVersion, HandshakeError> {
    let fetched = async {
        let resp = http.get(url).send().await?.error_for_status()?;
        resp.json::<VersionDocument>().await
    }
    .await;

    match fetched {
        Ok(doc) => match <[u32; 3]>::try_from(doc.version.as_slice()) {
            Ok(parts) => Ok(ProtocolVersion {
                parts,
                is_latest: true,
            }),
            Err(_) => Err(HandshakeError::Version(format!(
                "expected 3 version components, got {:?}",
                doc.version
            ))),
        },
        Err(e) if e.is_decode() => Err(HandshakeError::Version(e.to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "Could not fetch latest WA web version, using pinned one");
            Ok(ProtocolVersion {
                parts: PINNED_VERSION,
                is_latest: false,
            })
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Hello {
        version: [u32; 3],
        browser: &'a [String; 3],
        public: bool,
        credentials: Option<String>,
    },
    SendText {
        to: &'a str,
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted: Option<&'a MessageKey>,
    },
    React {
        key: &'a MessageKey,
        emoji: &'a str,
    },
    RejectCall {
        call_id: &'a str,
        from: &'a str,
    },
    Close,
}

impl<'a> From<&'a Command> for Outbound<'a> {
    fn from(cmd: &'a Command) -> Self {
        match cmd {
            Command::SendText { to, text, quoted } => Outbound::SendText {
                to,
                text,
                quoted: quoted.as_ref(),
            },
            Command::React { key, emoji } => Outbound::React { key, emoji },
            Command::RejectCall { call_id, from } => Outbound::RejectCall { call_id, from },
            Command::Close => Outbound::Close,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Connection {
        state: WireConnectionState,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    PairingCode {
        code: String,
    },
    CredsUpdate {
        credentials: String,
    },
    MessagesUpsert(MessageBatch),
    Call {
        calls: Vec<CallOffer>,
    },
    GroupParticipantsUpdate(GroupParticipantsUpdate),
}

/// Decode one sidecar frame.
fn decode_frame(line: &str) -> Result<BackendEvent, String> {
    let frame: Inbound = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let event = match frame {
        Inbound::Connection { state, status_code, reason, user_id } => {
            BackendEvent::Connection(match state {
                WireConnectionState::Connecting => ConnectionUpdate::Connecting,
                WireConnectionState::Open => ConnectionUpdate::Open {
                    user_id: user_id.ok_or("open frame without user_id")?,
                },
                WireConnectionState::Close => ConnectionUpdate::Close {
                    status_code,
                    reason: reason.unwrap_or_else(|| "closed by backend".to_string()),
                },
            })
        }
        Inbound::PairingCode { code } => BackendEvent::PairingCode(code),
        Inbound::CredsUpdate { credentials } => {
            let bytes = BASE64
                .decode(credentials.as_bytes())
                .map_err(|e| format!("bad credentials encoding: {e}"))?;
            BackendEvent::CredentialsUpdated(Credentials::new(bytes))
        }
        Inbound::MessagesUpsert(batch) => BackendEvent::Inbound(InboundEvent::Message(batch)),
        Inbound::Call { calls } => BackendEvent::Inbound(InboundEvent::Call(calls)),
        Inbound::GroupParticipantsUpdate(update) => {
            BackendEvent::Inbound(InboundEvent::GroupUpdate(update))
        }
    };
    Ok(event)
}

async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Pump frames both ways until either side goes away. Returns the close
/// reason to report, or `None` when the sidecar already reported a close
/// or every handle was dropped.
async fn run_bridge<R, W>(
    reader: R,
    mut writer: W,
    event_tx: mpsc::Sender<BackendEvent>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(Some("bridge closed the connection".to_string()));
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode_frame(line) {
                    Ok(event) => {
                        let closing = matches!(
                            event,
                            BackendEvent::Connection(ConnectionUpdate::Close { .. })
                        );
                        if event_tx.send(event).await.is_err() || closing {
                            return Ok(None);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed bridge frame"),
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    return Ok(None);
                };
                write_frame(&mut writer, &Outbound::from(&cmd)).await?;
                if cmd == Command::Close {
                    let _ = writer.shutdown().await;
                    return Ok(Some("closed locally".to_string()));
                }
            }
        }
    }
}
