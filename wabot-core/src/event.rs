//! Events emitted by a backend connection for the supervisor to consume.

use serde::{Deserialize, Serialize};

use crate::session::Credentials;

/// Everything a live connection can report to its owner.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Lifecycle transition reported by the backend.
    Connection(ConnectionUpdate),

    /// Pairing payload (QR data or link code) while no credentials exist.
    PairingCode(String),

    /// The backend rotated its session state; must be persisted.
    CredentialsUpdated(Credentials),

    /// Chat traffic, routed to the dispatcher.
    Inbound(InboundEvent),
}

/// Lifecycle updates as the backend reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connecting,
    /// Handshake complete. `user_id` is our own account JID.
    Open { user_id: String },
    /// Connection ended. `status_code` is the backend's disconnect code when
    /// it gave one.
    Close {
        status_code: Option<u16>,
        reason: String,
    },
}

/// Inbound chat traffic. Shared read-only between subscribers.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(MessageBatch),
    Call(CallBatch),
    GroupUpdate(GroupParticipantsUpdate),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Call(_) => EventKind::Call,
            Self::GroupUpdate(_) => EventKind::GroupUpdate,
        }
    }
}

/// Stable label per inbound stream, used in logs and spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Call,
    GroupUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Call => "call",
            Self::GroupUpdate => "group_update",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `messages.upsert` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub kind: UpsertKind,
    pub messages: Vec<ChatMessage>,
}

/// `Notify` is live traffic, `Append` is history being synced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Notify,
    Append,
}

/// Address of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    /// Chat JID (user or group).
    pub remote_jid: String,
    pub id: String,
    /// Sent by the account we are logged in as.
    #[serde(default)]
    pub from_me: bool,
    /// Sender inside a group chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// `None` for stubs (decryption failures, placeholders).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    /// Plain text of the message, from the body or a media caption.
    pub fn text(&self) -> Option<&str> {
        match self.content.as_ref()? {
            MessageContent::Text { text } => Some(text),
            MessageContent::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        /// image, video, audio, document, sticker
        media: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Reaction {
        emoji: String,
    },
    /// Revokes, ephemeral settings and similar control messages.
    Protocol,
    /// Locations, contacts, polls and anything newer than this decoder.
    #[serde(other)]
    Other,
}

impl MessageContent {
    /// Whether a user would see this as a message bubble.
    pub fn is_renderable(&self) -> bool {
        !matches!(self, Self::Reaction { .. } | Self::Protocol)
    }
}

pub type CallBatch = Vec<CallOffer>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOffer {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_group: bool,
    pub status: CallStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Offer,
    Ringing,
    Timeout,
    Reject,
    Accept,
    Terminate,
    #[serde(other)]
    Unknown,
}

/// One `group-participants.update` delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipantsUpdate {
    pub group_jid: String,
    pub participants: Vec<String>,
    pub action: ParticipantAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_batch_from_wire_shape() {
        let raw = r#"{
            "kind": "notify",
            "messages": [{
                "key": {"remote_jid": "123@s.whatsapp.net", "id": "ABC", "from_me": false},
                "push_name": "Ana",
                "content": {"type": "media", "media": "image", "caption": "look"}
            }]
        }"#;
        let batch: MessageBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.kind, UpsertKind::Notify);
        assert_eq!(batch.messages[0].text(), Some("look"));
        assert!(batch.messages[0].content.as_ref().unwrap().is_renderable());
    }

    #[test]
    fn stub_message_has_no_content() {
        let raw = r#"{"key": {"remote_jid": "1@g.us", "id": "X"}}"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.content.is_none());
        assert!(!msg.key.from_me);
        assert_eq!(msg.text(), None);
    }

    #[test]
    fn reactions_and_protocol_messages_are_not_renderable() {
        assert!(!MessageContent::Reaction { emoji: "👍".into() }.is_renderable());
        assert!(!MessageContent::Protocol.is_renderable());
    }

    #[test]
    fn unknown_content_type_keeps_the_rest_of_the_batch() {
        let raw = r#"{
            "kind": "notify",
            "messages": [
                {"key": {"remote_jid": "1@s.whatsapp.net", "id": "A"},
                 "content": {"type": "text", "text": ".ping"}},
                {"key": {"remote_jid": "1@s.whatsapp.net", "id": "B"},
                 "content": {"type": "location", "lat": 1.5, "lng": 2.5}}
            ]
        }"#;
        let batch: MessageBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].text(), Some(".ping"));
        let other = batch.messages[1].content.as_ref().unwrap();
        assert_eq!(*other, MessageContent::Other);
        assert!(other.is_renderable());
        assert_eq!(batch.messages[1].text(), None);
    }

    #[test]
    fn unknown_participant_action_does_not_fail_decoding() {
        let raw = r#"{"group_jid": "1@g.us", "participants": ["a@s.whatsapp.net"], "action": "modify"}"#;
        let update: GroupParticipantsUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.action, ParticipantAction::Other);
    }

    #[test]
    fn unknown_call_status_does_not_fail_decoding() {
        let raw = r#"{"id": "c1", "from": "9@s.whatsapp.net", "status": "preaccept"}"#;
        let call: CallOffer = serde_json::from_str(raw).unwrap();
        assert_eq!(call.status, CallStatus::Unknown);
    }
}
