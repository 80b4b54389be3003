//! Random emoji reactions to incoming messages.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::backend::ConnectionHandle;
use crate::config::BotConfig;
use crate::dispatch::{Handler, handler};
use crate::error::ConfigError;
use crate::event::{ChatMessage, MessageBatch, UpsertKind};

/// Name the engine registers under as a message subscriber.
pub const SUBSCRIBER_NAME: &str = "auto_react";

#[derive(Debug, Clone)]
pub struct AutoReactionEngine {
    enabled: bool,
    reactions: Vec<String>,
}

impl AutoReactionEngine {
    pub fn new(enabled: bool, reactions: Vec<String>) -> Result<Self, ConfigError> {
        if reactions.is_empty() {
            return Err(ConfigError::EmptyReactions);
        }
        Ok(Self { enabled, reactions })
    }

    pub fn from_config(config: &BotConfig) -> Result<Self, ConfigError> {
        Self::new(config.auto_react, config.reactions.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Uniform pick from the configured set.
    pub fn choose(&self) -> &str {
        self.reactions
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or("👍")
    }

    /// Whether `message` should get a reaction at all.
    pub fn should_react(&self, message: &ChatMessage) -> bool {
        self.enabled
            && !message.key.from_me
            && message.content.as_ref().is_some_and(|c| c.is_renderable())
    }

    /// React to one message. Returns the reaction sent, if any. Send
    /// failures are logged and swallowed.
    pub async fn on_message(&self, message: &ChatMessage, conn: &ConnectionHandle) -> Option<String> {
        if !self.should_react(message) {
            return None;
        }
        let emoji = self.choose().to_string();
        match conn.react(&message.key, &emoji).await {
            Ok(()) => {
                tracing::debug!(chat = %message.key.remote_jid, id = %message.key.id, %emoji, "Reacted");
                Some(emoji)
            }
            Err(e) => {
                tracing::warn!(chat = %message.key.remote_jid, id = %message.key.id, error = %e, "Auto reaction failed");
                None
            }
        }
    }

    /// History syncs (`Append`) are never reacted to.
    pub async fn on_batch(&self, batch: &MessageBatch, conn: &ConnectionHandle) -> usize {
        if !self.enabled || batch.kind != UpsertKind::Notify {
            return 0;
        }
        let mut sent = 0;
        for message in &batch.messages {
            if self.on_message(message, conn).await.is_some() {
                sent += 1;
            }
        }
        sent
    }

    /// The engine as a message subscriber for [`crate::dispatch::EventDispatcher`].
    pub fn into_handler(self: Arc<Self>) -> Handler<MessageBatch> {
        handler(move |batch: Arc<MessageBatch>, conn: ConnectionHandle| {
            let engine = self.clone();
            async move {
                engine.on_batch(&batch, &conn).await;
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Command;
    use crate::event::{MessageContent, MessageKey};

    fn message(from_me: bool, content: Option<MessageContent>) -> ChatMessage {
        ChatMessage {
            key: MessageKey {
                remote_jid: "555@s.whatsapp.net".into(),
                id: "MSG1".into(),
                from_me,
                participant: None,
            },
            push_name: Some("Bo".into()),
            timestamp: None,
            content,
        }
    }

    fn text(s: &str) -> Option<MessageContent> {
        Some(MessageContent::Text { text: s.into() })
    }

    fn engine(enabled: bool) -> AutoReactionEngine {
        AutoReactionEngine::new(enabled, vec!["👍".into(), "❤️".into()]).unwrap()
    }

    #[tokio::test]
    async fn reacts_once_to_third_party_message() {
        let (conn, mut rx) = ConnectionHandle::channel(8);
        let sent = engine(true).on_message(&message(false, text("hi")), &conn).await;
        let emoji = sent.expect("reaction expected");
        assert!(emoji == "👍" || emoji == "❤️");

        drop(conn);
        match rx.recv().await {
            Some(Command::React { key, emoji: sent_emoji }) => {
                assert_eq!(key.id, "MSG1");
                assert_eq!(sent_emoji, emoji);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn never_reacts_to_own_messages() {
        let (conn, mut rx) = ConnectionHandle::channel(8);
        assert!(engine(true).on_message(&message(true, text("me")), &conn).await.is_none());
        drop(conn);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn disabled_engine_never_sends() {
        let (conn, mut rx) = ConnectionHandle::channel(8);
        let e = engine(false);
        for content in [text("hi"), None, Some(MessageContent::Protocol)] {
            assert!(e.on_message(&message(false, content), &conn).await.is_none());
        }
        drop(conn);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn skips_messages_without_renderable_content() {
        let (conn, mut rx) = ConnectionHandle::channel(8);
        let e = engine(true);
        let reaction = Some(MessageContent::Reaction { emoji: "😂".into() });
        for content in [None, Some(MessageContent::Protocol), reaction] {
            assert!(e.on_message(&message(false, content), &conn).await.is_none());
        }
        drop(conn);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reacts_to_content_types_it_cannot_decode() {
        let raw = r#"{
            "kind": "notify",
            "messages": [
                {"key": {"remote_jid": "555@s.whatsapp.net", "id": "T"},
                 "content": {"type": "text", "text": "hi"}},
                {"key": {"remote_jid": "555@s.whatsapp.net", "id": "L"},
                 "content": {"type": "location", "lat": 0.0, "lng": 0.0}}
            ]
        }"#;
        let batch: MessageBatch = serde_json::from_str(raw).unwrap();
        let (conn, mut rx) = ConnectionHandle::channel(8);
        assert_eq!(engine(true).on_batch(&batch, &conn).await, 2);
        drop(conn);

        let mut reacted = Vec::new();
        while let Some(cmd) = rx.recv().await {
            if let Command::React { key, .. } = cmd {
                reacted.push(key.id);
            }
        }
        assert_eq!(reacted, vec!["T", "L"]);
    }

    #[tokio::test]
    async fn send_failure_is_swallowed() {
        let (conn, rx) = ConnectionHandle::channel(8);
        drop(rx);
        assert!(engine(true).on_message(&message(false, text("hi")), &conn).await.is_none());
    }

    #[tokio::test]
    async fn ignores_history_batches() {
        let (conn, _rx) = ConnectionHandle::channel(8);
        let batch = MessageBatch {
            kind: UpsertKind::Append,
            messages: vec![message(false, text("old"))],
        };
        assert_eq!(engine(true).on_batch(&batch, &conn).await, 0);
    }

    #[tokio::test]
    async fn reacts_to_each_message_in_live_batch() {
        let (conn, _rx) = ConnectionHandle::channel(8);
        let batch = MessageBatch {
            kind: UpsertKind::Notify,
            messages: vec![
                message(false, text("a")),
                message(true, text("b")),
                message(false, text("c")),
            ],
        };
        assert_eq!(engine(true).on_batch(&batch, &conn).await, 2);
    }

    #[test]
    fn choice_stays_within_set() {
        let e = engine(true);
        for _ in 0..200 {
            assert!(["👍", "❤️"].contains(&e.choose()));
        }
    }

    #[test]
    fn rejects_empty_set() {
        assert_eq!(
            AutoReactionEngine::new(true, Vec::new()).unwrap_err(),
            ConfigError::EmptyReactions
        );
    }
}
