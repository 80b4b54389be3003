//! Dot-prefixed chat commands.
//!
//! In private mode only messages sent from the bot's own account are
//! treated as commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use wabot_core::ConnectionHandle;
use wabot_core::Mode;
use wabot_core::event::{ChatMessage, MessageBatch, UpsertKind};

use super::HandlerSettings;

pub const PREFIX: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Ping,
    Alive,
}

/// Extract a command from `message`, honouring the bot's mode.
pub fn parse_command(message: &ChatMessage, mode: Mode) -> Option<BotCommand> {
    if mode == Mode::Private && !message.key.from_me {
        return None;
    }
    let body = message.text()?.trim().strip_prefix(PREFIX)?;
    let word = body.split_whitespace().next()?.to_ascii_lowercase();
    match word.as_str() {
        "ping" => Some(BotCommand::Ping),
        "alive" | "uptime" => Some(BotCommand::Alive),
        _ => None,
    }
}

pub fn reply_text(
    command: BotCommand,
    message: &ChatMessage,
    settings: &HandlerSettings,
    now: DateTime<Utc>,
) -> String {
    match command {
        BotCommand::Ping => match message.timestamp {
            Some(sent) => {
                let lag = (now.timestamp() - sent).max(0);
                format!("🏓 Pong! ({lag}s)")
            }
            None => "🏓 Pong!".to_string(),
        },
        BotCommand::Alive => {
            let up = (now - settings.started).num_seconds().max(0);
            format!(
                "✅ {} is alive\nMode: {}\nUptime: {}h {}m {}s",
                settings.bot_name,
                settings.mode,
                up / 3600,
                up % 3600 / 60,
                up % 60
            )
        }
    }
}

pub async fn handle(batch: &MessageBatch, conn: &ConnectionHandle, settings: &HandlerSettings) -> Result<()> {
    if batch.kind != UpsertKind::Notify {
        return Ok(());
    }
    for message in &batch.messages {
        let Some(command) = parse_command(message, settings.mode) else {
            continue;
        };
        tracing::info!(chat = %message.key.remote_jid, ?command, "Command received");
        let text = reply_text(command, message, settings, Utc::now());
        conn.reply(&message.key, &text).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabot_core::backend::Command;
    use wabot_core::event::{MessageContent, MessageKey};

    fn message(text: &str, from_me: bool) -> ChatMessage {
        ChatMessage {
            key: MessageKey {
                remote_jid: "15557654321@s.whatsapp.net".into(),
                id: "ABC".into(),
                from_me,
                participant: None,
            },
            push_name: None,
            timestamp: Some(1_700_000_000),
            content: Some(MessageContent::Text { text: text.into() }),
        }
    }

    fn settings(mode: Mode) -> HandlerSettings {
        HandlerSettings {
            bot_name: "RCD-MD".into(),
            mode,
            reject_calls: false,
            started: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn parses_known_commands_case_insensitively() {
        assert_eq!(parse_command(&message(".ping", false), Mode::Public), Some(BotCommand::Ping));
        assert_eq!(parse_command(&message("  .PING now", false), Mode::Public), Some(BotCommand::Ping));
        assert_eq!(parse_command(&message(".uptime", false), Mode::Public), Some(BotCommand::Alive));
        assert_eq!(parse_command(&message("ping", false), Mode::Public), None);
        assert_eq!(parse_command(&message(".menu", false), Mode::Public), None);
    }

    #[test]
    fn private_mode_only_obeys_own_account() {
        assert_eq!(parse_command(&message(".ping", false), Mode::Private), None);
        assert_eq!(parse_command(&message(".ping", true), Mode::Private), Some(BotCommand::Ping));
    }

    #[test]
    fn alive_reports_uptime() {
        let s = settings(Mode::Public);
        let now = DateTime::from_timestamp(1_700_003_725, 0).unwrap();
        let text = reply_text(BotCommand::Alive, &message(".alive", false), &s, now);
        assert!(text.contains("RCD-MD is alive"), "{text}");
        assert!(text.contains("Uptime: 1h 2m 5s"), "{text}");
        assert!(text.contains("Mode: public"), "{text}");
    }

    #[tokio::test]
    async fn ping_is_answered_in_the_same_chat() {
        let (conn, mut rx) = ConnectionHandle::channel(4);
        let batch = MessageBatch {
            kind: UpsertKind::Notify,
            messages: vec![message(".ping", false), message("hello", false)],
        };
        handle(&batch, &conn, &settings(Mode::Public)).await.unwrap();
        drop(conn);

        match rx.recv().await {
            Some(Command::SendText { to, text, quoted }) => {
                assert_eq!(to, "15557654321@s.whatsapp.net");
                assert!(text.starts_with("🏓 Pong!"), "{text}");
                assert_eq!(quoted.map(|k| k.id), Some("ABC".to_string()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn history_batches_are_not_commands() {
        let (conn, mut rx) = ConnectionHandle::channel(4);
        let batch = MessageBatch {
            kind: UpsertKind::Append,
            messages: vec![message(".ping", false)],
        };
        handle(&batch, &conn, &settings(Mode::Public)).await.unwrap();
        drop(conn);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_connection_surfaces_as_error() {
        let (conn, rx) = ConnectionHandle::channel(4);
        drop(rx);
        let batch = MessageBatch {
            kind: UpsertKind::Notify,
            messages: vec![message(".ping", false)],
        };
        assert!(handle(&batch, &conn, &settings(Mode::Public)).await.is_err());
    }
}
