//! Handlers registered with the dispatcher.

pub mod call;
pub mod group;
pub mod message;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use wabot_core::event::{CallBatch, GroupParticipantsUpdate, MessageBatch};
use wabot_core::{ConnectionHandle, Handlers, Mode, handler};

/// Behaviour switches shared by all handlers.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub bot_name: String,
    pub mode: Mode,
    pub reject_calls: bool,
    pub started: DateTime<Utc>,
}

pub fn build(settings: HandlerSettings) -> Handlers {
    let settings = Arc::new(settings);

    let for_messages = settings.clone();
    let for_calls = settings.clone();
    Handlers {
        message: handler(move |batch: Arc<MessageBatch>, conn: ConnectionHandle| {
            let settings = for_messages.clone();
            async move { message::handle(&batch, &conn, &settings).await }
        }),
        call: handler(move |calls: Arc<CallBatch>, conn: ConnectionHandle| {
            let settings = for_calls.clone();
            async move { call::handle(&calls, &conn, &settings).await }
        }),
        group_update: handler(|update: Arc<GroupParticipantsUpdate>, _conn: ConnectionHandle| async move {
            group::handle(&update);
            Ok(())
        }),
    }
}
