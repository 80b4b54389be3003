//! Group membership changes.

use wabot_core::event::{GroupParticipantsUpdate, ParticipantAction};

/// One-line summary of a membership change.
pub fn describe(update: &GroupParticipantsUpdate) -> String {
    let verb = match update.action {
        ParticipantAction::Add => "joined",
        ParticipantAction::Remove => "left",
        ParticipantAction::Promote => "promoted",
        ParticipantAction::Demote => "demoted",
        ParticipantAction::Other => "updated in",
    };
    let who = update.participants.join(", ");
    match &update.author {
        Some(author) if update.action != ParticipantAction::Add || !update.participants.contains(author) => {
            format!("{who} {verb} {} (by {author})", update.group_jid)
        }
        _ => format!("{who} {verb} {}", update.group_jid),
    }
}

pub fn handle(update: &GroupParticipantsUpdate) {
    tracing::info!(group = %update.group_jid, action = ?update.action, "{}", describe(update));
}
