//! Incoming call offers.

use anyhow::Result;
use wabot_core::ConnectionHandle;
use wabot_core::event::{CallOffer, CallStatus};

use super::HandlerSettings;

pub const REJECT_NOTICE: &str = "📵 This number does not take calls. Please send a message instead.";

/// Only fresh one-to-one offers are rejected; group calls are left alone.
pub fn should_reject(offer: &CallOffer, settings: &HandlerSettings) -> bool {
    settings.reject_calls && offer.status == CallStatus::Offer && !offer.is_group
}

pub async fn handle(calls: &[CallOffer], conn: &ConnectionHandle, settings: &HandlerSettings) -> Result<()> {
    for offer in calls {
        tracing::info!(
            from = %offer.from,
            call_id = %offer.id,
            video = offer.is_video,
            status = ?offer.status,
            "Call event"
        );
        if !should_reject(offer, settings) {
            continue;
        }
        conn.reject_call(&offer.id, &offer.from).await?;
        conn.send_text(&offer.from, REJECT_NOTICE).await?;
        tracing::info!(from = %offer.from, "Call rejected");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wabot_core::Mode;
    use wabot_core::backend::Command;

    fn offer(status: CallStatus, is_group: bool) -> CallOffer {
        CallOffer {
            id: "CALL1".into(),
            from: "15551112222@s.whatsapp.net".into(),
            is_video: false,
            is_group,
            status,
        }
    }

    fn settings(reject_calls: bool) -> HandlerSettings {
        HandlerSettings {
            bot_name: "RCD-MD".into(),
            mode: Mode::Public,
            reject_calls,
            started: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rejects_offer_and_explains() {
        let (conn, mut rx) = ConnectionHandle::channel(4);
        handle(&[offer(CallStatus::Offer, false)], &conn, &settings(true))
            .await
            .unwrap();
        drop(conn);

        assert_eq!(
            rx.recv().await,
            Some(Command::RejectCall {
                call_id: "CALL1".into(),
                from: "15551112222@s.whatsapp.net".into(),
            })
        );
        assert!(matches!(rx.recv().await, Some(Command::SendText { ref text, .. }) if text == REJECT_NOTICE));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn leaves_calls_alone_unless_configured() {
        assert!(!should_reject(&offer(CallStatus::Offer, false), &settings(false)));
        assert!(!should_reject(&offer(CallStatus::Offer, true), &settings(true)));
        assert!(!should_reject(&offer(CallStatus::Terminate, false), &settings(true)));
    }
}
