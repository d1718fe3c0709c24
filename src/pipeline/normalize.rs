//! Raw event to [`NormalizedMessage`] conversion.
//!
//! This is the only place protocol-native integers are turned into decimal
//! strings. Nothing downstream sees an `i64` identifier.

use chrono::{DateTime, Utc};

use crate::protocol::InboundEvent;
use crate::types::{NormalizedMessage, SenderInfo};

/// Convert a raw event for `account_id`.
///
/// Returns `None` when the event has no resolvable chat; callers drop such
/// events without logging above `debug`.
pub fn normalize(account_id: &str, event: &InboundEvent) -> Option<NormalizedMessage> {
    let chat = event.chat.as_ref()?;

    let sender = event
        .from
        .as_ref()
        .map(|user| SenderInfo {
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            username: user.username.clone(),
            is_bot: user.is_bot,
        })
        .unwrap_or_default();

    let text = event
        .text
        .clone()
        .or_else(|| event.caption.clone())
        .unwrap_or_default();

    Some(NormalizedMessage {
        account_id: account_id.to_owned(),
        chat_id: chat.id.to_string(),
        message_id: event.message_id.to_string(),
        text,
        is_outgoing: event.outgoing,
        timestamp: timestamp(event.date),
        sender,
        sender_id: event.from.as_ref().map(|user| user.id.to_string()),
        profile_photo: None,
        media_ref: event.media.clone(),
        media_asset: None,
        reply_markup: event.reply_markup.clone(),
    })
}

/// Unix seconds to UTC; out-of-range values fall back to the epoch.
fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
