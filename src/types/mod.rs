//! Core records that flow through the relay pipeline.
//!
//! Every identifier that originates from the messaging protocol is carried as
//! a decimal string. The protocol's integers can exceed the range a JSON
//! consumer can represent exactly, so they never travel as numbers past the
//! normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{MediaKind, MediaRef};

/// Display details of the author of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    /// First name; empty when the protocol did not provide a sender.
    pub first_name: String,
    /// Last name, if set.
    pub last_name: Option<String>,
    /// Public username without the leading `@`.
    pub username: Option<String>,
    /// Whether the sender is itself an automated account.
    pub is_bot: bool,
}

/// Canonical form of an inbound message, ready for delivery.
///
/// Built by the normalizer and enriched once with avatar and media data
/// before it is enqueued. Nothing mutates it after that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Account that received the message.
    pub account_id: String,
    /// Conversation identifier, decimal string.
    pub chat_id: String,
    /// Message identifier within the conversation, decimal string.
    pub message_id: String,
    /// Message text, or the media caption. Empty when neither is present.
    pub text: String,
    /// Whether the account itself sent the message.
    pub is_outgoing: bool,
    /// Protocol timestamp of the message.
    pub timestamp: DateTime<Utc>,
    /// Flattened author details.
    pub sender: SenderInfo,
    /// Numeric identifier of the sender, decimal string, used for avatar lookup.
    pub sender_id: Option<String>,
    /// Encoded avatar of the conversation, filled in by the photo cache.
    pub profile_photo: Option<String>,
    /// Attached media reference as received from the protocol.
    pub media_ref: Option<MediaRef>,
    /// Stored asset for the attached media, filled in by the deduplicator.
    pub media_asset: Option<MediaAsset>,
    /// Inline keyboard or other reply markup, passed through untouched.
    pub reply_markup: Option<serde_json::Value>,
}

impl NormalizedMessage {
    /// Attach an encoded avatar.
    #[must_use]
    pub fn with_profile_photo(mut self, photo: Option<String>) -> Self {
        self.profile_photo = photo;
        self
    }

    /// Attach the resolved media asset.
    #[must_use]
    pub fn with_media_asset(mut self, asset: Option<MediaAsset>) -> Self {
        self.media_asset = asset;
        self
    }
}

/// A message owned by the delivery queue until its terminal outcome.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Correlation id used in logs.
    pub id: Uuid,
    /// The message to deliver.
    pub message: NormalizedMessage,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Retries consumed so far.
    pub retry_count: u32,
}

impl QueueItem {
    /// Wrap a message for enqueueing.
    pub fn new(message: NormalizedMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Terminal disposition of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// The backend accepted the message.
    Delivered,
    /// The backend refused the message; retrying would not help.
    RejectedByBackend,
    /// Every retry failed with a transient error.
    Exhausted,
    /// Evicted to keep the queue within capacity, or abandoned at shutdown.
    Dropped,
}

impl DeliveryOutcome {
    /// Stable lowercase label for logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::RejectedByBackend => "rejected_by_backend",
            Self::Exhausted => "exhausted",
            Self::Dropped => "dropped",
        }
    }
}

/// Media stored by the backend asset endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    /// Deduplication key: the protocol's stable id, or a prefixed content hash.
    pub content_key: String,
    /// Canonical MIME type.
    pub mime_type: String,
    /// Size of the downloaded bytes.
    pub size_bytes: u64,
    /// Kind of media the asset came from.
    pub media_type: MediaKind,
    /// Whether the backend already had this content.
    pub cached: bool,
    /// Public URL returned by the backend, if any.
    pub public_url: Option<String>,
    /// Storage path returned by the backend, if any.
    pub storage_path: Option<String>,
}

/// Credential for one bot account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredential {
    /// Stable account identifier.
    pub account_id: String,
    /// Bot API token.
    pub bot_token: String,
    /// Optional human label.
    #[serde(default)]
    pub label: Option<String>,
}

impl std::fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredential")
            .field("account_id", &self.account_id)
            .field("bot_token", &"[REDACTED]")
            .field("label", &self.label)
            .finish()
    }
}

impl AccountCredential {
    /// Build a credential from a bare bot token.
    ///
    /// The account id is the numeric bot id that prefixes every token
    /// (`123456:AAE...`). Returns `None` for tokens without that shape.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        let (bot_id, secret) = token.split_once(':')?;
        if bot_id.is_empty() || secret.is_empty() || !bot_id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            account_id: bot_id.to_owned(),
            bot_token: token.to_owned(),
            label: None,
        })
    }
}

/// Liveness of one account's protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live session.
    Disconnected,
    /// Initial authentication in progress.
    Connecting,
    /// Session live and verified by the last probe.
    Connected,
    /// Probe found the session not connected.
    Degraded,
    /// Repair in progress.
    Reconnecting,
}

impl ConnectionState {
    /// Stable lowercase label for logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
        }
    }
}
