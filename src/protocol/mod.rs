//! Capability interface to the external messaging protocol client.
//!
//! The relay never speaks the wire protocol itself. Each account owns one
//! [`ProtocolClient`] that maintains the session, emits [`InboundEvent`]s to
//! subscribed handlers, performs outbound [`Action`]s, and fetches media bytes.
//!
//! Two implementations ship with the crate:
//! - [`bot_api::BotApiClient`]: Telegram Bot API over HTTPS long-polling
//! - [`loopback::LoopbackClient`]: in-process client fed with synthetic events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::AccountCredential;

pub mod bot_api;
pub mod loopback;

// ---------------------------------------------------------------------------
// Raw event model
// ---------------------------------------------------------------------------

/// Author of a raw event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUser {
    /// Protocol user id.
    pub id: i64,
    /// Whether the user is an automated account.
    #[serde(default)]
    pub is_bot: bool,
    /// First name.
    #[serde(default)]
    pub first_name: String,
    /// Last name.
    #[serde(default)]
    pub last_name: Option<String>,
    /// Username without `@`.
    #[serde(default)]
    pub username: Option<String>,
}

/// Conversation a raw event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChat {
    /// Protocol chat id. Negative for groups and channels.
    pub id: i64,
    /// Chat type (`private`, `group`, `supergroup`, `channel`).
    #[serde(rename = "type", default)]
    pub chat_type: String,
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Compressed photo.
    Photo,
    /// Arbitrary file.
    Document,
    /// Sticker (static, animated vector, or video).
    Sticker,
    /// GIF-style looping animation.
    Animation,
}

impl MediaKind {
    /// Stable lowercase label, as sent to the asset endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
        }
    }
}

/// Reference to media the protocol client can download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Media kind.
    pub kind: MediaKind,
    /// Download handle, valid for this account only.
    pub file_id: String,
    /// Stable identifier shared by every copy of the same content, if provided.
    #[serde(default)]
    pub file_unique_id: Option<String>,
    /// MIME type declared by the sender.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Declared size in bytes.
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Sticker encoded as an animated vector.
    #[serde(default)]
    pub is_animated: bool,
    /// Sticker encoded as video.
    #[serde(default)]
    pub is_video: bool,
}

/// An event as emitted by the protocol client.
///
/// Only the fields the normalizer extracts are modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Message id within the chat.
    pub message_id: i64,
    /// Conversation, if resolvable.
    pub chat: Option<RawChat>,
    /// Author, if known.
    pub from: Option<RawUser>,
    /// Unix timestamp in seconds.
    pub date: i64,
    /// Message text.
    pub text: Option<String>,
    /// Media caption.
    pub caption: Option<String>,
    /// Whether the account itself sent the message.
    #[serde(default)]
    pub outgoing: bool,
    /// Attached media.
    pub media: Option<MediaRef>,
    /// Reply markup, passed through as-is.
    pub reply_markup: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Outbound operation performed through the protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a text message.
    SendMessage {
        /// Target chat.
        chat_id: String,
        /// Message text.
        text: String,
        /// Message to reply to.
        reply_to: Option<String>,
    },
    /// Replace the text of a sent message.
    EditMessage {
        /// Target chat.
        chat_id: String,
        /// Message to edit.
        message_id: String,
        /// New text.
        text: String,
    },
    /// Delete a message.
    DeleteMessage {
        /// Target chat.
        chat_id: String,
        /// Message to delete.
        message_id: String,
    },
    /// Look up the current profile photo of a user or chat.
    GetProfilePhoto {
        /// User or chat id.
        user_id: String,
    },
}

impl Action {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::GetProfilePhoto { .. } => "get_profile_photo",
        }
    }
}

/// Result of an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// A message was sent.
    Sent {
        /// Id of the new message.
        message_id: String,
    },
    /// The action completed with no payload.
    Done,
    /// Profile photo lookup result.
    Photo(Option<MediaRef>),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a protocol client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The session is not live. Callers treat this as a skip, not a failure.
    #[error("session not connected")]
    NotConnected,

    /// The protocol rejected the request.
    #[error("protocol API error: {0}")]
    Api(String),

    /// HTTP transport failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A response could not be decoded.
    #[error("response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The credential cannot be used with this client.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Callback invoked for every inbound event.
pub type EventHandler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

type HandlerList = Mutex<Vec<(u64, EventHandler)>>;

/// Handlers subscribed to one client.
///
/// Clients embed a `HandlerSet` and call [`HandlerSet::emit`] for each event.
#[derive(Default)]
pub struct HandlerSet {
    next_id: AtomicU64,
    handlers: Arc<HandlerList>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("handlers", &self.len())
            .finish()
    }
}

impl HandlerSet {
    /// Register a handler. It stays attached until the returned token is
    /// cancelled or dropped.
    pub fn subscribe(&self, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push((id, handler));
        }
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Deliver an event to every attached handler.
    ///
    /// Handlers run outside the lock so they may subscribe or cancel.
    pub fn emit(&self, event: &InboundEvent) {
        let snapshot: Vec<EventHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(event.clone());
        }
    }

    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Whether no handler is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancellation token for a subscribed handler.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerList>,
}

impl Subscription {
    /// Detach the handler.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            if let Ok(mut handlers) = handlers.lock() {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client capability
// ---------------------------------------------------------------------------

/// Session with the messaging network for one account.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Establish (or re-establish) the session and start emitting events.
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Stop emitting events and release the session.
    async fn disconnect(&self) -> Result<(), ProtocolError>;

    /// Whether the session is currently live.
    fn is_connected(&self) -> bool;

    /// Attach an event handler.
    fn subscribe(&self, handler: EventHandler) -> Subscription;

    /// Perform an outbound action.
    async fn invoke(&self, action: Action) -> Result<ActionResult, ProtocolError>;

    /// Download the bytes behind a media reference.
    async fn download_binary(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError>;
}

/// Builds protocol clients from stored credentials.
pub trait ClientFactory: Send + Sync {
    /// Create an unconnected client for the credential.
    ///
    /// # Errors
    ///
    /// Returns an error when the credential is unusable.
    fn create(&self, credential: &AccountCredential)
        -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}
