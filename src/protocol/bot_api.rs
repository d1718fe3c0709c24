//! Telegram Bot API client: in-process async long-polling.
//!
//! Polls `getUpdates` for new messages, converts them into [`InboundEvent`]s,
//! and emits them to subscribed handlers. Outbound actions map onto
//! `sendMessage`, `editMessageText`, `deleteMessage`, and
//! `getUserProfilePhotos`; media bytes come from `getFile` plus the file
//! download endpoint.
//!
//! The Bot API never echoes the bot's own messages back through
//! `getUpdates`, so a successful `sendMessage` emits an outgoing event itself.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Action, ActionResult, ClientFactory, EventHandler, HandlerSet, InboundEvent, MediaKind,
    MediaRef, ProtocolClient, ProtocolError, RawChat, RawUser, Subscription,
};
use crate::types::AccountCredential;

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Initial backoff on poll failure, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff on poll failure, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Extra seconds added to the HTTP timeout beyond the long-poll timeout,
/// so the TCP socket stays open while Telegram holds the request.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Timeout for every non-polling call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bot API client settings shared by every account.
#[derive(Debug, Clone)]
pub struct BotApiConfig {
    /// API base URL, without trailing slash.
    pub api_base: String,
    /// Long-poll timeout for `getUpdates`, in seconds.
    pub poll_timeout_secs: u32,
}

impl Default for BotApiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            poll_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Telegram API types (minimal subset)
// ---------------------------------------------------------------------------

/// Generic Bot API response wrapper.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

/// `Update` object.
#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
    edited_message: Option<TelegramMessage>,
    channel_post: Option<TelegramMessage>,
}

/// `Message` object (subset of fields we use).
#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    from: Option<RawUser>,
    chat: RawChat,
    date: i64,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<TelegramPhotoSize>>,
    document: Option<TelegramFileMeta>,
    sticker: Option<TelegramSticker>,
    animation: Option<TelegramFileMeta>,
    reply_markup: Option<serde_json::Value>,
}

/// `PhotoSize` object.
#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
    file_unique_id: String,
    file_size: Option<u64>,
}

/// Shared shape of `Document` and `Animation`.
#[derive(Debug, Deserialize)]
struct TelegramFileMeta {
    file_id: String,
    file_unique_id: String,
    mime_type: Option<String>,
    file_size: Option<u64>,
}

/// `Sticker` object.
#[derive(Debug, Deserialize)]
struct TelegramSticker {
    file_id: String,
    file_unique_id: String,
    #[serde(default)]
    is_animated: bool,
    #[serde(default)]
    is_video: bool,
    file_size: Option<u64>,
}

/// `File` object returned by `getFile`.
#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

/// `UserProfilePhotos` object.
#[derive(Debug, Deserialize)]
struct TelegramProfilePhotos {
    photos: Vec<Vec<TelegramPhotoSize>>,
}

/// `ChatFullInfo` object (photo only).
#[derive(Debug, Deserialize)]
struct TelegramChatInfo {
    photo: Option<TelegramChatPhoto>,
}

/// `ChatPhoto` object.
#[derive(Debug, Deserialize)]
struct TelegramChatPhoto {
    big_file_id: String,
    big_file_unique_id: String,
}

impl TelegramChatPhoto {
    fn into_media_ref(self) -> MediaRef {
        MediaRef {
            kind: MediaKind::Photo,
            file_id: self.big_file_id,
            file_unique_id: Some(self.big_file_unique_id),
            mime_type: None,
            file_size: None,
            is_animated: false,
            is_video: false,
        }
    }
}

impl TelegramPhotoSize {
    fn into_media_ref(self) -> MediaRef {
        MediaRef {
            kind: MediaKind::Photo,
            file_id: self.file_id,
            file_unique_id: Some(self.file_unique_id),
            mime_type: None,
            file_size: self.file_size,
            is_animated: false,
            is_video: false,
        }
    }
}

impl TelegramMessage {
    /// Convert into the protocol-neutral event model.
    ///
    /// `bot_user_id` is the id `getMe` reported for this bot; messages it
    /// authored are outgoing.
    fn into_event(self, bot_user_id: i64) -> InboundEvent {
        let outgoing = self
            .from
            .as_ref()
            .is_some_and(|user| user.id == bot_user_id);

        let media = self.media_ref();

        InboundEvent {
            message_id: self.message_id,
            chat: Some(self.chat),
            from: self.from,
            date: self.date,
            text: self.text,
            caption: self.caption,
            outgoing,
            media,
            reply_markup: self.reply_markup,
        }
    }

    /// Pick the attached media, if any.
    ///
    /// Animations also carry a `document` field, so they are checked first.
    /// For photos the largest size is last by Telegram convention.
    fn media_ref(&self) -> Option<MediaRef> {
        if let Some(animation) = &self.animation {
            return Some(file_meta_ref(MediaKind::Animation, animation));
        }
        if let Some(sticker) = &self.sticker {
            return Some(MediaRef {
                kind: MediaKind::Sticker,
                file_id: sticker.file_id.clone(),
                file_unique_id: Some(sticker.file_unique_id.clone()),
                mime_type: None,
                file_size: sticker.file_size,
                is_animated: sticker.is_animated,
                is_video: sticker.is_video,
            });
        }
        if let Some(photo) = self.photo.as_ref().and_then(|sizes| sizes.last()) {
            return Some(MediaRef {
                kind: MediaKind::Photo,
                file_id: photo.file_id.clone(),
                file_unique_id: Some(photo.file_unique_id.clone()),
                mime_type: None,
                file_size: photo.file_size,
                is_animated: false,
                is_video: false,
            });
        }
        self.document
            .as_ref()
            .map(|document| file_meta_ref(MediaKind::Document, document))
    }
}

fn file_meta_ref(kind: MediaKind, meta: &TelegramFileMeta) -> MediaRef {
    MediaRef {
        kind,
        file_id: meta.file_id.clone(),
        file_unique_id: Some(meta.file_unique_id.clone()),
        mime_type: meta.mime_type.clone(),
        file_size: meta.file_size,
        is_animated: false,
        is_video: false,
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Thin typed wrapper over the Bot API HTTP endpoints for one token.
#[derive(Clone)]
struct BotApi {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl BotApi {
    /// Call a Bot API method and unwrap the response envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T, ProtocolError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(params)
            .timeout(timeout)
            .send()
            .await?;
        let body = resp.bytes().await?;
        let response: TelegramResponse<T> = serde_json::from_slice(&body)?;

        if !response.ok {
            let code = response.error_code.unwrap_or_default();
            let description = response
                .description
                .unwrap_or_else(|| format!("{method} failed"));
            return Err(ProtocolError::Api(format!("{code}: {description}")));
        }

        response
            .result
            .ok_or_else(|| ProtocolError::Api(format!("{method} returned no result")))
    }

    async fn download(&self, file_path: &str) -> Result<Vec<u8>, ProtocolError> {
        let url = format!("{}/file/bot{}/{file_path}", self.api_base, self.bot_token);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

fn request_timeout() -> Duration {
    Duration::from_secs(REQUEST_TIMEOUT_SECS)
}

fn parse_message_id(raw: &str) -> Result<i64, ProtocolError> {
    raw.parse::<i64>()
        .map_err(|_| ProtocolError::Api(format!("invalid message id: {raw}")))
}

fn is_unauthorized(err: &ProtocolError) -> bool {
    matches!(err, ProtocolError::Api(msg) if msg.starts_with("401:") || msg.starts_with("404:"))
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// State moved into the background polling task.
struct Poller {
    api: BotApi,
    account_id: String,
    bot_user_id: i64,
    poll_timeout_secs: u32,
    handlers: Arc<HandlerSet>,
    connected: Arc<AtomicBool>,
    offset: Arc<AtomicI64>,
}

impl Poller {
    /// Main polling loop with exponential backoff on errors.
    ///
    /// Marks the session not connected while polls fail, so the supervisor
    /// sees a degraded session. Stops for good when the token is rejected.
    async fn run(self) {
        let mut backoff_ms: u64 = INITIAL_BACKOFF_MS;

        loop {
            match self.poll_updates().await {
                Ok(updates) => {
                    backoff_ms = INITIAL_BACKOFF_MS;
                    self.connected.store(true, Ordering::SeqCst);

                    for update in updates {
                        // Advance offset so we don't re-process this update.
                        self.offset
                            .store(update.update_id.saturating_add(1), Ordering::SeqCst);

                        let message = update
                            .message
                            .or(update.edited_message)
                            .or(update.channel_post);
                        if let Some(message) = message {
                            let event = message.into_event(self.bot_user_id);
                            debug!(
                                account_id = %self.account_id,
                                message_id = event.message_id,
                                "received update"
                            );
                            self.handlers.emit(&event);
                        }
                    }
                }
                Err(e) if is_unauthorized(&e) => {
                    warn!(account_id = %self.account_id, error = %e, "token rejected, polling stopped");
                    self.connected.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!(
                        account_id = %self.account_id,
                        error = %e,
                        backoff_ms,
                        "poll error, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn poll_updates(&self) -> Result<Vec<TelegramUpdate>, ProtocolError> {
        let mut params = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "edited_message", "channel_post"],
        });
        let offset = self.offset.load(Ordering::SeqCst);
        if offset > 0 {
            params["offset"] = serde_json::Value::from(offset);
        }

        let http_timeout_secs =
            u64::from(self.poll_timeout_secs).saturating_add(POLL_TIMEOUT_MARGIN_SECS);

        self.api
            .call("getUpdates", &params, Duration::from_secs(http_timeout_secs))
            .await
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`ProtocolClient`] backed by the Telegram Bot API.
pub struct BotApiClient {
    api: BotApi,
    account_id: String,
    poll_timeout_secs: u32,
    handlers: Arc<HandlerSet>,
    connected: Arc<AtomicBool>,
    offset: Arc<AtomicI64>,
    bot_user_id: AtomicI64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BotApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApiClient")
            .field("account_id", &self.account_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl BotApiClient {
    /// Create an unconnected client for one bot token.
    pub fn new(http: reqwest::Client, config: &BotApiConfig, credential: &AccountCredential) -> Self {
        Self {
            api: BotApi {
                http,
                api_base: config.api_base.trim_end_matches('/').to_owned(),
                bot_token: credential.bot_token.clone(),
            },
            account_id: credential.account_id.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
            handlers: Arc::new(HandlerSet::default()),
            connected: Arc::new(AtomicBool::new(false)),
            offset: Arc::new(AtomicI64::new(0)),
            bot_user_id: AtomicI64::new(0),
            poller: Mutex::new(None),
        }
    }

    fn stop_poller(&self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

impl Drop for BotApiClient {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

#[async_trait]
impl ProtocolClient for BotApiClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        let me: RawUser = self
            .api
            .call("getMe", &serde_json::json!({}), request_timeout())
            .await?;

        self.bot_user_id.store(me.id, Ordering::SeqCst);
        self.stop_poller();
        let poller = Poller {
            api: self.api.clone(),
            account_id: self.account_id.clone(),
            bot_user_id: me.id,
            poll_timeout_secs: self.poll_timeout_secs,
            handlers: Arc::clone(&self.handlers),
            connected: Arc::clone(&self.connected),
            offset: Arc::clone(&self.offset),
        };
        let handle = tokio::spawn(poller.run());
        if let Ok(mut slot) = self.poller.lock() {
            *slot = Some(handle);
        }
        self.connected.store(true, Ordering::SeqCst);

        info!(
            account_id = %self.account_id,
            username = me.username.as_deref().unwrap_or(""),
            "bot session connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.stop_poller();
        self.connected.store(false, Ordering::SeqCst);
        info!(account_id = %self.account_id, "bot session disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, handler: EventHandler) -> Subscription {
        self.handlers.subscribe(handler)
    }

    async fn invoke(&self, action: Action) -> Result<ActionResult, ProtocolError> {
        self.ensure_connected()?;
        debug!(account_id = %self.account_id, action = action.name(), "invoking action");

        match action {
            Action::SendMessage {
                chat_id,
                text,
                reply_to,
            } => {
                let mut params = serde_json::json!({ "chat_id": chat_id, "text": text });
                if let Some(reply_to) = reply_to {
                    params["reply_parameters"] =
                        serde_json::json!({ "message_id": parse_message_id(&reply_to)? });
                }
                let sent: TelegramMessage =
                    self.api.call("sendMessage", &params, request_timeout()).await?;
                let message_id = sent.message_id.to_string();
                let mut event = sent.into_event(self.bot_user_id.load(Ordering::SeqCst));
                event.outgoing = true;
                self.handlers.emit(&event);
                Ok(ActionResult::Sent { message_id })
            }
            Action::EditMessage {
                chat_id,
                message_id,
                text,
            } => {
                let params = serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": parse_message_id(&message_id)?,
                    "text": text,
                });
                let _: serde_json::Value = self
                    .api
                    .call("editMessageText", &params, request_timeout())
                    .await?;
                Ok(ActionResult::Done)
            }
            Action::DeleteMessage {
                chat_id,
                message_id,
            } => {
                let params = serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": parse_message_id(&message_id)?,
                });
                let _: bool = self
                    .api
                    .call("deleteMessage", &params, request_timeout())
                    .await?;
                Ok(ActionResult::Done)
            }
            // Groups and channels have negative ids and no user profile.
            Action::GetProfilePhoto { user_id } if user_id.starts_with('-') => {
                let params = serde_json::json!({ "chat_id": user_id });
                let chat: TelegramChatInfo =
                    self.api.call("getChat", &params, request_timeout()).await?;
                Ok(ActionResult::Photo(
                    chat.photo.map(TelegramChatPhoto::into_media_ref),
                ))
            }
            Action::GetProfilePhoto { user_id } => {
                let params = serde_json::json!({ "user_id": user_id, "limit": 1 });
                let photos: TelegramProfilePhotos = self
                    .api
                    .call("getUserProfilePhotos", &params, request_timeout())
                    .await?;
                let largest = photos
                    .photos
                    .into_iter()
                    .next()
                    .and_then(|mut sizes| sizes.pop())
                    .map(TelegramPhotoSize::into_media_ref);
                Ok(ActionResult::Photo(largest))
            }
        }
    }

    async fn download_binary(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;
        let file: TelegramFile = self
            .api
            .call(
                "getFile",
                &serde_json::json!({ "file_id": media.file_id }),
                request_timeout(),
            )
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| ProtocolError::Api("file has no download path".to_owned()))?;
        self.api.download(&path).await
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates [`BotApiClient`]s sharing one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct BotApiFactory {
    http: reqwest::Client,
    config: BotApiConfig,
}

impl BotApiFactory {
    /// Create a factory with its own HTTP client.
    pub fn new(config: BotApiConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self { http, config }
    }
}

impl ClientFactory for BotApiFactory {
    fn create(
        &self,
        credential: &AccountCredential,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        if AccountCredential::from_token(&credential.bot_token).is_none() {
            return Err(ProtocolError::InvalidCredential(format!(
                "malformed bot token for account {}",
                credential.account_id
            )));
        }
        Ok(Arc::new(BotApiClient::new(
            self.http.clone(),
            &self.config,
            credential,
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
