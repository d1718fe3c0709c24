//! HTTP client for the ingestion backend.
//!
//! Three endpoints, all relative to one base URL:
//! - ingest: one JSON message per call ([`IngestPayload`])
//! - assets: base64 media upload, deduplicated server-side by key
//! - roster: the accounts this relay should connect
//!
//! Every call makes exactly one request and classifies its failure as a
//! [`CallError`]; retrying is left to the [`crate::pipeline::retry`] layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::accounts::RosterSource;
use crate::pipeline::media::{AssetResponse, AssetStore, AssetUpload};
use crate::pipeline::queue::Deliver;
use crate::pipeline::retry::CallError;
use crate::registry::Registry;
use crate::types::{AccountCredential, NormalizedMessage, SenderInfo};

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Backend endpoint settings.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://app.example.com`.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Path of the ingestion endpoint.
    pub ingest_path: String,
    /// Path of the asset endpoint.
    pub assets_path: String,
    /// Path of the roster endpoint.
    pub roster_path: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("ingest_path", &self.ingest_path)
            .field("assets_path", &self.assets_path)
            .field("roster_path", &self.roster_path)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Message body sent to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestPayload {
    /// Always `"message"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Message fields.
    pub data: IngestData,
}

/// `data` object of [`IngestPayload`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestData {
    /// Chat id, decimal string.
    pub chat_id: String,
    /// Message id, decimal string.
    pub message_id: String,
    /// Text or caption.
    pub text: String,
    /// Whether the account sent the message.
    pub is_outgoing: bool,
    /// Unix timestamp in seconds.
    pub date: i64,
    /// Author details.
    pub sender: SenderInfo,
    /// Encoded chat avatar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_photo_url: Option<String>,
    /// Content key of the attached media.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_unique_id: Option<String>,
    /// Reply markup as received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
    /// Token of the receiving bot, identifying the account to the backend.
    pub bot_token: String,
    /// Public URL of the stored media asset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Kind of the attached media.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl IngestPayload {
    /// Build the payload for `message` received by the bot with `bot_token`.
    pub fn new(message: &NormalizedMessage, bot_token: &str) -> Self {
        let asset = message.media_asset.as_ref();
        let file_unique_id = asset
            .map(|a| a.content_key.clone())
            .or_else(|| {
                message
                    .media_ref
                    .as_ref()
                    .and_then(|m| m.file_unique_id.clone())
            });
        let media_url = asset.and_then(|a| a.public_url.clone());
        let media_type = media_url
            .as_ref()
            .and(asset)
            .map(|a| a.media_type.as_str().to_owned());

        Self {
            kind: "message",
            data: IngestData {
                chat_id: message.chat_id.clone(),
                message_id: message.message_id.clone(),
                text: message.text.clone(),
                is_outgoing: message.is_outgoing,
                date: message.timestamp.timestamp(),
                sender: message.sender.clone(),
                profile_photo_url: message.profile_photo.clone(),
                file_unique_id,
                reply_markup: message.reply_markup.clone(),
                bot_token: bot_token.to_owned(),
                media_url,
                media_type,
            },
        }
    }
}

/// Roster endpoint response.
#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[serde(default)]
    accounts: Vec<AccountCredential>,
}

/// Client for the backend endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
    registry: Arc<Registry>,
}

impl BackendClient {
    /// Create a client. `registry` supplies bot tokens for ingest payloads.
    pub fn new(config: BackendConfig, registry: Arc<Registry>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            http,
            config,
            registry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Turn a non-success status into a [`CallError`].
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CallError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CallError::status(status.as_u16(), &body))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, CallError> {
        let req = self.authorize(self.http.post(self.url(path)).json(body));
        Self::check(req.send().await?).await
    }

    /// Send one message to the ingestion endpoint.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the request.
    pub async fn ingest(&self, payload: &IngestPayload) -> Result<(), CallError> {
        self.post_json(&self.config.ingest_path, payload).await?;
        debug!(
            chat_id = %payload.data.chat_id,
            message_id = %payload.data.message_id,
            "message ingested"
        );
        Ok(())
    }

    /// Upload one media asset.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; an undecodable success body is
    /// [`CallError::Malformed`].
    pub async fn upload_asset(&self, upload: &AssetUpload) -> Result<AssetResponse, CallError> {
        let resp = self.post_json(&self.config.assets_path, upload).await?;
        resp.json::<AssetResponse>()
            .await
            .map_err(|e| CallError::Malformed(format!("asset response: {e}")))
    }

    /// Fetch the account roster. Entries with an empty id or token are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the request.
    pub async fn fetch_roster(&self) -> Result<Vec<AccountCredential>, CallError> {
        let req = self.authorize(self.http.get(self.url(&self.config.roster_path)));
        let resp = Self::check(req.send().await?).await?;
        let roster: RosterResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(format!("roster response: {e}")))?;

        let accounts: Vec<AccountCredential> = roster
            .accounts
            .into_iter()
            .filter(|cred| {
                let usable = !cred.account_id.trim().is_empty() && !cred.bot_token.trim().is_empty();
                if !usable {
                    warn!(account_id = %cred.account_id, "skipping roster entry without id or token");
                }
                usable
            })
            .collect();
        debug!(count = accounts.len(), "roster fetched");
        Ok(accounts)
    }
}

#[async_trait]
impl Deliver for BackendClient {
    async fn deliver(&self, message: &NormalizedMessage) -> Result<(), CallError> {
        let credential = self.registry.credential(&message.account_id).ok_or_else(|| {
            CallError::Malformed(format!("no credential for account {}", message.account_id))
        })?;
        self.ingest(&IngestPayload::new(message, &credential.bot_token))
            .await
    }
}

#[async_trait]
impl AssetStore for BackendClient {
    async fn store_asset(&self, upload: &AssetUpload) -> Result<AssetResponse, CallError> {
        self.upload_asset(upload).await
    }
}

#[async_trait]
impl RosterSource for BackendClient {
    async fn fetch_roster(&self) -> Result<Vec<AccountCredential>, CallError> {
        BackendClient::fetch_roster(self).await
    }
}
