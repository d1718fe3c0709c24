//! Media deduplication: download once, key by content, upload via the
//! backend asset store.
//!
//! The backend owns the actual dedup decision (it checks the key before
//! storing). Locally, [`MediaBatch`] avoids downloading the same media twice
//! for one chat within one batch of events.
//!
//! Content keys come from two disjoint spaces: the protocol's stable
//! `file_unique_id` as-is, or [`HASH_KEY_PREFIX`] followed by the hex SHA-256
//! of the bytes. Protocol ids never contain `:`, so the spaces cannot
//! collide.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::retry::{CallError, RetryExecutor};
use crate::protocol::{MediaKind, MediaRef, ProtocolClient, ProtocolError};
use crate::types::MediaAsset;

/// Prefix marking a content key derived from a hash of the bytes.
pub const HASH_KEY_PREFIX: &str = "sha256:";

/// Default size ceiling, matching the Bot API download limit.
pub const DEFAULT_MAX_BYTES: u64 = 20 * 1024 * 1024;

/// Body sent to the asset endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUpload {
    /// Base64-encoded bytes.
    pub base64_data: String,
    /// Canonical MIME type.
    pub mime_type: String,
    /// Content key.
    pub file_unique_id: String,
    /// Protocol download handle.
    pub file_id: String,
    /// Account the media arrived on.
    pub account_id: String,
    /// Media kind label.
    pub media_type: String,
}

/// Asset endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetResponse {
    /// Whether the backend stored (or already had) the asset.
    #[serde(default)]
    pub success: bool,
    /// Whether the key already existed.
    #[serde(default)]
    pub cached: bool,
    /// Public URL of the stored asset.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Storage path of the stored asset.
    #[serde(default)]
    pub storage_path: Option<String>,
}

/// Backend side of asset storage.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Submit one asset. A single call; retries are the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the call.
    async fn store_asset(&self, upload: &AssetUpload) -> Result<AssetResponse, CallError>;
}

/// Canonical MIME type for `media`, or `None` when the encoding is skipped.
///
/// Animated vector stickers are not worth decoding and are skipped.
pub fn canonical_mime(media: &MediaRef) -> Option<String> {
    let mime = match media.kind {
        MediaKind::Photo => "image/jpeg",
        MediaKind::Sticker if media.is_animated => return None,
        MediaKind::Sticker if media.is_video => "video/webm",
        MediaKind::Sticker => "image/webp",
        MediaKind::Animation => "video/mp4",
        MediaKind::Document => {
            return Some(
                media
                    .mime_type
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("application/octet-stream")
                    .to_owned(),
            );
        }
    };
    Some(mime.to_owned())
}

/// Dedup key for `media` with downloaded `bytes`.
pub fn content_key(media: &MediaRef, bytes: &[u8]) -> String {
    match media
        .file_unique_id
        .as_deref()
        .filter(|id| !id.is_empty())
    {
        Some(id) => id.to_owned(),
        None => hash_key(bytes),
    }
}

/// Derived key for `bytes`.
pub fn hash_key(bytes: &[u8]) -> String {
    format!("{HASH_KEY_PREFIX}{}", hex::encode(Sha256::digest(bytes)))
}

/// Downloads media and registers it with the asset store.
pub struct MediaDeduplicator {
    store: Arc<dyn AssetStore>,
    retry: RetryExecutor,
    max_bytes: u64,
}

impl std::fmt::Debug for MediaDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDeduplicator")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl MediaDeduplicator {
    /// Create a deduplicator uploading to `store`.
    pub fn new(store: Arc<dyn AssetStore>, retry: RetryExecutor, max_bytes: u64) -> Self {
        Self {
            store,
            retry,
            max_bytes,
        }
    }

    /// Resolve `media` into a stored asset.
    ///
    /// Returns `None` for skipped encodings, oversized media, a disconnected
    /// session, failed or empty downloads, and failed uploads. Never errors.
    pub async fn resolve(
        &self,
        account_id: &str,
        media: &MediaRef,
        client: &dyn ProtocolClient,
    ) -> Option<MediaAsset> {
        let Some(mime_type) = canonical_mime(media) else {
            debug!(account_id, file_id = %media.file_id, "skipping unsupported media encoding");
            return None;
        };

        if media.file_size.is_some_and(|size| size > self.max_bytes) {
            debug!(account_id, file_id = %media.file_id, "media exceeds size limit, skipping");
            return None;
        }

        if !client.is_connected() {
            debug!(account_id, "session not connected, skipping media download");
            return None;
        }

        let bytes = match client.download_binary(media).await {
            Ok(bytes) => bytes,
            Err(ProtocolError::NotConnected) => {
                debug!(account_id, "session dropped during media download");
                return None;
            }
            Err(e) => {
                warn!(account_id, file_id = %media.file_id, error = %e, "media download failed");
                return None;
            }
        };
        if bytes.is_empty() {
            debug!(account_id, file_id = %media.file_id, "media download returned no bytes");
            return None;
        }
        let size_bytes = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        if size_bytes > self.max_bytes {
            debug!(account_id, size_bytes, "downloaded media exceeds size limit, skipping");
            return None;
        }

        let key = content_key(media, &bytes);
        let upload = AssetUpload {
            base64_data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime_type: mime_type.clone(),
            file_unique_id: key.clone(),
            file_id: media.file_id.clone(),
            account_id: account_id.to_owned(),
            media_type: media.kind.as_str().to_owned(),
        };

        let mut retries = 0;
        let response = match self
            .retry
            .attempt("asset_upload", &mut retries, || self.store.store_asset(&upload))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(account_id, content_key = %key, error = %e, "media upload failed");
                return None;
            }
        };
        if !response.success {
            warn!(account_id, content_key = %key, "asset store did not accept media");
            return None;
        }

        debug!(
            account_id,
            content_key = %key,
            cached = response.cached,
            size_bytes,
            "media resolved"
        );
        Some(MediaAsset {
            content_key: key,
            mime_type,
            size_bytes,
            media_type: media.kind,
            cached: response.cached,
            public_url: response.public_url,
            storage_path: response.storage_path,
        })
    }
}

/// Media already resolved within one batch, keyed by chat and media id.
#[derive(Debug, Default)]
pub struct MediaBatch {
    resolved: HashMap<(String, String), Option<MediaAsset>>,
}

impl MediaBatch {
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `media` for `chat_id`, reusing an earlier result in this batch.
    pub async fn resolve(
        &mut self,
        dedup: &MediaDeduplicator,
        account_id: &str,
        chat_id: &str,
        media: &MediaRef,
        client: &dyn ProtocolClient,
    ) -> Option<MediaAsset> {
        let id = media
            .file_unique_id
            .clone()
            .unwrap_or_else(|| media.file_id.clone());
        let key = (chat_id.to_owned(), id);
        if let Some(asset) = self.resolved.get(&key) {
            return asset.clone();
        }
        let asset = dedup.resolve(account_id, media, client).await;
        if asset.is_some() {
            self.resolved.insert(key, asset.clone());
        }
        asset
    }
}
