//! Event ingestion pipeline.
//!
//! ```text
//! protocol event -> normalize -> avatar / media enrichment -> DeliveryQueue
//!                                                              |
//!                                           RetryExecutor -> backend ingest
//! ```
//!
//! [`EventPipeline::process_batch`] runs once per batch of events drained from
//! an account's subscription channel. Events are normalized and enqueued in
//! arrival order. Enrichment only touches the protocol client while the
//! account is connected; otherwise the message is enqueued without it.

pub mod media;
pub mod normalize;
pub mod photo_cache;
pub mod queue;
pub mod retry;

use std::sync::Arc;

use base64::Engine;
use tracing::debug;

use crate::protocol::{Action, ActionResult, InboundEvent, ProtocolClient, ProtocolError};
use crate::registry::Registry;

use self::media::{MediaBatch, MediaDeduplicator};
use self::photo_cache::PhotoCache;
use self::queue::DeliveryQueue;

/// Prefix of encoded avatars.
const AVATAR_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Wires normalization, enrichment and the delivery queue together.
#[derive(Debug)]
pub struct EventPipeline {
    queue: Arc<DeliveryQueue>,
    registry: Arc<Registry>,
    media: Option<MediaDeduplicator>,
    photos: Option<PhotoCache>,
}

impl EventPipeline {
    /// Create a pipeline. `media` and `photos` are optional enrichments.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        registry: Arc<Registry>,
        media: Option<MediaDeduplicator>,
        photos: Option<PhotoCache>,
    ) -> Self {
        Self {
            queue,
            registry,
            media,
            photos,
        }
    }

    /// The delivery queue messages end up in.
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Normalize, enrich and enqueue a batch of events from one account.
    ///
    /// Returns the number of messages enqueued.
    pub async fn process_batch(
        &self,
        account_id: &str,
        client: &dyn ProtocolClient,
        events: Vec<InboundEvent>,
    ) -> usize {
        let mut media_batch = MediaBatch::new();
        let mut enqueued = 0;

        for event in events {
            let Some(mut message) = normalize::normalize(account_id, &event) else {
                debug!(account_id, message_id = event.message_id, "dropping event without chat");
                continue;
            };

            if self.session_live(account_id, client) {
                if self.photos.is_some() {
                    let photo = self.profile_photo(&message.chat_id, client).await;
                    message = message.with_profile_photo(photo);
                }

                if let (Some(dedup), Some(media_ref)) = (&self.media, message.media_ref.clone()) {
                    let asset = media_batch
                        .resolve(dedup, account_id, &message.chat_id, &media_ref, client)
                        .await;
                    message = message.with_media_asset(asset);
                }
            } else {
                debug!(account_id, "session not connected, enqueueing without enrichment");
            }

            self.queue.enqueue(message);
            enqueued += 1;
        }

        enqueued
    }

    /// Drop expired avatar cache entries. Returns how many were removed.
    pub fn purge_caches(&self) -> usize {
        self.photos.as_ref().map_or(0, PhotoCache::purge_expired)
    }

    fn session_live(&self, account_id: &str, client: &dyn ProtocolClient) -> bool {
        self.registry.is_connected(account_id) && client.is_connected()
    }

    async fn profile_photo(&self, chat_id: &str, client: &dyn ProtocolClient) -> Option<String> {
        let cache = self.photos.as_ref()?;
        cache
            .get_or_fetch(chat_id, || fetch_avatar(chat_id, client))
            .await
    }
}

/// Look up and encode the avatar of `chat_id`.
async fn fetch_avatar(chat_id: &str, client: &dyn ProtocolClient) -> Option<String> {
    let action = Action::GetProfilePhoto {
        user_id: chat_id.to_owned(),
    };
    let photo = match client.invoke(action).await {
        Ok(ActionResult::Photo(Some(photo))) => photo,
        Ok(_) => return None,
        Err(ProtocolError::NotConnected) => return None,
        Err(e) => {
            debug!(chat_id, error = %e, "profile photo lookup failed");
            return None;
        }
    };

    match client.download_binary(&photo).await {
        Ok(bytes) if !bytes.is_empty() => Some(format!(
            "{AVATAR_DATA_URL_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )),
        Ok(_) => None,
        Err(e) => {
            debug!(chat_id, error = %e, "profile photo download failed");
            None
        }
    }
}
