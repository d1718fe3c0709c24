//! End-to-end tests of the ingestion path over the loopback client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use courier::accounts::AccountManager;
use courier::pipeline::media::{AssetResponse, AssetStore, AssetUpload, MediaDeduplicator};
use courier::pipeline::photo_cache::PhotoCache;
use courier::pipeline::queue::{Deliver, DeliveryQueue, QueueConfig};
use courier::pipeline::retry::{CallError, RetryExecutor, RetryPolicy};
use courier::pipeline::EventPipeline;
use courier::protocol::loopback::{LoopbackClient, LoopbackFactory};
use courier::protocol::{InboundEvent, MediaKind, MediaRef, RawChat, RawUser};
use courier::registry::Registry;
use courier::types::{AccountCredential, DeliveryOutcome, NormalizedMessage};

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<NormalizedMessage>>,
}

#[async_trait]
impl Deliver for Recorder {
    async fn deliver(&self, message: &NormalizedMessage) -> Result<(), CallError> {
        self.delivered
            .lock()
            .expect("recorder lock")
            .push(message.clone());
        Ok(())
    }
}

struct AcceptAll;

#[async_trait]
impl AssetStore for AcceptAll {
    async fn store_asset(&self, upload: &AssetUpload) -> Result<AssetResponse, CallError> {
        Ok(AssetResponse {
            success: true,
            cached: false,
            public_url: Some(format!("https://cdn.test/{}", upload.file_unique_id)),
            storage_path: Some(format!("media/{}", upload.file_unique_id)),
        })
    }
}

fn event(message_id: i64, chat_id: i64, text: &str) -> InboundEvent {
    InboundEvent {
        message_id,
        chat: Some(RawChat {
            id: chat_id,
            chat_type: "private".to_owned(),
        }),
        from: Some(RawUser {
            id: chat_id,
            is_bot: false,
            first_name: "Lin".to_owned(),
            last_name: None,
            username: Some("lin".to_owned()),
        }),
        date: 1_700_000_000,
        text: Some(text.to_owned()),
        caption: None,
        outgoing: false,
        media: None,
        reply_markup: None,
    }
}

fn photo(file_id: &str, unique: &str) -> MediaRef {
    MediaRef {
        kind: MediaKind::Photo,
        file_id: file_id.to_owned(),
        file_unique_id: Some(unique.to_owned()),
        mime_type: None,
        file_size: None,
        is_animated: false,
        is_video: false,
    }
}

struct Harness {
    registry: Arc<Registry>,
    queue: Arc<DeliveryQueue>,
    pipeline: Arc<EventPipeline>,
    manager: AccountManager,
    factory: Arc<LoopbackFactory>,
    recorder: Arc<Recorder>,
    shutdown: watch::Sender<bool>,
}

fn harness() -> Harness {
    let registry = Arc::new(Registry::new());
    let queue = Arc::new(DeliveryQueue::new(QueueConfig {
        max_concurrent: 1,
        dispatch_delay: Duration::from_millis(1),
        ..QueueConfig::default()
    }));
    let retry = RetryExecutor::new(RetryPolicy::default());
    let media = MediaDeduplicator::new(Arc::new(AcceptAll), retry.clone(), 1024);
    let pipeline = Arc::new(EventPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        Some(media),
        Some(PhotoCache::default()),
    ));
    let factory = Arc::new(LoopbackFactory::new());
    let manager = AccountManager::new(
        Arc::clone(&registry),
        Arc::clone(&factory) as Arc<dyn courier::protocol::ClientFactory>,
        Arc::clone(&pipeline),
        Duration::ZERO,
    );

    let recorder = Arc::new(Recorder::default());
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&queue).run(Arc::clone(&recorder) as Arc<dyn Deliver>, retry, rx));

    Harness {
        registry,
        queue,
        pipeline,
        manager,
        factory,
        recorder,
        shutdown,
    }
}

fn credential(id: &str) -> AccountCredential {
    AccountCredential {
        account_id: id.to_owned(),
        bot_token: format!("{id}:secret"),
        label: None,
    }
}

#[tokio::test]
async fn injected_events_are_enriched_and_delivered_in_order() {
    let h = harness();
    let mut reports = h.queue.reports();
    h.manager.connect(credential("1")).await.expect("connect");

    let client = h.factory.client("1");
    client.set_profile_photo("55", photo("avatar", "AQADavatar"));
    client.add_file("avatar", vec![0xFF, 0xD8, 0xFF]);
    client.add_file("pic", vec![1, 2, 3, 4]);

    let mut with_photo = event(2, 55, "");
    with_photo.caption = Some("look".to_owned());
    with_photo.media = Some(photo("pic", "AQADpic"));

    client.inject(event(1, 55, "hello"));
    client.inject(with_photo);
    client.inject(event(3, 55, "bye"));

    for _ in 0..3 {
        let report = reports.recv().await.expect("report");
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    }

    let delivered = h.recorder.delivered.lock().expect("lock").clone();
    let ids: Vec<&str> = delivered.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let first = &delivered[0];
    assert_eq!(first.account_id, "1");
    assert_eq!(first.chat_id, "55");
    assert_eq!(first.text, "hello");
    assert_eq!(first.sender.username.as_deref(), Some("lin"));
    assert_eq!(first.profile_photo.as_deref(), Some("data:image/jpeg;base64,/9j/"));

    let second = &delivered[1];
    assert_eq!(second.text, "look");
    let asset = second.media_asset.as_ref().expect("media asset");
    assert_eq!(asset.content_key, "AQADpic");
    assert_eq!(asset.public_url.as_deref(), Some("https://cdn.test/AQADpic"));

    // One avatar lookup for the chat, served from cache afterwards.
    let lookups = client
        .actions()
        .into_iter()
        .filter(|a| a.name() == "get_profile_photo")
        .count();
    assert_eq!(lookups, 1);

    h.shutdown.send(true).expect("shutdown");
}

#[tokio::test]
async fn disconnected_account_is_enqueued_without_enrichment() {
    let h = harness();
    h.registry.upsert_credential(credential("2"));

    let client = LoopbackClient::new();
    client.add_file("pic", vec![1]);
    let mut with_media = event(10, 77, "caption ignored");
    with_media.media = Some(photo("pic", "AQADx"));

    let enqueued = h
        .pipeline
        .process_batch("2", &client, vec![with_media])
        .await;

    assert_eq!(enqueued, 1);
    assert_eq!(client.downloads(), 0);
    assert!(client.actions().is_empty());

    h.shutdown.send(true).expect("shutdown");
}

#[tokio::test]
async fn events_without_chat_are_discarded() {
    let h = harness();
    let client = LoopbackClient::new();
    let mut orphan = event(1, 1, "lost");
    orphan.chat = None;

    let enqueued = h
        .pipeline
        .process_batch("1", &client, vec![orphan, event(2, 1, "kept")])
        .await;

    assert_eq!(enqueued, 1);
    h.shutdown.send(true).expect("shutdown");
}
