//! In-process protocol client fed with synthetic events.
//!
//! Events passed to [`LoopbackClient::inject`] reach every subscribed
//! handler exactly as a live session would deliver them. Invoked actions
//! are recorded for inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    Action, ActionResult, ClientFactory, EventHandler, HandlerSet, InboundEvent, MediaRef,
    ProtocolClient, ProtocolError, Subscription,
};
use crate::types::AccountCredential;

/// Scriptable [`ProtocolClient`].
#[derive(Debug, Default)]
pub struct LoopbackClient {
    handlers: HandlerSet,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    connect_delay_ms: AtomicU64,
    connect_calls: AtomicUsize,
    downloads: AtomicUsize,
    next_message_id: AtomicI64,
    actions: Mutex<Vec<Action>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    profile_photos: Mutex<HashMap<String, MediaRef>>,
}

impl LoopbackClient {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Emit an event to every subscribed handler.
    pub fn inject(&self, event: InboundEvent) {
        self.handlers.emit(&event);
    }

    /// Force the reported liveness, simulating a dropped session.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls take `delay` before completing.
    pub fn set_connect_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Serve `bytes` for downloads of `file_id`.
    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(file_id.to_owned(), bytes);
        }
    }

    /// Answer profile photo lookups for `user_id` with `photo`.
    pub fn set_profile_photo(&self, user_id: &str, photo: MediaRef) {
        if let Ok(mut photos) = self.profile_photos.lock() {
            photos.insert(user_id.to_owned(), photo);
        }
    }

    /// Actions invoked so far, in order.
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Number of `connect` calls, successful or not.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `download_binary` calls that reached the file store.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Number of attached handlers.
    pub fn subscribers(&self) -> usize {
        self.handlers.len()
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Api("connect refused".to_owned()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.connected.store(false, Ordering::SeqCst);
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
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action.clone());
        }
        let result = match action {
            Action::SendMessage { .. } => {
                let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
                ActionResult::Sent {
                    message_id: id.to_string(),
                }
            }
            Action::EditMessage { .. } | Action::DeleteMessage { .. } => ActionResult::Done,
            Action::GetProfilePhoto { user_id } => {
                let photo = self
                    .profile_photos
                    .lock()
                    .ok()
                    .and_then(|photos| photos.get(&user_id).cloned());
                ActionResult::Photo(photo)
            }
        };
        Ok(result)
    }

    async fn download_binary(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(&media.file_id).cloned())
            .ok_or_else(|| ProtocolError::Api(format!("file not found: {}", media.file_id)))
    }
}

/// Factory handing out pre-registered loopback clients.
///
/// Each account id maps to one shared client, so a test can keep a handle
/// to the same client the relay uses.
#[derive(Debug, Default)]
pub struct LoopbackFactory {
    clients: Mutex<HashMap<String, Arc<LoopbackClient>>>,
    created: AtomicUsize,
}

impl LoopbackFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the client for `account_id`.
    pub fn client(&self, account_id: &str) -> Arc<LoopbackClient> {
        match self.clients.lock() {
            Ok(mut clients) => Arc::clone(
                clients
                    .entry(account_id.to_owned())
                    .or_insert_with(|| Arc::new(LoopbackClient::new())),
            ),
            Err(_) => Arc::new(LoopbackClient::new()),
        }
    }

    /// Number of `create` calls so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClientFactory for LoopbackFactory {
    fn create(
        &self,
        credential: &AccountCredential,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn ProtocolClient> = self.client(&credential.account_id);
        Ok(client)
    }
}
