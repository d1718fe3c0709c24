//! Process-wide registry of accounts, their credentials, connection states
//! and live sessions.
//!
//! This is the only mutable state shared across tasks. All access goes
//! through one short-lived mutex; nothing awaits while holding it. Writes
//! for a given account come from one task at a time: the account manager
//! for connect and disconnect, the supervisor for repairs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{ProtocolClient, Subscription};
use crate::types::{AccountCredential, ConnectionState};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The account already has a live session.
    #[error("account {0} already has a live session")]
    AlreadyConnected(String),

    /// The account is not registered.
    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

/// A session [`Registry::insert_session`] refused, handed back so the caller
/// can close it.
#[derive(Debug)]
pub struct RejectedSession {
    /// Why the session was refused.
    pub error: RegistryError,
    /// The refused session, still connected.
    pub session: AccountSession,
}

/// A live protocol session for one account.
pub struct AccountSession {
    /// Owning account.
    pub account_id: String,
    /// Connected protocol client.
    pub client: Arc<dyn ProtocolClient>,
    /// When the session was established.
    pub connected_at: DateTime<Utc>,
    /// When the supervisor last probed the session.
    pub last_health_check: Option<DateTime<Utc>>,
    subscription: Option<Subscription>,
    ingest: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AccountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSession")
            .field("account_id", &self.account_id)
            .field("connected_at", &self.connected_at)
            .field("last_health_check", &self.last_health_check)
            .finish_non_exhaustive()
    }
}

impl AccountSession {
    /// Wrap a connected client.
    pub fn new(account_id: impl Into<String>, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            account_id: account_id.into(),
            client,
            connected_at: Utc::now(),
            last_health_check: None,
            subscription: None,
            ingest: None,
        }
    }

    /// Attach the event subscription and the task draining it.
    #[must_use]
    pub fn with_ingest(mut self, subscription: Subscription, ingest: JoinHandle<()>) -> Self {
        self.subscription = Some(subscription);
        self.ingest = Some(ingest);
        self
    }

    /// Detach the handler and disconnect the client.
    ///
    /// The ingest task is left to flush events it already received; it ends
    /// once the detached handler releases its channel.
    pub async fn close(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        drop(self.ingest.take());
        if let Err(e) = self.client.disconnect().await {
            warn!(account_id = %self.account_id, error = %e, "disconnect failed");
        }
        debug!(account_id = %self.account_id, "session closed");
    }
}

/// Per-account row of the health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    /// Account id.
    pub account_id: String,
    /// Optional label from the roster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the supervisor maintains this account.
    pub enabled: bool,
    /// When the live session was established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// When the live session was last probed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct AccountEntry {
    credential: Option<AccountCredential>,
    enabled: bool,
    state: ConnectionState,
    session: Option<AccountSession>,
}

impl AccountEntry {
    fn new(credential: Option<AccountCredential>) -> Self {
        Self {
            credential,
            enabled: true,
            state: ConnectionState::Disconnected,
            session: None,
        }
    }
}

/// Keyed store of accounts.
#[derive(Debug, Default)]
pub struct Registry {
    accounts: Mutex<BTreeMap<String, AccountEntry>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, AccountEntry>> {
        match self.accounts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register or update a credential. New accounts start enabled and
    /// disconnected.
    pub fn upsert_credential(&self, credential: AccountCredential) {
        let mut accounts = self.lock();
        match accounts.get_mut(&credential.account_id) {
            Some(entry) => entry.credential = Some(credential),
            None => {
                accounts.insert(
                    credential.account_id.clone(),
                    AccountEntry::new(Some(credential)),
                );
            }
        }
    }

    /// Forget an account entirely, returning its live session if any.
    pub fn remove_account(&self, account_id: &str) -> Option<AccountSession> {
        self.lock()
            .remove(account_id)
            .and_then(|entry| entry.session)
    }

    /// Stored credential for `account_id`.
    pub fn credential(&self, account_id: &str) -> Option<AccountCredential> {
        self.lock()
            .get(account_id)
            .and_then(|entry| entry.credential.clone())
    }

    /// All stored credentials, ordered by account id.
    pub fn credentials(&self) -> Vec<AccountCredential> {
        self.lock()
            .values()
            .filter_map(|entry| entry.credential.clone())
            .collect()
    }

    /// All registered account ids, ordered.
    pub fn account_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Store a live session and mark the account connected.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyConnected`] if the account already has a
    /// session. The rejected session is returned untouched.
    pub fn insert_session(&self, session: AccountSession) -> Result<(), RejectedSession> {
        let mut accounts = self.lock();
        let entry = accounts
            .entry(session.account_id.clone())
            .or_insert_with(|| AccountEntry::new(None));
        if entry.session.is_some() {
            return Err(RejectedSession {
                error: RegistryError::AlreadyConnected(session.account_id.clone()),
                session,
            });
        }
        entry.state = ConnectionState::Connected;
        entry.session = Some(session);
        Ok(())
    }

    /// Take the live session out of the registry and mark the account
    /// disconnected. The caller is responsible for closing it.
    pub fn remove_session(&self, account_id: &str) -> Option<AccountSession> {
        let mut accounts = self.lock();
        let entry = accounts.get_mut(account_id)?;
        entry.state = ConnectionState::Disconnected;
        entry.session.take()
    }

    /// Take every live session, for shutdown.
    pub fn drain_sessions(&self) -> Vec<AccountSession> {
        let mut accounts = self.lock();
        accounts
            .values_mut()
            .filter_map(|entry| {
                entry.state = ConnectionState::Disconnected;
                entry.session.take()
            })
            .collect()
    }

    /// Whether the account has a live session.
    pub fn has_session(&self, account_id: &str) -> bool {
        self.lock()
            .get(account_id)
            .is_some_and(|entry| entry.session.is_some())
    }

    /// Client of the live session.
    pub fn client(&self, account_id: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.lock()
            .get(account_id)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| Arc::clone(&session.client))
    }

    /// Current state, `None` for unknown accounts.
    pub fn state(&self, account_id: &str) -> Option<ConnectionState> {
        self.lock().get(account_id).map(|entry| entry.state)
    }

    /// Whether the account is in [`ConnectionState::Connected`].
    pub fn is_connected(&self, account_id: &str) -> bool {
        self.state(account_id) == Some(ConnectionState::Connected)
    }

    /// Record a state transition.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] if the account is not registered.
    pub fn set_state(&self, account_id: &str, state: ConnectionState) -> Result<(), RegistryError> {
        let mut accounts = self.lock();
        let entry = accounts
            .get_mut(account_id)
            .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_owned()))?;
        if entry.state != state {
            debug!(account_id, from = entry.state.as_str(), to = state.as_str(), "state change");
        }
        entry.state = state;
        Ok(())
    }

    /// Stamp the live session's last health check with the current time.
    pub fn touch_health_check(&self, account_id: &str) {
        if let Some(session) = self
            .lock()
            .get_mut(account_id)
            .and_then(|entry| entry.session.as_mut())
        {
            session.last_health_check = Some(Utc::now());
        }
    }

    /// Exclude the account from supervision after an explicit disconnect.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] if the account is not registered.
    pub fn disable(&self, account_id: &str) -> Result<(), RegistryError> {
        self.set_enabled(account_id, false)
    }

    /// Put the account back under supervision.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] if the account is not registered.
    pub fn enable(&self, account_id: &str) -> Result<(), RegistryError> {
        self.set_enabled(account_id, true)
    }

    fn set_enabled(&self, account_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut accounts = self.lock();
        let entry = accounts
            .get_mut(account_id)
            .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_owned()))?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Whether the supervisor maintains the account.
    pub fn is_enabled(&self, account_id: &str) -> bool {
        self.lock()
            .get(account_id)
            .is_some_and(|entry| entry.enabled)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.session.is_some())
            .count()
    }

    /// Status rows for every account, ordered by id.
    pub fn snapshot(&self) -> Vec<AccountStatus> {
        self.lock()
            .iter()
            .map(|(account_id, entry)| AccountStatus {
                account_id: account_id.clone(),
                label: entry.credential.as_ref().and_then(|c| c.label.clone()),
                state: entry.state,
                enabled: entry.enabled,
                connected_at: entry.session.as_ref().map(|s| s.connected_at),
                last_health_check: entry.session.as_ref().and_then(|s| s.last_health_check),
            })
            .collect()
    }
}
