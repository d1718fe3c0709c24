//! Account lifecycle: connect, disconnect, bulk startup, roster reload,
//! shutdown, and outbound actions.
//!
//! Each connected account has a subscription on its protocol client that
//! forwards events into a bounded channel, and an ingest task that drains the
//! channel in batches through [`EventPipeline::process_batch`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::pipeline::retry::CallError;
use crate::pipeline::EventPipeline;
use crate::protocol::{
    Action, ActionResult, ClientFactory, InboundEvent, ProtocolClient, ProtocolError,
};
use crate::registry::{AccountSession, Registry, RegistryError, RejectedSession};
use crate::types::{AccountCredential, ConnectionState};

/// Capacity of each account's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Most events handed to the pipeline in one batch.
const INGEST_BATCH_LIMIT: usize = 64;

/// Errors from account operations.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    /// Registry rejected the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The protocol client failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The roster could not be fetched.
    #[error("roster fetch failed: {0}")]
    Roster(#[from] CallError),

    /// The account has no live session.
    #[error("account {0} is not connected")]
    NotConnected(String),

    /// The account was disconnected and is excluded from supervision.
    #[error("account {0} is disabled")]
    Disabled(String),
}

/// Source of the backend account roster.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Fetch the current roster.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the fetch.
    async fn fetch_roster(&self) -> Result<Vec<AccountCredential>, CallError>;
}

/// Result of a roster reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    /// Accounts newly connected.
    pub connected: Vec<String>,
    /// Accounts removed because they left the roster.
    pub disconnected: Vec<String>,
    /// Accounts left as they were.
    pub unchanged: Vec<String>,
    /// Accounts whose connect attempt failed.
    pub failed: Vec<String>,
}

/// Merge the environment pool with the roster by account id; the roster wins.
pub fn merge_accounts(
    env: &[AccountCredential],
    roster: Vec<AccountCredential>,
) -> Vec<AccountCredential> {
    let mut merged: BTreeMap<String, AccountCredential> = env
        .iter()
        .map(|cred| (cred.account_id.clone(), cred.clone()))
        .collect();
    for cred in roster {
        merged.insert(cred.account_id.clone(), cred);
    }
    merged.into_values().collect()
}

/// Exclusive right to change one account's session.
///
/// Held across every connect, disconnect, repair, and re-authentication of
/// the account, so lifecycle changes to it apply one at a time.
#[derive(Debug)]
pub struct AccountLock {
    account_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountLock {
    /// Account this lock covers.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

/// Owns account sessions on behalf of the admin surface and the supervisor.
pub struct AccountManager {
    registry: Arc<Registry>,
    factory: Arc<dyn ClientFactory>,
    pipeline: Arc<EventPipeline>,
    roster: Option<Arc<dyn RosterSource>>,
    env_accounts: Vec<AccountCredential>,
    connect_spacing: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("env_accounts", &self.env_accounts.len())
            .field("connect_spacing", &self.connect_spacing)
            .finish_non_exhaustive()
    }
}

impl AccountManager {
    /// Create a manager.
    pub fn new(
        registry: Arc<Registry>,
        factory: Arc<dyn ClientFactory>,
        pipeline: Arc<EventPipeline>,
        connect_spacing: Duration,
    ) -> Self {
        Self {
            registry,
            factory,
            pipeline,
            roster: None,
            env_accounts: Vec::new(),
            connect_spacing,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use `roster` as the backend account list.
    #[must_use]
    pub fn with_roster(mut self, roster: Arc<dyn RosterSource>) -> Self {
        self.roster = Some(roster);
        self
    }

    /// Accounts configured through the environment.
    #[must_use]
    pub fn with_env_accounts(mut self, accounts: Vec<AccountCredential>) -> Self {
        self.env_accounts = accounts;
        self
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Pipeline fed by every session.
    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    /// Wait for exclusive lifecycle access to `account_id`.
    pub async fn lock_account(&self, account_id: &str) -> AccountLock {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(account_id.to_owned()).or_default())
        };
        AccountLock {
            account_id: account_id.to_owned(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Register the environment pool merged with the roster.
    ///
    /// A failed roster fetch is logged and the environment pool used alone.
    /// Returns the number of registered accounts.
    pub async fn load_accounts(&self) -> usize {
        let roster = match &self.roster {
            Some(source) => match source.fetch_roster().await {
                Ok(roster) => roster,
                Err(e) => {
                    warn!(error = %e, "roster fetch failed, using environment accounts only");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let merged = merge_accounts(&self.env_accounts, roster);
        let count = merged.len();
        for credential in merged {
            self.registry.upsert_credential(credential);
        }
        info!(count, "accounts loaded");
        count
    }

    /// Connect an account, storing its credential and enabling supervision.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyConnected`] if a session exists, or the
    /// protocol error that prevented the session.
    pub async fn connect(&self, credential: AccountCredential) -> Result<(), AccountError> {
        let lock = self.lock_account(&credential.account_id).await;
        self.registry.upsert_credential(credential);
        self.registry.enable(lock.account_id())?;
        self.establish_locked(&lock).await
    }

    /// Connect a registered account by id.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] if no credential is stored, else as
    /// [`AccountManager::connect`].
    pub async fn connect_by_id(&self, account_id: &str) -> Result<(), AccountError> {
        let credential = self
            .registry
            .credential(account_id)
            .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_owned()))?;
        self.connect(credential).await
    }

    /// Authenticate an enabled account with its stored credential and
    /// register a new session.
    ///
    /// Leaves the enabled flag alone.
    ///
    /// # Errors
    ///
    /// [`AccountError::Disabled`] for a disabled account, else as
    /// [`AccountManager::connect`].
    pub async fn establish(&self, account_id: &str) -> Result<(), AccountError> {
        let lock = self.lock_account(account_id).await;
        self.establish_locked(&lock).await
    }

    /// [`AccountManager::establish`] for a caller already holding the lock.
    ///
    /// # Errors
    ///
    /// As [`AccountManager::establish`].
    pub async fn establish_locked(&self, lock: &AccountLock) -> Result<(), AccountError> {
        let account_id = lock.account_id();
        let credential = self
            .registry
            .credential(account_id)
            .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_owned()))?;
        if !self.registry.is_enabled(account_id) {
            return Err(AccountError::Disabled(account_id.to_owned()));
        }
        if self.registry.has_session(account_id) {
            return Err(RegistryError::AlreadyConnected(account_id.to_owned()).into());
        }

        self.registry
            .set_state(account_id, ConnectionState::Connecting)?;
        match self.open_session(&credential).await {
            Ok(session) => {
                if let Err(RejectedSession { error, session }) =
                    self.registry.insert_session(session)
                {
                    warn!(account_id, error = %error, "session rejected, closing it");
                    session.close().await;
                    return Err(error.into());
                }
                info!(account_id, "account connected");
                Ok(())
            }
            Err(e) => {
                self.registry
                    .set_state(account_id, ConnectionState::Disconnected)?;
                warn!(account_id, error = %e, "account connect failed");
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        credential: &AccountCredential,
    ) -> Result<AccountSession, AccountError> {
        let client = self.factory.create(credential)?;
        let account_id = credential.account_id.clone();

        let (tx, rx) = mpsc::channel::<InboundEvent>(EVENT_CHANNEL_CAPACITY);
        let handler_account = account_id.clone();
        let subscription = client.subscribe(Arc::new(move |event: InboundEvent| {
            if let Err(e) = tx.try_send(event) {
                warn!(account_id = %handler_account, error = %e, "event channel full, dropping event");
            }
        }));

        client.connect().await?;

        let ingest = tokio::spawn(ingest_loop(
            account_id.clone(),
            Arc::clone(&client),
            Arc::clone(&self.pipeline),
            rx,
        ));
        Ok(AccountSession::new(account_id, client).with_ingest(subscription, ingest))
    }

    /// Disconnect an account and exclude it from supervision.
    ///
    /// Returns whether a live session was closed.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] for unregistered accounts.
    pub async fn disconnect(&self, account_id: &str) -> Result<bool, AccountError> {
        let _lock = self.lock_account(account_id).await;
        self.registry.disable(account_id)?;
        match self.registry.remove_session(account_id) {
            Some(session) => {
                session.close().await;
                info!(account_id, "account disconnected");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Connect every enabled account without a session, pausing
    /// `connect_spacing` between attempts.
    ///
    /// Returns `(connected, failed)` counts.
    pub async fn connect_all(&self) -> (usize, usize) {
        let pending: Vec<String> = self
            .registry
            .account_ids()
            .into_iter()
            .filter(|id| self.registry.is_enabled(id) && !self.registry.has_session(id))
            .collect();

        let mut connected = 0;
        let mut failed = 0;
        for (i, account_id) in pending.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.connect_spacing).await;
            }
            match self.establish(account_id).await {
                Ok(()) => connected += 1,
                Err(_) => failed += 1,
            }
        }
        info!(connected, failed, "bulk connect finished");
        (connected, failed)
    }

    /// Re-fetch the roster and converge: connect new accounts, disconnect
    /// departed ones. Explicitly disconnected accounts stay disconnected.
    ///
    /// # Errors
    ///
    /// [`AccountError::Roster`] when the roster cannot be fetched; nothing
    /// is changed in that case.
    pub async fn reload(&self) -> Result<ReloadSummary, AccountError> {
        let roster = match &self.roster {
            Some(source) => source.fetch_roster().await?,
            None => Vec::new(),
        };
        let desired = merge_accounts(&self.env_accounts, roster);
        let mut summary = ReloadSummary::default();

        for account_id in self.registry.account_ids() {
            if desired.iter().any(|c| c.account_id == account_id) {
                continue;
            }
            let _lock = self.lock_account(&account_id).await;
            if let Some(session) = self.registry.remove_account(&account_id) {
                session.close().await;
            }
            info!(account_id = %account_id, "account left roster, removed");
            summary.disconnected.push(account_id);
        }

        let mut attempts = 0usize;
        for credential in desired {
            let account_id = credential.account_id.clone();
            let lock = self.lock_account(&account_id).await;
            let token_changed = self
                .registry
                .credential(&account_id)
                .is_some_and(|old| old.bot_token != credential.bot_token);
            let known = self.registry.state(&account_id).is_some();
            self.registry.upsert_credential(credential);

            if known && !self.registry.is_enabled(&account_id) {
                summary.unchanged.push(account_id);
                continue;
            }
            if self.registry.has_session(&account_id) {
                if !token_changed {
                    summary.unchanged.push(account_id);
                    continue;
                }
                if let Some(session) = self.registry.remove_session(&account_id) {
                    session.close().await;
                }
            }

            if attempts > 0 {
                tokio::time::sleep(self.connect_spacing).await;
            }
            attempts += 1;
            match self.establish_locked(&lock).await {
                Ok(()) => summary.connected.push(account_id),
                Err(_) => summary.failed.push(account_id),
            }
        }

        info!(
            connected = summary.connected.len(),
            disconnected = summary.disconnected.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failed.len(),
            "roster reloaded"
        );
        Ok(summary)
    }

    /// Perform an outbound action on a connected account.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownAccount`] for unregistered accounts,
    /// [`AccountError::NotConnected`] when the account has no live session,
    /// or the protocol error of the action.
    pub async fn perform(
        &self,
        account_id: &str,
        action: Action,
    ) -> Result<ActionResult, AccountError> {
        if self.registry.state(account_id).is_none() {
            return Err(RegistryError::UnknownAccount(account_id.to_owned()).into());
        }
        if !self.registry.is_connected(account_id) {
            return Err(AccountError::NotConnected(account_id.to_owned()));
        }
        let client = self
            .registry
            .client(account_id)
            .ok_or_else(|| AccountError::NotConnected(account_id.to_owned()))?;

        debug!(account_id, action = action.name(), "performing action");
        client.invoke(action).await.map_err(|e| match e {
            ProtocolError::NotConnected => AccountError::NotConnected(account_id.to_owned()),
            other => AccountError::Protocol(other),
        })
    }

    /// Close every live session.
    pub async fn shutdown_all(&self) {
        let sessions = self.registry.drain_sessions();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!(count, "all sessions closed");
    }
}

/// Drain an account's event channel into the pipeline until it closes.
async fn ingest_loop(
    account_id: String,
    client: Arc<dyn ProtocolClient>,
    pipeline: Arc<EventPipeline>,
    mut rx: mpsc::Receiver<InboundEvent>,
) {
    let mut buffer = Vec::with_capacity(INGEST_BATCH_LIMIT);
    loop {
        let received = rx.recv_many(&mut buffer, INGEST_BATCH_LIMIT).await;
        if received == 0 {
            break;
        }
        let events = std::mem::take(&mut buffer);
        pipeline
            .process_batch(&account_id, client.as_ref(), events)
            .await;
    }
    debug!(account_id = %account_id, "ingest task finished");
}
