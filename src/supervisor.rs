//! Connection supervisor: periodic probing and repair of account sessions.
//!
//! State machine per enabled account:
//!
//! ```text
//! Connected --probe: not connected--> Degraded --> Reconnecting
//! Reconnecting --lightweight reconnect ok--> Connected
//! Reconnecting --fails--> drop session, full re-auth --> Connected | Disconnected
//! Disconnected --next probe--> full re-auth
//! ```
//!
//! Each account is checked and repaired under its [`AccountLock`], so a
//! repair never interleaves with an admin connect or disconnect of the same
//! account.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::accounts::{AccountError, AccountLock, AccountManager};
use crate::pipeline::queue::shutdown_signalled;
use crate::protocol::ProtocolClient;
use crate::registry::{Registry, RegistryError};
use crate::types::ConnectionState;

/// Counts from one probe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    /// Sessions found live.
    pub healthy: usize,
    /// Sessions restored by a lightweight reconnect.
    pub repaired: usize,
    /// Accounts restored by full re-authentication.
    pub reauthenticated: usize,
    /// Accounts left disconnected.
    pub failed: usize,
}

/// Probes sessions and repairs broken ones.
#[derive(Debug)]
pub struct Supervisor {
    registry: Arc<Registry>,
    manager: Arc<AccountManager>,
    interval: Duration,
}

/// Running supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Signal the task and wait for it to finish its current probe.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "supervisor task ended abnormally");
        }
    }
}

impl Supervisor {
    /// Create a supervisor probing every `interval`.
    pub fn new(manager: Arc<AccountManager>, interval: Duration) -> Self {
        Self {
            registry: Arc::clone(manager.registry()),
            manager,
            interval,
        }
    }

    /// Run one probe cycle over every enabled account.
    pub async fn probe_once(&self) -> ProbeSummary {
        let mut summary = ProbeSummary::default();

        for account_id in self.registry.account_ids() {
            if !self.registry.is_enabled(&account_id) {
                continue;
            }
            let lock = self.manager.lock_account(&account_id).await;
            if !self.registry.is_enabled(&account_id) {
                debug!(account_id = %account_id, "disabled while waiting, skipping");
                continue;
            }

            match self.registry.client(&account_id) {
                Some(client) => {
                    self.registry.touch_health_check(&account_id);
                    if client.is_connected() {
                        self.transition(&account_id, ConnectionState::Connected);
                        summary.healthy += 1;
                        continue;
                    }
                    warn!(account_id = %account_id, "probe found session not connected");
                    self.transition(&account_id, ConnectionState::Degraded);
                    self.repair(&lock, client, &mut summary).await;
                }
                None => {
                    debug!(account_id = %account_id, "no session, attempting full connect");
                    self.reauthenticate(&lock, &mut summary).await;
                }
            }
        }

        let purged = self.manager.pipeline().purge_caches();
        if purged > 0 {
            debug!(purged, "expired profile photos purged");
        }
        summary
    }

    async fn repair(
        &self,
        lock: &AccountLock,
        client: Arc<dyn ProtocolClient>,
        summary: &mut ProbeSummary,
    ) {
        let account_id = lock.account_id();
        self.transition(account_id, ConnectionState::Reconnecting);

        match client.connect().await {
            Ok(()) => {
                self.transition(account_id, ConnectionState::Connected);
                info!(account_id, "session restored by reconnect");
                summary.repaired += 1;
            }
            Err(e) => {
                warn!(account_id, error = %e, "reconnect failed, discarding session");
                if let Some(session) = self.registry.remove_session(account_id) {
                    session.close().await;
                }
                self.reauthenticate(lock, summary).await;
            }
        }
    }

    async fn reauthenticate(&self, lock: &AccountLock, summary: &mut ProbeSummary) {
        let account_id = lock.account_id();
        match self.manager.establish_locked(lock).await {
            Ok(()) => {
                info!(account_id, "session restored by re-authentication");
                summary.reauthenticated += 1;
            }
            Err(AccountError::Registry(RegistryError::AlreadyConnected(_))) => {
                debug!(account_id, "session already present");
                summary.healthy += 1;
            }
            Err(AccountError::Disabled(_)) => {
                debug!(account_id, "account disabled, leaving it alone");
            }
            Err(e) => {
                warn!(account_id, error = %e, "re-authentication failed, will retry next probe");
                self.transition(account_id, ConnectionState::Disconnected);
                summary.failed += 1;
            }
        }
    }

    fn transition(&self, account_id: &str, state: ConnectionState) {
        if let Err(e) = self.registry.set_state(account_id, state) {
            debug!(account_id, error = %e, "state update skipped");
        }
    }

    /// Probe loop. The first probe runs one interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "supervisor started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.probe_once().await;
                    debug!(
                        healthy = summary.healthy,
                        repaired = summary.repaired,
                        reauthenticated = summary.reauthenticated,
                        failed = summary.failed,
                        "probe cycle finished"
                    );
                }
                () = shutdown_signalled(&mut shutdown) => break,
            }
        }

        info!("supervisor stopped");
    }

    /// Start the probe loop on its own task.
    pub fn spawn(self: Arc<Self>) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SupervisorHandle { shutdown_tx, join }
    }
}
