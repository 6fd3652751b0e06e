//! Account Pool Manager
//!
//! Owns the sending accounts, rotates between them round-robin, keeps one
//! cached session per account and opens the circuit on accounts that keep
//! failing. Account counters sit behind a short-held synchronous lock so
//! selection never waits on I/O; sessions sit behind async locks.

use super::account::{AccountSnapshot, Availability, RateLimitedAccount};
use crate::clock::{Clock, SystemClock};
use crate::transport::{Session, Transport, TransportError};
use outreach_common::types::{AccountConfig, SendError};
use outreach_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// A cached session, shared between the cache and the attempt using it
pub type SessionHandle = Arc<AsyncMutex<Box<dyn Session>>>;

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

struct PoolState {
    accounts: Vec<RateLimitedAccount>,
    /// Index the next scan starts from
    cursor: usize,
}

/// Round-robin pool of rate-limited sending accounts
pub struct AccountPool {
    state: Mutex<PoolState>,
    sessions: AsyncMutex<HashMap<String, SessionHandle>>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    max_failures: u32,
    session_timeout: Duration,
}

/// Exclusive use of one account for a single attempt.
///
/// The account is skipped by [`AccountPool::select_account`] until the lease
/// is settled through `record_success`/`record_failure` or dropped.
pub struct AccountLease<'a> {
    pool: &'a AccountPool,
    index: usize,
    config: AccountConfig,
}

impl AccountLease<'_> {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }
}

impl std::fmt::Debug for AccountLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLease")
            .field("account", &self.config.name)
            .finish()
    }
}

impl Drop for AccountLease<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state();
        if let Some(account) = state.accounts.get_mut(self.index) {
            account.set_leased(false);
        }
    }
}

impl AccountPool {
    /// Create a pool over the given accounts, in rotation order
    pub fn new(accounts: Vec<AccountConfig>, transport: Arc<dyn Transport>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();

        Self {
            state: Mutex::new(PoolState {
                accounts: accounts
                    .into_iter()
                    .map(|config| RateLimitedAccount::new(config, now))
                    .collect(),
                cursor: 0,
            }),
            sessions: AsyncMutex::new(HashMap::new()),
            transport,
            clock,
            max_failures: DEFAULT_MAX_FAILURES,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Consecutive failures after which an account is deactivated
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Bound on liveness probes and session opening
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Use a different time source; rate windows restart at its current time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        for account in &mut self.state().accounts {
            account.restamp_windows(now);
        }
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.state().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the next available account, round-robin from after the last one returned.
    ///
    /// Returns `None` when every account is deactivated, over quota, cooling
    /// down or leased. That means "try later", not an error.
    pub fn select_account(&self) -> Option<AccountLease<'_>> {
        let now = self.clock.now();
        let mut state = self.state();
        let count = state.accounts.len();

        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            let account = &mut state.accounts[index];
            account.roll_windows(now);

            match account.availability(now) {
                Availability::Available => {
                    account.set_leased(true);
                    let config = account.config().clone();
                    state.cursor = (index + 1) % count;

                    return Some(AccountLease {
                        pool: self,
                        index,
                        config,
                    });
                }
                reason => debug!("Skipping account {}: {:?}", account.name(), reason),
            }
        }

        warn!("No available account among {} configured", count);
        None
    }

    /// Get a live session for the leased account, reusing the cached one when it answers a probe.
    ///
    /// Failing to open a session counts as an account failure.
    pub async fn acquire_session(
        &self,
        lease: &AccountLease<'_>,
    ) -> std::result::Result<SessionHandle, SendError> {
        let name = lease.name();

        let active = self
            .state()
            .accounts
            .get(lease.index)
            .is_some_and(|account| account.is_active());
        if !active {
            return Err(SendError::CircuitOpen(name.to_string()));
        }

        let cached = self.sessions.lock().await.get(name).cloned();
        if let Some(handle) = cached {
            let alive = {
                let mut session = handle.lock().await;
                tokio::time::timeout(self.session_timeout, session.is_alive())
                    .await
                    .unwrap_or(false)
            };

            if alive {
                return Ok(handle);
            }

            debug!("Cached session for account {} is dead, reconnecting", name);
            self.discard_session(name, &handle).await;
        }

        let opened =
            tokio::time::timeout(self.session_timeout, self.transport.open_session(lease.config()))
                .await;

        match opened {
            Ok(Ok(session)) => {
                let handle: SessionHandle = Arc::new(AsyncMutex::new(session));
                self.sessions
                    .lock()
                    .await
                    .insert(name.to_string(), Arc::clone(&handle));
                debug!("Opened session for account {}", name);
                Ok(handle)
            }
            Ok(Err(e)) => {
                warn!("Failed to open session for account {}: {}", name, e);
                self.note_failure(lease.index);
                Err(match e {
                    TransportError::Timeout(_) => {
                        SendError::Timeout(self.session_timeout.as_secs())
                    }
                    other => SendError::Transport(other.to_string()),
                })
            }
            Err(_) => {
                warn!(
                    "Opening session for account {} timed out after {:?}",
                    name, self.session_timeout
                );
                self.note_failure(lease.index);
                Err(SendError::Timeout(self.session_timeout.as_secs()))
            }
        }
    }

    /// Account a delivered message against the lease's account
    pub async fn record_success(&self, lease: AccountLease<'_>) {
        let now = self.clock.now();
        let mut state = self.state();
        if let Some(account) = state.accounts.get_mut(lease.index) {
            account.record_success(now);
        }
    }

    /// Account a failed attempt; the cached session is dropped as it may be broken
    pub async fn record_failure(&self, lease: AccountLease<'_>) {
        self.note_failure(lease.index);

        let handle = self.sessions.lock().await.remove(lease.name());
        if let Some(handle) = handle {
            close_quietly(lease.name(), &handle).await;
        }
    }

    fn note_failure(&self, index: usize) {
        let mut state = self.state();
        let Some(account) = state.accounts.get_mut(index) else {
            return;
        };

        if account.record_failure(self.max_failures) {
            warn!(
                "Circuit breaker opened for account {} after {} consecutive failures",
                account.name(),
                account.consecutive_failures()
            );
        }
    }

    async fn discard_session(&self, name: &str, handle: &SessionHandle) {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                sessions.remove(name);
            }
        }
        close_quietly(name, handle).await;
    }

    /// Close every cached session. Safe to call repeatedly.
    pub async fn close_all(&self) {
        let drained: Vec<(String, SessionHandle)> = self.sessions.lock().await.drain().collect();

        if !drained.is_empty() {
            info!("Closing {} cached sessions", drained.len());
        }

        for (name, handle) in drained {
            close_quietly(&name, &handle).await;
        }
    }

    /// Number of cached sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Counters of every account, in rotation order
    pub fn account_stats(&self) -> Vec<AccountSnapshot> {
        self.state()
            .accounts
            .iter()
            .map(RateLimitedAccount::snapshot)
            .collect()
    }

    /// Reactivate a deactivated account after it has been fixed
    pub fn reset_account(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let account = state
            .accounts
            .iter_mut()
            .find(|account| account.name() == name)
            .ok_or_else(|| Error::NotFound(format!("account {}", name)))?;

        account.reactivate();
        info!("Account {} reactivated", name);
        Ok(())
    }

    /// Fail when the pool cannot send at all: no accounts, or all deactivated
    pub fn ensure_usable(&self) -> Result<()> {
        let state = self.state();
        if state.accounts.is_empty() {
            return Err(Error::NoAccounts);
        }

        if state.accounts.iter().all(|account| !account.is_active()) {
            return Err(Error::AllAccountsDeactivated(state.accounts.len()));
        }

        Ok(())
    }
}

async fn close_quietly(name: &str, handle: &SessionHandle) {
    if let Err(e) = handle.lock().await.close().await {
        warn!("Failed to close session for account {}: {}", name, e);
    }
}
