//! Scripted in-memory transport for unit tests

use crate::transport::{OutgoingMessage, Session, Transport, TransportError};
use async_trait::async_trait;
use outreach_common::types::AccountConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct FakeState {
    opens: HashMap<String, u32>,
    closes: u32,
    sent: Vec<(String, OutgoingMessage)>,
    failing_opens: HashSet<String>,
    failing_sends: HashSet<String>,
    hanging_opens: HashSet<String>,
    hanging_sends: HashSet<String>,
    dead: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Make opening a session for `account` fail with an auth error
    pub fn fail_open(&self, account: &str) {
        self.with_state(|s| s.failing_opens.insert(account.to_string()));
    }

    /// Make every send through `account` get rejected
    pub fn fail_send(&self, account: &str) {
        self.with_state(|s| s.failing_sends.insert(account.to_string()));
    }

    /// Make opening a session for `account` never complete
    pub fn hang_open(&self, account: &str) {
        self.with_state(|s| s.hanging_opens.insert(account.to_string()));
    }

    /// Make every send through `account` never complete
    pub fn hang_send(&self, account: &str) {
        self.with_state(|s| s.hanging_sends.insert(account.to_string()));
    }

    /// Make current sessions of `account` fail their liveness probe
    pub fn kill_sessions(&self, account: &str) {
        self.with_state(|s| s.dead.insert(account.to_string()));
    }

    pub fn opens(&self, account: &str) -> u32 {
        self.with_state(|s| s.opens.get(account).copied().unwrap_or(0))
    }

    pub fn closes(&self) -> u32 {
        self.with_state(|s| s.closes)
    }

    /// (account, message) pairs in submission order
    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.with_state(|s| s.sent.clone())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_session(
        &self,
        account: &AccountConfig,
    ) -> Result<Box<dyn Session>, TransportError> {
        let hang = self.with_state(|s| s.hanging_opens.contains(&account.name));
        if hang {
            std::future::pending::<()>().await;
        }

        self.with_state(|s| {
            if s.failing_opens.contains(&account.name) {
                return Err(TransportError::Auth("535 authentication failed".to_string()));
            }
            *s.opens.entry(account.name.clone()).or_default() += 1;
            s.dead.remove(&account.name);
            Ok(())
        })?;

        Ok(Box::new(FakeSession {
            account: account.name.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct FakeSession {
    account: String,
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

#[async_trait]
impl Session for FakeSession {
    async fn is_alive(&mut self) -> bool {
        !self.closed && !self.state.lock().unwrap().dead.contains(&self.account)
    }

    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let hang = self.state.lock().unwrap().hanging_sends.contains(&self.account);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_sends.contains(&self.account) {
            return Err(TransportError::Rejected("550 mailbox unavailable".to_string()));
        }
        state.sent.push((self.account.clone(), message.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}
