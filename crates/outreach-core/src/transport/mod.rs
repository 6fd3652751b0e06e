//! Transport seam - opening authenticated sessions and submitting messages

mod smtp;

pub use smtp::SmtpTransport;

use async_trait::async_trait;
use outreach_common::types::AccountConfig;
use thiserror::Error;

/// Errors raised by a transport or one of its sessions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server rejected message: {0}")]
    Rejected(String),

    #[error("invalid message: {0}")]
    Message(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session closed")]
    Closed,
}

/// A fully rendered message ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// From header, `Name <addr>` or a bare address
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

/// Opens sessions to an account's outgoing mail server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, negotiate security per the account's transport mode and authenticate
    async fn open_session(
        &self,
        account: &AccountConfig,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// A live, authenticated session
#[async_trait]
pub trait Session: Send {
    /// Lightweight liveness probe (NOOP)
    async fn is_alive(&mut self) -> bool;

    /// Submit one message
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), TransportError>;

    /// Release the session
    async fn close(&mut self) -> Result<(), TransportError>;
}
