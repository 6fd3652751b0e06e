//! Outreach Core - Send-path engine for bulk outreach
//!
//! This crate rotates outgoing mail across a pool of rate-limited accounts,
//! dispatches paced batches of templated messages to contacts, and sends
//! rule-driven follow-ups based on contact history.

pub mod clock;
pub mod dispatch;
pub mod followup;
pub mod pool;
pub mod template;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{
    AccountTally, CampaignStats, Dispatcher, MessageTemplate, Progress, ProgressEvent,
};
pub use followup::FollowUpEngine;
pub use pool::{AccountLease, AccountPool, AccountSnapshot};
pub use template::{validate_address, RenderError, TemplateRenderer};
pub use transport::{OutgoingMessage, Session, SmtpTransport, Transport, TransportError};
