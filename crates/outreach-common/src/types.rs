//! Common types for Outreach

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Account name used in outcomes when no account could be selected
pub const NO_ACCOUNT: &str = "none";

/// How the session to an outgoing mail server is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Unencrypted SMTP
    Plaintext,
    /// Plain connection upgraded with STARTTLS
    #[default]
    Starttls,
    /// Implicit TLS (SMTPS)
    Tls,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Plaintext => write!(f, "plaintext"),
            TransportMode::Starttls => write!(f, "starttls"),
            TransportMode::Tls => write!(f, "tls"),
        }
    }
}

/// Configuration of one outgoing mail identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Unique account name
    pub name: String,

    /// SMTP server host
    pub host: String,

    /// SMTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login username
    #[serde(default)]
    pub username: String,

    /// Login password
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Address placed in the From header
    pub from_email: String,

    /// Display name placed in the From header
    #[serde(default)]
    pub from_name: String,

    /// Transport security
    #[serde(default)]
    pub transport: TransportMode,

    /// Maximum sends per calendar day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    /// Maximum sends per clock hour
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,

    /// Minimum spacing between two sends on this account
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: f64,
}

fn default_port() -> u16 {
    587
}

fn default_daily_limit() -> u32 {
    500
}

fn default_hourly_limit() -> u32 {
    50
}

fn default_min_delay() -> f64 {
    2.0
}

impl AccountConfig {
    /// Create an account with default limits
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            from_email: from_email.into(),
            from_name: String::new(),
            transport: TransportMode::default(),
            daily_limit: default_daily_limit(),
            hourly_limit: default_hourly_limit(),
            min_delay_secs: default_min_delay(),
        }
    }

    /// Set the daily and hourly limits
    pub fn with_limits(mut self, daily: u32, hourly: u32) -> Self {
        self.daily_limit = daily;
        self.hourly_limit = hourly;
        self
    }

    /// Set the minimum delay between sends
    pub fn with_min_delay(mut self, secs: f64) -> Self {
        self.min_delay_secs = secs;
        self
    }

    /// From header value, `Name <addr>` when a display name is set
    pub fn from_header(&self) -> String {
        if self.from_name.is_empty() {
            self.from_email.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_email)
        }
    }
}

/// Contact status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Unsubscribed,
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactStatus::Pending => write!(f, "pending"),
            ContactStatus::Sent => write!(f, "sent"),
            ContactStatus::Failed => write!(f, "failed"),
            ContactStatus::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

impl std::str::FromStr for ContactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContactStatus::Pending),
            "sent" => Ok(ContactStatus::Sent),
            "failed" => Ok(ContactStatus::Failed),
            "unsubscribed" => Ok(ContactStatus::Unsubscribed),
            _ => Err(format!("Invalid contact status: {}", s)),
        }
    }
}

/// One recipient and its campaign state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Contact {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub brokerage: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub custom1: String,
    #[serde(default)]
    pub custom2: String,
    #[serde(default)]
    pub custom3: String,
    #[serde(default)]
    pub custom4: String,
    #[serde(default)]
    pub custom5: String,
    #[serde(default)]
    pub status: ContactStatus,
    #[serde(default)]
    pub sent_count: u32,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
}

impl Contact {
    /// Create a pending contact
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    /// Case-insensitive identity of the contact
    pub fn key(&self) -> String {
        email_key(&self.email)
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.status == ContactStatus::Unsubscribed
    }

    /// Full name, trimmed
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Append a note, separating entries with ` | `
    pub fn append_note(&mut self, note: &str) {
        if self.notes.is_empty() {
            self.notes = note.to_string();
        } else {
            self.notes.push_str(" | ");
            self.notes.push_str(note);
        }
    }

    /// Field map used for template substitution
    pub fn template_variables(&self) -> HashMap<String, String> {
        let fields = [
            ("FirstName", self.first_name.clone()),
            ("LastName", self.last_name.clone()),
            ("FullName", self.full_name()),
            ("Email", self.email.clone()),
            ("Company", self.company.clone()),
            ("Brokerage", self.brokerage.clone()),
            ("City", self.city.clone()),
            ("State", self.state.clone()),
            ("Custom1", self.custom1.clone()),
            ("Custom2", self.custom2.clone()),
            ("Custom3", self.custom3.clone()),
            ("Custom4", self.custom4.clone()),
            ("Custom5", self.custom5.clone()),
        ];

        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Reason a single delivery attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SendError {
    #[error("No available account")]
    NoAvailableAccount,

    #[error("Template rendering error: {0}")]
    Render(String),

    #[error("Either plain text body or HTML body must be provided")]
    EmptyBody,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport timed out after {0}s")]
    Timeout(u64),

    #[error("Account {0} is deactivated")]
    CircuitOpen(String),
}

impl SendError {
    /// Whether the failure is attributable to the account rather than the contact
    pub fn is_account_failure(&self) -> bool {
        matches!(
            self,
            SendError::Transport(_) | SendError::Timeout(_) | SendError::CircuitOpen(_)
        )
    }
}

/// Immutable result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    success: bool,
    recipient: String,
    account: String,
    error: Option<SendError>,
    timestamp: DateTime<Utc>,
}

impl SendOutcome {
    /// A delivered message
    pub fn delivered(
        recipient: impl Into<String>,
        account: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            success: true,
            recipient: recipient.into(),
            account: account.into(),
            error: None,
            timestamp,
        }
    }

    /// A failed attempt
    pub fn failed(
        recipient: impl Into<String>,
        account: impl Into<String>,
        error: SendError,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            recipient: recipient.into(),
            account: account.into(),
            error: Some(error),
            timestamp,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn error(&self) -> Option<&SendError> {
        self.error.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Condition under which a follow-up rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpTrigger {
    Immediate,
    DaysAfterSend,
    DaysAfterFailure,
    DaysAfterNoReply,
}

impl std::fmt::Display for FollowUpTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FollowUpTrigger::Immediate => write!(f, "immediate"),
            FollowUpTrigger::DaysAfterSend => write!(f, "days_after_send"),
            FollowUpTrigger::DaysAfterFailure => write!(f, "days_after_failure"),
            FollowUpTrigger::DaysAfterNoReply => write!(f, "days_after_no_reply"),
        }
    }
}

/// Named follow-up policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpRule {
    pub name: String,
    pub trigger: FollowUpTrigger,

    /// Wait period in days
    #[serde(default)]
    pub days: i64,

    pub subject_template: String,

    #[serde(default)]
    pub body_template: String,

    #[serde(default)]
    pub html_template: Option<String>,

    /// Cap on follow-ups per contact for this rule
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_follow_ups() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

impl FollowUpRule {
    /// Create an enabled rule with the default follow-up cap
    pub fn new(
        name: impl Into<String>,
        trigger: FollowUpTrigger,
        days: i64,
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger,
            days,
            subject_template: subject_template.into(),
            body_template: body_template.into(),
            html_template: None,
            max_follow_ups: default_max_follow_ups(),
            enabled: true,
        }
    }

    pub fn with_max_follow_ups(mut self, max: u32) -> Self {
        self.max_follow_ups = max;
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_template = Some(html.into());
        self
    }
}

/// One recorded follow-up attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpRecord {
    pub rule_name: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Append-only log of follow-up attempts, keyed by contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FollowUpHistory {
    entries: BTreeMap<String, Vec<FollowUpRecord>>,
}

impl FollowUpHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt for the contact with the given address
    pub fn record(&mut self, email: &str, record: FollowUpRecord) {
        self.entries
            .entry(email_key(email))
            .or_default()
            .push(record);
    }

    /// Attempts (successful or not) made for a contact under a rule
    pub fn count(&self, email: &str, rule_name: &str) -> u32 {
        self.records(email)
            .iter()
            .filter(|r| r.rule_name == rule_name)
            .count() as u32
    }

    /// All attempts for a contact, oldest first
    pub fn records(&self, email: &str) -> &[FollowUpRecord] {
        self.entries
            .get(&email_key(email))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of contacts with at least one attempt
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalized form of an address used to match contacts and history entries
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}
