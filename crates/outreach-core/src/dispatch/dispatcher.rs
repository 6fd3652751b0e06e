//! Dispatcher
//!
//! Sends one rendered message to one contact through the account pool, and
//! drives paced, cancellable batch and campaign runs over many contacts.

use super::stats::CampaignStats;
use crate::pool::AccountPool;
use crate::template::{validate_address, TemplateRenderer};
use crate::transport::OutgoingMessage;
use chrono::{DateTime, Utc};
use outreach_common::config::DispatchConfig;
use outreach_common::types::{
    AccountConfig, Contact, ContactStatus, FollowUpRule, SendError, SendOutcome, NO_ACCOUNT,
};
use outreach_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Subject, plain body and optional HTML body templates of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

impl MessageTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            html: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn from_rule(rule: &FollowUpRule) -> Self {
        Self {
            subject: rule.subject_template.clone(),
            body: rule.body_template.clone(),
            html: rule.html_template.clone(),
        }
    }
}

/// Reported to the progress handler after each attempt, in order
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent<'a> {
    /// 1-based attempt number within the run
    pub index: usize,
    /// Attempts the run plans to make
    pub total: usize,
    /// Follow-up rule behind the attempt, if any
    pub rule: Option<&'a str>,
    pub outcome: &'a SendOutcome,
}

/// Optional caller-supplied progress handler
pub type Progress<'p> = Option<&'p mut (dyn for<'e> FnMut(ProgressEvent<'e>) + Send)>;

/// Paced sender over an account pool
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    renderer: TemplateRenderer,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(pool: Arc<AccountPool>, config: DispatchConfig) -> Self {
        Self {
            pool,
            renderer: TemplateRenderer::new(),
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: TemplateRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Placeholders in the template that no contact field or renderer default fills
    pub fn unfilled_placeholders(&self, template: &MessageTemplate) -> Vec<String> {
        let fields = Contact::default().template_variables();
        let texts = [Some(&template.subject), Some(&template.body), template.html.as_ref()];

        let mut names: Vec<String> = Vec::new();
        for text in texts.into_iter().flatten() {
            for name in self.renderer.unknown_placeholders(text, &fields) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.pool.clock().now()
    }

    /// Make one delivery attempt. Never retries; every failure comes back as a failed outcome.
    pub async fn send_one(&self, contact: &Contact, template: &MessageTemplate) -> SendOutcome {
        let Some(lease) = self.pool.select_account() else {
            debug!("No account available for {}", contact.email);
            return SendOutcome::failed(
                &contact.email,
                NO_ACCOUNT,
                SendError::NoAvailableAccount,
                self.now(),
            );
        };
        let account = lease.name().to_string();

        let message = match self.prepare(contact, template, lease.config()) {
            Ok(message) => message,
            Err(e) => {
                error!("Not sending to {}: {}", contact.email, e);
                return SendOutcome::failed(&contact.email, account, e, self.now());
            }
        };

        let session = match self.pool.acquire_session(&lease).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to send to {} via {}: {}", contact.email, account, e);
                return SendOutcome::failed(&contact.email, account, e, self.now());
            }
        };

        let timeout = self.config.send_timeout();
        let sent = {
            let mut session = session.lock().await;
            match tokio::time::timeout(timeout, session.send(&message)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
                Err(_) => Err(SendError::Timeout(timeout.as_secs())),
            }
        };

        match sent {
            Ok(()) => {
                self.pool.record_success(lease).await;
                info!("Sent to {} via {}", message.to, account);
                SendOutcome::delivered(&contact.email, account, self.now())
            }
            Err(e) => {
                if e.is_account_failure() {
                    self.pool.record_failure(lease).await;
                }
                error!("Failed to send to {} via {}: {}", contact.email, account, e);
                SendOutcome::failed(&contact.email, account, e, self.now())
            }
        }
    }

    fn prepare(
        &self,
        contact: &Contact,
        template: &MessageTemplate,
        account: &AccountConfig,
    ) -> std::result::Result<OutgoingMessage, SendError> {
        let fields = contact.template_variables();
        let render = |text: &str| {
            self.renderer
                .render(text, &fields)
                .map_err(|e| SendError::Render(e.to_string()))
        };

        let subject = render(&template.subject)?;
        let text_body = non_empty(render(&template.body)?);
        let html_body = match &template.html {
            Some(html) => non_empty(render(html)?),
            None => None,
        };

        if text_body.is_none() && html_body.is_none() {
            return Err(SendError::EmptyBody);
        }

        let to = validate_address(&contact.email).map_err(SendError::InvalidAddress)?;

        Ok(OutgoingMessage {
            from: account.from_header(),
            to,
            subject,
            text_body,
            html_body,
        })
    }

    /// Send to every contact in order, skipping unsubscribed ones, and update each contact.
    ///
    /// Fails before touching any contact when the pool has no usable account.
    /// On cancellation the outcomes gathered so far are returned.
    pub async fn send_batch(
        &self,
        contacts: &mut [Contact],
        template: &MessageTemplate,
        cancel: &CancellationToken,
        mut progress: Progress<'_>,
    ) -> Result<Vec<SendOutcome>> {
        self.pool.ensure_usable()?;

        let eligible: Vec<usize> = contacts
            .iter()
            .enumerate()
            .filter(|(_, contact)| !contact.is_unsubscribed())
            .map(|(index, _)| index)
            .collect();
        let total = eligible.len();
        let mut outcomes = Vec::with_capacity(total);

        for (attempt, &index) in eligible.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Batch cancelled after {} of {} attempts", attempt, total);
                break;
            }

            let contact = &mut contacts[index];
            let outcome = self.send_one(contact, template).await;
            apply_outcome(contact, &outcome);

            if let Some(handler) = progress.as_deref_mut() {
                handler(ProgressEvent {
                    index: attempt + 1,
                    total,
                    rule: None,
                    outcome: &outcome,
                });
            }
            outcomes.push(outcome);

            let attempts = attempt + 1;
            if attempts < total && !pause(self.batch_pause(attempts), cancel).await {
                info!("Batch cancelled after {} of {} attempts", attempts, total);
                break;
            }
        }

        Ok(outcomes)
    }

    /// Send to at most `max_emails` contacts from the front of the list and summarize the run
    pub async fn send_campaign(
        &self,
        contacts: &mut [Contact],
        template: &MessageTemplate,
        max_emails: Option<usize>,
        cancel: &CancellationToken,
        progress: Progress<'_>,
    ) -> Result<CampaignStats> {
        let limit = max_emails.map_or(contacts.len(), |max| max.min(contacts.len()));
        let contacts = &mut contacts[..limit];
        info!("Starting campaign over {} contacts", contacts.len());
        for name in self.unfilled_placeholders(template) {
            warn!("Placeholder {} matches no contact field and is sent as written", name);
        }

        let outcomes = self.send_batch(contacts, template, cancel, progress).await?;
        let stats = CampaignStats::from_outcomes(outcomes).with_cancelled(cancel.is_cancelled());

        info!(
            "Campaign finished: {} sent, {} failed ({:.1}%)",
            stats.successful, stats.failed, stats.success_rate
        );
        Ok(stats)
    }

    /// Delay after the given number of attempts: the global delay, plus the
    /// batch delay whenever a full batch has just completed
    fn batch_pause(&self, attempts: usize) -> Duration {
        let mut delay = self.config.global_delay();
        if self.config.batch_size > 0 && attempts % self.config.batch_size == 0 {
            debug!("Batch of {} complete, pausing", self.config.batch_size);
            delay += self.config.batch_delay();
        }
        delay
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Reflect an outcome on the contact. Capacity exhaustion leaves it pending.
fn apply_outcome(contact: &mut Contact, outcome: &SendOutcome) {
    match outcome.error() {
        None => {
            contact.status = ContactStatus::Sent;
            contact.sent_count += 1;
            contact.last_sent_at = Some(outcome.timestamp());
        }
        Some(SendError::NoAvailableAccount) => {}
        Some(e) => {
            contact.status = ContactStatus::Failed;
            contact.append_note(&format!("Error: {}", e));
        }
    }
}

/// Sleep unless cancelled first; returns false on cancellation
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
