//! Follow-up Engine
//!
//! Decides from elapsed time and contact status which contacts are due for a
//! follow-up under which rule, and sends those follow-ups through the
//! dispatcher while keeping per-rule history.

use crate::dispatch::{
    pause, CampaignStats, Dispatcher, MessageTemplate, Progress, ProgressEvent,
};
use chrono::{DateTime, Duration, Utc};
use outreach_common::types::{
    Contact, ContactStatus, FollowUpHistory, FollowUpRecord, FollowUpRule, FollowUpTrigger,
};
use outreach_common::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rule-driven follow-up sender
pub struct FollowUpEngine {
    dispatcher: Arc<Dispatcher>,
    rules: Vec<FollowUpRule>,
}

impl FollowUpEngine {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = FollowUpRule>) -> Self {
        for rule in rules {
            self.add_rule(rule);
        }
        self
    }

    /// Register a rule. A rule with the same name is replaced in place, keeping its position.
    pub fn add_rule(&mut self, rule: FollowUpRule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => {
                info!("Replaced follow-up rule: {}", rule.name);
                *existing = rule;
            }
            None => {
                info!("Added follow-up rule: {}", rule.name);
                self.rules.push(rule);
            }
        }
    }

    /// Remove a rule by name; returns whether it existed
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name != name);

        let removed = self.rules.len() != before;
        if removed {
            info!("Removed follow-up rule: {}", name);
        }
        removed
    }

    /// Rules in registration order
    pub fn rules(&self) -> &[FollowUpRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&FollowUpRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Whether the rule's trigger condition holds for the contact at `now`.
    ///
    /// Elapsed time is counted in whole days since the last send. There is no
    /// reply signal: "no reply" means the contact is still `sent`.
    pub fn is_due(rule: &FollowUpRule, contact: &Contact, now: DateTime<Utc>) -> bool {
        if !rule.enabled || contact.is_unsubscribed() {
            return false;
        }

        let waited = || {
            contact
                .last_sent_at
                .is_some_and(|last| now.signed_duration_since(last).num_days() >= rule.days)
        };

        match rule.trigger {
            FollowUpTrigger::Immediate => true,
            FollowUpTrigger::DaysAfterSend => waited(),
            FollowUpTrigger::DaysAfterFailure => {
                contact.status == ContactStatus::Failed && waited()
            }
            FollowUpTrigger::DaysAfterNoReply => contact.status == ContactStatus::Sent && waited(),
        }
    }

    /// Contacts due for a follow-up, each paired with the rule to send.
    ///
    /// A contact yields at most one pair per evaluation: the first enabled
    /// rule, in registration order, that is due and still under its
    /// `max_follow_ups` for that contact. Later rules are not considered.
    pub fn find_due<'a>(
        &'a self,
        contacts: &'a [Contact],
        history: &FollowUpHistory,
        now: DateTime<Utc>,
    ) -> Vec<(&'a Contact, &'a FollowUpRule)> {
        self.due_pairs(contacts, history, now)
            .into_iter()
            .map(|(contact, rule)| (&contacts[contact], &self.rules[rule]))
            .collect()
    }

    fn due_pairs(
        &self,
        contacts: &[Contact],
        history: &FollowUpHistory,
        now: DateTime<Utc>,
    ) -> Vec<(usize, usize)> {
        contacts
            .iter()
            .enumerate()
            .filter(|(_, contact)| !contact.is_unsubscribed())
            .filter_map(|(index, contact)| {
                self.rules
                    .iter()
                    .position(|rule| {
                        rule.enabled
                            && history.count(&contact.email, &rule.name) < rule.max_follow_ups
                            && Self::is_due(rule, contact, now)
                    })
                    .map(|rule| (index, rule))
            })
            .collect()
    }

    /// Send every due follow-up, recording each attempt in `history`.
    ///
    /// Failed attempts mark the contact failed and still count toward the
    /// rule's cap. `last_sent_at` and the history timestamp are the moment the
    /// pool's clock saw the attempt; the next `follow_up_at` is `now` plus the
    /// rule's wait.
    pub async fn run(
        &self,
        contacts: &mut [Contact],
        history: &mut FollowUpHistory,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        mut progress: Progress<'_>,
    ) -> Result<CampaignStats> {
        self.dispatcher.pool().ensure_usable()?;

        let due = self.due_pairs(contacts, history, now);
        if due.is_empty() {
            info!("No contacts need follow-ups at this time");
            return Ok(CampaignStats::default());
        }

        info!("Processing {} follow-ups", due.len());
        let total = due.len();
        let mut outcomes = Vec::with_capacity(total);

        for (attempt, &(contact_index, rule_index)) in due.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Follow-ups cancelled after {} of {}", attempt, total);
                break;
            }

            let rule = &self.rules[rule_index];
            let contact = &mut contacts[contact_index];

            let outcome = self
                .dispatcher
                .send_one(contact, &MessageTemplate::from_rule(rule))
                .await;
            let at = outcome.timestamp();

            history.record(
                &contact.email,
                FollowUpRecord {
                    rule_name: rule.name.clone(),
                    timestamp: at,
                    success: outcome.success(),
                    error: outcome.error().map(|e| e.to_string()),
                },
            );

            if outcome.success() {
                contact.last_sent_at = Some(at);
                contact.sent_count += 1;

                if history.count(&contact.email, &rule.name) < rule.max_follow_ups {
                    match days_after(now, rule.days) {
                        Some(next) => {
                            contact.follow_up_at = Some(next);
                            debug!(
                                "Next {} follow-up for {} at {}",
                                rule.name, contact.email, next
                            );
                        }
                        None => warn!(
                            "Rule {} waits {} days, past the calendar; not rescheduling {}",
                            rule.name, rule.days, contact.email
                        ),
                    }
                }
            } else {
                contact.status = ContactStatus::Failed;
            }

            if let Some(handler) = progress.as_deref_mut() {
                handler(ProgressEvent {
                    index: attempt + 1,
                    total,
                    rule: Some(&rule.name),
                    outcome: &outcome,
                });
            }
            outcomes.push(outcome);

            let attempts = attempt + 1;
            if attempts < total && !pause(self.dispatcher.config().global_delay(), cancel).await {
                info!("Follow-ups cancelled after {} of {}", attempts, total);
                break;
            }
        }

        let stats = CampaignStats::from_outcomes(outcomes).with_cancelled(cancel.is_cancelled());
        info!(
            "Follow-ups processed: {} sent, {} failed",
            stats.successful, stats.failed
        );
        Ok(stats)
    }

    /// Manually schedule the next follow-up under a rule
    pub fn schedule(
        &self,
        contact: &mut Contact,
        rule_name: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let rule = self
            .rule(rule_name)
            .ok_or_else(|| Error::NotFound(format!("follow-up rule {}", rule_name)))?;

        let at = days_after(now, rule.days).ok_or_else(|| {
            Error::Validation(format!(
                "follow-up rule {} waits {} days, past the representable calendar",
                rule.name, rule.days
            ))
        })?;
        contact.follow_up_at = Some(at);
        info!("Scheduled follow-up for {} on {}", contact.email, at);
        Ok(at)
    }
}

fn days_after(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|wait| at.checked_add_signed(wait))
}
