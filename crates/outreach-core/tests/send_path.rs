//! End-to-end runs over an in-memory transport: campaign, then follow-ups days later

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use outreach_common::config::DispatchConfig;
use outreach_common::types::{
    AccountConfig, Contact, ContactStatus, FollowUpHistory, FollowUpRule, FollowUpTrigger,
};
use outreach_core::{
    AccountPool, Clock, Dispatcher, FollowUpEngine, ManualClock, MessageTemplate, OutgoingMessage,
    Session, Transport, TransportError,
};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, OutgoingMessage)>>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open_session(
        &self,
        account: &AccountConfig,
    ) -> Result<Box<dyn Session>, TransportError> {
        Ok(Box::new(RecordingSession {
            account: account.name.clone(),
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct RecordingSession {
    account: String,
    sent: Arc<Mutex<Vec<(String, OutgoingMessage)>>>,
}

#[async_trait]
impl Session for RecordingSession {
    async fn is_alive(&mut self) -> bool {
        true
    }

    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((self.account.clone(), message.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn accounts(daily: u32) -> Vec<AccountConfig> {
    ["sales1", "sales2"]
        .iter()
        .map(|name| {
            let mut account =
                AccountConfig::new(*name, "smtp.example.com", format!("{}@example.com", name))
                    .with_limits(daily, daily)
                    .with_min_delay(0.0);
            account.from_name = "Sales Team".to_string();
            account
        })
        .collect()
}

fn contacts(count: usize) -> Vec<Contact> {
    (0..count)
        .map(|i| {
            let mut contact = Contact::new(format!("lead{}@example.org", i));
            contact.first_name = format!("Lead{}", i);
            contact.company = "Acme".to_string();
            contact
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn campaign_then_follow_up() {
    let start = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let transport = RecordingTransport::default();

    let pool =
        AccountPool::new(accounts(100), Arc::new(transport.clone())).with_clock(clock.clone());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(pool), DispatchConfig::default()));

    let mut contacts = contacts(4);
    contacts[3].status = ContactStatus::Unsubscribed;

    let stats = dispatcher
        .send_campaign(
            &mut contacts,
            &MessageTemplate::new("Hello {FirstName}", "Hi {FirstName} at {Company}"),
            None,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.by_account["sales1"].total, 2);
    assert_eq!(stats.by_account["sales2"].total, 1);

    let sent = transport.sent();
    assert_eq!(sent[0].1.from, "Sales Team <sales1@example.com>");
    assert_eq!(sent[1].1.text_body.as_deref(), Some("Hi Lead1 at Acme"));
    assert_eq!(contacts[0].last_sent_at, Some(start));

    let mut engine = FollowUpEngine::new(Arc::clone(&dispatcher));
    engine.add_rule(
        FollowUpRule::new(
            "no-reply",
            FollowUpTrigger::DaysAfterNoReply,
            3,
            "Re: Hello {FirstName}",
            "Just checking in, {FirstName}.",
        )
        .with_max_follow_ups(2),
    );
    let mut history = FollowUpHistory::new();

    clock.advance(Duration::days(2));
    assert!(engine.find_due(&contacts, &history, clock.now()).is_empty());

    clock.advance(Duration::days(1));
    let stats = engine
        .run(
            &mut contacts,
            &mut history,
            clock.now(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(stats.successful, 3);
    assert_eq!(history.count("LEAD0@example.org", "no-reply"), 1);
    assert_eq!(contacts[0].sent_count, 2);
    assert_eq!(contacts[0].follow_up_at, Some(start + Duration::days(6)));
    assert_eq!(contacts[3].sent_count, 0);
    assert_eq!(transport.sent().len(), 6);

    dispatcher.pool().close_all().await;
    assert_eq!(dispatcher.pool().session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_campaigns_share_quota() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()));
    let transport = RecordingTransport::default();
    let pool = AccountPool::new(accounts(3), Arc::new(transport.clone())).with_clock(clock);
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(pool), DispatchConfig::default()));

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let mut contacts = contacts(5);
                let template = MessageTemplate::new("Hi", "Hello {FirstName}");
                dispatcher
                    .send_campaign(&mut contacts, &template, None, &CancellationToken::new(), None)
                    .await
                    .map(|stats| stats.successful)
            })
        })
        .collect();

    let mut delivered = 0;
    for run in runs {
        delivered += run.await.unwrap().unwrap();
    }

    assert_eq!(delivered, 6);
    assert_eq!(transport.sent().len(), 6);
    for snapshot in dispatcher.pool().account_stats() {
        assert_eq!(snapshot.sent_today, 3);
    }
}
