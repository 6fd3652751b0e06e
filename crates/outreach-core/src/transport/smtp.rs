//! SMTP transport backed by lettre

use super::{OutgoingMessage, Session, Transport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, extension::ClientId, Error as SmtpError},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use outreach_common::types::{AccountConfig, TransportMode};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// SMTP transport
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    hello_name: String,
    timeout: Duration,
}

impl SmtpTransport {
    /// Create a transport announcing `hello_name` in EHLO
    pub fn new(hello_name: impl Into<String>) -> Self {
        Self {
            hello_name: hello_name.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the per-command SMTP timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn open_session(
        &self,
        account: &AccountConfig,
    ) -> Result<Box<dyn Session>, TransportError> {
        let builder = match account.transport {
            TransportMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&account.host),
            TransportMode::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.host)
            }
            TransportMode::Plaintext => Ok(
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.host),
            ),
        }
        .map_err(|e| TransportError::Connect(format!("Failed to create SMTP transport: {}", e)))?;

        let mut builder = builder
            .port(account.port)
            .hello_name(ClientId::Domain(self.hello_name.clone()))
            .timeout(Some(self.timeout));

        if !account.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                account.username.clone(),
                account.password.clone(),
            ));
        }

        let mailer = builder.build();

        // Connects and authenticates, so bad credentials surface here rather than on first send
        match mailer.test_connection().await {
            Ok(true) => {
                debug!(
                    "Opened {} session to {}:{} for account {}",
                    account.transport, account.host, account.port, account.name
                );
                Ok(Box::new(SmtpSession {
                    mailer: Some(mailer),
                }))
            }
            Ok(false) => Err(TransportError::Connect(format!(
                "{}:{} did not answer NOOP",
                account.host, account.port
            ))),
            Err(e) => Err(classify(e)),
        }
    }
}

/// Session over a (pooled) lettre transport
struct SmtpSession {
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

#[async_trait]
impl Session for SmtpSession {
    async fn is_alive(&mut self) -> bool {
        match &self.mailer {
            Some(mailer) => mailer.test_connection().await.unwrap_or(false),
            None => false,
        }
    }

    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let mailer = self.mailer.as_ref().ok_or(TransportError::Closed)?;
        let email = build_message(message)?;

        let response = mailer.send(email).await.map_err(classify)?;
        debug!("Message to {} accepted: {:?}", message.to, response.code());

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the transport shuts down its pooled connections
        self.mailer.take();
        Ok(())
    }
}

fn build_message(message: &OutgoingMessage) -> Result<Message, TransportError> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|e| TransportError::Message(format!("Invalid from address: {}", e)))?;

    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| TransportError::Message(format!("Invalid to address: {}", e)))?;

    let domain = from.email.domain().to_string();
    let builder = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .message_id(Some(format!(
            "<{}.{}@{}>",
            Uuid::new_v4(),
            Utc::now().timestamp(),
            domain
        )));

    let email = match (&message.html_body, &message.text_body) {
        (Some(html), Some(text)) => builder.multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(text.clone()))
                .singlepart(SinglePart::html(html.clone())),
        ),
        (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
        (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
        (None, None) => {
            return Err(TransportError::Message(
                "message has neither a text nor an HTML body".to_string(),
            ))
        }
    };

    email.map_err(|e| TransportError::Message(format!("Failed to build email: {}", e)))
}

fn classify(e: SmtpError) -> TransportError {
    let text = e.to_string();
    if e.is_timeout() {
        TransportError::Timeout(text)
    } else if e.is_permanent() && (text.contains("535") || text.contains("auth")) {
        TransportError::Auth(text)
    } else if e.is_permanent() || e.is_transient() {
        TransportError::Rejected(text)
    } else {
        TransportError::Connect(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, html: Option<&str>) -> OutgoingMessage {
        OutgoingMessage {
            from: "Sales <sales@example.com>".to_string(),
            to: "jane@example.org".to_string(),
            subject: "Hello".to_string(),
            text_body: text.map(str::to_string),
            html_body: html.map(str::to_string),
        }
    }

    #[test]
    fn test_build_multipart_message() {
        let email = build_message(&message(Some("plain"), Some("<p>html</p>"))).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("From: Sales <sales@example.com>"));
        assert!(raw.contains("Message-ID: <"));
    }

    #[test]
    fn test_build_html_only_message() {
        let email = build_message(&message(None, Some("<p>hi</p>"))).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_build_rejects_missing_body() {
        let err = build_message(&message(None, None)).unwrap_err();
        assert!(matches!(err, TransportError::Message(_)));
    }

    #[test]
    fn test_build_rejects_bad_recipient() {
        let mut msg = message(Some("plain"), None);
        msg.to = "not an address".to_string();
        assert!(matches!(
            build_message(&msg),
            Err(TransportError::Message(_))
        ));
    }
}
