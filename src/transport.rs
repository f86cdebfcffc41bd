//! Mail transport seam used by the background mailer.

use crate::notification::Notification;
use async_trait::async_trait;
use log::info;
use thiserror::Error;

/// Failure reported by a transport for a single send attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Timeout or temporary unavailability; the send may succeed if retried.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Malformed recipient, rejected credentials, and the like.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Sends one message. Implementations must be safe to call from the mailer
/// task for the whole process lifetime.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DeliveryError>;

    /// Sends a whole notification. The default drops attachments and
    /// forwards to [`Transport::send`].
    async fn send_message(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.send(
            &notification.recipient,
            &notification.subject,
            &notification.body,
        )
        .await
    }
}

/// Development transport that writes messages to the log instead of a
/// mail server.
#[derive(Debug, Clone)]
pub struct LogTransport {
    from_address: String,
}

impl LogTransport {
    pub fn new(from_address: impl Into<String>) -> Self {
        LogTransport {
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        if !is_plausible_address(recipient) {
            return Err(DeliveryError::Permanent(format!(
                "malformed recipient {:?}",
                recipient
            )));
        }

        info!(
            target: "bms::mail",
            "from={} to={} subject={:?} bytes={}",
            self.from_address,
            recipient,
            subject,
            body.len()
        );
        Ok(())
    }
}

/// `local@domain` with both parts non-empty and no whitespace.
fn is_plausible_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !address.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
