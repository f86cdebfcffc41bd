//! Notification messages and their delivery outcomes.

use crate::account::AccountRecord;
use crate::batch::BatchResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    pub fn new() -> Self {
        NotificationId(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An email waiting to be delivered by the background mailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Number of send attempts made so far.
    pub attempt_count: u32,
    /// Files sent alongside the body. Transports that cannot attach files
    /// ignore them.
    pub attachments: Vec<PathBuf>,
}

impl Notification {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Notification {
            id: NotificationId::new(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
            attempt_count: 0,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    /// "Account created" message for a newly opened account.
    pub fn account_created(account: &AccountRecord, recipient: impl Into<String>) -> Self {
        Notification::new(
            recipient,
            format!("Account created: {}", account.id),
            format!(
                "Account {} ({}) created with balance {}",
                account.owner_name, account.id, account.balance
            ),
        )
    }

    /// Summary of a finished batch job.
    pub fn batch_summary(result: &BatchResult, recipient: impl Into<String>) -> Self {
        let mut body = format!(
            "Batch {} ({}) computed at {}\nAccounts: {}\nTotal balance: {}\n",
            result.job_id,
            result.strategy,
            result.computed_at.to_rfc3339(),
            result.count,
            result.total
        );
        if !result.failed.is_empty() {
            let failed: Vec<&str> = result.failed.iter().map(|id| id.as_str()).collect();
            body.push_str(&format!("Unavailable accounts: {}\n", failed.join(", ")));
        }

        Notification::new(
            recipient,
            format!("Balance batch completed: {} accounts", result.count),
            body,
        )
    }
}

/// State a delivery ended in (or is passing through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeliveryStatus {
    Sent,
    /// Transitional: an attempt failed and a retry is scheduled. Reported in
    /// `DeliveryRetried` events, never as the status of a finished delivery.
    FailedRetryable,
    FailedPermanent,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::FailedRetryable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::FailedRetryable => "failed_retryable",
            DeliveryStatus::FailedPermanent => "failed_permanent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub notification: Notification,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}
