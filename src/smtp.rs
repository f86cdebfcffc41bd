//! SMTP delivery through `lettre`.
//!
//! Replies and connection problems are mapped onto [`DeliveryError`] so the
//! mailer can decide whether to retry: 5xx replies and anything wrong with
//! the message itself are permanent, everything else (4xx replies, refused
//! or dropped connections, timeouts) is transient.

use crate::config::SmtpConfig;
use crate::notification::Notification;
use crate::transport::{DeliveryError, Transport};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{info, warn};
use std::path::Path;

/// Sends notifications to an SMTP relay, with STARTTLS and login when
/// configured. Attachments are read from disk at send time.
pub struct SmtpTransport {
    relay: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    endpoint: String,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, from_address: &str) -> Result<Self, DeliveryError> {
        let from: Mailbox = from_address.parse().map_err(|e| {
            DeliveryError::Permanent(format!("invalid sender {:?}: {}", from_address, e))
        })?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| DeliveryError::Permanent(format!("TLS setup failed: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
        };
        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if let Some(password) = &config.password {
            let username = config
                .username
                .clone()
                .unwrap_or_else(|| from.email.to_string());
            builder = builder.credentials(Credentials::new(username, password.clone()));
        }

        Ok(SmtpTransport {
            relay: builder.build(),
            from,
            endpoint: format!("{}:{}", config.host, config.port),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let message = build_message(&self.from, recipient, subject, body, Vec::new())?;
        self.dispatch(message, recipient).await
    }

    async fn send_message(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let attachments = read_attachments(&notification.attachments).await;
        let message = build_message(
            &self.from,
            &notification.recipient,
            &notification.subject,
            &notification.body,
            attachments,
        )?;
        self.dispatch(message, &notification.recipient).await
    }
}

impl SmtpTransport {
    async fn dispatch(&self, message: Message, recipient: &str) -> Result<(), DeliveryError> {
        match self.relay.send(message).await {
            Ok(_) => {
                info!(target: "bms::mail", "Email sent to {} via {}", recipient, self.endpoint);
                Ok(())
            }
            Err(e) => Err(classify(&e)),
        }
    }
}

fn classify(e: &lettre::transport::smtp::Error) -> DeliveryError {
    if e.is_permanent() || e.is_client() {
        DeliveryError::Permanent(e.to_string())
    } else {
        DeliveryError::Transient(e.to_string())
    }
}

/// Named file contents to attach to a message.
type AttachmentFile = (String, Vec<u8>);

/// Reads every attachment that can be read; unreadable files are logged and
/// left out so the body still goes through.
async fn read_attachments<P: AsRef<Path>>(paths: &[P]) -> Vec<AttachmentFile> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                warn!("Skipping attachment {}: not a file path", path.display());
                continue;
            }
        };
        match tokio::fs::read(path).await {
            Ok(contents) => files.push((name, contents)),
            Err(e) => warn!("Failed to attach file {}: {}", path.display(), e),
        }
    }
    files
}

fn build_message(
    from: &Mailbox,
    recipient: &str,
    subject: &str,
    body: &str,
    attachments: Vec<AttachmentFile>,
) -> Result<Message, DeliveryError> {
    let to: Mailbox = recipient
        .parse()
        .map_err(|e| DeliveryError::Permanent(format!("malformed recipient {:?}: {}", recipient, e)))?;
    let octet_stream = ContentType::parse("application/octet-stream")
        .map_err(|e| DeliveryError::Permanent(e.to_string()))?;

    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
    for (name, contents) in attachments {
        parts = parts.singlepart(Attachment::new(name).body(contents, octet_stream.clone()));
    }

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject)
        .multipart(parts)
        .map_err(|e| DeliveryError::Permanent(format!("could not build message: {}", e)))
}
