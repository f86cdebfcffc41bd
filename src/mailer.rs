//! Background mailer.
//!
//! [`MailSubsystem`] owns the notification queue and the task that drains it.
//! Each dequeued notification moves through
//! `PENDING -> SENDING -> {SENT | FAILED_RETRYABLE -> SENDING | FAILED_PERMANENT}`;
//! transient failures are retried with exponential backoff, and every
//! notification that reaches a terminal state produces exactly one terminal
//! event on the sink. Delivery errors never leave this module.
//!
//! Shutdown closes the queue, keeps delivering until the drain deadline, and
//! reports anything still queued or in flight instead of dropping it.

use crate::config::MailerConfig;
use crate::error::QueueError;
use crate::events::{Event, EventKind, EventSink};
use crate::notification::{DeliveryOutcome, DeliveryStatus, Notification, NotificationId};
use crate::queue::{notification_queue, Dequeued, NotificationConsumer, NotificationProducer};
use crate::transport::Transport;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Retry schedule for transient delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a notification gets at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// What happened to the notifications handled by one mailer run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sent: usize,
    pub failed: usize,
    /// Still queued or in flight when the drain deadline passed.
    pub pending: Vec<Notification>,
}

/// Delivers single notifications through a transport.
pub struct Mailer {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
}

impl Mailer {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>, policy: RetryPolicy) -> Self {
        Mailer {
            transport,
            sink,
            policy,
        }
    }

    /// Attempts delivery until the notification is sent or permanently failed.
    ///
    /// `attempt_count` is updated in place, so a caller that abandons the
    /// future still sees how many attempts were made. The returned outcome is
    /// always terminal; `FailedRetryable` only shows up in `DeliveryRetried`
    /// events.
    pub async fn deliver(&self, notification: &mut Notification) -> DeliveryOutcome {
        loop {
            notification.attempt_count += 1;
            debug!(
                "Sending notification {} to {} (attempt {})",
                notification.id, notification.recipient, notification.attempt_count
            );

            let attempt = self.transport.send_message(notification).await;

            match attempt {
                Ok(()) => return self.finish(notification, DeliveryStatus::Sent, None),
                Err(err)
                    if err.is_transient()
                        && notification.attempt_count <= self.policy.max_retries =>
                {
                    let delay = self.policy.delay_for(notification.attempt_count - 1);
                    self.sink.record(Event::notification(
                        EventKind::DeliveryRetried,
                        notification.id,
                        format!(
                            "status={} attempt={} retry_in_ms={} error={}",
                            DeliveryStatus::FailedRetryable.as_str(),
                            notification.attempt_count,
                            delay.as_millis(),
                            err
                        ),
                    ));
                    time::sleep(delay).await;
                }
                Err(err) => {
                    return self.finish(
                        notification,
                        DeliveryStatus::FailedPermanent,
                        Some(err.to_string()),
                    )
                }
            }
        }
    }

    fn finish(
        &self,
        notification: &Notification,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> DeliveryOutcome {
        let event = match &error {
            None => Event::notification(
                EventKind::NotificationSent,
                notification.id,
                format!(
                    "to={} attempts={}",
                    notification.recipient, notification.attempt_count
                ),
            ),
            Some(reason) => Event::notification(
                EventKind::NotificationFailed,
                notification.id,
                format!(
                    "to={} attempts={} error={}",
                    notification.recipient, notification.attempt_count, reason
                ),
            ),
        };
        self.sink.record(event);

        DeliveryOutcome {
            notification: notification.clone(),
            status,
            error,
        }
    }

    /// Drains `consumer` until shutdown is signalled or the queue closes.
    async fn run(
        self,
        mut consumer: NotificationConsumer,
        mut shutdown: oneshot::Receiver<Duration>,
    ) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        let deadline = loop {
            let mut notification = tokio::select! {
                signal = &mut shutdown => break drain_deadline(signal),
                next = consumer.dequeue() => match next {
                    Dequeued::Item(notification) => notification,
                    Dequeued::Closed => break Instant::now(),
                },
            };

            let step = {
                let delivery = self.deliver(&mut notification);
                tokio::pin!(delivery);

                tokio::select! {
                    outcome = &mut delivery => {
                        tally(&mut report, &outcome);
                        Step::Delivered
                    }
                    signal = &mut shutdown => {
                        consumer.close();
                        let deadline = drain_deadline(signal);
                        match time::timeout_at(deadline, delivery).await {
                            Ok(outcome) => {
                                tally(&mut report, &outcome);
                                Step::Stopped { deadline, unfinished: false }
                            }
                            Err(_) => Step::Stopped { deadline, unfinished: true },
                        }
                    }
                }
            };

            if let Step::Stopped { deadline, unfinished } = step {
                if unfinished {
                    report.pending.push(notification);
                }
                break deadline;
            }
        };

        consumer.close();

        if report.pending.is_empty() {
            while let Ok(Dequeued::Item(mut notification)) =
                time::timeout_at(deadline, consumer.dequeue()).await
            {
                let delivered = time::timeout_at(deadline, self.deliver(&mut notification)).await;
                match delivered {
                    Ok(outcome) => tally(&mut report, &outcome),
                    Err(_) => {
                        report.pending.push(notification);
                        break;
                    }
                }
            }
        }

        report.pending.extend(consumer.take_remaining());
        for notification in &report.pending {
            self.sink.record(Event::notification(
                EventKind::ShutdownPending,
                notification.id,
                format!(
                    "to={} subject={:?} attempts={}",
                    notification.recipient, notification.subject, notification.attempt_count
                ),
            ));
        }

        info!(
            "Mailer stopped: {} sent, {} failed, {} pending",
            report.sent,
            report.failed,
            report.pending.len()
        );
        report
    }
}

/// How the main loop left one delivery.
enum Step {
    Delivered,
    /// Shutdown arrived mid-delivery; `unfinished` if the deadline cut it off.
    Stopped { deadline: Instant, unfinished: bool },
}

fn tally(report: &mut ShutdownReport, outcome: &DeliveryOutcome) {
    match outcome.status {
        DeliveryStatus::Sent => report.sent += 1,
        DeliveryStatus::FailedPermanent => report.failed += 1,
        DeliveryStatus::FailedRetryable => {}
    }
}

/// A dropped shutdown sender means the subsystem went away without `stop`;
/// treat it as a shutdown with no drain time.
fn drain_deadline(signal: Result<Duration, oneshot::error::RecvError>) -> Instant {
    Instant::now() + signal.unwrap_or(Duration::ZERO)
}

/// The queue plus the background task that drains it.
///
/// Must be started from within a tokio runtime.
pub struct MailSubsystem {
    producer: NotificationProducer,
    shutdown: oneshot::Sender<Duration>,
    handle: JoinHandle<ShutdownReport>,
}

impl MailSubsystem {
    /// Creates the queue and spawns the mailer task.
    pub fn start(
        config: &MailerConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (producer, consumer) = notification_queue(config.queue_capacity, config.enqueue_timeout);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let mailer = Mailer::new(transport, sink, config.retry);

        info!(
            "Starting mailer (queue capacity {}, max retries {})",
            producer.capacity(),
            config.retry.max_retries
        );
        let handle = tokio::spawn(mailer.run(consumer, shutdown_rx));

        MailSubsystem {
            producer,
            shutdown,
            handle,
        }
    }

    /// Handle for components that only need to enqueue.
    pub fn producer(&self) -> NotificationProducer {
        self.producer.clone()
    }

    /// Queues a message for background delivery.
    pub async fn notify(
        &self,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<NotificationId, QueueError> {
        let notification = Notification::new(recipient, subject, body);
        let id = notification.id;
        self.producer.enqueue(notification).await?;
        Ok(id)
    }

    /// Queues an already built notification, waiting up to the enqueue timeout.
    pub async fn enqueue(&self, notification: Notification) -> Result<NotificationId, QueueError> {
        let id = notification.id;
        self.producer.enqueue(notification).await?;
        Ok(id)
    }

    /// Queues without waiting; fails with [`QueueError::Full`] at capacity.
    pub fn try_notify(
        &self,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<NotificationId, QueueError> {
        let notification = Notification::new(recipient, subject, body);
        let id = notification.id;
        self.producer.try_enqueue(notification)?;
        Ok(id)
    }

    /// Stops accepting notifications, drains for up to `drain_deadline`, and
    /// returns what was delivered and what was left pending.
    pub async fn stop(self, drain_deadline: Duration) -> ShutdownReport {
        info!("Stopping mailer (drain deadline {:?})", drain_deadline);
        if self.shutdown.send(drain_deadline).is_err() {
            debug!("Mailer task already finished before shutdown");
        }

        match self.handle.await {
            Ok(report) => {
                if !report.pending.is_empty() {
                    warn!(
                        "{} notifications were not delivered before shutdown",
                        report.pending.len()
                    );
                }
                report
            }
            Err(e) => {
                error!("Mailer task failed: {}", e);
                ShutdownReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_default_policy_retries_three_times() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }
}
