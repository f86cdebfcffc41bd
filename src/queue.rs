//! Bounded FIFO queue between notification producers and the mailer.
//!
//! Producers hold cloneable [`NotificationProducer`] handles; the single
//! mailer task owns the [`NotificationConsumer`]. Notifications come out in
//! the order they went in.

use crate::error::QueueError;
use crate::notification::Notification;
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Creates a queue holding at most `capacity` notifications (minimum 1).
///
/// `enqueue_timeout` bounds how long [`NotificationProducer::enqueue`] waits
/// for space; zero fails immediately when the queue is full.
pub fn notification_queue(
    capacity: usize,
    enqueue_timeout: Duration,
) -> (NotificationProducer, NotificationConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        NotificationProducer {
            tx,
            capacity,
            enqueue_timeout,
        },
        NotificationConsumer { rx },
    )
}

#[derive(Debug, Clone)]
pub struct NotificationProducer {
    tx: mpsc::Sender<Notification>,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl NotificationProducer {
    /// Enqueues, waiting up to the configured timeout while the queue is full.
    pub async fn enqueue(&self, notification: Notification) -> Result<(), QueueError> {
        if self.enqueue_timeout.is_zero() {
            return self.try_enqueue(notification);
        }

        let id = notification.id;
        match self.tx.send_timeout(notification, self.enqueue_timeout).await {
            Ok(()) => {
                debug!("Enqueued notification {}", id);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(QueueError::Full {
                capacity: self.capacity,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Enqueues without waiting.
    pub fn try_enqueue(&self, notification: Notification) -> Result<(), QueueError> {
        let id = notification.id;
        match self.tx.try_send(notification) {
            Ok(()) => {
                debug!("Enqueued notification {}", id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(QueueError::Full {
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Notifications currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of waiting on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    Item(Notification),
    /// The queue is closed and empty; nothing more will arrive.
    Closed,
}

#[derive(Debug)]
pub struct NotificationConsumer {
    rx: mpsc::Receiver<Notification>,
}

impl NotificationConsumer {
    /// Waits for the next notification.
    pub async fn dequeue(&mut self) -> Dequeued {
        match self.rx.recv().await {
            Some(notification) => Dequeued::Item(notification),
            None => Dequeued::Closed,
        }
    }

    /// Stops accepting new notifications. Already queued items can still be
    /// dequeued.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Removes everything currently queued without waiting.
    pub fn take_remaining(&mut self) -> Vec<Notification> {
        let mut remaining = Vec::new();
        while let Ok(notification) = self.rx.try_recv() {
            remaining.push(notification);
        }
        remaining
    }
}
