//! Observability sink for batch and delivery events.
//!
//! Sinks are append-only and best-effort: `record` has no error path, so a
//! failing sink can never break aggregation or delivery.

use crate::batch::JobId;
use crate::notification::NotificationId;
use log::{info, warn};
use std::fmt;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BatchCompleted,
    BatchFailed,
    LookupFailed,
    DeliveryRetried,
    NotificationSent,
    NotificationFailed,
    /// A notification was still queued or in flight when the mailer stopped.
    ShutdownPending,
}

impl EventKind {
    /// Terminal delivery outcomes; each notification gets at most one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::NotificationSent | EventKind::NotificationFailed)
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::BatchFailed
                | EventKind::LookupFailed
                | EventKind::DeliveryRetried
                | EventKind::NotificationFailed
                | EventKind::ShutdownPending
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BatchCompleted => "batch_completed",
            EventKind::BatchFailed => "batch_failed",
            EventKind::LookupFailed => "lookup_failed",
            EventKind::DeliveryRetried => "delivery_retried",
            EventKind::NotificationSent => "notification_sent",
            EventKind::NotificationFailed => "notification_failed",
            EventKind::ShutdownPending => "shutdown_pending",
        }
    }
}

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSubject {
    Job(JobId),
    Notification(NotificationId),
}

impl fmt::Display for EventSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSubject::Job(id) => write!(f, "job:{}", id),
            EventSubject::Notification(id) => write!(f, "notification:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub subject: EventSubject,
    pub detail: String,
}

impl Event {
    pub fn job(kind: EventKind, job_id: JobId, detail: impl Into<String>) -> Self {
        Event {
            kind,
            subject: EventSubject::Job(job_id),
            detail: detail.into(),
        }
    }

    pub fn notification(kind: EventKind, id: NotificationId, detail: impl Into<String>) -> Self {
        Event {
            kind,
            subject: EventSubject::Notification(id),
            detail: detail.into(),
        }
    }
}

/// Receives events from the aggregator and the mailer.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Writes every event as a single `log` line under the `bms::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: Event) {
        if event.kind.is_failure() {
            warn!(
                target: "bms::events",
                "kind={} subject={} detail={}",
                event.kind.as_str(),
                event.subject,
                event.detail
            );
        } else {
            info!(
                target: "bms::events",
                "kind={} subject={} detail={}",
                event.kind.as_str(),
                event.subject,
                event.detail
            );
        }
    }
}

/// Keeps events in memory, mostly for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    /// Events whose subject is `subject`, in recording order.
    pub fn for_subject(&self, subject: EventSubject) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.subject == subject)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_kind_and_subject() {
        let sink = MemorySink::new();
        let job = JobId::new();
        let other = JobId::new();

        sink.record(Event::job(EventKind::LookupFailed, job, "A2 unavailable"));
        sink.record(Event::job(EventKind::BatchCompleted, job, "total=1"));
        sink.record(Event::job(EventKind::BatchCompleted, other, "total=2"));

        assert_eq!(sink.count(EventKind::BatchCompleted), 2);
        let for_job = sink.for_subject(EventSubject::Job(job));
        assert_eq!(for_job.len(), 2);
        assert_eq!(for_job[0].kind, EventKind::LookupFailed);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::NotificationSent.is_terminal());
        assert!(EventKind::NotificationFailed.is_terminal());
        assert!(!EventKind::DeliveryRetried.is_terminal());
        assert!(!EventKind::ShutdownPending.is_terminal());
    }

    #[test]
    fn test_log_sink_accepts_events() {
        LogSink.record(Event::notification(
            EventKind::NotificationSent,
            NotificationId::new(),
            "to=a@x.com",
        ));
    }
}
