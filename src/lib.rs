//! # BMS Batch
//!
//! Concurrent balance aggregation over account snapshots, with a background
//! mailer that delivers notifications about the results.
//!
//! ## Design Principles
//!
//! - **Two interchangeable strategies**: threaded and cooperative aggregation
//!   share one partition and one combination routine, so they agree exactly
//! - **Fixed-point arithmetic**: balances are 4-place decimals via `rust_decimal`
//! - **Partial failure is local**: a failed account lookup is recorded as
//!   absent; only a batch where every lookup fails is an error
//! - **Non-blocking notification**: callers only enqueue; delivery, retries,
//!   and shutdown draining happen in the mailer task
//!
//! ## Example
//!
//! ```
//! use bms_batch::{aggregate, AccountRecord, Decimal4, Strategy};
//!
//! let accounts = vec![
//!     AccountRecord::new("A1", "Alice", Decimal4::from_units(100)),
//!     AccountRecord::new("A2", "Bob", Decimal4::from_units(250)),
//!     AccountRecord::new("A3", "Carol", Decimal4::from_units(-30)),
//! ];
//! let result = aggregate(&accounts, Strategy::Threaded, 2).unwrap();
//! assert_eq!(result.total, Decimal4::from_units(320));
//! assert_eq!(result.count, 3);
//! ```

pub mod account;
pub mod aggregator;
pub mod batch;
pub mod config;
pub mod decimal;
pub mod error;
pub mod events;
pub mod mailer;
pub mod notification;
pub mod queue;
pub mod smtp;
pub mod source;
pub mod transport;

pub use account::{AccountId, AccountRecord};
pub use aggregator::{aggregate, Aggregator};
pub use batch::{AccountBalance, BatchJob, BatchResult, JobId, Strategy};
pub use config::{BatchConfig, Config, MailerConfig, SmtpConfig};
pub use decimal::Decimal4;
pub use error::{AggregationError, ConfigError, Error, LookupError, QueueError, Result};
pub use events::{Event, EventKind, EventSink, EventSubject, LogSink, MemorySink};
pub use mailer::{MailSubsystem, Mailer, RetryPolicy, ShutdownReport};
pub use notification::{DeliveryOutcome, DeliveryStatus, Notification, NotificationId};
pub use queue::{notification_queue, Dequeued, NotificationConsumer, NotificationProducer};
pub use smtp::SmtpTransport;
pub use source::{AccountSource, InMemorySource};
pub use transport::{DeliveryError, LogTransport, Transport};
