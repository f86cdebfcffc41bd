//! BMS batch CLI
//!
//! Aggregates the balances of every account in a CSV snapshot and writes the
//! per-account balances and the total as CSV.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- accounts.csv [threaded|cooperative] > balances.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `BMS_*`: see `bms_batch::config`; with `BMS_NOTIFY_TO` set, a summary
//!   notification is mailed before exit, through `BMS_SMTP_HOST` when set
//!   and to the log otherwise

use bms_batch::{
    Aggregator, Config, Error, InMemorySource, LogSink, LogTransport, MailSubsystem, Notification,
    Result, SmtpTransport, Strategy, Transport,
};
use log::{info, warn};
use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(Error::MissingArgument);
    }

    let config = Config::from_env()?;
    let strategy = match args.get(2) {
        Some(raw) => raw.parse::<Strategy>()?,
        None => config.batch.strategy,
    };

    let file = File::open(&args[1])?;
    let source = InMemorySource::from_csv(BufReader::new(file))?;
    let account_ids = source.ids().to_vec();
    info!("Loaded {} accounts from {}", account_ids.len(), args[1]);

    let aggregator = Aggregator::from_config(Arc::new(source), &config.batch);
    let result = aggregator.submit_batch_async(account_ids, strategy).await?;

    let stdout = io::stdout();
    let handle = stdout.lock();
    result.write_csv(handle)?;

    if let Some(recipient) = &config.mailer.notify_to {
        let transport: Arc<dyn Transport> = match &config.mailer.smtp {
            Some(smtp) => match SmtpTransport::new(smtp, &config.mailer.from_address) {
                Ok(transport) => Arc::new(transport),
                Err(e) => {
                    warn!("SMTP unavailable ({}); logging mail instead", e);
                    Arc::new(LogTransport::new(config.mailer.from_address.clone()))
                }
            },
            None => Arc::new(LogTransport::new(config.mailer.from_address.clone())),
        };
        let mail = MailSubsystem::start(&config.mailer, transport, Arc::new(LogSink));

        if let Err(e) = mail
            .enqueue(Notification::batch_summary(&result, recipient.as_str()))
            .await
        {
            warn!("Batch summary not queued: {}", e);
        }

        let report = mail.stop(config.mailer.drain_deadline).await;
        info!(
            "Mail summary: {} sent, {} failed, {} pending",
            report.sent,
            report.failed,
            report.pending.len()
        );
    }

    Ok(())
}
