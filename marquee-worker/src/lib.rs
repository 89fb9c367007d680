use anyhow::{bail, Context};
use chrono::Duration;
use marquee_booking::{BookingCommitter, HoldManager, HoldReaper, ShowtimeLedger, TicketIssuer};
use marquee_core::{Clock, ContactValidator, LedgerStore, MailQueue, SeatInventory, TicketStore};
use marquee_notify::{MailPipeline, Mailer, PipelineConfig};
use marquee_store::app_config::Config;
use marquee_store::{DbClient, MemoryStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_HOLD_SECONDS: u64 = 24 * 60 * 60;

/// Storage, broker and time sources the services run on.
#[derive(Clone)]
pub struct Backends {
    pub seats: Arc<dyn SeatInventory>,
    pub ledger: Arc<dyn LedgerStore>,
    pub tickets: Arc<dyn TicketStore>,
    pub queue: Arc<dyn MailQueue>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    pub fn postgres(db: &DbClient, queue: Arc<dyn MailQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            seats: Arc::new(db.seat_inventory()),
            ledger: Arc::new(db.ledger_store()),
            tickets: Arc::new(db.ticket_store()),
            queue,
            clock,
        }
    }

    pub fn in_memory(store: &MemoryStore, queue: Arc<dyn MailQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            seats: Arc::new(store.clone()),
            ledger: Arc::new(store.clone()),
            tickets: Arc::new(store.clone()),
            queue,
            clock,
        }
    }
}

/// The booking operations, wired against one set of backends.
pub struct Services {
    pub ledger: ShowtimeLedger,
    pub holds: HoldManager,
    pub committer: BookingCommitter,
    pub tickets: TicketIssuer,
    pub reaper: HoldReaper,
}

impl Services {
    pub fn wire(backends: &Backends, config: &Config) -> anyhow::Result<Self> {
        let hold_seconds = config.booking.hold_seconds;
        if hold_seconds == 0 || hold_seconds > MAX_HOLD_SECONDS {
            bail!("booking.hold_seconds must be between 1 and {}, got {}", MAX_HOLD_SECONDS, hold_seconds);
        }
        let default_hold = Duration::seconds(i64::try_from(hold_seconds).context("hold_seconds out of range")?);

        Ok(Self {
            ledger: ShowtimeLedger::new(backends.seats.clone(), backends.ledger.clone()),
            holds: HoldManager::new(backends.ledger.clone(), backends.clock.clone(), default_hold),
            committer: BookingCommitter::new(backends.ledger.clone(), ContactValidator::default()),
            tickets: TicketIssuer::new(backends.tickets.clone(), backends.clock.clone())
                .with_confirmations(backends.queue.clone(), &config.kafka.mail_queue),
            reaper: HoldReaper::new(
                backends.ledger.clone(),
                backends.clock.clone(),
                std::time::Duration::from_secs(config.reaper.interval_seconds.max(1)),
            ),
        })
    }
}

pub fn mail_pipeline(backends: &Backends, mailer: Arc<dyn Mailer>, config: &Config) -> MailPipeline {
    MailPipeline::new(
        backends.queue.clone(),
        mailer,
        PipelineConfig::from_config(&config.kafka, &config.notifications),
    )
}

/// Installs the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "marquee_worker=debug,marquee_booking=debug,marquee_notify=debug,marquee_store=info".into()
    });

    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
