use anyhow::Context;
use marquee_core::SystemClock;
use marquee_notify::MailtrapMailer;
use marquee_store::app_config::Config;
use marquee_store::{DbClient, KafkaMailQueue};
use marquee_worker::{init_tracing, mail_pipeline, Backends, Services};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load().context("Failed to load config")?;
    info!("Starting Marquee worker");

    // Postgres
    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Kafka
    let queue = Arc::new(KafkaMailQueue::new(&config.kafka).context("Failed to create Kafka mail queue")?);

    let backends = Backends::postgres(&db, queue, Arc::new(SystemClock));
    let services = Arc::new(Services::wire(&backends, &config)?);
    let mailer = Arc::new(MailtrapMailer::from_config(&config.mail).context("Failed to build mail client")?);
    let pipeline = mail_pipeline(&backends, mailer, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { pipeline.run(rx).await }
    });

    let reaper_task = if config.reaper.enabled {
        let services = services.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { services.reaper.run(rx).await }))
    } else {
        info!("Hold reaper disabled, expired holds are released lazily");
        None
    };

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown_tx.send(true).context("Workers already gone")?;

    if let Err(e) = pipeline_task.await {
        error!("Mail pipeline task failed: {}", e);
    }
    if let Some(task) = reaper_task {
        if let Err(e) = task.await {
            error!("Reaper task failed: {}", e);
        }
    }

    info!("Marquee worker stopped");
    Ok(())
}
