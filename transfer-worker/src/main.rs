use anyhow::Context;
use event_bus::EventPublisher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use transfer_worker::{
    run_consumer, OutcomeAuditHandler, Reaper, TransferInitiatedHandler, WorkerConfig,
};
use wallet_ledger::Ledger;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("Transfer worker starting...");

    let config = match std::env::var("WORKER_CONFIG") {
        Ok(path) => WorkerConfig::from_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => WorkerConfig::from_env().context("loading config from environment")?,
    };

    info!(
        exchange = %config.bus.exchange,
        transfer_queue = %config.transfer_queue,
        audit_queue = %config.audit_queue,
        prefetch = config.prefetch,
        "Configuration loaded"
    );

    let ledger = Ledger::open(config.ledger.clone())
        .await
        .context("opening ledger")?;
    let publisher = Arc::new(
        EventPublisher::connect(&config.bus)
            .await
            .context("connecting publisher")?,
    );

    let cancel = CancellationToken::new();

    let transfer_handler = Arc::new(TransferInitiatedHandler::new(
        ledger.clone(),
        Arc::clone(&publisher),
        cancel.clone(),
        config.requeue_delay(),
    ));
    let audit_handler = Arc::new(OutcomeAuditHandler::new(
        ledger.clone(),
        config.requeue_delay(),
    ));

    let transfers = tokio::spawn(run_consumer(
        config.bus.clone(),
        config.transfer_binding()?,
        transfer_handler,
        config.reconnect.clone(),
        cancel.clone(),
    ));
    let audit = tokio::spawn(run_consumer(
        config.bus.clone(),
        config.audit_binding()?,
        audit_handler,
        config.reconnect.clone(),
        cancel.clone(),
    ));
    let reaper = {
        let reaper = Reaper::new(ledger.clone(), Arc::clone(&publisher), config.outbox_grace());
        let cancel = cancel.clone();
        let period = config.reaper_interval();
        tokio::spawn(async move { reaper.run(cancel, period).await })
    };

    info!("Transfer worker running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested, draining");
    cancel.cancel();

    for (name, task) in [("transfers", transfers), ("audit", audit)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(consumer = name, error = %e, "Consumer exited with error"),
            Err(e) => error!(consumer = name, error = %e, "Consumer task panicked"),
        }
    }
    if let Err(e) = reaper.await {
        error!(error = %e, "Reaper task panicked");
    }

    match Arc::try_unwrap(publisher) {
        Ok(publisher) => publisher.close().await.context("closing publisher")?,
        Err(_) => error!("Publisher still shared at shutdown, skipping flush"),
    }
    ledger.close().await;

    info!("Transfer worker stopped");
    Ok(())
}
