use configuration::Settings;
use exchange_server::Exchange;
use std::error::Error;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stdout)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let settings = Settings::load().expect("Failed to load configuration");
    let exchange = Arc::new(Exchange::from_settings(settings).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = exchange.run(shutdown_rx);
    info!("Press Ctrl+C to shut down.");

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down.");
    shutdown_tx.send(true)?;

    for task in handles.pool_tasks {
        task.await?;
    }
    handles.ticker_task.await?;
    for task in handles.settlement_tasks {
        if let Err(e) = task.await? {
            // Accounting invariant violations are not recoverable in-process.
            error!("settlement failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
