use anyhow::{anyhow, Context};
use log_processor_service::{
    config::Config,
    health,
    logging::{self, LogFormat},
    services::ProcessingSupervisor,
    AppContext,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            logging::init_tracing(LogFormat::Text);
            error!(error = %e, "Invalid configuration");
            return Err(e).context("failed to load configuration");
        }
    };
    logging::init_tracing(config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting log processor");
    info!(config = ?config, "Configuration loaded");

    let ctx = AppContext::connect(&config)
        .await
        .context("failed to initialize log processor")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_port = config.health_port;
    let mut health_server = tokio::spawn(async move { health::serve(health_port).await });

    let mut supervisor = ProcessingSupervisor::new(ctx, config.supervisor.clone());
    let mut worker = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let exit = tokio::select! {
        result = &mut worker => {
            // The worker only returns on its own after a startup failure
            health_server.abort();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Processing supervisor stopped");
                    Err(e).context("processing supervisor failed")
                }
                Err(e) => Err(e).context("processing task panicked"),
            };
        }
        result = &mut health_server => {
            let err = match result {
                Ok(Ok(())) => anyhow!("health server exited"),
                Ok(Err(e)) => anyhow::Error::new(e).context("health server failed"),
                Err(e) => anyhow::Error::new(e).context("health server task failed"),
            };
            error!(error = %err, "Health server stopped; shutting down");
            Err(err)
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    // The in-flight event finishes; anything not yet attempted stays pending
    let _ = shutdown_tx.send(true);
    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Processing supervisor stopped with error"),
        Err(e) => error!(error = %e, "Processing task failed"),
    }
    health_server.abort();

    info!("Log processor stopped");
    exit
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
