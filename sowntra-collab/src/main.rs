use log::{error, info};
use sowntra_collab::{ServerConfig, ServerError, SyncServer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting collaboration server on {} (save interval {:?})",
        config.bind_addr, config.save_interval
    );

    let server = Arc::new(SyncServer::new(config)?);
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let mut outcome = Ok(());
    tokio::select! {
        result = serving => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Server stopped: {e}");
                outcome = Err(e);
            }
            Err(e) => error!("Server task failed: {e}"),
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
        }
    }

    server.shutdown().await;
    let stats = server.stats().await;
    info!(
        "Served {} connections, wrote {} snapshots",
        stats.total_connections, stats.snapshots_written
    );
    outcome
}
