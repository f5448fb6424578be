use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info, warn};

use movie_relay::api::{ApiServer, AppState};
use movie_relay::catalog::DeliveredStore;
use movie_relay::config::AppConfig;
use movie_relay::database::Database;
use movie_relay::external::{
    FfmpegTranscoder, HttpDeliveryChannel, HttpExtractor, HttpMirrorSource, MirrorSource,
};
use movie_relay::ledger::{AccountLedger, load_account_specs};
use movie_relay::pipeline::{Collaborators, PipelineManager};
use movie_relay::resolver::MirrorResolver;
use movie_relay::{logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default().context("invalid configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("failed to initialize logging")?;
    panic_hook::install(&config.log_dir);
    let retention_token = tokio_util::sync::CancellationToken::new();
    logging_config.start_retention_cleanup(retention_token.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting movie-relay");

    let db = Database::open(&config.database_url)
        .await
        .context("failed to open database")?;
    let catalog: Arc<dyn DeliveredStore> = Arc::new(db.delivered());
    let ledger = Arc::new(AccountLedger::new(
        Arc::new(db.accounts()),
        config.ledger.clone(),
    ));
    let specs = load_account_specs(
        config.ledger.accounts_path.as_deref(),
        config.session_name.clone(),
    )?;
    ledger.provision(&specs).await?;
    info!(accounts = specs.len(), "Delivery accounts provisioned");

    let sources: Vec<Arc<dyn MirrorSource>> = config
        .sources
        .mirrors
        .iter()
        .cloned()
        .map(|c| Arc::new(HttpMirrorSource::new(c)) as Arc<dyn MirrorSource>)
        .collect();
    let collaborators = Collaborators {
        resolver: Arc::new(MirrorResolver::new(sources, &config.sources.resolver)),
        extractor: Arc::new(HttpExtractor::new(config.sources.extractor.clone())),
        transcoder: Arc::new(FfmpegTranscoder::new(config.sources.ffmpeg.clone())),
        delivery: Arc::new(HttpDeliveryChannel::new(config.sources.delivery.clone())),
        ledger,
        catalog,
    };

    let pipeline = Arc::new(PipelineManager::new(config.pipeline.clone(), collaborators));
    pipeline.start();

    let state = AppState::new(pipeline.clone())
        .with_logging_config(logging_config.clone())
        .with_download_secret(config.api.download_secret.clone());
    let server = Arc::new(ApiServer::new(config.api.clone(), state));

    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "API server failed");
            }
        })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }

    server.shutdown();
    if let Err(e) = server_task.await {
        warn!(error = %e, "API server task ended abnormally");
    }
    pipeline.stop().await;
    retention_token.cancel();
    db.close().await;

    info!("movie-relay stopped");
    Ok(())
}
