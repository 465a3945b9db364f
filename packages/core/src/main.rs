use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use clinical_edge::cli::Cli;
use clinical_edge::config::Config;
use clinical_edge::logging::init_logging;
use clinical_edge::registry::DirectoryModelSource;
use clinical_edge::repository::RecordRepository;
use clinical_edge::scheduler::PassthroughExecutor;
use clinical_edge::sync::{HttpRemoteEndpoint, RemoteEndpoint};
use clinical_edge::{api, db, EdgeEngine, EngineError};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), EngineError> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    config.apply_cli(&cli)?;

    tracing::info!(
        database_url = %config.database_url,
        remote = config.remote_sync_url.as_deref().unwrap_or("none"),
        workers = config.workers,
        "Service starting"
    );

    let pool = db::create_pool(&config.database_url)
        .await
        .map_err(|err| EngineError::StorageUnavailable(err.into()))?;
    let store = Arc::new(RecordRepository::new(pool));

    let remote: Option<Arc<dyn RemoteEndpoint>> = match &config.remote_sync_url {
        Some(url) => Some(Arc::new(HttpRemoteEndpoint::new(url.clone(), config.remote_timeout)?)),
        None => {
            tracing::warn!("REMOTE_SYNC_URL not set, running offline-only");
            None
        }
    };

    let engine = EdgeEngine::init(
        store,
        remote,
        Arc::new(DirectoryModelSource::new(config.model_dir.clone())),
        Arc::new(PassthroughExecutor),
        config.engine_config().await?,
    )
    .await?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|err| EngineError::config(format!("cannot bind {}: {err}", config.listen_addr)))?;
    tracing::info!("Listening on {}", config.listen_addr);

    let served = axum::serve(listener, api::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.shutdown().await;
    served.map_err(|err| EngineError::config(format!("server error: {err}")))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
