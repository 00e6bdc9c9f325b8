mod batch;
mod config;
mod configuration;
mod error;
mod filesystem;
mod journal;
mod models;
mod pdf;
mod routes;
mod state;
mod store;
mod tasks;
mod watcher;

use std::env;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use configuration::ConfigurationHandle;
use filesystem::TargetDirectory;
use state::AppState;
use store::DocumentStore;

const DEFAULT_CONFIG_FILE: &str = "pdfdesk.toml";

#[tokio::main]
async fn main() {
    /* initialize tracing */
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdfdesk=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(message) = run().await {
        tracing::error!("{}", message);
        process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    /* load config */
    let config_filename = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let settings = config::load_config(&config_filename).map_err(|e| e.to_string())?;
    tracing::info!(
        "starting {} (pdfdesk v{})",
        settings.agent.name,
        env!("CARGO_PKG_VERSION")
    );

    settings.verify_directories().map_err(|e| e.to_string())?;

    /* finish whatever a previous run left half done */
    let store = DocumentStore::new(&settings).map_err(|e| e.to_string())?;
    match store.journal().recover() {
        Ok(0) => {}
        Ok(recovered) => tracing::warn!("recovered {} interrupted operations", recovered),
        Err(e) => return Err(format!("journal recovery failed: {}", e)),
    }

    let configuration = ConfigurationHandle::load_or_create(&settings.configuration_file())
        .map_err(|e| e.to_string())?;

    /* inbox watcher */
    let (events, _) = broadcast::channel(16);
    let (stop_watcher, shutdown) = watch::channel(false);
    let watcher = tokio::spawn(watcher::watch_directory(
        settings.root(TargetDirectory::Inbox).to_path_buf(),
        Duration::from_millis(settings.watcher.interval_ms.max(100)),
        events.clone(),
        shutdown.clone(),
    ));
    let configuration_log = tokio::spawn(configuration::log_changes(
        configuration.subscribe(),
        shutdown,
    ));

    /* bind to the port and listen */
    let addr = format!("{}:{}", settings.agent.host, settings.agent.port);
    let app = routes::router(AppState::new(settings, store, configuration, events));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("could not bind {}: {}", addr, e))?;
    tracing::info!("listening on {}", &addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = stop_watcher.send(true);
    if let Err(e) = watcher.await {
        tracing::warn!("watcher task ended abnormally: {}", e);
    }
    match configuration_log.await {
        Ok(changes) => tracing::debug!("{} configuration changes this run", changes),
        Err(e) => tracing::warn!("configuration log task ended abnormally: {}", e),
    }

    served.map_err(|e| format!("server error: {}", e))?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
