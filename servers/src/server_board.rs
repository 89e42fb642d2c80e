use anyhow::{Context, Result, bail};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod board_logic;
use board_logic::{admin, config, logger};

use lib_board::connections::ConnectionManager;
use lib_board::connections::db_postgres::{PostgresDriver, mask_url_password};
use lib_board::core::{Registry, ShutdownReason};
use lib_board::server;

/// How long open requests get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    let _log_guard =
        logger::setup_logging(&settings.log_dir, &settings.log_level, settings.log_retention)?;
    let pid_file = match &settings.pid_file {
        Some(path) => Some(admin::PidFile::write(path)?),
        None => None,
    };

    let catalog = board_logic::statement_catalog().context("invalid statement catalog")?;
    info!(
        "Using store {} ({} statements)",
        mask_url_password(&settings.database_url),
        catalog.len()
    );
    let driver = PostgresDriver::new(&settings.database_url).context("invalid database url")?;
    let store = ConnectionManager::new(Arc::new(driver), catalog, settings.store_timings());
    store.set_on_connect(|| info!("Backing store connected"));

    let registry = Registry::new(settings.board_settings(), Arc::clone(&store));
    let dispatcher = board_logic::build_dispatcher(
        Arc::clone(&registry),
        settings.resource_dir.clone(),
    )
    .context("handler registration failed")?;

    store.request_connect().await;
    let keepalive = store.spawn_keepalive(settings.keepalive_interval, registry.shutdown_token());
    let signals = admin::spawn_signal_listener(Arc::clone(&registry));

    let address = settings.listen_address()?;
    let app = server::router(Arc::new(dispatcher))
        .into_make_service_with_connect_info::<SocketAddr>();
    let shutdown = registry.shutdown_token();

    match settings.tls_paths() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .with_context(|| format!("failed to load TLS material {}", cert.display()))?;
            let handle = axum_server::Handle::new();
            let drain = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
            });
            info!("Listening on https://{}", address);
            axum_server::bind_rustls(address, tls)
                .handle(handle)
                .serve(app)
                .await
                .context("server error")?;
        }
        None => {
            if settings.tls_cert.is_some() {
                warn!("TLS certificate or key missing on disk, serving plain HTTP");
            }
            let listener = tokio::net::TcpListener::bind(address)
                .await
                .with_context(|| format!("failed to bind {}", address))?;
            info!("Listening on http://{}", address);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .context("server error")?;
        }
    }

    let closed = registry.close_all_connections();
    info!("Closed {} client connections", closed);
    store.request_shutdown().await;
    let _ = tokio::join!(keepalive, signals);
    drop(pid_file);

    match registry.shutdown_reason() {
        Some(ShutdownReason::Fatal(reason)) => bail!("terminated: {}", reason),
        _ => {
            info!("Shutdown complete.");
            Ok(())
        }
    }
}
