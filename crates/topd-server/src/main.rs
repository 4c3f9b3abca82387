use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use topd_server::bot_detection::BotList;
use topd_server::config::{Config, StorageKind};
use topd_server::keeper::ControlEvent;
use topd_server::state::AppState;
use topd_storage::{MemoryBackend, PersistenceBackend};

/// `topd health`: liveness probe for container health checks.
///
/// Calls `GET http://localhost:$TOPD_PORT/health`.
/// Exits 0 if the server responds with HTTP 200, exits 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("TOPD_PORT").unwrap_or_else(|_| "8081".to_string());
    let url = format!("http://localhost:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

async fn open_backend(cfg: &Config) -> Result<Arc<dyn PersistenceBackend>> {
    match cfg.storage {
        StorageKind::DuckDb => {
            std::fs::create_dir_all(&cfg.data_dir)
                .with_context(|| format!("on create data dir {}", cfg.data_dir))?;
            let db_path = format!("{}/topd.db", cfg.data_dir);
            let db =
                topd_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit, cfg.timezone)?;

            // Safe on every startup: the seed is an upsert that keeps counters.
            if let Err(e) = db.seed_site(1, 1, true).await {
                warn!(error = %e, "Failed to seed default site");
            }
            info!(path = %db_path, "DuckDB storage ready");
            Ok(Arc::new(db))
        }
        StorageKind::Memory => {
            warn!("In-memory storage: counters and history are lost on exit");
            Ok(Arc::new(MemoryBackend::seeded()))
        }
    }
}

/// Translate process signals into keeper control events.
///
/// SIGHUP starts a new counting period; Ctrl+C and SIGTERM request the final
/// flush. The task ends once a terminate has been forwarded.
fn spawn_signal_forwarder(control: mpsc::Sender<ControlEvent>) -> Result<()> {
    #[cfg(unix)]
    let (mut hangup, mut terminate) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::hangup()).context("on install SIGHUP handler")?,
            signal(SignalKind::terminate()).context("on install SIGTERM handler")?,
        )
    };

    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c() => ControlEvent::Terminate,
                _ = terminate.recv() => ControlEvent::Terminate,
                _ = hangup.recv() => ControlEvent::Reload,
            };
            #[cfg(not(unix))]
            let event = match tokio::signal::ctrl_c().await {
                Ok(()) => ControlEvent::Terminate,
                Err(e) => {
                    warn!(error = %e, "Ctrl+C handler failed");
                    return;
                }
            };

            info!(?event, "Signal received");
            if control.send(event).await.is_err() || event == ControlEvent::Terminate {
                return;
            }
        }
    });
    Ok(())
}

#[cfg(unix)]
async fn serve_unix(
    socket: &str,
    app: axum::Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if std::path::Path::new(socket).exists() {
        std::fs::remove_file(socket).with_context(|| format!("on remove stale socket {socket}"))?;
    }
    let listener = tokio::net::UnixListener::bind(socket)
        .with_context(|| format!("on bind unix socket {socket}"))?;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o777))?;
    info!(socket = %socket, "topd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    std::fs::remove_file(socket).ok();
    Ok(())
}

async fn serve(cfg: &Config, app: axum::Router, done: oneshot::Receiver<()>) -> Result<()> {
    let shutdown = async move {
        // An error means the keeper stopped without a terminate; shut down anyway.
        done.await.ok();
        info!("Draining connections");
    };

    #[cfg(unix)]
    if let Some(socket) = &cfg.socket {
        return serve_unix(socket, app, shutdown).await;
    }

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("on bind {addr}"))?;
    info!(port = cfg.port, "topd listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check();
    }
    // Structured JSON logging. Level controlled via RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("topd=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let backend = open_backend(&cfg).await?;
    let bots = BotList::from_file(&cfg.bots_path)?;

    let state = Arc::new(AppState::new(backend, cfg.clone(), bots));
    let cancel = CancellationToken::new();
    let consumer = state.start(cancel.clone()).await?;

    let (control_tx, control_rx) = mpsc::channel(8);
    spawn_signal_forwarder(control_tx)?;

    let (done_tx, done_rx) = oneshot::channel();
    let keeper = tokio::spawn(state.keeper().run(cancel.clone(), control_rx, done_tx));

    let app = topd_server::app::build_app(Arc::clone(&state));
    let served = serve(&cfg, app, done_rx).await;

    // Stop the consumer, then persist whatever it drained after the keeper's
    // terminate flush.
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .is_err()
    {
        warn!("History consumer did not stop in time");
    }
    keeper.await.ok();
    state.keeper().flush().await;
    info!("topd stopped");

    served
}
