use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use visitd::auth::Credentials;
use visitd::config::Config;
use visitd::engine::Engine;
use visitd::limits::{COMPACTION_CHECK_INTERVAL, SHUTDOWN_DRAIN_TIMEOUT};
use visitd::observability;
use visitd::{reaper, tls, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls_acceptor = tls::load_tls_acceptor(&config)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(
        Engine::new(config.wal_path(), config.calendar()?)?.complete_confirmed_on_sweep(config.complete_confirmed),
    );

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(reaper::run_sweeper(
        engine.clone(),
        config.sweep_interval,
        cancel.clone(),
    ));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACTION_CHECK_INTERVAL,
        cancel.clone(),
    ));

    let credentials = Credentials::from_config(&config);
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("visitd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  slots: {}", config.slots.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(","));
    info!("  utc_offset_minutes: {}", config.utc_offset_minutes);
    info!("  sweep_interval: {}s", config.sweep_interval.as_secs());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot listen for SIGTERM ({e}); ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let credentials = credentials.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, credentials, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = tokio::join!(sweeper, compactor);

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(SHUTDOWN_DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("visitd stopped");
    Ok(())
}
