// Broker daemon entry point.
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use miniqueue_broker::Broker;
use miniqueue_store::SledStore;
use miniqueued::config::{Config, DEFAULT_DB_PATH};
use miniqueued::{http, observability, resp, tls};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    observability::init_logging(&config);
    let metrics = observability::init_metrics().context("install metrics recorder")?;

    if config.db == Path::new(DEFAULT_DB_PATH) {
        tracing::warn!("no db path specified, using default {DEFAULT_DB_PATH}");
    }

    let store = SledStore::open(&config.db)
        .with_context(|| format!("open store at {}", config.db.display()))?;
    let broker = Arc::new(Broker::new(Arc::new(store)));
    let cancel = CancellationToken::new();

    // Background sweeper returning due delayed messages to their queues.
    let sweeper = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        let period = config.period;
        tokio::spawn(async move { broker.process_delays(period, cancel).await })
    };

    let resp_addr = SocketAddr::from(([0, 0, 0, 0], config.resp_port));
    let resp_listener = TcpListener::bind(resp_addr)
        .await
        .with_context(|| format!("bind resp listener on {resp_addr}"))?;
    tracing::info!(addr = %resp_addr, "resp listener started");
    let resp_task = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { resp::serve(resp_listener, broker, cancel).await })
    };

    let state = http::AppState {
        broker: Arc::clone(&broker),
        metrics: Some(metrics),
    };
    let router = http::router(state);
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("bind http listener on {http_addr}"))?;
    tracing::info!(addr = %http_addr, "starting miniqueue");

    let http_task = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load_server_config(cert, key).context("load TLS config")?;
            let cancel = cancel.clone();
            tokio::spawn(async move { tls::serve(http_listener, tls_config, router, cancel).await })
        }
        (None, None) => {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                axum::serve(http_listener, router)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                    .context("serve http")
            })
        }
        _ => bail!("both --cert and --key are required to enable TLS"),
    };

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutting down");
    cancel.cancel();

    let _ = sweeper.await;
    let _ = resp_task.await;
    if let Err(err) = http_task.await.context("join http task")? {
        tracing::warn!(error = %err, "http server exited with error");
    }

    broker.close().context("flush store")?;
    tracing::info!("miniqueue stopped");
    Ok(())
}
