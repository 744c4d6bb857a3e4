// TLS termination for the HTTP listener.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Build a rustls server config from PEM cert/key files. ALPN prefers
/// HTTP/2, which the streaming subscribe protocol wants for clean
/// full-duplex bodies.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert).with_context(|| format!("open certificate {}", cert.display()))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("parse certificate")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key).with_context(|| format!("open private key {}", key.display()))?,
    ))
    .context("parse private key")?
    .context("no private key found in file")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept TLS connections and serve the router over them until `cancel`
/// fires. Each connection gets its own task; handshake failures only kill
/// that connection.
pub async fn serve(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accept connection")?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "tls handshake failed");
                    return;
                }
            };
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(%peer, error = %err, "http connection closed with error");
            }
        });
    }
}
