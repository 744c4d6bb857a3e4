//! RESP transport.
//!
//! A thin line-oriented front on the broker: PING/INFO/TOPICS/PUBLISH run
//! request-reply, SUBSCRIBE detaches the connection into a delivery loop
//! where each bulk payload is followed by one `ACK|NACK|BACK|DACK <n>`
//! command from the client. A dropped connection nacks whatever was
//! outstanding.

use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use miniqueue_broker::{Broker, Consumer};
use miniqueue_resp::{decode_command, encode_reply, Command, Reply};
use miniqueue_store::Value;

/// Accept loop for the RESP listener. Runs until `cancel` fires.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => return,
        };
        match accepted {
            Ok((socket, peer)) => {
                tracing::debug!(%peer, "resp connection accepted");
                let broker = Arc::clone(&broker);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, broker, cancel).await {
                        tracing::debug!(%peer, error = %err, "resp connection closed");
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "resp accept failed");
            }
        }
    }
}

/// Serve one RESP connection. Generic over the stream so tests can drive it
/// through an in-memory duplex pipe.
pub async fn handle_connection<S>(
    mut socket: S,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let mut out = BytesMut::new();

    loop {
        let Some(cmd) = decode_command(&mut buf)? else {
            let read = tokio::select! {
                read = socket.read_buf(&mut buf) => read?,
                _ = cancel.cancelled() => return Ok(()),
            };
            if read == 0 {
                return Ok(());
            }
            continue;
        };

        match cmd.name().as_str() {
            "PING" => write_reply(&mut socket, &mut out, &Reply::Simple("pong".into())).await?,
            "INFO" => {
                let info = format!("redis_version:miniqueue_{}", env!("CARGO_PKG_VERSION"));
                write_reply(&mut socket, &mut out, &Reply::Simple(info)).await?;
            }
            "TOPICS" => match broker.topics() {
                Ok(topics) => {
                    let listing = format!("[{}]", topics.join(" "));
                    write_reply(&mut socket, &mut out, &Reply::Simple(listing)).await?;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to get topics");
                    write_reply(
                        &mut socket,
                        &mut out,
                        &Reply::Error("failed to get topics".into()),
                    )
                    .await?;
                }
            },
            "PUBLISH" => {
                if cmd.args.len() != 3 {
                    write_reply(
                        &mut socket,
                        &mut out,
                        &Reply::Error("invalid number of args, want: 3".into()),
                    )
                    .await?;
                    continue;
                }
                let topic = cmd.arg_str(1).unwrap_or_default();
                let payload = cmd.arg(2).cloned().unwrap_or_default();
                match broker.publish(&topic, Value::new(payload)).await {
                    Ok(()) => {
                        metrics::counter!("miniqueue_publish_total").increment(1);
                        write_reply(&mut socket, &mut out, &Reply::Simple("OK".into())).await?;
                    }
                    Err(err) => {
                        tracing::error!(topic, error = %err, "failed to publish");
                        write_reply(
                            &mut socket,
                            &mut out,
                            &Reply::Error("failed to publish".into()),
                        )
                        .await?;
                    }
                }
            }
            "SUBSCRIBE" => {
                if cmd.args.len() != 2 {
                    write_reply(
                        &mut socket,
                        &mut out,
                        &Reply::Error("invalid number of args, want: 2".into()),
                    )
                    .await?;
                    return Ok(());
                }
                let topic = cmd.arg_str(1).unwrap_or_default();
                // The connection now belongs to this subscription until the
                // client hangs up.
                return subscribe_session(socket, buf, out, broker, topic, cancel).await;
            }
            _ => {
                let name = cmd.arg_str(0).unwrap_or_default();
                write_reply(
                    &mut socket,
                    &mut out,
                    &Reply::Error(format!("unknown command '{name}'")),
                )
                .await?;
            }
        }
    }
}

async fn subscribe_session<S>(
    mut socket: S,
    mut buf: BytesMut,
    mut out: BytesMut,
    broker: Arc<Broker>,
    topic: String,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut consumer = broker.subscribe(&topic).await;
    let result = subscribe_loop(&mut socket, &mut buf, &mut out, &mut consumer, &cancel).await;

    if consumer.has_outstanding() {
        if let Err(err) = consumer.nack().await {
            tracing::warn!(topic, error = %err, "nack on disconnect failed");
        }
    }
    if let Err(err) = broker.unsubscribe(&topic, consumer.id()).await {
        tracing::warn!(topic, error = %err, "unsubscribe on disconnect failed");
    }
    result
}

async fn subscribe_loop<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    out: &mut BytesMut,
    consumer: &mut Consumer,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Deliver the next message, keeping an eye on the socket so a
        // disconnect interrupts the wait. Bytes read early stay buffered for
        // the acknowledgement phase below.
        let value = tokio::select! {
            value = consumer.next(cancel) => value?,
            read = socket.read_buf(buf) => {
                if read? == 0 {
                    return Ok(());
                }
                continue;
            }
        };

        metrics::counter!("miniqueue_delivered_total").increment(1);
        tracing::debug!(topic = consumer.topic(), "sending msg");
        write_reply(socket, out, &Reply::Bulk(value.raw.clone())).await?;

        // Await the acknowledgement for this delivery.
        loop {
            let Some(cmd) = decode_command(buf)? else {
                let read = tokio::select! {
                    read = socket.read_buf(buf) => read?,
                    _ = cancel.cancelled() => return Ok(()),
                };
                if read == 0 {
                    return Ok(());
                }
                continue;
            };

            let resolved = match cmd.name().as_str() {
                "ACK" => consumer.ack().map(|_| true),
                "NACK" => consumer.nack().await.map(|_| true),
                "BACK" => consumer.back().await.map(|_| true),
                "DACK" => match dack_seconds(&cmd) {
                    Ok(seconds) => consumer.dack(seconds).map(|_| true),
                    Err(message) => {
                        write_reply(socket, out, &Reply::Error(message.into())).await?;
                        Ok(false)
                    }
                },
                _ => {
                    write_reply(
                        socket,
                        out,
                        &Reply::Error("expected one of ACK, NACK, BACK, DACK".into()),
                    )
                    .await?;
                    Ok(false)
                }
            };

            match resolved {
                Ok(true) => break,
                Ok(false) => continue,
                Err(err) => {
                    write_reply(socket, out, &Reply::Error(err.to_string())).await?;
                }
            }
        }
    }
}

fn dack_seconds(cmd: &Command) -> Result<u32, &'static str> {
    if cmd.args.len() < 2 {
        return Err("too few arguments");
    }
    cmd.arg_str(1)
        .and_then(|arg| arg.parse::<u32>().ok())
        .filter(|seconds| *seconds > 0)
        .ok_or("invalid DACK duration argument")
}

async fn write_reply<S>(socket: &mut S, out: &mut BytesMut, reply: &Reply) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    out.clear();
    encode_reply(reply, out);
    socket.write_all(out).await?;
    socket.flush().await
}
