// Test harness subscriber: consumes messages from a topic over RESP.
use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use clap::Parser;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Test harness subscriber for miniqueue")]
struct Args {
    /// Broker RESP address (host:port)
    #[arg(long, default_value = "127.0.0.1:6379")]
    broker: String,

    /// Topic name
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Acknowledgement sent after each message
    #[arg(long, value_enum, default_value_t = AckMode::Ack)]
    ack_mode: AckMode,

    /// Delay in seconds used with --ack-mode dack
    #[arg(long, default_value = "5")]
    dack_delay: u32,

    /// Stop after this many messages (0 = run forever)
    #[arg(long, default_value = "0")]
    count: u64,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum AckMode {
    Ack,
    Nack,
    Back,
    Dack,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(broker = %args.broker, topic = %args.topic, "starting subscriber");

    let mut stream = TcpStream::connect(&args.broker)
        .await
        .with_context(|| format!("connect to {}", args.broker))?;
    stream
        .write_all(format!("SUBSCRIBE {}\r\n", args.topic).as_bytes())
        .await
        .context("send subscribe")?;

    let ack_line = match args.ack_mode {
        AckMode::Ack => "ACK\r\n".to_string(),
        AckMode::Nack => "NACK\r\n".to_string(),
        AckMode::Back => "BACK\r\n".to_string(),
        AckMode::Dack => format!("DACK {}\r\n", args.dack_delay),
    };

    let started = Instant::now();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut received = 0u64;

    loop {
        let payload = match read_reply(&mut stream, &mut buf).await? {
            ServerReply::Bulk(payload) => payload,
            ServerReply::Error(message) => bail!("broker error: {message}"),
            ServerReply::Closed => {
                warn!("broker closed the connection");
                break;
            }
        };

        received += 1;
        info!(
            seq = received,
            len = payload.len(),
            msg = %String::from_utf8_lossy(&payload),
            "received"
        );

        stream
            .write_all(ack_line.as_bytes())
            .await
            .context("send acknowledgement")?;

        if args.count > 0 && received >= args.count {
            break;
        }
    }

    let elapsed = started.elapsed();
    info!(received, elapsed = %format!("{elapsed:.2?}"), "subscriber done");
    Ok(())
}

enum ServerReply {
    Bulk(Vec<u8>),
    Error(String),
    Closed,
}

/// Read one server reply. Only the two kinds the subscribe stream produces
/// are handled: bulk payloads and errors.
async fn read_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<ServerReply> {
    loop {
        if let Some(reply) = parse_reply(buf)? {
            return Ok(reply);
        }
        let read = stream.read_buf(buf).await.context("read from broker")?;
        if read == 0 {
            return Ok(ServerReply::Closed);
        }
    }
}

fn parse_reply(buf: &mut BytesMut) -> Result<Option<ServerReply>> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return Ok(None);
    };
    match buf.first() {
        Some(b'$') => {
            let len: usize = std::str::from_utf8(&buf[1..line_end])
                .ok()
                .and_then(|digits| digits.parse().ok())
                .context("invalid bulk length")?;
            let total = line_end + 2 + len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            let payload = buf[line_end + 2..line_end + 2 + len].to_vec();
            buf.advance(total);
            Ok(Some(ServerReply::Bulk(payload)))
        }
        Some(b'-') => {
            let message = String::from_utf8_lossy(&buf[1..line_end]).into_owned();
            buf.advance(line_end + 2);
            Ok(Some(ServerReply::Error(message)))
        }
        Some(_) => bail!("unexpected reply type: {}", buf[0] as char),
        None => Ok(None),
    }
}
