// Test harness publisher: pushes messages onto a topic over RESP.
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use miniqueue_resp::{encode_reply, Command, Reply};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Test harness publisher for miniqueue")]
struct Args {
    /// Broker RESP address (host:port)
    #[arg(long, default_value = "127.0.0.1:6379")]
    broker: String,

    /// Topic name
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Message payload; a sequence number is appended to each message
    #[arg(long, default_value = "payload")]
    message: String,

    /// Number of messages to publish
    #[arg(long, default_value = "10")]
    count: u64,

    /// Messages per second (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate: u64,
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
    info!(broker = %args.broker, topic = %args.topic, count = args.count, "starting publisher");

    let mut stream = TcpStream::connect(&args.broker)
        .await
        .with_context(|| format!("connect to {}", args.broker))?;

    let pause = (args.rate > 0).then(|| Duration::from_secs(1) / args.rate as u32);
    let started = Instant::now();
    let mut out = BytesMut::new();
    let mut reply = [0u8; 512];

    for seq in 0..args.count {
        let payload = format!("{}-{seq}", args.message);
        out.clear();
        encode_command(
            &mut out,
            &["PUBLISH", &args.topic, &payload],
        );
        stream.write_all(&out).await.context("write publish")?;

        let read = stream.read(&mut reply).await.context("read reply")?;
        if read == 0 {
            bail!("broker closed the connection");
        }
        let line = String::from_utf8_lossy(&reply[..read]);
        if !line.starts_with("+OK") {
            bail!("unexpected publish reply: {}", line.trim_end());
        }

        if let Some(pause) = pause {
            sleep(pause).await;
        }
    }

    let elapsed = started.elapsed();
    info!(
        published = args.count,
        elapsed = %format!("{elapsed:.2?}"),
        "publisher done"
    );
    Ok(())
}

/// Encode a command as a RESP array of bulk strings, the same framing the
/// server's decoder accepts.
fn encode_command(out: &mut BytesMut, args: &[&str]) {
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        encode_reply(&Reply::Bulk(Bytes::copy_from_slice(arg.as_bytes())), out);
    }
    // Sanity: the round trip stays parseable.
    debug_assert!({
        let mut check = out.clone();
        matches!(
            miniqueue_resp::decode_command(&mut check),
            Ok(Some(Command { .. }))
        )
    });
}
