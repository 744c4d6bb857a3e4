// Daemon configuration from command-line flags.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_DB_PATH: &str = "./miniqueue";

#[derive(Parser, Debug, Clone)]
#[command(name = "miniqueued", version, about = "Durable single-node message broker")]
pub struct Config {
    /// Port for the HTTP listener.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Port for the RESP (redis protocol) listener.
    #[arg(long, default_value_t = 6379)]
    pub resp_port: u16,

    /// Path to the TLS certificate (PEM). TLS is enabled when both --cert
    /// and --key are given.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to the TLS private key (PEM).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Path to the database directory.
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// Log level.
    #[arg(long, value_enum, default_value = "debug")]
    pub level: LogLevel,

    /// Period between runs of the delayed-message sweeper.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub period: Duration,

    /// Human readable logging output instead of JSON.
    #[arg(long, default_value_t = false)]
    pub human: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Disabled,
    Debug,
    Info,
}
