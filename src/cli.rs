//! Parses the command line arguments of the transfer demo.
//!
//! Basic usage for a lossy transfer with logging on:
//!
//! ```cargo run -- --log --loss 0.01 --congestion bbr```

use crate::{simulation::TransferConfig, tcp::CongestionMechanism};
use clap::Parser;
use std::{fs::OpenOptions, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tracing_subscriber::FmtSubscriber;

/// Directory log files are written to
const LOG_DIRECTORY: &str = "logs";

/// Pushes bytes between two TCP shards over an in-memory link.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Write JSON events to a file under ./logs
    #[arg(short, long)]
    pub log: bool,
    /// Congestion control for both ends
    #[arg(short, long, value_enum, default_value_t = CongestionMechanism::NewReno)]
    pub congestion: CongestionMechanism,
    /// Bytes to transfer
    #[arg(short, long, default_value_t = 1 << 24)]
    pub bytes: usize,
    /// Probability each packet is dropped
    #[arg(long, default_value_t = 0.0)]
    pub loss: f64,
    /// MTU of the link
    #[arg(long, default_value_t = 1500)]
    pub mtu: u16,
    /// One-way link delay in milliseconds
    #[arg(long, default_value_t = 1)]
    pub latency: u64,
    /// Seeds packet loss and the stacks
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl Args {
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            bytes: self.bytes,
            congestion: self.congestion,
            loss: self.loss,
            mtu: self.mtu,
            latency: Duration::from_millis(self.latency),
            seed: self.seed,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum LoggingError {
    #[error("Could not open the log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("A global subscriber is already installed")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs a global subscriber writing JSON events to a file named after
/// the current time. Call once, at startup.
pub fn init_logging() -> Result<PathBuf, LoggingError> {
    std::fs::create_dir_all(LOG_DIRECTORY)?;
    let file_path = PathBuf::from(LOG_DIRECTORY).join(format!(
        "debug-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    ));
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::DEBUG)
        .json()
        .finish();
    // All events from every task go to the same file
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(file_path)
}
