//! A bulk transfer between two shards joined by a [`Loopback`] link.

use crate::{
    ipv4_address::{Endpoint, Ipv4Address},
    link::{loopback::Loopback, loopback::LoopbackConfig, HwFeatures},
    tcp::{CongestionMechanism, ConnectionInfo, ListenError, Tcp, TcpConfig, TcpError},
};
use std::{fmt, sync::atomic::Ordering, sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio::time::Instant;

const CLIENT: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const PORT: u16 = 0xbeef;
/// Bytes handed to each `send`
const WRITE_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferConfig {
    pub bytes: usize,
    pub congestion: CongestionMechanism,
    pub loss: f64,
    pub mtu: u16,
    pub latency: Duration,
    pub seed: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bytes: 1 << 20,
            congestion: CongestionMechanism::default(),
            loss: 0.0,
            mtu: 1500,
            latency: Duration::from_millis(1),
            seed: 0,
        }
    }
}

/// What a finished transfer measured.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub bytes_received: usize,
    /// From the completed handshake to the acknowledgment of the last byte
    pub elapsed: Duration,
    /// The sender just before it closed
    pub sender: Option<ConnectionInfo>,
    pub packets_sent: u64,
    pub packets_dropped: u64,
}

impl TransferReport {
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 * 8.0 / secs
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} bytes in {:.3} s ({:.2} Mbit/s)",
            self.bytes_received,
            self.elapsed.as_secs_f64(),
            self.throughput_bps() / 1e6
        )?;
        write!(
            f,
            "{} packets sent, {} dropped",
            self.packets_sent, self.packets_dropped
        )?;
        if let Some(info) = &self.sender {
            write!(
                f,
                "\nsender: cwnd {} ssthresh {} rto {:?} srtt {:?}",
                info.cwnd, info.ssthresh, info.rto, info.srtt
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, ThisError)]
pub enum SimulationError {
    #[error(transparent)]
    Listen(#[from] ListenError),
    #[error(transparent)]
    Tcp(#[from] TcpError),
    #[error("The receiving task failed: {0}")]
    Receiver(#[from] tokio::task::JoinError),
}

/// Sends `config.bytes` from a client shard to a server shard and waits
/// until the server has read all of it.
pub async fn transfer(config: TransferConfig) -> Result<TransferReport, SimulationError> {
    let (client_link, server_link) = Loopback::pair(
        CLIENT,
        SERVER,
        LoopbackConfig {
            features: HwFeatures {
                mtu: config.mtu,
                ..Default::default()
            },
            loss: config.loss,
            latency: config.latency,
            seed: config.seed,
        },
    );
    let tcp_config = |seed| TcpConfig {
        congestion: config.congestion,
        seed: Some(seed),
        ..Default::default()
    };
    let client = Tcp::new(client_link.clone(), tcp_config(config.seed));
    let server = Tcp::new(server_link.clone(), tcp_config(config.seed.wrapping_add(1)));

    let mut tasks = client_link.attach(client.clone());
    tasks.extend(server_link.attach(server.clone()));
    tasks.push(client.start_timers());
    tasks.push(server.start_timers());

    let listener = server.listen(PORT, 16)?;
    let receiver = tokio::spawn(async move {
        let connection = listener.accept().await?;
        let mut received = 0;
        loop {
            let text = connection.read().await?;
            if text.is_empty() {
                break;
            }
            received += text.len();
        }
        connection.close().await?;
        Ok::<_, TcpError>(received)
    });

    let connection = client.connect(Endpoint::new(SERVER, PORT)).await?;
    tracing::info!(id = %connection.id(), bytes = config.bytes, "Transfer started");
    let start = Instant::now();
    let mut remaining = config.bytes;
    while remaining > 0 {
        let len = remaining.min(WRITE_SIZE);
        connection.send(vec![0xa5; len]).await?;
        remaining -= len;
    }
    let sender = connection.info();
    connection.close().await?;
    let elapsed = start.elapsed();
    let bytes_received = receiver.await??;
    tracing::info!(bytes_received, ?elapsed, "Transfer finished");

    for task in tasks {
        task.abort();
    }
    let stats = |link: &Arc<Loopback>| {
        (
            link.stats().sent.load(Ordering::Relaxed),
            link.stats().dropped.load(Ordering::Relaxed),
        )
    };
    let (client_sent, client_dropped) = stats(&client_link);
    let (server_sent, server_dropped) = stats(&server_link);
    Ok(TransferReport {
        bytes_received,
        elapsed,
        sender,
        packets_sent: client_sent + server_sent,
        packets_dropped: client_dropped + server_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transfers_everything() {
        let report = transfer(TransferConfig {
            bytes: 200_000,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(report.bytes_received, 200_000);
        assert_eq!(report.packets_dropped, 0);
        assert!(report.sender.is_some());
    }
}
