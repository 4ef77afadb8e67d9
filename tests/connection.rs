use async_trait::async_trait;
use elvis_tcp::{
    ipv4_address::{Endpoint, Ipv4Address},
    link::{
        loopback::{Loopback, LoopbackConfig},
        EthernetAddress, HwFeatures, IpLink, PacketProvider, ResolveError, DEFAULT_RSS_KEY,
    },
    simulation::{transfer, TransferConfig},
    tcp::{CongestionMechanism, State, Tcp, TcpConfig, TcpError},
    Message,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

const CLIENT: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const PORT: u16 = 0xbeef;
const SERVER_ENDPOINT: Endpoint = Endpoint::new(SERVER, PORT);

struct Hosts {
    client: Tcp,
    server: Tcp,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Hosts {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn hosts(link: LoopbackConfig) -> Hosts {
    let (client_link, server_link) = Loopback::pair(CLIENT, SERVER, link);
    let config = |seed| TcpConfig {
        seed: Some(seed),
        ..Default::default()
    };
    let client = Tcp::new(client_link.clone(), config(1));
    let server = Tcp::new(server_link.clone(), config(2));
    let mut tasks = client_link.attach(client.clone());
    tasks.extend(server_link.attach(server.clone()));
    tasks.push(client.start_timers());
    tasks.push(server.start_timers());
    Hosts {
        client,
        server,
        tasks,
    }
}

/// Accepts one connection and echoes everything it reads until the peer
/// closes.
fn echo_server(server: &Tcp) -> anyhow::Result<JoinHandle<Result<usize, TcpError>>> {
    let listener = server.listen(PORT, 8)?;
    Ok(tokio::spawn(async move {
        let connection = listener.accept().await?;
        let mut echoed = 0;
        loop {
            let text = connection.read().await?;
            if text.is_empty() {
                break;
            }
            echoed += text.len();
            connection.send(text).await?;
        }
        connection.close().await?;
        Ok(echoed)
    }))
}

async fn read_exactly(
    connection: &elvis_tcp::tcp::Connection,
    len: usize,
) -> anyhow::Result<Message> {
    let mut out = Message::default();
    while out.len() < len {
        let text = connection.read().await?;
        anyhow::ensure!(!text.is_empty(), "connection closed early");
        out.append(text);
    }
    Ok(out)
}

#[tokio::test(start_paused = true)]
async fn echo() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig::default());
    let server = echo_server(&hosts.server)?;

    let connection = hosts.client.connect(SERVER_ENDPOINT).await?;
    assert_eq!(connection.id().remote, SERVER_ENDPOINT);
    assert_eq!(connection.id().local.address, CLIENT);
    assert_eq!(connection.info().map(|info| info.state), Some(State::Established));

    connection.send("Hello, world").await?;
    let reply = read_exactly(&connection, 12).await?;
    assert_eq!(reply, Message::from("Hello, world"));

    connection.close().await?;
    assert!(connection.read().await?.is_empty());
    assert_eq!(server.await??, 12);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn echo_large_with_checksum_offload() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig {
        features: HwFeatures {
            tx_csum_l4_offload: true,
            ..Default::default()
        },
        ..Default::default()
    });
    let server = echo_server(&hosts.server)?;
    let connection = hosts.client.connect(SERVER_ENDPOINT).await?;

    let text: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    connection.send(text.clone()).await?;
    let reply = read_exactly(&connection, text.len()).await?;
    assert_eq!(reply.to_vec(), text);

    connection.close().await?;
    assert_eq!(server.await??, text.len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_without_listener_is_refused() {
    let hosts = hosts(LoopbackConfig::default());
    let result = hosts.client.connect(SERVER_ENDPOINT).await;
    assert_eq!(result.unwrap_err(), TcpError::ConnectionRefused);
    assert_eq!(hosts.client.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_close_reads_as_end_of_stream() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig::default());
    let listener = hosts.server.listen(PORT, 8)?;
    let server = tokio::spawn(async move {
        let connection = listener.accept().await?;
        connection.send("bye").await?;
        connection.close().await
    });

    let connection = hosts.client.connect(SERVER_ENDPOINT).await?;
    assert_eq!(read_exactly(&connection, 3).await?, Message::from("bye"));
    assert!(connection.read().await?.is_empty());
    server.await??;
    connection.close().await?;

    // The side that closed first lingers in TIME-WAIT
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hosts.client.connection_count(), 0);
    assert_eq!(hosts.server.connection_count(), 1);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hosts.server.connection_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_after_close_fails() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig::default());
    let _server = echo_server(&hosts.server)?;
    let connection = hosts.client.connect(SERVER_ENDPOINT).await?;
    connection.close().await?;
    assert_eq!(
        connection.send("late").await.unwrap_err(),
        TcpError::ConnectionReset
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn abort_accept() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig::default());
    let listener = Arc::new(hosts.server.listen(PORT, 8)?);
    let accepting = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await.map(|_| ()) })
    };
    tokio::task::yield_now().await;
    listener.abort_accept();
    assert_eq!(accepting.await?, Err(TcpError::ConnectionAborted));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_listener_closes_unaccepted() -> anyhow::Result<()> {
    let hosts = hosts(LoopbackConfig::default());
    let listener = hosts.server.listen(PORT, 8)?;
    let connection = hosts.client.connect(SERVER_ENDPOINT).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(listener);
    assert!(connection.read().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lossy_transfer_completes() -> anyhow::Result<()> {
    let report = transfer(TransferConfig {
        bytes: 300_000,
        loss: 0.02,
        seed: 7,
        ..Default::default()
    })
    .await?;
    assert_eq!(report.bytes_received, 300_000);
    assert!(report.packets_dropped > 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bbr_transfer_completes() -> anyhow::Result<()> {
    let report = transfer(TransferConfig {
        bytes: 300_000,
        congestion: CongestionMechanism::Bbr,
        ..Default::default()
    })
    .await?;
    assert_eq!(report.bytes_received, 300_000);
    assert!(report.sender.and_then(|info| info.pacing_rate).is_some());
    Ok(())
}

/// A link whose neighbor never answers address resolution.
struct Unreachable;

#[async_trait]
impl IpLink for Unreachable {
    fn host_address(&self) -> Ipv4Address {
        CLIENT
    }

    fn hw_features(&self) -> HwFeatures {
        HwFeatures::default()
    }

    fn rss_key(&self) -> &[u8] {
        &DEFAULT_RSS_KEY
    }

    fn hash_to_shard(&self, _hash: u32) -> usize {
        0
    }

    fn shard(&self) -> usize {
        0
    }

    fn register_packet_provider(&self, _provider: PacketProvider) {}

    fn poll_ready(&self) {}

    async fn get_destination_link_address(
        &self,
        _address: Ipv4Address,
    ) -> Result<EthernetAddress, ResolveError> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Err(ResolveError::Timeout)
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_neighbor_aborts_connect() {
    let tcp = Tcp::new(Arc::new(Unreachable), TcpConfig::default());
    let result = tcp.connect(SERVER_ENDPOINT).await;
    assert_eq!(result.unwrap_err(), TcpError::ConnectionAborted);
    assert_eq!(tcp.connection_count(), 0);
}
