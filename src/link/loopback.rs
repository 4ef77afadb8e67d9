//! An in-memory link joining two hosts, with optional loss and latency.

use super::{
    EthernetAddress, HwFeatures, IpLink, L4Packet, PacketProvider, ResolveError, DEFAULT_RSS_KEY,
};
use crate::{ipv4_address::Ipv4Address, message::Message, tcp::Tcp, utility::Checksum};
use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::Instant,
};

/// Offset of the checksum field in a TCP header
const TCP_CHECKSUM_OFFSET: usize = 16;

/// Behavior shared by both ends of a loopback pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopbackConfig {
    pub features: HwFeatures,
    /// Probability that a packet is dropped, in each direction
    pub loss: f64,
    /// One-way delay
    pub latency: Duration,
    /// Seeds the loss process
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            features: HwFeatures::default(),
            loss: 0.0,
            latency: Duration::from_millis(1),
            seed: 0,
        }
    }
}

#[derive(Debug)]
struct Frame {
    packet: Message,
    from: Ipv4Address,
    to: Ipv4Address,
    deliver_at: Instant,
}

/// Packet counters for one direction of a loopback pair.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

/// One end of a loopback pair.
pub struct Loopback {
    address: Ipv4Address,
    link_address: EthernetAddress,
    peer_link_address: EthernetAddress,
    config: LoopbackConfig,
    provider: Mutex<Option<PacketProvider>>,
    ready: Notify,
    to_peer: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    loss: Mutex<SmallRng>,
    stats: LinkStats,
}

impl Loopback {
    /// Creates both ends of a link between `a` and `b`.
    pub fn pair(
        a: Ipv4Address,
        b: Ipv4Address,
        config: LoopbackConfig,
    ) -> (Arc<Loopback>, Arc<Loopback>) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        let mac = |host: Ipv4Address| {
            let [w, x, y, z] = host.to_bytes();
            EthernetAddress([0x02, 0x00, w, x, y, z])
        };
        let end = |address, peer, to_peer, inbound, seed| {
            Arc::new(Loopback {
                address,
                link_address: mac(address),
                peer_link_address: mac(peer),
                config,
                provider: Mutex::new(None),
                ready: Notify::new(),
                to_peer,
                inbound: Mutex::new(Some(inbound)),
                loss: Mutex::new(SmallRng::seed_from_u64(seed)),
                stats: LinkStats::default(),
            })
        };
        (
            end(a, b, to_b, from_b, config.seed),
            end(b, a, to_a, from_a, config.seed.wrapping_add(1)),
        )
    }

    pub fn link_address(&self) -> EthernetAddress {
        self.link_address
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Runs this end of the link on behalf of `tcp`: pulls from its packet
    /// provider and hands arriving packets to it. Attach each end once.
    pub fn attach(self: &Arc<Self>, tcp: Tcp) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![];

        let me = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                me.ready.notified().await;
                while let Some(packet) = me.next_packet() {
                    me.transmit(packet);
                }
            }
        }));

        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match inbound {
            Some(mut inbound) => tasks.push(tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    tokio::time::sleep_until(frame.deliver_at).await;
                    tcp.received(frame.packet, frame.from, frame.to);
                }
            })),
            None => tracing::warn!(address = %self.address, "Loopback end attached twice"),
        }
        tasks
    }

    fn next_packet(&self) -> Option<L4Packet> {
        let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
        provider.as_mut().and_then(|provider| provider())
    }

    fn transmit(&self, packet: L4Packet) {
        let dropped = self.config.loss > 0.0
            && self
                .loss
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_bool(self.config.loss.min(1.0));
        if dropped {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from = %self.address, to = %packet.to, "Loopback dropped packet");
            return;
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        let mut bytes = packet.packet;
        if packet.offload.needs_csum {
            bytes = finish_checksum(bytes);
        }
        let frame = Frame {
            packet: bytes,
            from: self.address,
            to: packet.to,
            deliver_at: Instant::now() + self.config.latency,
        };
        if self.to_peer.send(frame).is_err() {
            tracing::debug!(from = %self.address, "Loopback peer is gone");
        }
    }
}

/// Completes a checksum holding only the pseudo-header sum, as offloading
/// hardware would.
fn finish_checksum(packet: Message) -> Message {
    let mut bytes = packet.to_vec();
    if bytes.len() < TCP_CHECKSUM_OFFSET + 2 {
        return packet;
    }
    let mut sum = Checksum::new();
    sum.accumulate_remainder(bytes.iter().cloned());
    bytes[TCP_CHECKSUM_OFFSET..TCP_CHECKSUM_OFFSET + 2].copy_from_slice(&sum.as_u16().to_be_bytes());
    Message::from(bytes)
}

#[async_trait]
impl IpLink for Loopback {
    fn host_address(&self) -> Ipv4Address {
        self.address
    }

    fn hw_features(&self) -> HwFeatures {
        self.config.features
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

    fn register_packet_provider(&self, provider: PacketProvider) {
        *self.provider.lock().unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    fn poll_ready(&self) {
        self.ready.notify_one();
    }

    async fn get_destination_link_address(
        &self,
        _address: Ipv4Address,
    ) -> Result<EthernetAddress, ResolveError> {
        Ok(self.peer_link_address)
    }
}

impl std::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loopback")
            .field("address", &self.address)
            .field("link_address", &self.link_address)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
