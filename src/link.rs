//! The IP layer beneath TCP.
//!
//! TCP never pushes packets down. It registers a [`PacketProvider`] with its
//! [`IpLink`] and signals [`IpLink::poll_ready`] whenever it has something
//! to send; the link pulls packets at its own pace. Inbound segments travel
//! the other way through [`Tcp::received`](crate::tcp::Tcp::received).

use crate::{ipv4_address::Ipv4Address, message::Message};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error as ThisError;

pub mod loopback;

/// Capabilities of the network device under the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwFeatures {
    /// Largest IP packet the device carries
    pub mtu: u16,
    /// The device verifies transport checksums on receive
    pub rx_csum_offload: bool,
    /// The device completes transport checksums on transmit
    pub tx_csum_l4_offload: bool,
}

impl HwFeatures {
    /// The MSS this device allows: the MTU less the IPv4 and TCP headers.
    pub fn mss(&self) -> u32 {
        (self.mtu as u32).saturating_sub(40)
    }
}

impl Default for HwFeatures {
    fn default() -> Self {
        Self {
            mtu: 1500,
            rx_csum_offload: false,
            tx_csum_l4_offload: false,
        }
    }
}

/// A hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthernetAddress(pub [u8; 6]);

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Work left for the device when checksums are offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffloadInfo {
    /// IP protocol number of the transport header
    pub protocol: u8,
    /// The transport checksum holds only the pseudo-header sum
    pub needs_csum: bool,
    pub tcp_hdr_len: u8,
}

/// A transport segment ready for IP encapsulation.
#[derive(Debug, Clone)]
pub struct L4Packet {
    pub to: Ipv4Address,
    /// Serialized header and text
    pub packet: Message,
    /// The next hop, when the transport already resolved it
    pub e_dst: Option<EthernetAddress>,
    pub offload: OffloadInfo,
}

/// Why a link address could not be found.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Link address resolution timed out")]
    Timeout,
    #[error("Link address resolution queue is full")]
    QueueFull,
}

/// Hands the link the next outbound packet, if any.
pub type PacketProvider = Box<dyn FnMut() -> Option<L4Packet> + Send>;

/// The IP layer as TCP sees it.
#[async_trait]
pub trait IpLink: Send + Sync + 'static {
    /// This host's address on the link.
    fn host_address(&self) -> Ipv4Address;

    fn hw_features(&self) -> HwFeatures;

    /// The receive-side scaling key of the device.
    fn rss_key(&self) -> &[u8];

    /// The shard whose queue receives packets with steering hash `hash`.
    fn hash_to_shard(&self, hash: u32) -> usize;

    /// The shard this link serves.
    fn shard(&self) -> usize;

    /// Installs the function the link pulls outbound packets from. A later
    /// registration replaces an earlier one.
    fn register_packet_provider(&self, provider: PacketProvider);

    /// Tells the link the provider has packets waiting.
    fn poll_ready(&self);

    async fn get_destination_link_address(
        &self,
        address: Ipv4Address,
    ) -> Result<EthernetAddress, ResolveError>;
}

/// The key most NIC drivers install for receive-side scaling.
pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f,
    0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30,
    0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];
