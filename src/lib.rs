//! A userspace implementation of the Transmission Control Protocol.
//!
//! The stack processes TCP segments handed to it as byte buffers and hands
//! back packets for an IP layer to send, so it runs over anything that can
//! carry IPv4 datagrams: a NIC driver in poll mode, a tap device, or the
//! in-memory [`Loopback`](link::loopback::Loopback) used by the tests and
//! the demo binary.
//!
//! # Organization
//! - [`Message`] is the byte buffer segments are built from and parsed out
//!   of
//! - [`IpLink`](link::IpLink) is the IP layer as TCP sees it
//! - [`Tcp`](tcp::Tcp) is one shard of the stack, which hands out
//!   [`Connection`](tcp::Connection) and [`Listener`](tcp::Listener) handles
//!
//! # Connections
//!
//! Each connection is driven by a transmission control block, a state
//! machine following [RFC 9293](https://www.rfc-editor.org/rfc/rfc9293.html)
//! with the loss recovery of RFC 5681 and RFC 6582 and the retransmission
//! timer of RFC 6298. Congestion control is pluggable; NewReno and BBR are
//! provided.
//!
//! ```no_run
//! # async fn demo(tcp: elvis_tcp::tcp::Tcp) -> Result<(), elvis_tcp::tcp::TcpError> {
//! use elvis_tcp::ipv4_address::{Endpoint, Ipv4Address};
//!
//! let connection = tcp
//!     .connect(Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 80))
//!     .await?;
//! connection.send("GET / HTTP/1.0\r\n\r\n").await?;
//! let response = connection.read().await?;
//! connection.close().await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod ipv4_address;
pub mod link;
pub mod message;
pub use message::Message;
pub mod simulation;
pub mod tcp;
pub mod utility;
