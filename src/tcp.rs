//! An implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html).
//!
//! A [`Tcp`] is one shard of the stack: it owns the connection and listener
//! tables for the connections steered to it and drives their timers. User
//! code holds [`Connection`] and [`Listener`] handles, which name entries in
//! those tables without owning them.

use self::{
    isn::IsnGenerator,
    tcb::{
        segment_arrives_closed, segment_arrives_listen, ListenResult, Segment,
        SegmentArrivesResult, Signal, Tcb, TcbConfig, Waiter,
    },
    tcp_parsing::TcpHeader,
};
use crate::{
    ipv4_address::{Endpoint, Ipv4Address},
    link::{EthernetAddress, IpLink, L4Packet, OffloadInfo, ResolveError},
    message::Message,
    utility::toeplitz_hash,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use thiserror::Error as ThisError;
use tokio::{task::JoinHandle, time::Instant};

mod congestion;
mod isn;
mod seq;
mod tcb;
mod tcp_parsing;

pub use congestion::{BbrMode, CongestionMechanism, UnknownMechanism};
pub use seq::SeqNumber;
pub use tcb::{ConnectionInfo, State};
pub use tcp_parsing::{ParseError, TcpOptions};

/// IP protocol number of TCP
const PROTOCOL_TCP: u8 = 6;
/// First port handed out to active opens
const EPHEMERAL_PORT_START: u16 = 41952;
/// Every this many TCB polls the control queue goes first
const CONTROL_QUEUE_PRIORITY: u64 = 128;

/// An error reported to the user of a connection.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpError {
    #[error("Connection reset by peer")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection timed out")]
    TimedOut,
    #[error("No local port available")]
    AddressInUse,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenError {
    #[error("Port {0} is already in use")]
    PortInUse(u16),
}

/// Settings shared by every connection of a [`Tcp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    pub congestion: CongestionMechanism,
    /// Bytes of unacknowledged data a connection buffers before `send`
    /// suspends
    pub send_queue_space: usize,
    /// Bytes of resets and other ownerless segments queued for transmission
    pub control_queue_space: usize,
    /// Twice the maximum segment lifetime
    pub time_wait: Duration,
    /// Period of the timer task started by [`Tcp::start_timers`]
    pub timer_tick: Duration,
    /// Seeds port selection, the ISN secret and congestion control. Drawn
    /// from the OS when absent.
    pub seed: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            congestion: CongestionMechanism::default(),
            send_queue_space: 212_992,
            control_queue_space: 212_992,
            time_wait: Duration::from_secs(60),
            timer_tick: Duration::from_millis(10),
            seed: None,
        }
    }
}

/// A pair of endpoints that uniquely identifies a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId {
    /// The local endpoint
    pub local: Endpoint,
    /// The remote endpoint
    pub remote: Endpoint,
}

impl ConnectionId {
    /// Create a new connection ID from a pair of endpoints
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// Get a matching connection ID for the remote TCP.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }

    /// The receive-side steering hash a NIC computes for this connection's
    /// inbound packets.
    pub fn hash(&self, rss_key: &[u8]) -> u32 {
        let mut data = [0u8; 12];
        data[0..4].copy_from_slice(&self.remote.address.to_bytes());
        data[4..8].copy_from_slice(&self.local.address.to_bytes());
        data[8..10].copy_from_slice(&self.remote.port.to_be_bytes());
        data[10..12].copy_from_slice(&self.local.port.to_be_bytes());
        toeplitz_hash(rss_key, &data)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// One shard of the TCP stack. Cloning yields another handle to the same
/// shard.
#[derive(Clone)]
pub struct Tcp {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    link: Arc<dyn IpLink>,
    config: TcpConfig,
    shard: Mutex<TcpShard>,
}

struct TcpShard {
    tcbs: FxHashMap<ConnectionId, Slot>,
    listeners: FxHashMap<u16, ListenerState>,
    /// Connections with output waiting, in the order they asked
    poll_list: VecDeque<ConnectionId>,
    /// Segments sent on behalf of no connection, chiefly resets
    control_queue: VecDeque<L4Packet>,
    control_queue_bytes: usize,
    tcb_polled: u64,
    next_generation: u64,
    isn: IsnGenerator,
    rng: SmallRng,
}

/// A connection table entry.
struct Slot {
    tcb: Box<Tcb>,
    /// Tells this connection apart from earlier ones with the same id
    generation: u64,
    /// The listener a passive connection belongs to until accepted
    listener: Option<ListenerKey>,
    /// Counted in its listener's pending handshakes
    pending: bool,
    link_address: Option<EthernetAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListenerKey {
    port: u16,
    generation: u64,
}

struct ListenerState {
    generation: u64,
    backlog: usize,
    /// Handshakes in progress
    pending: usize,
    /// Established connections waiting for `accept`
    queue: VecDeque<(ConnectionId, u64)>,
    acceptor: Signal,
}

impl ListenerState {
    fn has_room(&self) -> bool {
        self.pending + self.queue.len() < self.backlog
    }
}

impl Tcp {
    /// Creates a shard over `link` and registers as its packet provider.
    pub fn new(link: Arc<dyn IpLink>, config: TcpConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let isn = IsnGenerator::new(&mut rng, Instant::now());
        let tcp = Self {
            inner: Arc::new(TcpInner {
                link,
                config,
                shard: Mutex::new(TcpShard {
                    tcbs: Default::default(),
                    listeners: Default::default(),
                    poll_list: VecDeque::new(),
                    control_queue: VecDeque::new(),
                    control_queue_bytes: 0,
                    tcb_polled: 0,
                    next_generation: 0,
                    isn,
                    rng,
                }),
            }),
        };
        let weak: Weak<TcpInner> = Arc::downgrade(&tcp.inner);
        tcp.inner
            .link
            .register_packet_provider(Box::new(move || {
                weak.upgrade().and_then(|inner| Tcp { inner }.poll())
            }));
        tcp
    }

    pub fn config(&self) -> &TcpConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &Arc<dyn IpLink> {
        &self.inner.link
    }

    /// The number of connections in the table, TIME-WAIT included.
    pub fn connection_count(&self) -> usize {
        self.lock().tcbs.len()
    }

    /// The state of the connection `id`, if it exists.
    pub fn connection_state(&self, id: ConnectionId) -> Option<State> {
        self.lock().tcbs.get(&id).map(|slot| slot.tcb.state())
    }

    fn lock(&self) -> MutexGuard<'_, TcpShard> {
        self.inner
            .shard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tcb_config(&self, shard: &mut TcpShard) -> TcbConfig {
        let config = &self.inner.config;
        TcbConfig {
            local_mss: self.inner.link.hw_features().mss(),
            congestion: config.congestion,
            send_queue_space: config.send_queue_space,
            time_wait: config.time_wait,
            seed: shard.rng.gen(),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Timers
    ///////////////////////////////////////////////////////////////////////////

    /// Spawns the task that runs connection timers every
    /// [`TcpConfig::timer_tick`]. The task ends once every handle to the
    /// shard is gone.
    pub fn start_timers(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let tick = self.inner.config.timer_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => Tcp { inner }.poll_timers(Instant::now()),
                    None => break,
                }
            }
        })
    }

    /// Runs every connection timer that expired by `now`.
    pub fn poll_timers(&self, now: Instant) {
        let mut shard = self.lock();
        let due: Vec<_> = shard
            .tcbs
            .iter()
            .filter(|(_, slot)| slot.tcb.next_deadline().map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(slot) = shard.tcbs.get_mut(&id) {
                slot.tcb.advance_time(now);
            }
            self.settle(&mut shard, id);
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Inbound
    ///////////////////////////////////////////////////////////////////////////

    /// Processes a TCP segment the IP layer received from `from` for `to`.
    pub fn received(&self, packet: Message, from: Ipv4Address, to: Ipv4Address) {
        let len = packet.len();
        let header = if self.inner.link.hw_features().rx_csum_offload {
            TcpHeader::from_bytes_offloaded(packet.iter(), len)
        } else {
            TcpHeader::from_bytes(packet.iter(), len, from, to)
        };
        let header = match header {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(%from, %to, error = %e, "Dropping malformed segment");
                return;
            }
        };
        let mut text = packet;
        text.slice(header.bytes()..);

        let id = ConnectionId {
            local: Endpoint::new(to, header.dst_port),
            remote: Endpoint::new(from, header.src_port),
        };
        let segment = Segment::new(header, text);
        let now = Instant::now();
        let mut shard = self.lock();

        if let Some(slot) = shard.tcbs.get_mut(&id) {
            if slot.tcb.segment_arrives(segment, now) == SegmentArrivesResult::Established {
                self.established(&mut shard, id, now);
            }
            self.settle(&mut shard, id);
            return;
        }

        let accepting = shard
            .listeners
            .get(&id.local.port)
            .map(|listener| (listener.has_room(), listener.generation));
        match accepting {
            Some((true, generation)) => {
                let iss = shard.isn.generate(id, now);
                let config = self.tcb_config(&mut shard);
                match segment_arrives_listen(segment, id, iss.into(), config, now) {
                    Some(ListenResult::Response(reset)) => {
                        self.push_control(&mut shard, id, reset)
                    }
                    Some(ListenResult::Tcb(tcb)) => {
                        let key = ListenerKey {
                            port: id.local.port,
                            generation,
                        };
                        tracing::debug!(%id, "Passive open");
                        if shard.insert(id, tcb, Some(key)).is_some() {
                            if let Some(listener) = shard.listeners.get_mut(&id.local.port) {
                                listener.pending += 1;
                            }
                            self.settle(&mut shard, id);
                        }
                    }
                    None => {}
                }
            }
            Some((false, _)) => {
                tracing::debug!(%id, "Listen backlog full, refusing");
                if let Some(reset) = segment_arrives_closed(&segment) {
                    self.push_control(&mut shard, id, reset);
                }
            }
            None => {
                tracing::debug!(%id, "No connection or listener");
                if let Some(reset) = segment_arrives_closed(&segment) {
                    self.push_control(&mut shard, id, reset);
                }
            }
        }
    }

    /// Moves a passive connection that finished its handshake onto its
    /// listener's accept queue.
    fn established(&self, shard: &mut TcpShard, id: ConnectionId, now: Instant) {
        let TcpShard {
            tcbs, listeners, ..
        } = shard;
        let Some(slot) = tcbs.get_mut(&id) else {
            return;
        };
        let Some(key) = slot.listener else {
            return;
        };
        slot.pending = slot.tcb.is_pending_passive();
        match listeners.get_mut(&key.port) {
            Some(listener) if listener.generation == key.generation => {
                listener.pending = listener.pending.saturating_sub(1);
                listener.queue.push_back((id, slot.generation));
                listener.acceptor.resolve(Ok(()));
            }
            _ => {
                tracing::debug!(%id, "Listener gone before handshake completed");
                slot.listener = None;
                slot.tcb.close(now);
            }
        }
    }

    /// Applies what a TCB operation left behind: resets to send, a request
    /// to be polled, or removal once CLOSED.
    fn settle(&self, shard: &mut TcpShard, id: ConnectionId) {
        let Some(slot) = shard.tcbs.get_mut(&id) else {
            return;
        };
        let resets = slot.tcb.take_resets();
        let closed = slot.tcb.state() == State::Closed;
        let poll = slot.tcb.take_poll_request();
        let resolved = slot.link_address.is_some();
        let generation = slot.generation;

        for reset in resets {
            self.push_control(shard, id, reset);
        }
        if closed {
            shard.remove(id);
        } else if poll {
            if resolved {
                shard.poll_list.push_back(id);
                self.inner.link.poll_ready();
            } else {
                self.resolve(id, generation);
            }
        }
    }

    /// Looks up the peer's link address before the connection is polled.
    fn resolve(&self, id: ConnectionId, generation: u64) {
        let tcp = self.clone();
        tokio::spawn(async move {
            let result = tcp
                .inner
                .link
                .get_destination_link_address(id.remote.address)
                .await;
            tcp.link_resolved(id, generation, result);
        });
    }

    fn link_resolved(
        &self,
        id: ConnectionId,
        generation: u64,
        result: Result<EthernetAddress, ResolveError>,
    ) {
        let mut shard = self.lock();
        let Some(slot) = shard.tcbs.get_mut(&id) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        match result {
            Ok(link_address) => {
                slot.link_address = Some(link_address);
                shard.poll_list.push_back(id);
                self.inner.link.poll_ready();
            }
            Err(e) => {
                tracing::debug!(%id, error = %e, "Link address unresolved");
                slot.tcb.link_unresolved(e, Instant::now());
                self.settle(&mut shard, id);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Outbound
    ///////////////////////////////////////////////////////////////////////////

    /// The packet provider: the next packet for the link to send.
    pub fn poll(&self) -> Option<L4Packet> {
        let mut shard = self.lock();
        if shard.poll_list.is_empty() || shard.tcb_polled % CONTROL_QUEUE_PRIORITY == 0 {
            if let Some(packet) = shard.pop_control() {
                return Some(packet);
            }
        }

        let now = Instant::now();
        while let Some(id) = shard.poll_list.pop_front() {
            shard.tcb_polled += 1;
            let Some(slot) = shard.tcbs.get_mut(&id) else {
                continue;
            };
            let segment = slot.tcb.get_packet(now);
            let link_address = slot.link_address;
            let packet = segment.map(|segment| self.serialize(id, segment, link_address));
            self.settle(&mut shard, id);
            if packet.is_some() {
                return packet;
            }
        }
        shard.pop_control()
    }

    fn serialize(
        &self,
        id: ConnectionId,
        segment: Segment,
        e_dst: Option<EthernetAddress>,
    ) -> L4Packet {
        let (mut header, mut text) = segment.into_inner();
        let offload = self.inner.link.hw_features().tx_csum_l4_offload;
        let checksum = if offload {
            header.compute_offloaded_checksum(id.local.address, id.remote.address, text.len())
        } else {
            header.compute_checksum(id.local.address, id.remote.address, text.iter(), text.len())
        };
        if let Err(e) = checksum {
            tracing::error!(%id, error = %e, "Could not checksum segment");
        }
        text.prepend(header.serialize());
        L4Packet {
            to: id.remote.address,
            packet: text,
            e_dst,
            offload: OffloadInfo {
                protocol: PROTOCOL_TCP,
                needs_csum: offload,
                tcp_hdr_len: header.bytes() as u8,
            },
        }
    }

    fn push_control(&self, shard: &mut TcpShard, id: ConnectionId, segment: Segment) {
        let packet = self.serialize(id, segment, None);
        let len = packet.packet.len();
        if shard.control_queue_bytes + len > self.inner.config.control_queue_space {
            tracing::warn!(%id, "Control queue full, dropping segment");
            return;
        }
        shard.control_queue_bytes += len;
        shard.control_queue.push_back(packet);
        self.inner.link.poll_ready();
    }

    ///////////////////////////////////////////////////////////////////////////
    // Opening
    ///////////////////////////////////////////////////////////////////////////

    /// Starts accepting connections on `port`, with at most `backlog`
    /// connections handshaking or waiting for `accept`.
    pub fn listen(&self, port: u16, backlog: usize) -> Result<Listener, ListenError> {
        let mut shard = self.lock();
        if shard.listeners.contains_key(&port) {
            return Err(ListenError::PortInUse(port));
        }
        let generation = shard.next_generation();
        shard.listeners.insert(
            port,
            ListenerState {
                generation,
                backlog,
                pending: 0,
                queue: VecDeque::new(),
                acceptor: Signal::default(),
            },
        );
        tracing::debug!(port, backlog, "Listening");
        Ok(Listener {
            tcp: self.clone(),
            key: ListenerKey { port, generation },
        })
    }

    /// Actively opens a connection to `remote`, resolving once the handshake
    /// completes.
    pub async fn connect(&self, remote: Endpoint) -> Result<Connection, TcpError> {
        let connection = {
            let mut shard = self.lock();
            let id = self.pick_port(&mut shard, remote)?;
            let now = Instant::now();
            let iss = shard.isn.generate(id, now);
            let config = self.tcb_config(&mut shard);
            let tcb = Box::new(Tcb::open(id, iss.into(), config, now));
            tracing::debug!(%id, "Active open");
            let generation = shard.insert(id, tcb, None).ok_or(TcpError::AddressInUse)?;
            self.settle(&mut shard, id);
            Connection {
                tcp: self.clone(),
                id,
                generation,
            }
        };
        // Dropping the handle from here on abandons the handshake
        let waiter = connection.with_tcb(|tcb, _| tcb.connect_done())?;
        wait(waiter).await?;
        Ok(connection)
    }

    /// Picks an ephemeral port that is free and whose connection would be
    /// steered to this shard.
    fn pick_port(&self, shard: &mut TcpShard, remote: Endpoint) -> Result<ConnectionId, TcpError> {
        let link = &self.inner.link;
        let local_address = link.host_address();
        let attempts = (u16::MAX - EPHEMERAL_PORT_START) as usize + 1;
        for _ in 0..attempts {
            let port = shard.rng.gen_range(EPHEMERAL_PORT_START..=u16::MAX);
            let id = ConnectionId::new(Endpoint::new(local_address, port), remote);
            if link.hash_to_shard(id.hash(link.rss_key())) == link.shard()
                && !shard.tcbs.contains_key(&id)
            {
                return Ok(id);
            }
        }
        tracing::warn!(%remote, "No ephemeral port available");
        Err(TcpError::AddressInUse)
    }
}

impl TcpShard {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Adds a connection, returning its generation. An existing connection
    /// with the same id is kept and the new one rejected.
    fn insert(
        &mut self,
        id: ConnectionId,
        tcb: Box<Tcb>,
        listener: Option<ListenerKey>,
    ) -> Option<u64> {
        if self.tcbs.contains_key(&id) {
            tracing::error!(%id, "Connection already exists");
            return None;
        }
        let generation = self.next_generation();
        self.tcbs.insert(
            id,
            Slot {
                tcb,
                generation,
                pending: listener.is_some(),
                listener,
                link_address: None,
            },
        );
        Some(generation)
    }

    fn remove(&mut self, id: ConnectionId) {
        let Some(slot) = self.tcbs.remove(&id) else {
            return;
        };
        tracing::debug!(%id, initiation = ?slot.tcb.initiation(), "Connection removed");
        if let (true, Some(key)) = (slot.pending, slot.listener) {
            if let Some(listener) = self.listeners.get_mut(&key.port) {
                if listener.generation == key.generation {
                    listener.pending = listener.pending.saturating_sub(1);
                }
            }
        }
    }

    fn pop_control(&mut self) -> Option<L4Packet> {
        let packet = self.control_queue.pop_front()?;
        self.control_queue_bytes -= packet.packet.len();
        Some(packet)
    }
}

impl fmt::Debug for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcp")
            .field("address", &self.inner.link.host_address())
            .field("config", &self.inner.config)
            .finish()
    }
}

async fn wait(waiter: Waiter) -> Result<(), TcpError> {
    // A dropped sender means another caller took over the wait
    waiter.await.unwrap_or(Err(TcpError::ConnectionAborted))
}

/// A handle to one connection. Dropping it closes both directions, or
/// abandons the handshake if the connection is still opening.
pub struct Connection {
    tcp: Tcp,
    id: ConnectionId,
    generation: u64,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Runs `f` on the connection's TCB if it still exists, then applies
    /// its effects on the shard.
    fn with_tcb<T>(&self, f: impl FnOnce(&mut Tcb, Instant) -> T) -> Result<T, TcpError> {
        let mut shard = self.tcp.lock();
        let slot = shard
            .tcbs
            .get_mut(&self.id)
            .filter(|slot| slot.generation == self.generation)
            .ok_or(TcpError::ConnectionReset)?;
        let out = f(&mut slot.tcb, Instant::now());
        self.tcp.settle(&mut shard, self.id);
        Ok(out)
    }

    /// Queues `text` for sending. Suspends while the send buffer is full.
    pub async fn send(&self, text: impl Into<Message>) -> Result<(), TcpError> {
        let text = text.into();
        let waiter = self.with_tcb(|tcb, _| tcb.send(text))??;
        wait(waiter).await
    }

    /// Waits for data and returns everything received in order so far. An
    /// empty message means the peer closed its direction.
    pub async fn read(&self) -> Result<Message, TcpError> {
        let waiter = match self.with_tcb(|tcb, _| tcb.wait_for_data()) {
            Ok(waiter) => waiter,
            // Removed after an orderly close
            Err(_) => return Ok(Message::default()),
        };
        wait(waiter).await?;
        Ok(self.with_tcb(|tcb, _| tcb.read()).unwrap_or_default())
    }

    /// Closes the sending direction once all queued data is acknowledged.
    /// Resolves when it is.
    pub async fn close(&self) -> Result<(), TcpError> {
        match self.with_tcb(|tcb, now| tcb.close(now)) {
            Ok(waiter) => wait(waiter).await,
            Err(_) => Ok(()),
        }
    }

    /// Fails a pending `read` with [`TcpError::ConnectionAborted`].
    pub fn close_read(&self) {
        let _ = self.with_tcb(|tcb, _| tcb.abort_reader());
    }

    /// Closes the sending direction without waiting.
    pub fn close_write(&self) {
        let _ = self.with_tcb(|tcb, now| {
            tcb.close(now);
        });
    }

    /// Abandons a handshake in progress.
    pub fn shutdown_connect(&self) {
        let _ = self.with_tcb(|tcb, now| tcb.shutdown_connect(now));
    }

    /// A snapshot of the connection, or `None` once it is gone.
    pub fn info(&self) -> Option<ConnectionInfo> {
        self.with_tcb(|tcb, _| tcb.info()).ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.with_tcb(|tcb, now| {
            if tcb.state().is_any_of(State::SynSent | State::SynReceived) {
                tcb.shutdown_connect(now);
            } else {
                tcb.abort_reader();
                tcb.close(now);
            }
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// A handle to a listening port. Dropping it stops listening and closes
/// connections nobody accepted.
pub struct Listener {
    tcp: Tcp,
    key: ListenerKey,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.key.port
    }

    /// Waits for the next established connection.
    pub async fn accept(&self) -> Result<Connection, TcpError> {
        loop {
            let waiter = {
                let mut shard = self.tcp.lock();
                let TcpShard {
                    tcbs, listeners, ..
                } = &mut *shard;
                let listener = listeners
                    .get_mut(&self.key.port)
                    .filter(|listener| listener.generation == self.key.generation)
                    .ok_or(TcpError::ConnectionAborted)?;
                while let Some((id, generation)) = listener.queue.pop_front() {
                    let Some(slot) = tcbs.get_mut(&id) else {
                        continue;
                    };
                    if slot.generation != generation {
                        continue;
                    }
                    slot.listener = None;
                    return Ok(Connection {
                        tcp: self.tcp.clone(),
                        id,
                        generation,
                    });
                }
                listener.acceptor.subscribe()
            };
            wait(waiter).await?;
        }
    }

    /// Fails a pending `accept` with [`TcpError::ConnectionAborted`].
    pub fn abort_accept(&self) {
        let mut shard = self.tcp.lock();
        if let Some(listener) = shard.listeners.get_mut(&self.key.port) {
            if listener.generation == self.key.generation {
                listener.acceptor.resolve(Err(TcpError::ConnectionAborted));
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let mut shard = self.tcp.lock();
        let owned = shard
            .listeners
            .get(&self.key.port)
            .map_or(false, |listener| listener.generation == self.key.generation);
        if !owned {
            return;
        }
        let Some(mut listener) = shard.listeners.remove(&self.key.port) else {
            return;
        };
        listener.acceptor.resolve(Err(TcpError::ConnectionAborted));
        let now = Instant::now();
        for (id, generation) in listener.queue.drain(..) {
            if let Some(slot) = shard.tcbs.get_mut(&id) {
                if slot.generation == generation {
                    slot.tcb.abort_reader();
                    slot.tcb.close(now);
                    self.tcp.settle(&mut shard, id);
                }
            }
        }
        tracing::debug!(port = self.key.port, "Stopped listening");
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.key.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::{Loopback, LoopbackConfig};
    use super::tcp_parsing::TcpHeaderBuilder;

    const A: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const B: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

    /// A shard on host A whose peer B is never attached
    fn shard(config: TcpConfig) -> Tcp {
        let (a, _b) = Loopback::pair(A, B, LoopbackConfig::default());
        Tcp::new(a, config)
    }

    fn from_b(builder: TcpHeaderBuilder) -> Message {
        let header = builder.build(B, A, std::iter::empty(), 0).unwrap();
        Message::from(header.serialize())
    }

    fn parse_to_b(packet: L4Packet) -> TcpHeader {
        assert_eq!(packet.to, B);
        TcpHeader::from_bytes(packet.packet.iter(), packet.packet.len(), A, B).unwrap()
    }

    #[test]
    #[tracing_test::traced_test]
    fn drops_malformed_segments() {
        let tcp = shard(TcpConfig::default());
        tcp.received(Message::from(b"short"), B, A);
        assert!(logs_contain("Dropping malformed segment"));
        assert!(tcp.poll().is_none());
    }

    #[test]
    fn answers_stray_ack_with_reset() {
        let tcp = shard(TcpConfig::default());
        tcp.received(
            from_b(TcpHeaderBuilder::new(0xdead, 80, SeqNumber::new(500)).ack(SeqNumber::new(1000))),
            B,
            A,
        );
        let reset = parse_to_b(tcp.poll().unwrap());
        assert!(reset.ctl.rst());
        assert!(!reset.ctl.ack());
        assert_eq!(reset.seq, SeqNumber::new(1000));
        assert_eq!((reset.src_port, reset.dst_port), (80, 0xdead));
        assert!(tcp.poll().is_none());
        assert_eq!(tcp.connection_count(), 0);
    }

    #[test]
    fn refuses_when_backlog_is_full() {
        let tcp = shard(TcpConfig::default());
        let _listener = tcp.listen(80, 0).unwrap();
        tcp.received(
            from_b(TcpHeaderBuilder::new(0xdead, 80, SeqNumber::new(500)).syn()),
            B,
            A,
        );
        let reset = parse_to_b(tcp.poll().unwrap());
        assert!(reset.ctl.rst());
        assert_eq!(reset.ack, SeqNumber::new(501));
        assert_eq!(tcp.connection_count(), 0);
    }

    #[test]
    fn control_queue_is_bounded() {
        let tcp = shard(TcpConfig {
            control_queue_space: 50,
            ..Default::default()
        });
        for port in 0..3 {
            tcp.received(
                from_b(TcpHeaderBuilder::new(port, 80, SeqNumber::new(1)).ack(SeqNumber::new(1))),
                B,
                A,
            );
        }
        assert!(tcp.poll().is_some());
        assert!(tcp.poll().is_some());
        assert!(tcp.poll().is_none());
    }

    #[test]
    fn one_connection_per_id() {
        let tcp = shard(TcpConfig::default());
        let id = ConnectionId::new(Endpoint::new(A, 41952), Endpoint::new(B, 80));
        let now = Instant::now();
        let open = |iss| Box::new(Tcb::open(id, SeqNumber::new(iss), TcbConfig::default(), now));
        let mut shard = tcp.lock();
        let generation = shard.insert(id, open(1), None).unwrap();
        assert_eq!(shard.insert(id, open(2), None), None);
        assert_eq!(shard.tcbs.len(), 1);
        assert_eq!(shard.tcbs[&id].generation, generation);
    }

    #[tokio::test]
    async fn listener_dropped_during_handshake() {
        let tcp = shard(TcpConfig::default());
        let listener = tcp.listen(80, 8).unwrap();
        let id = ConnectionId::new(Endpoint::new(A, 80), Endpoint::new(B, 0xdead));

        tcp.received(
            from_b(TcpHeaderBuilder::new(0xdead, 80, SeqNumber::new(500)).syn()),
            B,
            A,
        );
        // Let the link address lookup finish
        tokio::task::yield_now().await;
        let syn_ack = parse_to_b(tcp.poll().unwrap());
        assert!(syn_ack.ctl.syn() && syn_ack.ctl.ack());
        assert_eq!(tcp.connection_state(id), Some(State::SynReceived));

        drop(listener);
        tcp.received(
            from_b(
                TcpHeaderBuilder::new(0xdead, 80, SeqNumber::new(501))
                    .ack(syn_ack.seq + 1)
                    .wnd(1000),
            ),
            B,
            A,
        );
        let fin = parse_to_b(tcp.poll().unwrap());
        assert!(fin.ctl.fin());
        assert_eq!(fin.seq, syn_ack.seq + 1);
        assert_eq!(tcp.connection_state(id), Some(State::FinWait1));

        let shard = tcp.lock();
        assert!(shard.listeners.is_empty());
        assert_eq!(shard.tcbs[&id].listener, None);
        assert!(!shard.tcbs[&id].pending);
    }

    #[test]
    fn listen_twice_on_a_port() {
        let tcp = shard(TcpConfig::default());
        let listener = tcp.listen(80, 8).unwrap();
        assert_eq!(tcp.listen(80, 8).unwrap_err(), ListenError::PortInUse(80));
        drop(listener);
        assert_eq!(tcp.listen(80, 8).unwrap().port(), 80);
    }

    #[test]
    fn reverse_swaps_endpoints() {
        let id = ConnectionId::new(
            Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 41952),
            Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 80),
        );
        assert_eq!(id.reverse().local, id.remote);
        assert_eq!(id.reverse().reverse(), id);
        assert_eq!(id.to_string(), "10.0.0.1:41952 -> 10.0.0.2:80");
    }

    #[test]
    fn steering_hash_matches_nic() {
        // Microsoft RSS verification suite, IPv4 with TCP ports:
        // 66.9.149.187:2794 -> 161.142.100.80:1766 hashes to 0x51ccc178
        let id = ConnectionId::new(
            Endpoint::new(Ipv4Address::new([161, 142, 100, 80]), 1766),
            Endpoint::new(Ipv4Address::new([66, 9, 149, 187]), 2794),
        );
        assert_eq!(id.hash(&crate::link::DEFAULT_RSS_KEY), 0x51ccc178);
    }
}
