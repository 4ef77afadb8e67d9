//! The transmission control block: the per-connection state machine.
//!
//! A [`Tcb`] never performs I/O or reads the clock. Every operation takes the
//! current [`Instant`], outgoing segments are pulled with
//! [`Tcb::get_packet`], and resets owed to the peer are collected with
//! [`Tcb::take_resets`]. The owning shard drives timers through
//! [`Tcb::advance_time`].

use self::{
    receive_sequence_space::ReceiveState,
    send_sequence_space::{SendState, UnackedSegment},
    timer::Timer,
};
use super::{
    congestion::{
        AckSample, CongestionControl, CongestionMechanism, LossSignal, RecoveryAck,
        RetransmitTimeout,
    },
    seq::SeqNumber,
    tcp_parsing::{TcpHeader, TcpHeaderBuilder, TcpOptions},
    ConnectionId, TcpError,
};
use crate::{link::ResolveError, message::Message};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

mod reassembly;
mod receive_sequence_space;
mod segment;
mod send_sequence_space;
mod state;
mod timer;
mod waiter;

pub use segment::Segment;
pub use state::State;
pub use waiter::{Signal, Waiter};


const RTO_INITIAL: Duration = Duration::from_secs(1);
const RTO_MIN: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);
const RTO_CLK_GRANULARITY: Duration = Duration::from_millis(1);
const MAX_NR_RETRANSMIT: u16 = 5;
/// RFC 1122 allows up to 500 ms
const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(200);
/// Linux's default receive window
const RCV_WINDOW_BASE: u32 = 29200;
const LOCAL_WINDOW_SCALE: u8 = 7;
/// The largest shift RFC 7323 allows
const MAX_WINDOW_SCALE: u8 = 14;
/// Assumed when the peer's SYN carries no MSS option, RFC 1122 section 4.2.2.6
const DEFAULT_MSS: u32 = 536;

/// Per-connection settings handed down by the owning shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbConfig {
    /// The largest segment this host accepts: the link MTU less the IP and
    /// TCP headers
    pub local_mss: u32,
    pub congestion: CongestionMechanism,
    /// Bytes of unacknowledged user data after which `send` suspends
    pub send_queue_space: usize,
    /// How long a connection lingers in TIME-WAIT
    pub time_wait: Duration,
    /// Seeds the randomized parts of congestion control
    pub seed: u64,
}

impl Default for TcbConfig {
    fn default() -> Self {
        Self {
            local_mss: 1460,
            congestion: CongestionMechanism::default(),
            send_queue_space: 212_992,
            time_wait: Duration::from_secs(60),
            seed: 0,
        }
    }
}

/// How the connection was opened.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Initiation {
    /// Active open by the local user
    Open,
    /// Passive open through a listener
    Listen,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SegmentArrivesResult {
    Ok,
    /// A passively opened connection finished its handshake and belongs on
    /// its listener's accept queue
    Established,
    /// The connection reached CLOSED and must be removed
    Close,
}

/// A snapshot of the connection's transmission state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionInfo {
    pub state: State,
    pub cwnd: u32,
    pub ssthresh: u32,
    /// Bytes per second, for congestion control that paces
    pub pacing_rate: Option<u64>,
    pub srtt: Option<Duration>,
    pub rto: Duration,
    pub bytes_in_flight: u32,
}

/// The state of one TCP connection.
#[derive(Debug)]
pub struct Tcb {
    id: ConnectionId,
    initiation: Initiation,
    state: State,
    config: TcbConfig,
    snd: SendState,
    rcv: ReceiveState,
    congestion: Box<dyn CongestionControl>,
    /// Whether our SYN carries the window scale option
    offer_window_scale: bool,
    rto: Duration,
    persist_timeout: Duration,
    retransmit: Timer,
    persist: Timer,
    delayed_ack: Timer,
    time_wait: Timer,
    nr_full_seg_received: u16,
    /// Segments built and waiting for the next poll
    packetq: VecDeque<Segment>,
    /// Set while the TCB sits on the shard's poll list
    poll_active: bool,
    /// Set when the TCB asked to be polled and the shard has not noticed yet
    poll_requested: bool,
    /// The user asked to close, the FIN follows once all data is acknowledged
    close_requested: bool,
    connect_done: Signal,
    /// Resets to send on behalf of this connection
    resets: Vec<Segment>,
}

impl Tcb {
    fn new(id: ConnectionId, initiation: Initiation, iss: SeqNumber, config: TcbConfig) -> Self {
        Self {
            id,
            initiation,
            state: State::Closed,
            config,
            snd: SendState::new(iss, config.send_queue_space),
            rcv: ReceiveState::default(),
            congestion: config.congestion.build(DEFAULT_MSS, config.seed),
            offer_window_scale: false,
            rto: RTO_INITIAL,
            persist_timeout: RTO_INITIAL,
            retransmit: Timer::default(),
            persist: Timer::default(),
            delayed_ack: Timer::default(),
            time_wait: Timer::default(),
            nr_full_seg_received: 0,
            packetq: VecDeque::new(),
            poll_active: false,
            poll_requested: false,
            close_requested: false,
            connect_done: Signal::default(),
            resets: vec![],
        }
    }

    /// Actively opens a connection, queueing the SYN. See 3.10.1.
    pub fn open(id: ConnectionId, iss: SeqNumber, config: TcbConfig, now: Instant) -> Self {
        let mut tcb = Self::new(id, Initiation::Open, iss, config);
        tcb.offer_window_scale = true;
        tcb.rcv.window_scale = LOCAL_WINDOW_SCALE;
        tcb.rcv.mss = config.local_mss;
        tcb.rcv.window = RCV_WINDOW_BASE << LOCAL_WINDOW_SCALE;
        tcb.do_syn_sent(now);
        tcb
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn initiation(&self) -> Initiation {
        self.initiation
    }

    /// Whether this is a passive connection still counted against its
    /// listener's backlog.
    pub fn is_pending_passive(&self) -> bool {
        self.initiation == Initiation::Listen && self.state == State::SynReceived
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            cwnd: self.congestion.current_cwnd(),
            ssthresh: self.congestion.current_ssthresh(),
            pacing_rate: self.congestion.current_pacing_rate(),
            srtt: self.snd.srtt,
            rto: self.rto,
            bytes_in_flight: self.snd.flight_size(),
        }
    }

    /// The earliest armed timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            &self.retransmit,
            &self.persist,
            &self.delayed_ack,
            &self.time_wait,
        ]
        .into_iter()
        .filter_map(Timer::deadline)
        .min()
    }

    ///////////////////////////////////////////////////////////////////////////
    // User operations
    ///////////////////////////////////////////////////////////////////////////

    /// Resolves once the handshake completes, or with the error that ended
    /// it.
    pub fn connect_done(&mut self) -> Waiter {
        match self.state {
            State::SynSent | State::SynReceived => self.connect_done.subscribe(),
            State::Closed => Signal::ready(Err(TcpError::ConnectionReset)),
            _ => Signal::ready(Ok(())),
        }
    }

    /// Queues `text` for transmission. The returned waiter resolves once the
    /// send buffer has room for more.
    pub fn send(&mut self, text: Message) -> Result<Waiter, TcpError> {
        if self.snd.closed || self.close_requested || self.state == State::Closed {
            return Err(TcpError::ConnectionReset);
        }
        let len = text.len();
        self.snd.current_queue_space += len;
        self.snd.unsent_len += len as u32;
        self.snd.unsent.push_back(text);
        if self.can_send() > 0 {
            self.output();
        }
        Ok(self.wait_send_available())
    }

    fn wait_send_available(&mut self) -> Waiter {
        if self.snd.has_queue_space() {
            Signal::ready(Ok(()))
        } else {
            self.snd.send_available.subscribe()
        }
    }

    /// Resolves once data is readable or the peer will send no more.
    pub fn wait_for_data(&mut self) -> Waiter {
        if !self.rcv.data.is_empty() || self.foreign_will_not_send() {
            Signal::ready(Ok(()))
        } else {
            self.rcv.data_received.subscribe()
        }
    }

    /// Drains the in-order receive queue.
    pub fn read(&mut self) -> Message {
        self.rcv.read()
    }

    /// Whether the peer's FIN has been received or the connection is gone.
    pub fn foreign_will_not_send(&self) -> bool {
        self.state.is_any_of(
            State::Closing | State::TimeWait | State::CloseWait | State::LastAck | State::Closed,
        )
    }

    /// Fails a pending reader with [`TcpError::ConnectionAborted`].
    pub fn abort_reader(&mut self) {
        self.rcv
            .data_received
            .resolve(Err(TcpError::ConnectionAborted));
    }

    /// Requests an orderly close. The FIN goes out once every byte queued so
    /// far is acknowledged, which is also when the returned waiter resolves.
    pub fn close(&mut self, now: Instant) -> Waiter {
        if self.state == State::Closed || self.snd.closed {
            return Signal::ready(Ok(()));
        }
        self.close_requested = true;
        let waiter = if self.all_data_acked() {
            Signal::ready(Ok(()))
        } else {
            self.snd.all_data_acked.subscribe()
        };
        self.check_close(now);
        waiter
    }

    /// Abandons a handshake in progress, or closes both directions of an
    /// established connection.
    pub fn shutdown_connect(&mut self, now: Instant) {
        if self.syn_needs_on() {
            self.cleanup(Some(TcpError::ConnectionRefused));
        } else {
            self.abort_reader();
            self.close(now);
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Shard interface
    ///////////////////////////////////////////////////////////////////////////

    /// Returns true once per request to be put on the shard's poll list.
    pub fn take_poll_request(&mut self) -> bool {
        std::mem::take(&mut self.poll_requested)
    }

    /// Resets owed to the peer, built from segments this connection rejected.
    pub fn take_resets(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.resets)
    }

    /// The link address of the peer could not be resolved for a poll.
    pub fn link_unresolved(&mut self, error: ResolveError, now: Instant) {
        self.poll_active = false;
        match error {
            ResolveError::QueueFull => self.start_retransmit_timer(now),
            ResolveError::Timeout => {
                if self.state == State::SynSent {
                    self.cleanup(Some(TcpError::ConnectionAborted));
                }
                // Other states time out through retransmission
            }
        }
    }

    /// Produces the next segment to transmit, if the connection still has
    /// one. Requests another poll while more remains sendable.
    pub fn get_packet(&mut self, now: Instant) -> Option<Segment> {
        self.poll_active = false;
        if self.packetq.is_empty() {
            self.output_one(now, false);
        }
        if self.state == State::Closed {
            return None;
        }
        let segment = self.packetq.pop_front()?;
        // Three duplicate acknowledgments mean a segment is lost, hold back
        // new data until recovery
        if !self.packetq.is_empty()
            || (self.snd.dupacks < 3 && self.can_send() > 0 && self.snd.window > 0)
        {
            self.output();
        }
        Some(segment)
    }

    /// Drains every segment the connection currently wants to send.
    #[cfg(test)]
    pub fn segments(&mut self, now: Instant) -> Vec<Segment> {
        let mut segments = vec![];
        while self.take_poll_request() {
            if let Some(segment) = self.get_packet(now) {
                segments.push(segment);
            }
        }
        segments
    }

    /// Runs the timers that expired by `now`.
    pub fn advance_time(&mut self, now: Instant) {
        if self.retransmit.fire(now) {
            self.on_retransmit_timeout(now);
        }
        if self.persist.fire(now) {
            self.on_persist_timeout(now);
        }
        if self.delayed_ack.fire(now) {
            self.nr_full_seg_received = 0;
            self.output();
        }
        if self.time_wait.fire(now) {
            tracing::debug!(id = %self.id, "TIME-WAIT expired");
            self.do_closed();
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Segment arrival
    ///////////////////////////////////////////////////////////////////////////

    /// Processes an incoming segment, 3.10.7.3 and 3.10.7.4.
    pub fn segment_arrives(&mut self, segment: Segment, now: Instant) -> SegmentArrivesResult {
        let before = self.state;
        match self.state {
            State::Closed | State::Listen => {}
            State::SynSent => self.segment_arrives_syn_sent(segment, now),
            _ => self.segment_arrives_other(segment, now),
        }
        if self.state == State::Closed {
            return SegmentArrivesResult::Close;
        }
        self.check_close(now);
        if before == State::SynReceived
            && self.state != State::SynReceived
            && self.initiation == Initiation::Listen
        {
            SegmentArrivesResult::Established
        } else {
            SegmentArrivesResult::Ok
        }
    }

    fn segment_arrives_syn_sent(&mut self, segment: Segment, now: Instant) {
        let header = segment.header;

        // First, check the ACK bit
        let mut acceptable = false;
        if header.ctl.ack() {
            if header.ack <= self.snd.iss || header.ack > self.snd.nxt {
                return self.respond_with_reset(&segment);
            }
            acceptable = header.ack.is_between(self.snd.una, self.snd.nxt);
        }

        // Second, check the RST bit
        if header.ctl.rst() {
            if acceptable {
                tracing::debug!(id = %self.id, "Connection refused");
                self.cleanup(Some(TcpError::ConnectionRefused));
            }
            return;
        }

        // Third, security and precedence are ignored

        // Fourth, check the SYN bit
        if header.ctl.syn() {
            self.rcv.nxt = header.seq + 1;
            self.rcv.irs = header.seq;
            if header.ctl.ack() {
                self.snd.una = header.ack;
            }
            self.init_from_options(&header);
            if self.snd.una > self.snd.iss {
                self.do_established(now);
                self.output();
            } else {
                // Simultaneous open
                self.do_syn_received(now);
            }
        }

        // Fifth, drop anything else
    }

    fn segment_arrives_other(&mut self, segment: Segment, now: Instant) {
        let (header, mut text) = segment.into_inner();
        let mut seg_seq = header.seq;
        let seg_ack = header.ack;
        let mut seg_len = text.len() as u32;
        let mut fin = header.ctl.fin();
        let mut do_output = false;
        let mut do_output_data = false;

        // First, check the sequence number
        if !self.segment_acceptable(seg_seq, seg_len) {
            if header.ctl.rst() {
                return;
            }
            if self.state == State::SynReceived
                && header.ctl.syn()
                && header.ctl.ack()
                && seg_seq == self.rcv.irs
                && self.snd.una < seg_ack
                && seg_ack <= self.snd.nxt
            {
                // Our SYN crossed the peer's in a simultaneous open
                self.snd.una = seg_ack;
                self.do_established(now);
            } else if fin && header.ctl.ack() && seg_seq + seg_len + 1 == self.rcv.nxt {
                // A retransmitted FIN still acknowledges ours
                self.local_fin_acked(seg_ack, now);
                if self.state == State::TimeWait {
                    self.time_wait.arm(now + self.config.time_wait);
                }
            }
            if self.state != State::Closed {
                self.output();
            }
            return;
        }

        if seg_seq < self.rcv.nxt {
            // Drop data already received
            let dup = ((self.rcv.nxt - seg_seq) as u32).min(seg_len);
            text.trim_front(dup as usize);
            seg_len -= dup;
            seg_seq += dup;
        }

        let right_edge = self.rcv.nxt + self.rcv.window;
        if seg_seq + seg_len > right_edge {
            let excess = ((seg_seq + seg_len - right_edge) as u32).min(seg_len);
            text.trim_back(excess as usize);
            seg_len -= excess;
            fin = false;
        }

        if seg_seq != self.rcv.nxt {
            if seg_len > 0 && !header.ctl.rst() {
                self.rcv.out_of_order.insert(seg_seq, text);
            }
            // Out-of-order data gets an immediate duplicate ACK
            return self.output();
        }

        // Second, check the RST bit
        if header.ctl.rst() {
            match self.state {
                State::SynReceived => self.cleanup(Some(TcpError::ConnectionRefused)),
                State::Closing | State::LastAck | State::TimeWait => self.do_closed(),
                _ => self.do_reset(),
            }
            return;
        }

        // Third, security and precedence are ignored

        // Fourth, a SYN in the window is an error
        if header.ctl.syn() {
            if let Some(reset) = reset_for(&header, seg_len) {
                self.resets.push(Segment::new(reset, Message::default()));
            }
            return self.do_reset();
        }

        // Fifth, check the ACK field
        if !header.ctl.ack() {
            return;
        }

        if self.state == State::SynReceived {
            if seg_ack.is_between(self.snd.una, self.snd.nxt) {
                self.do_established(now);
            } else {
                if let Some(reset) = reset_for(&header, seg_len) {
                    self.resets.push(Segment::new(reset, Message::default()));
                }
                return;
            }
        }

        if self.state.is_any_of(State::Established | State::CloseWait) {
            let wnd = (header.wnd as u32) << self.snd.window_scale;
            // Zero window probes do not count toward duplicate detection
            let packets_out = ((self.snd.nxt - self.snd.una).max(0) as u32)
                .saturating_sub(self.snd.zero_window_probing_out);

            if self.snd.una < seg_ack && seg_ack <= self.snd.nxt {
                let acked = self.data_segment_acked(seg_ack, now);
                if self.snd.wl1 < seg_seq || (self.snd.wl1 == seg_seq && self.snd.wl2 <= seg_ack)
                {
                    self.update_window(wnd, seg_seq, seg_ack, now);
                }
                do_output_data = true;

                if self.snd.dupacks >= 3 {
                    if seg_ack > self.snd.recover {
                        tracing::trace!(id = %self.id, ack = %seg_ack, "Full ACK, leaving recovery");
                        let flight = self.snd.flight_size();
                        self.congestion
                            .on_recovery_ack(RecoveryAck::Full { flight });
                        self.exit_fast_recovery();
                        self.set_retransmit_timer(now);
                    } else {
                        tracing::trace!(id = %self.id, ack = %seg_ack, "Partial ACK");
                        self.fast_retransmit(now);
                        self.congestion
                            .on_recovery_ack(RecoveryAck::Partial { acked });
                        self.snd.partial_ack += 1;
                        if self.snd.partial_ack == 1 {
                            self.start_retransmit_timer(now);
                        }
                    }
                } else {
                    // An ACK that moves SND.UNA ends any dupack run
                    self.exit_fast_recovery();
                    self.set_retransmit_timer(now);
                }
            } else if packets_out > 0
                && !self.snd.unacked.is_empty()
                && seg_len == 0
                && !header.ctl.syn()
                && !header.ctl.fin()
                && seg_ack == self.snd.una
                && wnd == self.snd.window
            {
                self.on_duplicate_ack(seg_ack, now);
                if self.snd.dupacks != 3 {
                    do_output_data = true;
                }
            } else if seg_ack > self.snd.nxt {
                // Acknowledges something not yet sent
                return self.output();
            } else if self.snd.window == 0 && wnd > 0 {
                self.update_window(wnd, seg_seq, seg_ack, now);
                // An unaccepted probe byte is now ordinary data in flight
                if !self.snd.unacked.is_empty() && !self.retransmit.is_armed() {
                    self.start_retransmit_timer(now);
                }
                do_output_data = true;
            }
        }

        match self.state {
            State::FinWait1 => {
                self.local_fin_acked(seg_ack, now);
            }
            State::Closing => {
                self.local_fin_acked(seg_ack, now);
                return;
            }
            State::LastAck => {
                if self.local_fin_acked(seg_ack, now) {
                    return;
                }
            }
            _ => {}
        }

        // Sixth, the URG bit is ignored

        // Seventh, process the segment text
        if self.state.is_any_of(State::Established | State::FinWait1 | State::FinWait2)
            && seg_len > 0
        {
            self.rcv.data.push_back(text);
            self.rcv.nxt += seg_len;
            let mut filled_gap = false;
            if !self.rcv.out_of_order.is_empty() {
                let merged = self.rcv.out_of_order.merge(self.rcv.nxt);
                filled_gap = !merged.is_empty();
                if filled_gap {
                    self.rcv.nxt += merged.len() as u32;
                    self.rcv.data.push_back(merged);
                }
            }
            self.rcv.data_received.resolve(Ok(()));
            // A segment filling a gap is acknowledged at once
            do_output = filled_gap || self.should_send_ack(seg_len, now);
        }

        // Eighth, check the FIN bit
        if fin && seg_seq + seg_len == self.rcv.nxt {
            self.rcv.nxt += 1;
            self.rcv.data_received.resolve(Ok(()));
            // The FIN's ACK covers any data in the same segment
            self.delayed_ack.cancel();
            do_output = false;
            self.output();

            match self.state {
                State::SynReceived | State::Established => self.set_state(State::CloseWait),
                // Had our FIN been acknowledged we would be in FIN-WAIT-2
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => return self.do_time_wait(now),
                _ => {}
            }
        }

        if do_output || (do_output_data && self.can_send() > 0) {
            self.delayed_ack.cancel();
            self.output();
        }
    }

    /// Handles a duplicate acknowledgment, RFC 5681 section 3.2 and RFC 6582.
    fn on_duplicate_ack(&mut self, seg_ack: SeqNumber, now: Instant) {
        self.snd.dupacks += 1;
        let dupacks = self.snd.dupacks;
        // Only a loss above the previous recovery point starts a new episode
        let new_recovery = dupacks == 3 && seg_ack - 1 > self.snd.recover;
        let signal = LossSignal {
            dupacks,
            flight: self.snd.flight_size(),
            limited_transfer: self.snd.limited_transfer,
            new_recovery,
        };
        self.congestion.on_loss_signal(&signal);
        if new_recovery {
            tracing::debug!(id = %self.id, ack = %seg_ack, "Fast retransmit");
            self.snd.recover = self.snd.nxt - 1;
            self.fast_retransmit(now);
        }
    }

    /// Acknowledges the local FIN if `seg_ack` covers it, moving to the state
    /// that follows. Returns whether it did.
    fn local_fin_acked(&mut self, seg_ack: SeqNumber, now: Instant) -> bool {
        if !self.snd.closed || seg_ack != self.snd.nxt + 1 {
            return false;
        }
        match self.state {
            State::FinWait1 => {
                self.do_local_fin_acked();
                self.retransmit.cancel();
                self.set_state(State::FinWait2);
            }
            State::Closing => {
                self.do_local_fin_acked();
                self.do_time_wait(now);
            }
            State::LastAck => {
                self.do_local_fin_acked();
                self.do_closed();
            }
            _ => return false,
        }
        true
    }

    /// The acceptability test of 3.10.7.4, Table 6.
    fn segment_acceptable(&self, seg_seq: SeqNumber, seg_len: u32) -> bool {
        match (seg_len, self.rcv.window) {
            (0, 0) => seg_seq == self.rcv.nxt,
            (0, _) => self.rcv.in_window(seg_seq),
            (_, 0) => false,
            (len, _) => self.rcv.in_window(seg_seq) || self.rcv.in_window(seg_seq + (len - 1)),
        }
    }

    /// Applies the peer's options from its SYN and sizes both windows.
    fn init_from_options(&mut self, header: &TcpHeader) {
        let options = header.options;
        match options.window_scale {
            Some(shift) if self.offer_window_scale => {
                self.snd.window_scale = shift.min(MAX_WINDOW_SCALE);
                self.rcv.window_scale = LOCAL_WINDOW_SCALE;
            }
            _ => {
                self.snd.window_scale = 0;
                self.rcv.window_scale = 0;
            }
        }
        self.snd.mss = options
            .mss
            .map(u32::from)
            .filter(|&mss| mss > 0)
            .unwrap_or(DEFAULT_MSS);
        self.rcv.mss = self.config.local_mss;
        self.rcv.window = RCV_WINDOW_BASE << self.rcv.window_scale;
        // The window of a SYN is never scaled
        self.snd.window = header.wnd as u32;
        self.snd.wl1 = header.seq;
        self.snd.wl2 = header.ack;
        self.congestion.init_window(self.snd.mss, self.snd.window);
    }

    /// Removes acknowledged data from the retransmission queue and returns
    /// the number of bytes newly acknowledged.
    fn data_segment_acked(&mut self, seg_ack: SeqNumber, now: Instant) -> u32 {
        let mut total = 0;

        // Fully acknowledged segments
        while let Some(front) = self.snd.unacked.front() {
            let len = front.packet.len() as u32;
            if self.snd.una + len > seg_ack {
                break;
            }
            let Some(acked) = self.snd.unacked.pop_front() else {
                break;
            };
            self.snd.una += len;
            // Retransmitted segments give ambiguous samples, Karn's algorithm
            let rtt = (acked.nr_transmits == 0).then(|| {
                self.update_rto(acked.tx_time, now);
                now.saturating_duration_since(acked.tx_time)
            });
            self.on_ack(len, rtt, seg_ack, now);
            total += len;
            self.snd.current_queue_space = self
                .snd
                .current_queue_space
                .saturating_sub(acked.data_len as usize);
            self.signal_send_available();
        }

        // Partially acknowledged segment
        if self.snd.una < seg_ack {
            let acked = (seg_ack - self.snd.una) as u32;
            if let Some(front) = self.snd.unacked.front_mut() {
                let trim = (acked as usize).min(front.packet.len());
                front.packet.trim_front(trim);
                self.snd.una = seg_ack;
                self.on_ack(acked, None, seg_ack, now);
            } else {
                self.snd.una = seg_ack;
            }
            total += acked;
        }
        total
    }

    fn on_ack(&mut self, acked: u32, rtt: Option<Duration>, ack: SeqNumber, now: Instant) {
        let sample = AckSample {
            acked,
            flight: self.snd.flight_size(),
            rtt,
            srtt: self.snd.srtt,
            dupacks: self.snd.dupacks,
            ack,
            snd_next: self.snd.nxt,
            now,
        };
        self.congestion.on_ack(&sample);
    }

    fn update_window(&mut self, wnd: u32, seg_seq: SeqNumber, seg_ack: SeqNumber, now: Instant) {
        tracing::trace!(
            id = %self.id,
            old = self.snd.window,
            new = wnd,
            "Window update"
        );
        self.snd.window = wnd;
        self.snd.wl1 = seg_seq;
        self.snd.wl2 = seg_ack;
        self.snd.zero_window_probing_out = 0;
        if wnd == 0 {
            self.persist_timeout = self.rto;
            self.persist.arm(now + self.persist_timeout);
        } else {
            self.persist.cancel();
        }
    }

    /// Decides whether received text is acknowledged now or after a delay.
    fn should_send_ack(&mut self, seg_len: u32, now: Instant) -> bool {
        // Larger than one segment, likely a burst coalesced by the receiver
        if seg_len > self.rcv.mss {
            self.nr_full_seg_received = 0;
            self.delayed_ack.cancel();
            return true;
        }

        // Every second full-sized segment
        if seg_len == self.rcv.mss {
            let previous = self.nr_full_seg_received;
            self.nr_full_seg_received += 1;
            if previous >= 1 {
                self.nr_full_seg_received = 0;
                self.delayed_ack.cancel();
                return true;
            }
        }

        if !self.delayed_ack.is_armed() {
            self.delayed_ack.arm(now + DELAYED_ACK_TIMEOUT);
        }
        false
    }

    ///////////////////////////////////////////////////////////////////////////
    // Output
    ///////////////////////////////////////////////////////////////////////////

    /// Asks the shard to poll this connection.
    fn output(&mut self) {
        if !self.poll_active {
            self.poll_active = true;
            self.poll_requested = true;
        }
    }

    /// Builds one segment onto the packet queue. A data retransmission
    /// resends the oldest unacknowledged segment instead of new data.
    fn output_one(&mut self, now: Instant, data_retransmit: bool) {
        if self.state == State::Closed {
            return;
        }

        let text = if data_retransmit {
            match self.snd.unacked.front() {
                Some(unacked) => unacked.packet.clone(),
                None => return,
            }
        } else {
            self.get_transmit_packet()
        };
        let len = text.len() as u32;
        let syn_on = self.syn_needs_on();
        let ack_on = self.ack_needs_on();

        let seq = if data_retransmit {
            self.snd.una
        } else {
            // A retransmitted SYN keeps the ISS
            let seq = if syn_on { self.snd.iss } else { self.snd.nxt };
            self.snd.nxt += len;
            seq
        };

        let fin_on = self.fin_needs_on();
        let mut builder = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
            .wnd(self.advertised_window());
        if ack_on {
            self.delayed_ack.cancel();
            builder = builder.ack(self.rcv.nxt);
        }
        if syn_on {
            builder = builder.syn().options(self.syn_options());
        }
        if fin_on {
            builder = builder.fin();
        }
        if len > 0 {
            builder = builder.psh();
        }

        if !data_retransmit && (len > 0 || syn_on || fin_on) {
            if len > 0 {
                self.snd.unacked.push_back(UnackedSegment {
                    packet: text.clone(),
                    data_len: len,
                    nr_transmits: 0,
                    tx_time: now,
                });
            }
            // Probes into a zero window are timed by the persist timer
            if !self.retransmit.is_armed() && !self.snd.window_probe {
                self.start_retransmit_timer(now);
            }
        }

        self.packetq.push_back(Segment::new(builder.finish(), text));
    }

    /// Takes as much unsent data as the windows allow for one segment.
    fn get_transmit_packet(&mut self) -> Message {
        if self.snd.unsent.is_empty() {
            return Message::default();
        }
        let len = self
            .can_send()
            .min(self.config.local_mss)
            .min(self.snd.mss);
        let packet = self.snd.take_unsent(len);
        if matches!(self.snd.dupacks, 1 | 2) {
            self.snd.limited_transfer += packet.len() as u32;
        }
        packet
    }

    /// How many new bytes may be sent now.
    fn can_send(&self) -> u32 {
        if self.snd.window_probe {
            return 1;
        }
        if self.syn_needs_on() {
            return 0;
        }

        // Can not send more than advertised window allows
        let window_room = ((self.snd.una + self.snd.window) - self.snd.nxt).max(0) as u32;
        let x = window_room.min(self.snd.unsent_len);

        // Can not send more than congestion window allows
        let cwnd = self.congestion.current_cwnd();
        let flight = self.snd.flight_size();
        let mss = self.snd.mss;
        let room = match self.snd.dupacks {
            0 => cwnd.saturating_sub(flight),
            // Limited transmit, RFC 3042
            1 | 2 => cwnd.saturating_add(2 * mss).saturating_sub(flight),
            // At most one segment per duplicate during recovery
            _ => cwnd.saturating_sub(flight).min(mss),
        };
        x.min(room)
    }

    fn advertised_window(&self) -> u16 {
        (self.rcv.window >> self.rcv.window_scale).min(u16::MAX as u32) as u16
    }

    fn syn_options(&self) -> TcpOptions {
        TcpOptions {
            mss: Some(self.config.local_mss.min(u16::MAX as u32) as u16),
            window_scale: self.offer_window_scale.then_some(LOCAL_WINDOW_SCALE),
            ..Default::default()
        }
    }

    fn syn_needs_on(&self) -> bool {
        self.state.is_any_of(State::SynSent | State::SynReceived)
    }

    fn fin_needs_on(&self) -> bool {
        self.state
            .is_any_of(State::FinWait1 | State::Closing | State::LastAck)
            && self.snd.closed
            && self.snd.unsent_len == 0
    }

    fn ack_needs_on(&self) -> bool {
        !self
            .state
            .is_any_of(State::Closed | State::Listen | State::SynSent)
    }

    fn all_data_acked(&self) -> bool {
        self.snd.unacked.is_empty() && self.snd.unsent_len == 0
    }

    ///////////////////////////////////////////////////////////////////////////
    // Retransmission
    ///////////////////////////////////////////////////////////////////////////

    fn start_retransmit_timer(&mut self, now: Instant) {
        self.retransmit.arm(now + self.rto);
    }

    fn set_retransmit_timer(&mut self, now: Instant) {
        if self.snd.unacked.is_empty() {
            self.retransmit.cancel();
            self.signal_all_data_acked();
        } else {
            // Restart, new data was acknowledged
            self.start_retransmit_timer(now);
        }
    }

    /// Requests output and backs off the RTO, RFC 6298 section 5.5.
    fn output_update_rto(&mut self, now: Instant) {
        self.output();
        self.rto = (self.rto * 2).min(RTO_MAX);
        self.start_retransmit_timer(now);
    }

    fn on_retransmit_timeout(&mut self, now: Instant) {
        if self.syn_needs_on() {
            if self.snd.syn_retransmit < MAX_NR_RETRANSMIT {
                self.snd.syn_retransmit += 1;
                tracing::debug!(id = %self.id, attempt = self.snd.syn_retransmit, "Retransmitting SYN");
                self.output_update_rto(now);
            } else {
                tracing::warn!(id = %self.id, "Handshake timed out");
                self.cleanup(Some(TcpError::ConnectionRefused));
            }
            return;
        }

        if self.fin_needs_on() {
            if self.snd.fin_retransmit < MAX_NR_RETRANSMIT {
                self.snd.fin_retransmit += 1;
                tracing::debug!(id = %self.id, attempt = self.snd.fin_retransmit, "Retransmitting FIN");
                self.output_update_rto(now);
            } else {
                tracing::warn!(id = %self.id, "FIN retransmission exhausted");
                self.cleanup(Some(TcpError::TimedOut));
            }
            return;
        }

        if self.snd.window == 0 {
            // The peer's window is closed, persist probing takes over
            self.retransmit.cancel();
            if !self.persist.is_armed() {
                self.persist_timeout = self.rto;
                self.persist.arm(now + self.persist_timeout);
            }
            return;
        }

        let Some(oldest) = self.snd.unacked.front() else {
            return;
        };
        let timeout = RetransmitTimeout {
            flight: self.snd.flight_size(),
            first_transmission: oldest.nr_transmits == 0,
        };
        let exhausted = oldest.nr_transmits >= MAX_NR_RETRANSMIT;
        self.congestion.on_retransmit_timeout(&timeout);
        // RFC 6582 step 4
        self.snd.recover = self.snd.nxt - 1;
        self.exit_fast_recovery();

        if exhausted {
            tracing::warn!(id = %self.id, "Data retransmission exhausted");
            return self.cleanup(Some(TcpError::TimedOut));
        }
        if let Some(oldest) = self.snd.unacked.front_mut() {
            oldest.nr_transmits += 1;
        }
        tracing::debug!(id = %self.id, seq = %self.snd.una, rto = ?self.rto, "Retransmission timeout");
        self.output_one(now, true);
        self.output_update_rto(now);
    }

    fn fast_retransmit(&mut self, now: Instant) {
        if let Some(oldest) = self.snd.unacked.front_mut() {
            oldest.nr_transmits += 1;
            self.output_one(now, true);
            self.output();
        }
    }

    /// Sends a one byte probe into a zero window and backs off, RFC 1122
    /// section 4.2.2.17.
    fn on_persist_timeout(&mut self, now: Instant) {
        tracing::trace!(id = %self.id, "Persist timer fired");
        if self.snd.unacked.is_empty() {
            self.snd.window_probe = true;
            self.snd.zero_window_probing_out += 1;
            self.output_one(now, false);
            self.snd.window_probe = false;
        } else {
            // Probe again with the first unacknowledged byte
            self.output_window_probe();
        }
        self.output();
        self.persist_timeout = (self.persist_timeout * 2).min(RTO_MAX);
        self.persist.arm(now + self.persist_timeout);
    }

    /// Resends the byte at SND.UNA without taking new data.
    fn output_window_probe(&mut self) {
        let Some(oldest) = self.snd.unacked.front() else {
            return;
        };
        let text = oldest.packet.share(..1);
        self.delayed_ack.cancel();
        let header = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, self.snd.una)
            .wnd(self.advertised_window())
            .ack(self.rcv.nxt)
            .psh()
            .finish();
        self.packetq.push_back(Segment::new(header, text));
    }

    /// RFC 6298 section 2.
    fn update_rto(&mut self, tx_time: Instant, now: Instant) {
        let r = now.saturating_duration_since(tx_time);
        match self.snd.srtt {
            None => {
                self.snd.rttvar = r / 2;
                self.snd.srtt = Some(r);
            }
            Some(srtt) => {
                let delta = if srtt > r { srtt - r } else { r - srtt };
                self.snd.rttvar = self.snd.rttvar * 3 / 4 + delta / 4;
                self.snd.srtt = Some(srtt * 7 / 8 + r / 8);
            }
        }
        let srtt = self.snd.srtt.unwrap_or(r);
        self.rto = (srtt + RTO_CLK_GRANULARITY.max(self.snd.rttvar * 4)).clamp(RTO_MIN, RTO_MAX);
    }

    fn exit_fast_recovery(&mut self) {
        self.snd.dupacks = 0;
        self.snd.limited_transfer = 0;
        self.snd.partial_ack = 0;
    }

    ///////////////////////////////////////////////////////////////////////////
    // Transitions
    ///////////////////////////////////////////////////////////////////////////

    fn set_state(&mut self, state: State) {
        tracing::trace!(id = %self.id, from = %self.state, to = %state, "State transition");
        self.state = state;
    }

    fn do_syn_sent(&mut self, now: Instant) {
        self.set_state(State::SynSent);
        self.snd.syn_tx_time = Some(now);
        self.output();
    }

    fn do_syn_received(&mut self, now: Instant) {
        self.set_state(State::SynReceived);
        self.snd.syn_tx_time = Some(now);
        self.output();
    }

    fn do_established(&mut self, now: Instant) {
        self.set_state(State::Established);
        // Nothing but the SYN was outstanding
        self.retransmit.cancel();
        if self.snd.syn_retransmit == 0 {
            if let Some(syn_tx_time) = self.snd.syn_tx_time {
                self.update_rto(syn_tx_time, now);
            }
        }
        self.connect_done.resolve(Ok(()));
    }

    fn do_local_fin_acked(&mut self) {
        self.snd.una += 1;
        self.snd.nxt += 1;
    }

    fn do_time_wait(&mut self, now: Instant) {
        self.set_state(State::TimeWait);
        self.retransmit.cancel();
        self.persist.cancel();
        self.delayed_ack.cancel();
        self.time_wait.arm(now + self.config.time_wait);
    }

    fn do_reset(&mut self) {
        self.cleanup(Some(TcpError::ConnectionReset));
    }

    fn do_closed(&mut self) {
        self.cleanup(None);
    }

    /// Sends the FIN once a requested close finds all data acknowledged.
    fn check_close(&mut self, now: Instant) {
        if !self.close_requested
            || self.snd.closed
            || !self.state.is_any_of(State::Established | State::CloseWait)
            || !self.all_data_acked()
        {
            return;
        }
        self.snd.closed = true;
        match self.state {
            State::CloseWait => self.set_state(State::LastAck),
            _ => self.set_state(State::FinWait1),
        }
        // The FIN is queued directly
        self.output_one(now, false);
        self.output();
    }

    fn signal_all_data_acked(&mut self) {
        if self.all_data_acked() {
            self.snd.all_data_acked.resolve(Ok(()));
        }
    }

    fn signal_send_available(&mut self) {
        if self.snd.has_queue_space() {
            self.snd.send_available.resolve(Ok(()));
        }
    }

    /// Enters CLOSED, flushes every queue and releases every waiter. With a
    /// `cause` the waiters fail with it, otherwise the close was orderly.
    fn cleanup(&mut self, cause: Option<TcpError>) {
        tracing::debug!(id = %self.id, state = %self.state, ?cause, "Connection closed");
        self.set_state(State::Closed);
        self.snd.unsent.clear();
        self.snd.unsent_len = 0;
        self.snd.unacked.clear();
        self.rcv.out_of_order.clear();
        self.rcv.data.clear();
        self.packetq.clear();
        self.retransmit.cancel();
        self.persist.cancel();
        self.delayed_ack.cancel();
        self.time_wait.cancel();
        match cause {
            Some(error) => {
                self.rcv.data_received.resolve(Err(error));
                self.snd.all_data_acked.resolve(Err(error));
                self.snd.send_available.resolve(Err(error));
                self.connect_done.resolve(Err(error));
            }
            None => {
                self.rcv.data_received.resolve(Ok(()));
                self.snd.all_data_acked.resolve(Ok(()));
                self.snd.send_available.resolve(Err(TcpError::ConnectionReset));
                self.connect_done.resolve(Err(TcpError::ConnectionReset));
            }
        }
    }

    fn respond_with_reset(&mut self, segment: &Segment) {
        if let Some(reset) = segment_arrives_closed(segment) {
            self.resets.push(reset);
        }
    }
}

/// The reset answering a segment, RFC 793 section 3.4. Resets are never
/// answered.
fn reset_for(header: &TcpHeader, text_len: u32) -> Option<TcpHeader> {
    if header.ctl.rst() {
        return None;
    }
    let reset = if header.ctl.ack() {
        // <SEQ=SEG.ACK><CTL=RST>
        TcpHeaderBuilder::new(header.dst_port, header.src_port, header.ack).rst()
    } else {
        // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
        let seg_len = text_len + header.ctl.syn() as u32 + header.ctl.fin() as u32;
        TcpHeaderBuilder::new(header.dst_port, header.src_port, SeqNumber::new(0))
            .rst()
            .ack(header.seq + seg_len)
    };
    Some(reset.finish())
}

/// Handles a segment for which no connection or listener exists, 3.10.7.1.
pub fn segment_arrives_closed(segment: &Segment) -> Option<Segment> {
    reset_for(&segment.header, segment.text.len() as u32)
        .map(|reset| Segment::new(reset, Message::default()))
}

pub enum ListenResult {
    Response(Segment),
    Tcb(Box<Tcb>),
}

impl ListenResult {
    pub fn response(self) -> Option<Segment> {
        match self {
            ListenResult::Response(response) => Some(response),
            ListenResult::Tcb(_) => None,
        }
    }

    pub fn tcb(self) -> Option<Box<Tcb>> {
        match self {
            ListenResult::Response(_) => None,
            ListenResult::Tcb(tcb) => Some(tcb),
        }
    }
}

/// Handles a segment addressed to a listening port, 3.10.7.2. `id` names
/// the connection the segment would open.
pub fn segment_arrives_listen(
    segment: Segment,
    id: ConnectionId,
    iss: SeqNumber,
    config: TcbConfig,
    now: Instant,
) -> Option<ListenResult> {
    let header = segment.header;

    // First, an RST could not be valid
    if header.ctl.rst() {
        return None;
    }

    // Second, any acknowledgment is bad
    if header.ctl.ack() {
        return segment_arrives_closed(&segment).map(ListenResult::Response);
    }

    // Third, a SYN opens the connection. Security is ignored and any text
    // is dropped, the peer retransmits it.
    if header.ctl.syn() {
        let mut tcb = Tcb::new(id, Initiation::Listen, iss, config);
        tcb.rcv.nxt = header.seq + 1;
        tcb.rcv.irs = header.seq;
        tcb.offer_window_scale = header.options.window_scale.is_some();
        tcb.init_from_options(&header);
        tcb.do_syn_received(now);
        return Some(ListenResult::Tcb(Box::new(tcb)));
    }

    // Fourth, drop anything else
    None
}
