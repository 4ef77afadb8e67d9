use super::waiter::Signal;
use crate::{message::Message, tcp::seq::SeqNumber};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.UNA
//                             +SND.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission (send window)
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug)]
pub struct SendState {
    /// Oldest unacknowledged sequence number
    pub una: SeqNumber,
    /// Next sequence number to be sent. A FIN does not advance it until it
    /// is acknowledged.
    pub nxt: SeqNumber,
    /// The peer's receive window, scaled
    pub window: u32,
    pub window_scale: u8,
    /// The largest segment the peer accepts
    pub mss: u32,
    /// Segment sequence number used for last window update
    pub wl1: SeqNumber,
    /// Segment acknowledgment number used for last window update
    pub wl2: SeqNumber,
    /// Initial send sequence number
    pub iss: SeqNumber,
    /// Transmitted data waiting for acknowledgment, oldest first
    pub unacked: VecDeque<UnackedSegment>,
    /// Data accepted from the user but not yet segmentized
    pub unsent: VecDeque<Message>,
    /// Total length of `unsent`
    pub unsent_len: u32,
    /// Set once the FIN is queued, no more data may be sent
    pub closed: bool,
    /// Bytes of user data not yet acknowledged, bounded by `max_queue_space`
    pub current_queue_space: usize,
    pub max_queue_space: usize,
    pub srtt: Option<Duration>,
    pub rttvar: Duration,
    /// When the SYN first left, for the handshake round trip sample
    pub syn_tx_time: Option<Instant>,
    pub syn_retransmit: u16,
    pub fin_retransmit: u16,
    /// Duplicate acknowledgments since SND.UNA last moved
    pub dupacks: u16,
    /// Bytes sent under limited transmit during the current dupack episode
    pub limited_transfer: u32,
    /// Partial acknowledgments seen during the current fast recovery
    pub partial_ack: u32,
    /// Highest sequence number outstanding when loss recovery began
    pub recover: SeqNumber,
    /// Whether the next segment is a one byte zero window probe
    pub window_probe: bool,
    /// Zero window probes sent since the last window update
    pub zero_window_probing_out: u32,
    pub all_data_acked: Signal,
    pub send_available: Signal,
}

impl SendState {
    pub fn new(iss: SeqNumber, max_queue_space: usize) -> Self {
        Self {
            una: iss,
            nxt: iss + 1,
            window: 0,
            window_scale: 0,
            mss: 0,
            wl1: SeqNumber::default(),
            wl2: SeqNumber::default(),
            iss,
            unacked: VecDeque::new(),
            unsent: VecDeque::new(),
            unsent_len: 0,
            closed: false,
            current_queue_space: 0,
            max_queue_space,
            srtt: None,
            rttvar: Duration::ZERO,
            syn_tx_time: None,
            syn_retransmit: 0,
            fin_retransmit: 0,
            dupacks: 0,
            limited_transfer: 0,
            partial_ack: 0,
            recover: iss,
            window_probe: false,
            zero_window_probing_out: 0,
            all_data_acked: Signal::default(),
            send_available: Signal::default(),
        }
    }

    /// Bytes sent and not yet acknowledged
    pub fn flight_size(&self) -> u32 {
        self.unacked
            .iter()
            .map(|segment| segment.packet.len() as u32)
            .sum()
    }

    pub fn has_queue_space(&self) -> bool {
        self.max_queue_space > self.current_queue_space
    }

    /// Takes up to `len` bytes off the front of the unsent queue, merging
    /// queued messages and splitting the last one as needed.
    pub fn take_unsent(&mut self, len: u32) -> Message {
        let mut out = Message::default();
        let mut room = len as usize;
        while room > 0 {
            let Some(front) = self.unsent.front_mut() else {
                break;
            };
            if front.len() <= room {
                room -= front.len();
                if let Some(message) = self.unsent.pop_front() {
                    out.append(message);
                }
            } else {
                out.append(front.cut(room));
                room = 0;
            }
        }
        self.unsent_len -= out.len() as u32;
        out
    }
}

/// A transmitted segment that may need retransmission.
#[derive(Debug, Clone)]
pub struct UnackedSegment {
    /// The unacknowledged part of the segment text
    pub packet: Message,
    /// The length the segment had when first sent
    pub data_len: u32,
    pub nr_transmits: u16,
    pub tx_time: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_across_messages() {
        let mut snd = SendState::new(SeqNumber::new(0), 1000);
        for text in ["abc", "defg", "hi"] {
            snd.unsent_len += text.len() as u32;
            snd.unsent.push_back(text.into());
        }

        assert_eq!(snd.take_unsent(2).to_vec(), b"ab");
        assert_eq!(snd.take_unsent(6).to_vec(), b"cdefgh");
        assert_eq!(snd.unsent_len, 1);
        assert_eq!(snd.take_unsent(10).to_vec(), b"i");
        assert!(snd.take_unsent(10).is_empty());
        assert_eq!(snd.unsent_len, 0);
    }
}
