use super::{reassembly::Reassembly, waiter::Signal};
use crate::{message::Message, tcp::seq::SeqNumber};
use std::collections::VecDeque;

//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, Default)]
pub struct ReceiveState {
    /// Next sequence number expected on an incoming segment, and is the
    /// left or lower edge of the receive window
    pub nxt: SeqNumber,
    /// The number of bytes we can buffer from the peer, scaled
    pub window: u32,
    pub window_scale: u8,
    /// The largest segment we accept
    pub mss: u32,
    /// Initial receive sequence number
    pub irs: SeqNumber,
    /// In-order data not yet read by the user
    pub data: VecDeque<Message>,
    pub out_of_order: Reassembly,
    pub data_received: Signal,
}

impl ReceiveState {
    /// Whether `seq` lies in `RCV.NXT =< seq < RCV.NXT + RCV.WND`
    pub fn in_window(&self, seq: SeqNumber) -> bool {
        self.nxt <= seq && seq < self.nxt + self.window
    }

    /// Drains every in-order byte received so far.
    pub fn read(&mut self) -> Message {
        let mut out = Message::default();
        for message in self.data.drain(..) {
            out.append(message);
        }
        out
    }
}
