use crate::{message::Message, tcp::tcp_parsing::TcpHeader};

/// A parsed TCP header with the text that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// The length of the segment in sequence space, counting SYN and FIN
    pub fn seg_len(&self) -> u32 {
        self.text.len() as u32 + self.header.ctl.syn() as u32 + self.header.ctl.fin() as u32
    }

    pub fn into_inner(self) -> (TcpHeader, Message) {
        (self.header, self.text)
    }
}
