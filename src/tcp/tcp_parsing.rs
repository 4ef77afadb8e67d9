//! Parsing and serialization of TCP headers and their options.

use super::seq::SeqNumber;
use crate::{
    ipv4_address::Ipv4Address,
    utility::{BytesExt, Checksum},
};
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without options
const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without options
pub const BASE_HEADER_OCTETS: usize = BASE_HEADER_WORDS as usize * 4;
/// The largest header the 4-bit data offset can describe
const MAX_HEADER_OCTETS: usize = 15 * 4;
/// IP protocol number for TCP, used in the pseudo-header
const PROTOCOL_TCP: u8 = 6;

/// Option kinds understood by the codec
mod option_kind {
    pub const EOL: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const TIMESTAMPS: u8 = 8;
}

/// The data for a TCP header
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number
    pub src_port: u16,
    /// The destination port number
    pub dst_port: u16,
    /// The sequence number of the first data octet in this segment (except when
    /// SYN is present). If SYN is present the sequence number is the initial
    /// sequence number (ISN) and the first data octet is ISN+1.
    pub seq: SeqNumber,
    /// If the ACK control bit is set this field contains the value of the next
    /// sequence number the sender of the segment is expecting to receive.
    pub ack: SeqNumber,
    /// The number of 32-bit words in the TCP header, options included
    pub data_offset: u8,
    /// Flags that adjust the how segments are handled
    pub ctl: Control,
    /// The unscaled receive window of the sender
    pub wnd: u16,
    /// The header checksum
    pub checksum: u16,
    /// Offset from `seq` to the octet following urgent data. Ignored.
    pub urg: u16,
    /// Options carried by the header
    pub options: TcpOptions,
}

impl TcpHeader {
    /// Parses a serialized TCP header and verifies the checksum over the
    /// pseudo-header and the whole segment.
    pub fn from_bytes(
        packet: impl Iterator<Item = u8>,
        packet_len: usize,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        Self::parse(packet, packet_len, Some((src_address, dst_address)))
    }

    /// Parses a serialized TCP header whose checksum the receiving hardware
    /// already verified.
    pub fn from_bytes_offloaded(
        packet: impl Iterator<Item = u8>,
        packet_len: usize,
    ) -> Result<Self, ParseError> {
        Self::parse(packet, packet_len, None)
    }

    fn parse(
        mut packet: impl Iterator<Item = u8>,
        packet_len: usize,
        addresses: Option<(Ipv4Address, Ipv4Address)>,
    ) -> Result<Self, ParseError> {
        if packet_len < BASE_HEADER_OCTETS {
            Err(ParseError::HeaderTooShort)?
        }
        let base: [u8; BASE_HEADER_OCTETS] =
            packet.next_n().ok_or(ParseError::HeaderTooShort)?;
        let mut fields = base.iter().cloned();
        let mut next_u16 = || fields.next_u16_be().ok_or(ParseError::HeaderTooShort);
        let src_port = next_u16()?;
        let dst_port = next_u16()?;
        let seq = SeqNumber::new(u32::from_be_bytes([base[4], base[5], base[6], base[7]]));
        let ack = SeqNumber::new(u32::from_be_bytes([base[8], base[9], base[10], base[11]]));
        let data_offset = base[12] >> 4;
        let ctl = Control::from(base[13] & 0b11_1111);
        let wnd = u16::from_be_bytes([base[14], base[15]]);
        let checksum = u16::from_be_bytes([base[16], base[17]]);
        let urg = u16::from_be_bytes([base[18], base[19]]);

        let header_len = data_offset as usize * 4;
        if data_offset < BASE_HEADER_WORDS || header_len > packet_len {
            Err(ParseError::BadDataOffset(data_offset))?
        }
        let option_bytes: Vec<u8> = packet
            .by_ref()
            .take(header_len - BASE_HEADER_OCTETS)
            .collect();
        if option_bytes.len() != header_len - BASE_HEADER_OCTETS {
            Err(ParseError::HeaderTooShort)?
        }
        let options = TcpOptions::parse(&option_bytes)?;

        if let Some((src_address, dst_address)) = addresses {
            let mut sum = pseudo_header(src_address, dst_address, packet_len)?;
            sum.accumulate_remainder(base.iter().cloned());
            sum.accumulate_remainder(option_bytes.iter().cloned());
            sum.accumulate_remainder(&mut packet);
            // A correct checksum makes the one's complement sum all ones
            if sum.partial() != 0xffff {
                Err(ParseError::Checksum {
                    actual: !sum.partial(),
                    expected: checksum,
                })?
            }
        }

        Ok(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            ctl,
            wnd,
            checksum,
            urg,
            options,
        })
    }

    /// Size of the header in bytes
    pub fn bytes(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Convert the header to its native serialized format, ready to attach to a
    /// packet and send over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes());
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.get().to_be_bytes());
        out.extend_from_slice(&self.ack.get().to_be_bytes());
        out.push(self.data_offset << 4);
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urg.to_be_bytes());
        self.options.serialize_into(&mut out);
        out
    }

    /// Fills in the checksum over the pseudo-header, this header and `text`.
    pub fn compute_checksum(
        &mut self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        text: impl Iterator<Item = u8>,
        text_len: usize,
    ) -> Result<(), BuildHeaderError> {
        self.checksum = 0;
        let mut sum = pseudo_header(src_address, dst_address, self.bytes() + text_len)
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;
        sum.accumulate_remainder(self.serialize().into_iter());
        sum.accumulate_remainder(text);
        self.checksum = sum.as_u16();
        Ok(())
    }

    /// Stores only the folded pseudo-header sum in the checksum field, leaving
    /// the rest of the computation to transmit offload.
    pub fn compute_offloaded_checksum(
        &mut self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        text_len: usize,
    ) -> Result<(), BuildHeaderError> {
        let sum = pseudo_header(src_address, dst_address, self.bytes() + text_len)
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;
        self.checksum = sum.partial();
        Ok(())
    }
}

fn pseudo_header(
    src_address: Ipv4Address,
    dst_address: Ipv4Address,
    tcp_len: usize,
) -> Result<Checksum, ParseError> {
    let mut checksum = Checksum::new();
    checksum.add_u32(src_address.into());
    checksum.add_u32(dst_address.into());
    checksum.add_u8(0, PROTOCOL_TCP);
    checksum.add_u16(tcp_len.try_into().map_err(|_| ParseError::PacketTooLong)?);
    Ok(checksum)
}

/// An error that occurred while parsing a TCP header. Segments failing to
/// parse are dropped without a response.
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The packet length could not fit into a u16")]
    PacketTooLong,
    #[error("Data offset {0} does not describe a header inside the packet")]
    BadDataOffset(u8),
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
    #[error("Option of kind {kind} runs past the end of the header")]
    TruncatedOption { kind: u8 },
}

/// An error that occurred while building a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The TCP payload is longer than can fit into a single packet")]
    OverlyLongPayload,
}

/// The timestamps option: sender's clock value and the echoed peer value.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Timestamps {
    pub value: u32,
    pub echo: u32,
}

/// TCP options recognized by the stack. Unknown kinds are skipped.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    /// Parsed only; retransmission does not use SACK.
    pub sack_permitted: bool,
    pub timestamps: Option<Timestamps>,
}

impl TcpOptions {
    /// Parses the option bytes that follow the fixed header.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut options = Self::default();
        let mut i = 0;
        while i < bytes.len() {
            let kind = bytes[i];
            match kind {
                option_kind::EOL => break,
                option_kind::NOP => {
                    i += 1;
                    continue;
                }
                _ => {}
            }
            let len = *bytes
                .get(i + 1)
                .ok_or(ParseError::TruncatedOption { kind })? as usize;
            if len < 2 || i + len > bytes.len() {
                Err(ParseError::TruncatedOption { kind })?
            }
            let body = &bytes[i + 2..i + len];
            match (kind, body.len()) {
                (option_kind::MSS, 2) => options.mss = Some(u16::from_be_bytes([body[0], body[1]])),
                (option_kind::WINDOW_SCALE, 1) => options.window_scale = Some(body[0]),
                (option_kind::SACK_PERMITTED, 0) => options.sack_permitted = true,
                (option_kind::TIMESTAMPS, 8) => {
                    options.timestamps = Some(Timestamps {
                        value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                        echo: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                    })
                }
                // Known kinds with the wrong length are ignored like unknown ones
                _ => {}
            }
            i += len;
        }
        Ok(options)
    }

    /// The number of bytes the serialized options take, a multiple of four.
    pub fn len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() {
            len += 4;
        }
        if self.window_scale.is_some() {
            len += 4;
        }
        if self.sack_permitted {
            len += 4;
        }
        if self.timestamps.is_some() {
            len += 12;
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the options, each group NOP-padded to a 32-bit boundary.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        if let Some(mss) = self.mss {
            out.extend_from_slice(&[option_kind::MSS, 4]);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(shift) = self.window_scale {
            out.extend_from_slice(&[option_kind::NOP, option_kind::WINDOW_SCALE, 3, shift]);
        }
        if self.sack_permitted {
            out.extend_from_slice(&[option_kind::NOP, option_kind::NOP, option_kind::SACK_PERMITTED, 2]);
        }
        if let Some(timestamps) = self.timestamps {
            out.extend_from_slice(&[option_kind::NOP, option_kind::NOP, option_kind::TIMESTAMPS, 10]);
            out.extend_from_slice(&timestamps.value.to_be_bytes());
            out.extend_from_slice(&timestamps.echo.to_be_bytes());
        }
    }
}

/// Used for building a TCP header
#[derive(Debug)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    /// Initialize the TCP header with defaults and the given values
    pub fn new(src_port: u16, dst_port: u16, seq: SeqNumber) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            wnd: 0,
            ack: SeqNumber::default(),
            urg: 0,
            ctl: Control::default(),
            options: TcpOptions::default(),
            data_offset: BASE_HEADER_WORDS,
            checksum: 0,
        })
    }

    /// Set the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Set the acknowledgement number
    pub fn ack(mut self, ack: SeqNumber) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    pub fn psh(mut self) -> Self {
        self.0.ctl.set_psh(true);
        self
    }

    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    pub fn options(mut self, options: TcpOptions) -> Self {
        self.0.options = options;
        self
    }

    /// The header with its data offset filled in. The checksum stays zero
    /// until [`TcpHeader::compute_checksum`] runs at transmission.
    pub fn finish(self) -> TcpHeader {
        let mut header = self.0;
        let octets = BASE_HEADER_OCTETS + header.options.len();
        debug_assert!(octets <= MAX_HEADER_OCTETS);
        header.data_offset = (octets / 4) as u8;
        header
    }

    /// The finished header with its checksum computed over `text`.
    pub fn build(
        self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        text: impl Iterator<Item = u8>,
        text_len: usize,
    ) -> Result<TcpHeader, BuildHeaderError> {
        let mut header = self.finish();
        header.compute_checksum(src_address, dst_address, text, text_len)?;
        Ok(header)
    }
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    const FIN: u8 = 0;
    const SYN: u8 = 1;
    const RST: u8 = 2;
    const PSH: u8 = 3;
    const ACK: u8 = 4;
    const URG: u8 = 5;

    /// Create a new Control with the given bits
    pub const fn new(urg: bool, ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(
            fin as u8
                | (syn as u8) << Self::SYN
                | (rst as u8) << Self::RST
                | (psh as u8) << Self::PSH
                | (ack as u8) << Self::ACK
                | (urg as u8) << Self::URG,
        )
    }

    /// Get whether the urgent pointer field is significant
    pub const fn urg(self) -> bool {
        self.bit(Self::URG)
    }

    /// Get whether the acknowledgment field significant
    pub const fn ack(self) -> bool {
        self.bit(Self::ACK)
    }

    pub fn set_ack(&mut self, state: bool) {
        self.set_bit(Self::ACK, state);
    }

    /// Get whether the push function is enabled
    pub const fn psh(self) -> bool {
        self.bit(Self::PSH)
    }

    pub fn set_psh(&mut self, state: bool) {
        self.set_bit(Self::PSH, state);
    }

    /// Get whether to reset the connection
    pub const fn rst(self) -> bool {
        self.bit(Self::RST)
    }

    pub fn set_rst(&mut self, state: bool) {
        self.set_bit(Self::RST, state);
    }

    /// Get whether to synchronize sequence numbers
    pub const fn syn(self) -> bool {
        self.bit(Self::SYN)
    }

    pub fn set_syn(&mut self, state: bool) {
        self.set_bit(Self::SYN, state);
    }

    /// Get whether there is no more data to send
    pub const fn fin(self) -> bool {
        self.bit(Self::FIN)
    }

    pub fn set_fin(&mut self, state: bool) {
        self.set_bit(Self::FIN, state);
    }

    const fn bit(self, bit: u8) -> bool {
        (self.0 >> bit) & 0b1 == 1
    }

    fn set_bit(&mut self, bit: u8, state: bool) {
        self.0 = (self.0 & !(1 << bit)) | ((state as u8) << bit);
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.urg(), "URG"),
            (self.ack(), "ACK"),
            (self.psh(), "PSH"),
            (self.rst(), "RST"),
            (self.syn(), "SYN"),
            (self.fin(), "FIN"),
        ];
        write!(f, "Control(")?;
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{name}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"Hello, world!";
    const SRC_ADDRESS: Ipv4Address = Ipv4Address::LOCALHOST;
    const DST_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const SRC_PORT: u16 = 0xcafe;
    const DST_PORT: u16 = 0xbabe;
    const SEQUENCE: u32 = 123456789;
    const WINDOW: u16 = 1024;
    const ACKNOWLEDGEMENT: u32 = 10;

    fn build_expected() -> (etherparse::TcpHeader, Vec<u8>) {
        let mut expected = etherparse::TcpHeader::new(SRC_PORT, DST_PORT, SEQUENCE, WINDOW);
        expected.acknowledgment_number = ACKNOWLEDGEMENT;
        expected.ack = true;
        expected.psh = true;
        expected.checksum = expected
            .calc_checksum_ipv4_raw(SRC_ADDRESS.into(), DST_ADDRESS.into(), PAYLOAD)
            .unwrap();

        let mut serial = vec![];
        expected.write(&mut serial).unwrap();
        (expected, serial)
    }

    #[test]
    fn parses_packet() {
        let control = Control::new(false, true, true, false, false, false);
        let (expected, serial) = build_expected();

        let len = serial.len() + PAYLOAD.len();
        let actual = TcpHeader::from_bytes(
            serial.into_iter().chain(PAYLOAD.iter().cloned()),
            len,
            SRC_ADDRESS,
            DST_ADDRESS,
        )
        .unwrap();

        assert_eq!(actual.src_port, SRC_PORT);
        assert_eq!(actual.dst_port, DST_PORT);
        assert_eq!(actual.seq, SeqNumber::new(SEQUENCE));
        assert_eq!(actual.ack, SeqNumber::new(ACKNOWLEDGEMENT));
        assert_eq!(actual.ctl, control);
        assert_eq!(actual.wnd, WINDOW);
        assert_eq!(actual.checksum, expected.checksum);
        assert_eq!(actual.urg, 0);
        assert_eq!(actual.bytes(), BASE_HEADER_OCTETS);
        assert!(actual.options.is_empty());
    }

    #[test]
    fn builds_packet() {
        let (_, expected) = build_expected();

        let actual = TcpHeaderBuilder::new(SRC_PORT, DST_PORT, SeqNumber::new(SEQUENCE))
            .wnd(WINDOW)
            .psh()
            .ack(SeqNumber::new(ACKNOWLEDGEMENT))
            .build(
                SRC_ADDRESS,
                DST_ADDRESS,
                PAYLOAD.iter().cloned(),
                PAYLOAD.len(),
            )
            .unwrap()
            .serialize();

        assert_eq!(expected, actual);
    }

    #[test]
    fn parses_syn_options_from_etherparse() {
        let mut syn = etherparse::TcpHeader::new(SRC_PORT, DST_PORT, SEQUENCE, WINDOW);
        syn.syn = true;
        syn.set_options(&[
            etherparse::TcpOptionElement::MaximumSegmentSize(1460),
            etherparse::TcpOptionElement::SelectiveAcknowledgementPermitted,
            etherparse::TcpOptionElement::Timestamp(7, 0),
            etherparse::TcpOptionElement::Noop,
            etherparse::TcpOptionElement::WindowScale(7),
        ])
        .unwrap();
        syn.checksum = syn
            .calc_checksum_ipv4_raw(SRC_ADDRESS.into(), DST_ADDRESS.into(), &[])
            .unwrap();
        let mut serial = vec![];
        syn.write(&mut serial).unwrap();

        let len = serial.len();
        let actual =
            TcpHeader::from_bytes(serial.into_iter(), len, SRC_ADDRESS, DST_ADDRESS).unwrap();
        assert!(actual.ctl.syn());
        assert_eq!(actual.options.mss, Some(1460));
        assert_eq!(actual.options.window_scale, Some(7));
        assert!(actual.options.sack_permitted);
        assert_eq!(
            actual.options.timestamps,
            Some(Timestamps { value: 7, echo: 0 })
        );
    }

    #[test]
    fn options_survive_serialization() {
        let options = TcpOptions {
            mss: Some(1460),
            window_scale: Some(7),
            sack_permitted: false,
            timestamps: None,
        };
        let header = TcpHeaderBuilder::new(1, 2, SeqNumber::new(3))
            .syn()
            .options(options)
            .build(SRC_ADDRESS, DST_ADDRESS, std::iter::empty(), 0)
            .unwrap();
        assert_eq!(header.data_offset, 7);
        let serial = header.serialize();
        assert_eq!(&serial[20..], &[2, 4, 0x05, 0xb4, 1, 3, 3, 7]);
        let parsed =
            TcpHeader::from_bytes(serial.iter().cloned(), serial.len(), SRC_ADDRESS, DST_ADDRESS)
                .unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_corrupted_payload() {
        let (_, serial) = build_expected();
        let mut corrupted = PAYLOAD.to_vec();
        corrupted[0] ^= 0x40;
        let len = serial.len() + corrupted.len();
        let result =
            TcpHeader::from_bytes(serial.into_iter().chain(corrupted), len, SRC_ADDRESS, DST_ADDRESS);
        assert!(matches!(result, Err(ParseError::Checksum { .. })));
    }

    #[test]
    fn rejects_short_header() {
        let result = TcpHeader::from_bytes_offloaded([0u8; 12].into_iter(), 12);
        assert_eq!(result, Err(ParseError::HeaderTooShort));
    }

    #[test]
    fn rejects_truncated_option() {
        // MSS claims four bytes but only three remain
        assert_eq!(
            TcpOptions::parse(&[1, 2, 4, 5]),
            Err(ParseError::TruncatedOption { kind: 2 })
        );
        assert_eq!(
            TcpOptions::parse(&[3]),
            Err(ParseError::TruncatedOption { kind: 3 })
        );
        assert_eq!(
            TcpOptions::parse(&[8, 1, 0, 0]),
            Err(ParseError::TruncatedOption { kind: 8 })
        );
    }

    #[test]
    fn stops_at_end_of_list() {
        let options = TcpOptions::parse(&[2, 4, 2, 0, 0, 3, 3, 7]).unwrap();
        assert_eq!(options.mss, Some(512));
        assert_eq!(options.window_scale, None);
    }

    #[test]
    fn rejects_offset_past_packet() {
        let mut serial = TcpHeaderBuilder::new(1, 2, SeqNumber::new(3))
            .finish()
            .serialize();
        serial[12] = 6 << 4;
        let len = serial.len();
        assert_eq!(
            TcpHeader::from_bytes_offloaded(serial.into_iter(), len),
            Err(ParseError::BadDataOffset(6))
        );
    }

    #[test]
    fn control_works() {
        let control = Control::new(true, false, true, false, true, false);
        assert!(control.urg());
        assert!(!control.ack());
        assert!(control.psh());
        assert!(!control.rst());
        assert!(control.syn());
        assert!(!control.fin());
        assert_eq!(format!("{control:?}"), "Control(URG, PSH, SYN)");

        let control = {
            let mut control = Control::default();
            control.set_ack(true);
            control.set_rst(true);
            control.set_fin(true);
            control
        };
        assert!(control.ack());
        assert!(control.rst());
        assert!(control.fin());
        assert!(!control.syn());
    }
}
