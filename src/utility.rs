//! Byte-level helpers shared by the segment codec and the demultiplexer.

/// A calculator for the Internet checksum used by TCP and its pseudo-header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u16);

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `u16` to the one's-complement sum.
    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    /// Adds the `u16` formed by two bytes in network order.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s by splitting four bytes in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds every byte pair from the iterator. An odd trailing byte is padded
    /// with zero.
    pub fn accumulate_remainder(&mut self, mut payload: impl Iterator<Item = u8>) {
        while let Some(a) = payload.next() {
            self.add_u8(a, payload.next().unwrap_or(0));
        }
    }

    /// The folded sum without the final complement. Hardware that finishes
    /// the checksum expects this value in the checksum field.
    pub fn partial(&self) -> u16 {
        self.0
    }

    /// Computes the final checksum value.
    pub fn as_u16(&self) -> u16 {
        match self.0 {
            // Of the two one's complement zeros, pick the nonzero one so that
            // a computed checksum is never mistaken for an unused one.
            0xffff => 0xffff,
            sum => !sum,
        }
    }
}

/// An extension trait for `Iterator<Item = u8>` that reads big-endian
/// numbers off the front of the iterator.
pub trait BytesExt: Iterator<Item = u8> {
    fn next_u8(&mut self) -> Option<u8> {
        self.next()
    }

    fn next_u16_be(&mut self) -> Option<u16> {
        let arr = [self.next()?, self.next()?];
        Some(u16::from_be_bytes(arr))
    }

    fn next_u32_be(&mut self) -> Option<u32> {
        let arr = [self.next()?, self.next()?, self.next()?, self.next()?];
        Some(u32::from_be_bytes(arr))
    }

    /// Collects the next `N` items of the iterator into an array.
    /// Returns `None` if there were fewer than `N` bytes left.
    fn next_n<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut result = [0; N];
        for element in &mut result {
            *element = self.next()?
        }
        Some(result)
    }
}

impl<T: Iterator<Item = u8>> BytesExt for T {}

/// Toeplitz hash of `data` under `key`, the function NICs use for
/// receive-side steering. Keys shorter than `data.len() + 4` bytes are
/// treated as zero-extended.
pub fn toeplitz_hash(key: &[u8], data: &[u8]) -> u32 {
    let key_byte = |i: usize| key.get(i).copied().unwrap_or(0);
    let mut window = u32::from_be_bytes([key_byte(0), key_byte(1), key_byte(2), key_byte(3)]);
    let mut hash = 0u32;
    for (i, byte) in data.iter().enumerate() {
        let next = key_byte(i + 4);
        for bit in (0..8).rev() {
            if byte & (1 << bit) != 0 {
                hash ^= window;
            }
            window = (window << 1) | ((next >> bit) & 1) as u32;
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_ext() {
        let arr = [0xFF, 0x01, 0x09, 0x69];
        let mut iter = arr.iter().cloned();
        assert_eq!(iter.next_u16_be(), Some(0xFF01));
        assert_eq!(iter.next_u8(), Some(0x09));
        assert_eq!(iter.next_u32_be(), None);
    }

    #[test]
    fn checksum_of_rfc1071_example() {
        // RFC 1071 section 3: the sum of these words is 0xddf2.
        let mut checksum = Checksum::new();
        checksum.accumulate_remainder([0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7].into_iter());
        assert_eq!(checksum.partial(), 0xddf2);
        assert_eq!(checksum.as_u16(), !0xddf2);
    }

    #[test]
    fn checksum_pads_odd_length() {
        let mut odd = Checksum::new();
        odd.accumulate_remainder([0x12, 0x34, 0x56].into_iter());
        let mut even = Checksum::new();
        even.accumulate_remainder([0x12, 0x34, 0x56, 0x00].into_iter());
        assert_eq!(odd, even);
    }

    #[test]
    fn toeplitz_matches_microsoft_verification_suite() {
        // Key and first IPv4/TCP vector from the Microsoft RSS verification
        // suite: 66.9.149.187:2794 -> 161.142.100.80:1766 hashes to 0x51ccc178.
        const KEY: [u8; 40] = [
            0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3,
            0x8f, 0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3,
            0x80, 0x30, 0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
        ];
        let data = [66, 9, 149, 187, 161, 142, 100, 80, 0x0a, 0xea, 0x06, 0xe6];
        assert_eq!(toeplitz_hash(&KEY, &data), 0x51ccc178);
    }
}
