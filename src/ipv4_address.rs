use std::fmt::{self, Display};

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `0.0.0.0`.
    pub const CURRENT_NETWORK: Self = Self([0u8, 0, 0, 0]);

    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127u8, 0, 0, 1]);

    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    pub fn to_u32(self) -> u32 {
        self.into()
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

/// An address and port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
