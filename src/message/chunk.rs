use std::sync::Arc;

/// A view into a reference-counted byte buffer. Segments in the send,
/// retransmission and reassembly queues share chunks instead of copying.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(super) start: usize,
    pub(super) end: usize,
    pub(super) bytes: Arc<[u8]>,
}

impl Chunk {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            start: 0,
            end: bytes.len(),
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(vector: Vec<u8>) -> Self {
        Self::new(vector)
    }
}

impl From<&[u8]> for Chunk {
    fn from(slice: &[u8]) -> Self {
        Self::new(slice)
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(array: &[u8; N]) -> Self {
        Self::new(array.as_slice())
    }
}

impl<const N: usize> From<[u8; N]> for Chunk {
    fn from(array: [u8; N]) -> Self {
        Self::new(array.as_slice())
    }
}

impl From<&str> for Chunk {
    fn from(string: &str) -> Self {
        Self::new(string.as_bytes())
    }
}
