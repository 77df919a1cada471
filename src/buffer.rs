//! Outbound datagram buffers.
//!
//! Callers hand the send pipeline already-encrypted datagrams as chains of
//! immutable segments. A chain is the memory-descriptor contract between this
//! layer and the provider: segments are reference-counted, so snapshotting a
//! chain for a fallback per-datagram send is a cheap pointer copy, and the
//! backing storage lives until the last in-flight reference completes.

use bytes::Bytes;

/// A chain of immutable data segments forming one contiguous payload.
#[derive(Debug, Clone, Default)]
pub struct DataChain {
    segments: Vec<Bytes>,
    len: usize,
}

impl DataChain {
    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        let len = segments.iter().map(Bytes::len).sum();
        Self { segments, len }
    }

    /// Allocate a single-segment chain holding a copy of `data`.
    pub fn copy_from(data: &[u8]) -> Self {
        Self {
            segments: vec![Bytes::copy_from_slice(data)],
            len: data.len(),
        }
    }

    /// Total payload length across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Flatten the chain into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}

impl From<Bytes> for DataChain {
    fn from(segment: Bytes) -> Self {
        let len = segment.len();
        Self {
            segments: vec![segment],
            len,
        }
    }
}

/// One encrypted datagram queued for transmission.
#[derive(Debug, Clone)]
pub struct TxDatagram {
    chain: DataChain,
}

impl TxDatagram {
    pub fn new(chain: DataChain) -> Self {
        Self { chain }
    }

    pub fn from_bytes(payload: Bytes) -> Self {
        Self {
            chain: payload.into(),
        }
    }

    /// Wire length of the datagram payload.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn chain(&self) -> &DataChain {
        &self.chain
    }
}
