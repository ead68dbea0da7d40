//! Buffer Structures and Serialization
//!
//! A buffer is one datagram on the wire: an 8-byte fixed header, up to
//! `MAX_UPDATES` piggybacked acknowledgments, and a payload region. Data
//! buffers carry signal fragments as chunks, each introduced by a one-byte
//! `DataTag`.

use crate::sequence::{BufferId, KEEPALIVE_BUFFER_ID, UPDATE_BUFFER_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Wire protocol version
pub const VERSION: u8 = 1;

/// Size of the fixed part of the header
/// (version, type, id, retransmit count, update count)
pub const FIXED_HEADER_SIZE: usize = 8;

/// Size of one update entry on the wire
pub const UPDATE_SIZE: usize = 4;

/// Maximum number of updates a buffer may carry
pub const MAX_UPDATES: usize = 16;

/// Maximum number of updates piggybacked on a data buffer
pub const MAX_DATA_UPDATES: usize = 8;

/// Default buffer capacity in bytes
pub const DEFAULT_CAPACITY: usize = 4096;

/// Smallest capacity that still leaves room for a full data header,
/// a chunk tag and some encoder output
pub const MIN_CAPACITY: usize = 128;

/// Buffer type (second header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferType {
    /// Empty liveness probe
    KeepAlive = 1,
    /// Signal data and/or updates
    Data = 2,
    /// Connect handshake
    Connecting = 3,
    /// Accept handshake
    Accepting = 4,
}

impl BufferType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BufferType::KeepAlive),
            2 => Some(BufferType::Data),
            3 => Some(BufferType::Connecting),
            4 => Some(BufferType::Accepting),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is one of the handshake types
    pub fn is_handshake(self) -> bool {
        matches!(self, BufferType::Connecting | BufferType::Accepting)
    }
}

/// Chunk marker inside a data buffer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataTag {
    /// First fragment of a signal
    NewSignal = 1,
    /// Next fragment of the signal currently being received
    ContinuedSignal = 2,
    /// Resume a signal that was rotated away from earlier
    OldSignal = 3,
}

impl DataTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DataTag::NewSignal),
            2 => Some(DataTag::ContinuedSignal),
            3 => Some(DataTag::OldSignal),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Buffer parsing and building errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid buffer type: {0}")]
    InvalidType(u8),

    #[error("Too many updates: {0} (max {MAX_UPDATES})")]
    TooManyUpdates(usize),

    #[error("Datagram too large: {size} bytes (capacity {capacity})")]
    TooLarge { size: usize, capacity: usize },

    #[error("Invalid handshake payload")]
    InvalidHandshake,
}

/// Handshake payload carried by connect and accept buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Base port of the sender's service
    pub base_port: u16,
    /// Connect attempt tag (echoed back by the acceptor)
    pub epoch: u32,
}

impl Handshake {
    pub const SIZE: usize = 8;

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.base_port as u32);
        buf.put_u32(self.epoch);
    }

    pub fn parse(mut bytes: &[u8]) -> Result<Self, BufferError> {
        if bytes.len() != Self::SIZE {
            return Err(BufferError::InvalidHandshake);
        }
        let port = bytes.get_u32();
        let base_port = u16::try_from(port).map_err(|_| BufferError::InvalidHandshake)?;
        Ok(Handshake {
            base_port,
            epoch: bytes.get_u32(),
        })
    }
}

/// One datagram, either being assembled for sending or parsed on receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    buffer_type: BufferType,
    id: u32,
    retransmit_count: u8,
    updates: Vec<u32>,
    payload: BytesMut,
    capacity: usize,
}

impl Buffer {
    /// Create an empty buffer of the given type and capacity
    pub fn new(buffer_type: BufferType, capacity: usize) -> Self {
        Self::with_payload(buffer_type, capacity, BytesMut::new())
    }

    /// Create an empty buffer reusing pooled payload storage
    pub fn with_payload(buffer_type: BufferType, capacity: usize, mut payload: BytesMut) -> Self {
        payload.clear();
        Buffer {
            buffer_type,
            id: 0,
            retransmit_count: 0,
            updates: Vec::new(),
            payload,
            capacity,
        }
    }

    /// A keepalive buffer
    pub fn keepalive() -> Self {
        let mut buffer = Buffer::new(BufferType::KeepAlive, FIXED_HEADER_SIZE);
        buffer.id = KEEPALIVE_BUFFER_ID;
        buffer
    }

    /// An update-only buffer
    pub fn updates_only(capacity: usize) -> Self {
        let mut buffer = Buffer::new(BufferType::Data, capacity);
        buffer.id = UPDATE_BUFFER_ID;
        buffer
    }

    /// A handshake buffer
    pub fn handshake(buffer_type: BufferType, id: BufferId, handshake: Handshake) -> Self {
        debug_assert!(buffer_type.is_handshake());
        let capacity = FIXED_HEADER_SIZE + MAX_DATA_UPDATES * UPDATE_SIZE + Handshake::SIZE;
        let mut buffer = Buffer::new(buffer_type, capacity);
        buffer.id = id.as_raw();
        handshake.write(&mut buffer.payload);
        buffer
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Raw id, including the reserved markers
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    /// Stream id, `None` for keepalive and update-only buffers
    pub fn id(&self) -> Option<BufferId> {
        BufferId::from_wire(self.id)
    }

    pub fn set_id(&mut self, id: BufferId) {
        self.id = id.as_raw();
    }

    pub fn retransmit_count(&self) -> u8 {
        self.retransmit_count
    }

    pub fn set_retransmit_count(&mut self, count: u8) {
        self.retransmit_count = count;
    }

    /// Increment the retransmit count, returning the new value
    pub fn bump_retransmit_count(&mut self) -> u8 {
        self.retransmit_count = self.retransmit_count.saturating_add(1);
        self.retransmit_count
    }

    pub fn updates(&self) -> &[u32] {
        &self.updates
    }

    pub fn updates_count(&self) -> usize {
        self.updates.len()
    }

    /// Append an update; the caller keeps the list within MAX_UPDATES
    pub fn push_update(&mut self, id: u32) {
        debug_assert!(self.updates.len() < MAX_UPDATES);
        self.updates.push(id);
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the header including updates
    pub fn header_size(&self) -> usize {
        FIXED_HEADER_SIZE + self.updates.len() * UPDATE_SIZE
    }

    /// Size of the payload
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    /// Bytes still free for payload
    pub fn data_free_size(&self) -> usize {
        self.capacity
            .saturating_sub(self.header_size() + self.payload.len())
    }

    /// Total size of the buffer on the wire
    pub fn size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// True if there is nothing worth putting on the wire
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.updates.is_empty()
    }

    /// Append a chunk: the tag byte, then whatever `fill` writes into the
    /// remaining free space. Returns the number of bytes `fill` produced.
    ///
    /// Nothing is appended when there is no room for at least one payload byte.
    pub fn push_chunk<F>(&mut self, tag: DataTag, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let free = self.data_free_size();
        if free < 2 {
            return 0;
        }
        self.payload.put_u8(tag.as_u8());
        let start = self.payload.len();
        self.payload.resize(start + free - 1, 0);
        let written = fill(&mut self.payload[start..]).min(free - 1);
        self.payload.truncate(start + written);
        written
    }

    /// Clear contents and hand the payload storage back for pooling
    pub fn into_payload(self) -> BytesMut {
        let mut payload = self.payload;
        payload.clear();
        payload
    }

    /// Serialize the buffer (network byte order)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(VERSION);
        buf.put_u8(self.buffer_type.as_u8());
        buf.put_u32(self.id);
        buf.put_u8(self.retransmit_count);
        buf.put_u8(self.updates.len() as u8);
        for update in &self.updates {
            buf.put_u32(*update);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram
    ///
    /// Only the structure is validated here; payload contents are checked while
    /// decoding chunks.
    pub fn from_bytes(bytes: &[u8], capacity: usize) -> Result<Self, BufferError> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(BufferError::InsufficientData {
                expected: FIXED_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes.len() > capacity {
            return Err(BufferError::TooLarge {
                size: bytes.len(),
                capacity,
            });
        }

        let mut buf = bytes;
        let version = buf.get_u8();
        if version != VERSION {
            return Err(BufferError::UnsupportedVersion(version));
        }
        let raw_type = buf.get_u8();
        let buffer_type = BufferType::from_u8(raw_type).ok_or(BufferError::InvalidType(raw_type))?;
        let id = buf.get_u32();
        let retransmit_count = buf.get_u8();
        let updates_count = buf.get_u8() as usize;
        if updates_count > MAX_UPDATES {
            return Err(BufferError::TooManyUpdates(updates_count));
        }
        let expected = FIXED_HEADER_SIZE + updates_count * UPDATE_SIZE;
        if bytes.len() < expected {
            return Err(BufferError::InsufficientData {
                expected,
                actual: bytes.len(),
            });
        }

        let updates = (0..updates_count).map(|_| buf.get_u32()).collect();

        Ok(Buffer {
            buffer_type,
            id,
            retransmit_count,
            updates,
            payload: BytesMut::from(buf),
            capacity,
        })
    }
}

/// Iterator over the chunks of a data payload
///
/// Chunk bodies are not length-delimited: the decoder consuming a chunk
/// reports how many bytes it used, and the rest is the next chunk.
pub struct ChunkReader<'a> {
    remaining: &'a [u8],
}

impl<'a> ChunkReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        ChunkReader { remaining: payload }
    }

    /// Read the next tag and return it with the bytes following it.
    ///
    /// `Err` carries the unknown tag byte.
    pub fn next_tag(&mut self) -> Option<Result<(DataTag, &'a [u8]), u8>> {
        let (&tag, rest) = self.remaining.split_first()?;
        self.remaining = rest;
        Some(DataTag::from_u8(tag).map(|tag| (tag, rest)).ok_or(tag))
    }

    /// Mark `count` bytes after the last tag as consumed
    pub fn consume(&mut self, count: usize) {
        self.remaining = &self.remaining[count.min(self.remaining.len())..];
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_type() {
        assert_eq!(BufferType::from_u8(2), Some(BufferType::Data));
        assert_eq!(BufferType::from_u8(9), None);
        assert!(BufferType::Connecting.is_handshake());
        assert!(!BufferType::KeepAlive.is_handshake());
    }

    #[test]
    fn test_header_layout() {
        let mut buffer = Buffer::new(BufferType::Data, DEFAULT_CAPACITY);
        buffer.set_id(BufferId::new(0x0102_0304));
        buffer.set_retransmit_count(3);
        buffer.push_update(0x0A0B_0C0D);
        buffer.push_chunk(DataTag::NewSignal, |out| {
            out[..2].copy_from_slice(b"hi");
            2
        });

        let bytes = buffer.to_bytes();
        assert_eq!(
            &bytes[..],
            &[VERSION, 2, 1, 2, 3, 4, 3, 1, 0x0A, 0x0B, 0x0C, 0x0D, 1, b'h', b'i']
        );
    }

    #[test]
    fn test_parse_data_buffer() {
        let mut buffer = Buffer::new(BufferType::Data, DEFAULT_CAPACITY);
        buffer.set_id(BufferId::new(42));
        buffer.push_update(7);
        buffer.push_update(8);
        buffer.push_chunk(DataTag::ContinuedSignal, |out| {
            out[..5].copy_from_slice(b"hello");
            5
        });

        let parsed = Buffer::from_bytes(&buffer.to_bytes(), DEFAULT_CAPACITY).unwrap();
        assert_eq!(parsed.id(), Some(BufferId::new(42)));
        assert_eq!(parsed.updates(), &[7, 8]);
        assert_eq!(parsed.payload(), b"\x02hello");
    }

    #[test]
    fn test_parse_rejects_short() {
        assert_eq!(
            Buffer::from_bytes(&[VERSION, 2, 0], DEFAULT_CAPACITY),
            Err(BufferError::InsufficientData {
                expected: FIXED_HEADER_SIZE,
                actual: 3
            })
        );
    }

    #[test]
    fn test_parse_rejects_truncated_updates() {
        let bytes = [VERSION, 2, 0, 0, 0, 1, 0, 2, 0, 0, 0, 9];
        assert!(matches!(
            Buffer::from_bytes(&bytes, DEFAULT_CAPACITY),
            Err(BufferError::InsufficientData { expected: 16, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_version_and_type() {
        let bytes = [9, 2, 0, 0, 0, 1, 0, 0];
        assert_eq!(
            Buffer::from_bytes(&bytes, DEFAULT_CAPACITY),
            Err(BufferError::UnsupportedVersion(9))
        );
        let bytes = [VERSION, 7, 0, 0, 0, 1, 0, 0];
        assert_eq!(
            Buffer::from_bytes(&bytes, DEFAULT_CAPACITY),
            Err(BufferError::InvalidType(7))
        );
    }

    #[test]
    fn test_reserved_ids() {
        assert_eq!(Buffer::keepalive().id(), None);
        assert_eq!(Buffer::keepalive().raw_id(), KEEPALIVE_BUFFER_ID);
        assert_eq!(Buffer::updates_only(256).raw_id(), UPDATE_BUFFER_ID);
    }

    #[test]
    fn test_push_chunk_respects_capacity() {
        let mut buffer = Buffer::new(BufferType::Data, MIN_CAPACITY);
        let written = buffer.push_chunk(DataTag::NewSignal, |out| {
            out.fill(0xAB);
            out.len()
        });

        assert_eq!(written, MIN_CAPACITY - FIXED_HEADER_SIZE - 1);
        assert_eq!(buffer.size(), MIN_CAPACITY);
        assert_eq!(buffer.data_free_size(), 0);
        assert_eq!(buffer.push_chunk(DataTag::NewSignal, |_| 1), 0);
    }

    #[test]
    fn test_handshake_payload() {
        let hs = Handshake {
            base_port: 9000,
            epoch: 0xDEAD_BEEF,
        };
        let buffer = Buffer::handshake(BufferType::Connecting, BufferId::ZERO, hs);
        let parsed = Buffer::from_bytes(&buffer.to_bytes(), DEFAULT_CAPACITY).unwrap();

        assert_eq!(parsed.buffer_type(), BufferType::Connecting);
        assert_eq!(Handshake::parse(parsed.payload()), Ok(hs));
        assert_eq!(Handshake::parse(&[0, 1]), Err(BufferError::InvalidHandshake));
    }

    #[test]
    fn test_chunk_reader() {
        let payload = [1u8, b'a', b'b', 2, b'c'];
        let mut reader = ChunkReader::new(&payload);

        let (tag, rest) = reader.next_tag().unwrap().unwrap();
        assert_eq!(tag, DataTag::NewSignal);
        assert_eq!(rest, b"ab\x02c");
        reader.consume(2);

        let (tag, rest) = reader.next_tag().unwrap().unwrap();
        assert_eq!(tag, DataTag::ContinuedSignal);
        assert_eq!(rest, b"c");
        reader.consume(1);
        assert!(reader.is_empty());
        assert!(reader.next_tag().is_none());
    }
}
