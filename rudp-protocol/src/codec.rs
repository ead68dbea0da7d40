//! Signal Framing
//!
//! Frames are `type:u16, length:u32, body`, big-endian. A `FrameEncoder`
//! writes one frame across as many buffer chunks as needed and a
//! `FrameDecoder` puts it back together. Decoded frames are turned into
//! signals through a `SignalRegistry`.

use crate::signal::Signal;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Frame header size (type + length)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest accepted signal body
pub const MAX_SIGNAL_SIZE: usize = 16 * 1024 * 1024;

/// Encoders and decoders kept per pool
const MAX_POOLED: usize = 32;

/// Codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Signal too large: {0} bytes (max {MAX_SIGNAL_SIZE})")]
    TooLarge(usize),

    #[error("Unknown signal type: {0}")]
    UnknownType(u16),

    #[error("Malformed signal body: {0}")]
    Malformed(String),

    #[error("Frame is not complete")]
    Incomplete,
}

/// Builds a signal from its body
pub type SignalConstructor =
    Box<dyn Fn(Bytes) -> Result<Box<dyn Signal>, CodecError> + Send + Sync>;

/// Maps signal type ids to constructors
#[derive(Default)]
pub struct SignalRegistry {
    constructors: HashMap<u16, SignalConstructor>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        SignalRegistry::default()
    }

    /// Register a constructor, replacing any previous one for the type
    pub fn register<F>(&mut self, signal_type: u16, constructor: F)
    where
        F: Fn(Bytes) -> Result<Box<dyn Signal>, CodecError> + Send + Sync + 'static,
    {
        self.constructors.insert(signal_type, Box::new(constructor));
    }

    pub fn contains(&self, signal_type: u16) -> bool {
        self.constructors.contains_key(&signal_type)
    }

    /// Build a signal from a decoded frame
    pub fn decode(&self, signal_type: u16, body: Bytes) -> Result<Box<dyn Signal>, CodecError> {
        let constructor = self
            .constructors
            .get(&signal_type)
            .ok_or(CodecError::UnknownType(signal_type))?;
        constructor(body)
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("SignalRegistry").field("types", &types).finish()
    }
}

/// Writes one signal frame in pieces
#[derive(Debug, Default)]
pub struct FrameEncoder {
    staging: BytesMut,
    offset: usize,
}

impl FrameEncoder {
    pub fn new() -> Self {
        FrameEncoder::default()
    }

    /// Serialize `signal` into the staging area
    pub fn start(&mut self, signal: &dyn Signal) -> Result<(), CodecError> {
        self.clear();
        self.staging.put_u16(signal.signal_type());
        self.staging.put_u32(0);
        signal.encode(&mut self.staging);

        let body_len = self.staging.len() - FRAME_HEADER_SIZE;
        if body_len > MAX_SIGNAL_SIZE {
            self.clear();
            return Err(CodecError::TooLarge(body_len));
        }
        self.staging[2..FRAME_HEADER_SIZE].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(())
    }

    /// Copy as much of the remaining frame as fits into `out`
    pub fn fill(&mut self, out: &mut [u8]) -> usize {
        let remaining = &self.staging[self.offset..];
        let count = remaining.len().min(out.len());
        out[..count].copy_from_slice(&remaining[..count]);
        self.offset += count;
        count
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.staging.len()
    }

    /// Bytes of the frame not yet written
    pub fn remaining(&self) -> usize {
        self.staging.len() - self.offset
    }

    pub fn clear(&mut self) {
        self.staging.clear();
        self.offset = 0;
    }
}

/// Reassembles one signal frame from chunk bytes
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; FRAME_HEADER_SIZE],
    header_len: usize,
    signal_type: u16,
    body_len: usize,
    body: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Consume bytes up to the end of the frame, returning how many were used
    pub fn feed(&mut self, mut data: &[u8]) -> Result<usize, CodecError> {
        let total = data.len();

        if self.header_len < FRAME_HEADER_SIZE {
            let count = (FRAME_HEADER_SIZE - self.header_len).min(data.len());
            self.header[self.header_len..self.header_len + count].copy_from_slice(&data[..count]);
            self.header_len += count;
            data = &data[count..];

            if self.header_len < FRAME_HEADER_SIZE {
                return Ok(total - data.len());
            }

            let mut header = &self.header[..];
            self.signal_type = header.get_u16();
            self.body_len = header.get_u32() as usize;
            if self.body_len > MAX_SIGNAL_SIZE {
                return Err(CodecError::TooLarge(self.body_len));
            }
            self.body.reserve(self.body_len);
        }

        let count = (self.body_len - self.body.len()).min(data.len());
        self.body.put_slice(&data[..count]);
        data = &data[count..];

        Ok(total - data.len())
    }

    pub fn is_complete(&self) -> bool {
        self.header_len == FRAME_HEADER_SIZE && self.body.len() == self.body_len
    }

    /// Build the signal; the decoder is left cleared for reuse
    pub fn finish(&mut self, registry: &SignalRegistry) -> Result<Box<dyn Signal>, CodecError> {
        if !self.is_complete() {
            return Err(CodecError::Incomplete);
        }
        let body = self.body.split().freeze();
        let signal_type = self.signal_type;
        self.clear();
        registry.decode(signal_type, body)
    }

    pub fn clear(&mut self) {
        self.header_len = 0;
        self.signal_type = 0;
        self.body_len = 0;
        self.body.clear();
    }
}

/// Free list of encoders and decoders
#[derive(Debug, Default)]
pub struct CodecPool {
    encoders: Vec<FrameEncoder>,
    decoders: Vec<FrameDecoder>,
}

impl CodecPool {
    pub fn new() -> Self {
        CodecPool::default()
    }

    pub fn get_encoder(&mut self) -> FrameEncoder {
        match self.encoders.pop() {
            Some(encoder) => encoder,
            None => {
                trace!("allocating new frame encoder");
                FrameEncoder::new()
            }
        }
    }

    pub fn return_encoder(&mut self, mut encoder: FrameEncoder) {
        if self.encoders.len() < MAX_POOLED {
            encoder.clear();
            self.encoders.push(encoder);
        }
    }

    pub fn get_decoder(&mut self) -> FrameDecoder {
        match self.decoders.pop() {
            Some(decoder) => decoder,
            None => {
                trace!("allocating new frame decoder");
                FrameDecoder::new()
            }
        }
    }

    pub fn return_decoder(&mut self, mut decoder: FrameDecoder) {
        if self.decoders.len() < MAX_POOLED {
            decoder.clear();
            self.decoders.push(decoder);
        }
    }

    pub fn pooled(&self) -> (usize, usize) {
        (self.encoders.len(), self.decoders.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::PeerInfo;
    use crate::signal::SignalUid;

    struct Blob(Vec<u8>);

    impl Signal for Blob {
        fn signal_type(&self) -> u16 {
            7
        }

        fn encode(&self, out: &mut BytesMut) {
            out.put_slice(&self.0);
        }

        fn on_fully_received(self: Box<Self>, _peer: &PeerInfo) -> Option<SignalUid> {
            None
        }
    }

    fn registry() -> SignalRegistry {
        let mut registry = SignalRegistry::new();
        registry.register(7, |body| Ok(Box::new(Blob(body.to_vec())) as Box<dyn Signal>));
        registry
    }

    #[test]
    fn test_encoder_frame_layout() {
        let mut encoder = FrameEncoder::new();
        encoder.start(&Blob(b"abc".to_vec())).unwrap();

        let mut out = [0u8; 16];
        let written = encoder.fill(&mut out);
        assert_eq!(written, 9);
        assert_eq!(&out[..9], &[0, 7, 0, 0, 0, 3, b'a', b'b', b'c']);
        assert!(encoder.is_complete());
    }

    #[test]
    fn test_fragmented_frame() {
        let payload: Vec<u8> = (0..100u8).collect();
        let mut encoder = FrameEncoder::new();
        encoder.start(&Blob(payload.clone())).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 7];
        while !encoder.is_complete() {
            let written = encoder.fill(&mut chunk);
            assert_eq!(decoder.feed(&chunk[..written]).unwrap(), written);
        }
        assert!(decoder.is_complete());
        assert!(decoder.finish(&registry()).is_ok());
        assert!(!decoder.is_complete());
    }

    #[test]
    fn test_decoder_stops_at_frame_end() {
        let mut encoder = FrameEncoder::new();
        encoder.start(&Blob(vec![1, 2])).unwrap();
        let mut out = [0u8; 8];
        encoder.fill(&mut out);

        let mut data = out.to_vec();
        data.extend_from_slice(&[0xEE, 0xEE]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&data).unwrap(), 8);
        assert!(decoder.is_complete());
    }

    #[test]
    fn test_unknown_type_reported_at_finish() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 9, 0, 0, 0, 1, 0xFF]).unwrap();
        assert!(decoder.is_complete());
        assert_eq!(
            decoder.finish(&registry()).err(),
            Some(CodecError::UnknownType(9))
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let len = (MAX_SIGNAL_SIZE as u32 + 1).to_be_bytes();
        let header = [0, 7, len[0], len[1], len[2], len[3]];
        assert_eq!(
            decoder.feed(&header),
            Err(CodecError::TooLarge(MAX_SIGNAL_SIZE + 1))
        );
    }

    #[test]
    fn test_finish_incomplete() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 7, 0]).unwrap();
        assert_eq!(decoder.finish(&registry()).err(), Some(CodecError::Incomplete));
    }

    #[test]
    fn test_pool_reuse() {
        let mut pool = CodecPool::new();
        let mut encoder = pool.get_encoder();
        encoder.start(&Blob(vec![1])).unwrap();
        pool.return_encoder(encoder);
        assert_eq!(pool.pooled(), (1, 0));

        let encoder = pool.get_encoder();
        assert!(encoder.is_complete());
        assert_eq!(encoder.remaining(), 0);
        assert_eq!(pool.pooled(), (0, 0));
    }
}
