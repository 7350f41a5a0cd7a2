//! Growable reassembly buffer for inbound MQTT frames
//!
//! Transports hand over arbitrary read chunks. [`FrameBuffer`] accumulates
//! them and splits off complete packets, decoded by rumqttc. It grows on demand but never past its
//! limit, which is the configured maximum packet size; growth beyond it fails
//! with [`AllocationError`] instead of reallocating.
//!
//! Invariant: `capacity() >= len()` and `len() <= limit()` at all times.

use super::codec::{CodecError, Packet};
use crate::error::SessionResult;
use bytes::BytesMut;
use rumqttc::mqttbytes::{self, v4};
use thiserror::Error;

const INITIAL_CAPACITY: usize = 4096;

/// Buffer growth refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("buffer limit exceeded: {requested} bytes requested, limit is {limit}")]
    LimitExceeded { requested: usize, limit: usize },
}

#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    limit: usize,
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(INITIAL_CAPACITY)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes that can still be appended before hitting the limit
    pub fn headroom(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Make room for `additional` bytes
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocationError> {
        let requested = self.buf.len().saturating_add(additional);
        if requested > self.limit {
            return Err(AllocationError::LimitExceeded {
                requested,
                limit: self.limit,
            });
        }
        self.buf.reserve(additional);
        debug_assert!(self.buf.capacity() >= self.buf.len());
        Ok(())
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), AllocationError> {
        self.reserve(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Split off the next complete packet, if one is buffered
    ///
    /// A frame whose announced size cannot fit under the limit is refused as
    /// soon as its fixed header is readable, before any more bytes arrive.
    pub fn next_packet(&mut self) -> SessionResult<Option<Packet>> {
        match v4::read(&mut self.buf, self.limit) {
            Ok(packet) => Ok(Some(packet)),
            Err(mqttbytes::Error::InsufficientBytes(missing)) => {
                let requested = self.buf.len().saturating_add(missing);
                if requested > self.limit {
                    return Err(AllocationError::LimitExceeded {
                        requested,
                        limit: self.limit,
                    }
                    .into());
                }
                Ok(None)
            }
            Err(e) => Err(CodecError::from(e).into()),
        }
    }

    /// Append a read chunk and return every packet it completes.
    ///
    /// The chunk is consumed in slices no larger than the headroom so a chunk
    /// carrying several frames never trips the limit on its own.
    pub fn feed(&mut self, chunk: &[u8]) -> SessionResult<Vec<Packet>> {
        let mut packets = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let take = self.headroom().min(rest.len());
            if take == 0 {
                return Err(AllocationError::LimitExceeded {
                    requested: self.buf.len() + rest.len(),
                    limit: self.limit,
                }
                .into());
            }
            self.extend_from_slice(&rest[..take])?;
            rest = &rest[take..];

            while let Some(packet) = self.next_packet()? {
                packets.push(packet);
            }
        }

        Ok(packets)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
