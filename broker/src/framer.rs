// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Turns a stream of raw byte chunks into complete MQTT control packets.
//!
//! The framer only understands the fixed header (packet type + variable
//! byte remaining length); packet bodies are handed to
//! [`codec::v3`]/[`codec::v5`] decoders by the session layer once a
//! complete frame is available.

use std::time::{Duration, Instant};

use codec::{ByteArray, DecodePacket, VarInt};

/// Hard ceiling on buffered-but-incomplete bytes, matching the wire's
/// 256 MiB variable-byte-integer remaining-length limit.
pub const MAX_INCOMING_DATA_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerError {
    /// Accumulated buffer exceeded [`MAX_INCOMING_DATA_LENGTH`] without a
    /// decodable frame.
    BufferOverflow,

    /// No complete packet arrived within the idle timeout.
    IdleTimeout,

    /// The buffered bytes do not form a valid fixed header.
    Malformed,
}

/// Accumulates bytes from the network and yields complete frames.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl Framer {
    /// `idle_timeout` is typically `2 * keep_alive`.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            idle_timeout,
            last_activity: Instant::now(),
        }
    }

    /// Append freshly-read bytes to the internal buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::BufferOverflow`] if the buffer would exceed
    /// [`MAX_INCOMING_DATA_LENGTH`].
    pub fn append(&mut self, data: &[u8]) -> Result<(), FramerError> {
        if self.buf.len() + data.len() > MAX_INCOMING_DATA_LENGTH {
            return Err(FramerError::BufferOverflow);
        }
        self.buf.extend_from_slice(data);
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Returns true if the internal buffer currently holds the raw bytes
    /// for at least one complete control packet.
    #[must_use]
    pub fn packet_available(&self) -> bool {
        self.frame_len().is_some()
    }

    /// Remove and return the raw bytes of the next complete packet, if any.
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::Malformed`] if the buffered prefix cannot be
    /// parsed as a fixed header.
    pub fn take_packet(&mut self) -> Result<Option<Vec<u8>>, FramerError> {
        let Some(total) = self.frame_len() else {
            return Ok(None);
        };
        let frame = self.buf.drain(..total).collect();
        Ok(Some(frame))
    }

    /// Byte length of the next complete frame, if the buffer holds one.
    fn frame_len(&self) -> Option<usize> {
        if self.buf.len() < 2 {
            return None;
        }
        let mut ba = ByteArray::new(&self.buf[1..]);
        let remaining_length = match VarInt::decode(&mut ba) {
            Ok(v) => v,
            Err(_) => return None,
        };
        let total = 1 + ba.offset() + remaining_length.value();
        if total <= self.buf.len() {
            Some(total)
        } else {
            None
        }
    }

    /// Returns true if the idle timeout has elapsed with no complete
    /// packet pending. The caller should close the connection and, per
    /// the framer contract, reset the buffer via [`Self::reset`].
    #[must_use]
    pub fn is_idle_timed_out(&self) -> bool {
        !self.packet_available() && self.last_activity.elapsed() >= self.idle_timeout
    }

    /// Discard any partially-buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v3::PingRequestPacket;
    use codec::EncodePacket;

    #[test]
    fn test_incremental_delivery_across_arbitrary_splits() {
        let mut whole = Vec::new();
        let ping = PingRequestPacket::new();
        for _ in 0..3 {
            ping.encode(&mut whole).unwrap();
        }

        // Feed the concatenated bytes in tiny, arbitrary chunks.
        let mut framer = Framer::new(Duration::from_secs(60));
        let mut packets = Vec::new();
        for chunk in whole.chunks(3) {
            framer.append(chunk).unwrap();
            while let Some(packet) = framer.take_packet().unwrap() {
                packets.push(packet);
            }
        }
        assert_eq!(packets.len(), 3);
        let mut single = Vec::new();
        ping.encode(&mut single).unwrap();
        for packet in packets {
            assert_eq!(packet, single);
        }
    }

    #[test]
    fn test_no_packet_when_buffer_incomplete() {
        let mut framer = Framer::new(Duration::from_secs(60));
        framer.append(&[0x30]).unwrap();
        assert!(!framer.packet_available());
        assert!(framer.take_packet().unwrap().is_none());
    }

    #[test]
    fn test_buffer_overflow_rejected() {
        let mut framer = Framer::new(Duration::from_secs(60));
        let big = vec![0u8; MAX_INCOMING_DATA_LENGTH + 1];
        assert_eq!(framer.append(&big), Err(FramerError::BufferOverflow));
    }
}
