// ABOUTME: Reassembles arbitrary TCP chunks into whole length-prefixed packets
// ABOUTME: Hands packets to the dispatcher in exact wire order

use crate::config::MAX_PACKET_SIZE;
use crate::error::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};

/// Accumulates socket chunks and slices out complete packets.
///
/// A partial frame stays in the internal tail buffer until the rest of it
/// arrives; `BytesMut::split_to` hands out each completed packet without
/// copying the remainder. Declared lengths above the configured limit are
/// rejected before any buffering happens, which bounds the tail.
#[derive(Debug)]
pub struct PacketReassembler {
    pending: BytesMut,
    max_packet: u32,
}

impl PacketReassembler {
    pub fn new() -> Self {
        PacketReassembler::with_limit(MAX_PACKET_SIZE)
    }

    pub fn with_limit(max_packet: u32) -> Self {
        PacketReassembler {
            pending: BytesMut::with_capacity(crate::config::IO_BUFFER_SIZE),
            max_packet,
        }
    }

    /// Feed one chunk, returning every packet it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
        self.pending.extend_from_slice(chunk);
        let mut packets = Vec::new();
        while self.pending.len() >= 4 {
            let length = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]);
            if length > self.max_packet {
                return Err(ProtocolError::PacketTooLarge {
                    length,
                    max: self.max_packet,
                });
            }
            if self.pending.len() < 4 + length as usize {
                break;
            }
            self.pending.advance(4);
            packets.push(self.pending.split_to(length as usize).freeze());
        }
        Ok(packets)
    }

    /// Bytes stashed waiting for the rest of a frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for PacketReassembler {
    fn default() -> Self {
        PacketReassembler::new()
    }
}
