//! Cuts CRC-checked T2-MI packets out of a chunked byte stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::constants::{T2MI_CRC_SIZE, T2MI_HEADER_SIZE};
use crate::psi::section::CRC_MPEG;
use crate::t2mi::packet::T2miPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    /// Full packet size, header and CRC included
    AwaitingPayload { total: usize },
}

/// Cuts T2-MI packets out of a byte stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct SubFrameDecoder {
    buf: BytesMut,
    state: State,
    pub decoded: u64,
    pub crc_errors: u64,
}

impl Default for SubFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SubFrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::AwaitingHeader,
            decoded: 0,
            crc_errors: 0,
        }
    }

    /// True when no partial packet is buffered.
    pub fn at_boundary(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::AwaitingHeader;
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<T2miPacket> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buf.len() < T2MI_HEADER_SIZE {
                        break;
                    }
                    let bits = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
                    self.state = State::AwaitingPayload {
                        total: T2MI_HEADER_SIZE + bits.div_ceil(8) + T2MI_CRC_SIZE,
                    };
                }
                State::AwaitingPayload { total } => {
                    if self.buf.len() < total {
                        break;
                    }
                    let mut unit = self.buf.split_to(total).freeze();
                    self.state = State::AwaitingHeader;
                    // A failed unit is dropped; its length field still locates the next header.
                    if let Some(packet) = self.finish(&mut unit) {
                        out.push(packet);
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self, unit: &mut Bytes) -> Option<T2miPacket> {
        let mut crc_bytes = unit.split_off(unit.len() - T2MI_CRC_SIZE);
        let expected = crc_bytes.get_u32();
        let calc = CRC_MPEG.checksum(&unit[..]);
        if calc != expected {
            tracing::warn!(
                packet_type = unit[0],
                packet_count = unit[1],
                expected,
                calc,
                "T2-MI CRC mismatch"
            );
            self.crc_errors += 1;
            return None;
        }
        match T2miPacket::parse(unit.clone(), expected) {
            Ok(packet) => {
                self.decoded += 1;
                tracing::trace!(packet_type = packet.packet_type, packet_count = packet.packet_count, "T2-MI packet");
                Some(packet)
            }
            Err(err) => {
                tracing::warn!(%err, "T2-MI header unreadable");
                None
            }
        }
    }
}
