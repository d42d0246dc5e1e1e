//! Rebuilds the transport stream carried by one PLP from its baseband frames.
//!
//! Each BBFrame data field holds user packets with the sync byte removed
//! (high efficiency mode) or replaced by a CRC-8 of the previous packet
//! (normal mode), optionally followed by a deleted-null-packet counter byte.
//! SYNCD locates the first user packet that starts inside the data field;
//! the bytes before it close out the packet left open by the previous frame.

use std::io::Write;

use bytes::{Bytes, BytesMut};

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::t2mi::bbframe::BbMode;
use crate::t2mi::packet::T2miPacket;

const BODY_SIZE: usize = TS_PACKET_SIZE - 1;

/// Cursor into a PLP's baseband frame list. Survives between extractor runs
/// so a live stream can be drained incrementally.
#[derive(Debug, Default)]
pub struct ExtractState {
    pending: BytesMut,
    boundary_seen: bool,
    consumed: usize,
    pub frames_out: u64,
    pub units_skipped: u64,
    /// Open packets abandoned because the following data did not complete them
    pub realigns: u64,
}

impl ExtractState {
    /// Baseband frames already folded into the output.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Drop buffered bytes and wait for the next boundary.
    pub(crate) fn restart(&mut self) {
        self.pending.clear();
        self.boundary_seen = false;
        self.consumed = 0;
    }

    /// Forget `n` consumed frames after the owner dropped them from its list.
    pub(crate) fn rebase(&mut self, n: usize) {
        self.consumed = self.consumed.saturating_sub(n);
    }
}

pub struct PlpExtractor<'a> {
    units: &'a [T2miPacket],
    state: &'a mut ExtractState,
}

impl<'a> PlpExtractor<'a> {
    pub fn new(units: &'a [T2miPacket], state: &'a mut ExtractState) -> Self {
        Self { units, state }
    }

    /// True when at least one whole transport packet can be taken.
    pub fn has_more(&mut self) -> bool {
        let units = self.units;
        while self.state.pending.len() < TS_PACKET_SIZE && self.state.consumed < units.len() {
            let unit = &units[self.state.consumed];
            self.state.consumed += 1;
            self.fold(unit);
        }
        self.state.pending.len() >= TS_PACKET_SIZE
    }

    /// Bytes buffered but not yet handed out.
    pub fn pending(&self) -> usize {
        self.state.pending.len()
    }

    /// Write every complete packet to `out`, returning how many were written.
    pub fn drain_to<W: Write>(&mut self, out: &mut W) -> std::io::Result<usize> {
        let mut n = 0;
        for frame in self.by_ref() {
            out.write_all(&frame)?;
            n += 1;
        }
        Ok(n)
    }

    fn fold(&mut self, unit: &T2miPacket) {
        let Some(bb) = unit.baseband_frame() else {
            return;
        };
        let header = &bb.header;
        if !header.is_transport_stream() {
            tracing::debug!(plp = bb.plp_id, ts_gs = header.ts_gs, "skipping non-TS baseband frame");
            self.state.units_skipped += 1;
            return;
        }

        let df = &bb.data_field[..header.data_field_len().min(bb.data_field.len())];
        // Normal mode keeps a CRC-8 byte where the sync byte was.
        let lead = usize::from(header.mode == Some(BbMode::Normal));
        let dnp = header.dnp_len();
        let buf = &mut self.state.pending;

        let partial = buf.len() % TS_PACKET_SIZE;

        let Some(syncd) = header.sync_distance() else {
            if !self.state.boundary_seen {
                self.state.units_skipped += 1;
            } else if df.is_empty() || (partial > 0 && partial + df.len() <= TS_PACKET_SIZE) {
                buf.extend_from_slice(df);
            } else {
                // No packet starts here, so the open one has to absorb all of it.
                tracing::debug!(plp = bb.plp_id, partial, len = df.len(), "baseband frame does not continue open packet");
                buf.truncate(buf.len() - partial);
                self.state.realigns += 1;
            }
            return;
        };
        let syncd = syncd.min(df.len());

        if self.state.boundary_seen {
            let tail = &df[..syncd.saturating_sub(dnp)];
            if partial > 0 {
                if partial + tail.len() == TS_PACKET_SIZE {
                    buf.extend_from_slice(tail);
                } else {
                    tracing::debug!(plp = bb.plp_id, partial, tail = tail.len(), "lost data inside user packet, realigning");
                    buf.truncate(buf.len() - partial);
                    self.state.realigns += 1;
                }
            } else if !tail.is_empty() {
                // Normal mode may carry the replaced sync byte in this frame.
                let body = if tail.len() == lead + BODY_SIZE { &tail[lead..] } else { tail };
                if body.len() == BODY_SIZE {
                    buf.extend_from_slice(&[TS_SYNC_BYTE]);
                    buf.extend_from_slice(body);
                } else {
                    tracing::debug!(plp = bb.plp_id, tail = tail.len(), "stray bytes before user packet boundary");
                    self.state.realigns += 1;
                }
            }
        } else {
            tracing::debug!(plp = bb.plp_id, syncd, "first user packet boundary");
            self.state.boundary_seen = true;
        }

        let mut pos = syncd;
        while pos + lead + BODY_SIZE <= df.len() {
            pos += lead;
            buf.extend_from_slice(&[TS_SYNC_BYTE]);
            buf.extend_from_slice(&df[pos..pos + BODY_SIZE]);
            pos += BODY_SIZE + dnp;
        }
        if pos + lead < df.len() {
            buf.extend_from_slice(&[TS_SYNC_BYTE]);
            buf.extend_from_slice(&df[pos + lead..]);
        }
    }
}

impl Iterator for PlpExtractor<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if !self.has_more() {
            return None;
        }
        self.state.frames_out += 1;
        Some(self.state.pending.split_to(TS_PACKET_SIZE).freeze())
    }
}
