//! DVB-T2 Modulator Interface (T2-MI) carried on a transport PID.

pub mod bbframe;
pub mod decoder;
pub mod extractor;
pub mod packet;

use std::collections::BTreeMap;

use serde::Serialize;

pub use bbframe::{BbHeader, BbMode};
pub use decoder::SubFrameDecoder;
pub use extractor::{ExtractState, PlpExtractor};
pub use packet::{BasebandFrame, L1Current, T2Timestamp, T2miPacket, T2miPayload};

use crate::constants::*;

pub fn packet_type_name(packet_type: u8) -> &'static str {
    match packet_type {
        T2MI_TYPE_BBFRAME => "baseband_frame",
        0x01 => "aux_iq",
        0x02 => "arbitrary_cell",
        T2MI_TYPE_L1_CURRENT => "l1_current",
        0x11 => "l1_future",
        0x12 => "p2_bias_balancing",
        T2MI_TYPE_TIMESTAMP => "timestamp",
        T2MI_TYPE_INDIVIDUAL_ADDRESSING => "individual_addressing",
        0x30 => "fef_null",
        0x31 => "fef_iq",
        0x32 => "fef_composite",
        0x33 => "fef_sub_part",
        _ => "unknown",
    }
}

/// Baseband frames of one PLP plus the extraction cursor over them.
#[derive(Debug, Default)]
pub struct SubStream {
    packets: Vec<T2miPacket>,
    state: ExtractState,
    pub received: u64,
    pub dropped: u64,
}

impl SubStream {
    pub fn packets(&self) -> &[T2miPacket] {
        &self.packets
    }

    pub fn state(&self) -> &ExtractState {
        &self.state
    }

    pub fn extractor(&mut self) -> PlpExtractor<'_> {
        PlpExtractor::new(&self.packets, &mut self.state)
    }

    /// Drop frames the extractor has already consumed.
    pub fn compact(&mut self) {
        let n = self.state.consumed();
        self.packets.drain(..n);
        self.state.rebase(n);
    }

    fn push(&mut self, packet: T2miPacket, backlog: usize) {
        self.received += 1;
        self.packets.push(packet);
        if self.packets.len() > backlog {
            let excess = self.packets.len() - backlog;
            if excess > self.state.consumed() {
                // Unread frames are lost; extraction has to find a boundary again.
                self.state.restart();
                self.dropped += excess as u64;
            } else {
                self.state.rebase(excess);
            }
            self.packets.drain(..excess);
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct T2miStats {
    pub packets: u64,
    pub crc_errors: u64,
    pub resyncs: u64,
    /// packet_count jumps
    pub count_errors: u64,
    pub by_type: BTreeMap<u8, u64>,
}

/// T2-MI state for one PID: decoder, per-PLP frame lists, latest signalling.
#[derive(Debug)]
pub struct T2miChannel {
    pid: u16,
    decoder: SubFrameDecoder,
    synced: bool,
    last_count: Option<u8>,
    backlog: usize,
    plps: BTreeMap<u8, SubStream>,
    pub l1_current: Option<L1Current>,
    pub timestamp: Option<T2Timestamp>,
    pub stats: T2miStats,
}

impl T2miChannel {
    pub fn new(pid: u16, backlog: usize) -> Self {
        Self {
            pid,
            decoder: SubFrameDecoder::new(),
            synced: false,
            last_count: None,
            backlog,
            plps: BTreeMap::new(),
            l1_current: None,
            timestamp: None,
            stats: T2miStats::default(),
        }
    }

    /// Drop any partial packet and wait for the next unit start.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.synced = false;
    }

    /// Feed one TS payload. Returns how many T2-MI packets completed.
    pub fn feed(&mut self, payload: &[u8], unit_start: bool) -> usize {
        let mut packets = Vec::new();
        if unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return 0;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                tracing::warn!(pid = self.pid, pointer, "T2-MI pointer field past end of packet");
                self.reset();
                self.stats.resyncs += 1;
                return 0;
            }
            let (tail, head) = rest.split_at(pointer);
            if self.synced {
                packets.extend(self.decode(tail));
            }
            if !self.decoder.at_boundary() {
                tracing::debug!(pid = self.pid, "T2-MI packet did not end at pointer, resyncing");
                self.decoder.reset();
                self.stats.resyncs += 1;
            }
            self.synced = true;
            packets.extend(self.decode(head));
        } else if self.synced {
            packets = self.decode(payload);
        }

        let n = packets.len();
        for packet in packets {
            self.record(packet);
        }
        n
    }

    fn decode(&mut self, data: &[u8]) -> Vec<T2miPacket> {
        let before = self.decoder.crc_errors;
        let out = self.decoder.push(data);
        self.stats.crc_errors += self.decoder.crc_errors - before;
        out
    }

    fn record(&mut self, packet: T2miPacket) {
        self.stats.packets += 1;
        *self.stats.by_type.entry(packet.packet_type).or_default() += 1;

        if let Some(last) = self.last_count {
            if packet.packet_count != last.wrapping_add(1) {
                tracing::debug!(pid = self.pid, last, got = packet.packet_count, "T2-MI packet_count jump");
                self.stats.count_errors += 1;
            }
        }
        self.last_count = Some(packet.packet_count);

        match &packet.payload {
            T2miPayload::L1Current(l1) => self.l1_current = Some(l1.clone()),
            T2miPayload::Timestamp(ts) => self.timestamp = Some(*ts),
            _ => {}
        }
        if let Some(plp) = packet.plp_id() {
            tracing::trace!(pid = self.pid, plp, "baseband frame");
            self.plps.entry(plp).or_default().push(packet, self.backlog);
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn plp_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.plps.keys().copied()
    }

    pub fn plp(&self, plp: u8) -> Option<&SubStream> {
        self.plps.get(&plp)
    }

    pub fn plp_mut(&mut self, plp: u8) -> Option<&mut SubStream> {
        self.plps.get_mut(&plp)
    }

    pub fn summary(&self) -> T2miSummary {
        T2miSummary {
            pid: self.pid,
            packets: self.stats.packets,
            crc_errors: self.stats.crc_errors,
            resyncs: self.stats.resyncs,
            count_errors: self.stats.count_errors,
            packet_types: self
                .stats
                .by_type
                .iter()
                .map(|(&t, &n)| (format!("0x{t:02X} {}", packet_type_name(t)), n))
                .collect(),
            plps: self
                .plps
                .iter()
                .map(|(&id, s)| PlpSummary {
                    plp_id: id,
                    baseband_frames: s.received,
                    buffered: s.packets.len(),
                    extracted_packets: s.state.frames_out,
                    realigns: s.state.realigns,
                    dropped: s.dropped,
                })
                .collect(),
            l1_frame_idx: self.l1_current.as_ref().map(|l1| l1.frame_idx),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlpSummary {
    pub plp_id: u8,
    pub baseband_frames: u64,
    pub buffered: usize,
    pub extracted_packets: u64,
    pub realigns: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct T2miSummary {
    pub pid: u16,
    pub packets: u64,
    pub crc_errors: u64,
    pub resyncs: u64,
    pub count_errors: u64,
    pub packet_types: BTreeMap<String, u64>,
    pub plps: Vec<PlpSummary>,
    pub l1_frame_idx: Option<u8>,
    pub timestamp: Option<T2Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t2mi::packet::encode_packet;

    /// Split a byte stream into 184-byte TS payloads with pointer fields.
    fn packetize(stream: &[u8], starts: &[usize]) -> Vec<(Vec<u8>, bool)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let next_start = starts.iter().copied().find(|&s| s >= pos && s < pos + 183);
            match next_start {
                Some(s) => {
                    let mut p = vec![(s - pos) as u8];
                    let end = (pos + 183).min(stream.len());
                    p.extend_from_slice(&stream[pos..end]);
                    out.push((p, true));
                    pos = end;
                }
                None => {
                    let end = (pos + 184).min(stream.len());
                    out.push((stream[pos..end].to_vec(), false));
                    pos = end;
                }
            }
        }
        out
    }

    fn bb_packet(count: u8, plp: u8) -> Vec<u8> {
        let mut payload = vec![0, plp, 0];
        payload.extend_from_slice(&bbframe::encode_bbheader(100, Some(0), false, BbMode::HighEfficiency));
        payload.extend_from_slice(&[0x5A; 100]);
        encode_packet(T2MI_TYPE_BBFRAME, count, &payload)
    }

    #[test]
    fn test_packets_split_across_ts_payloads() {
        let mut stream = Vec::new();
        let mut starts = Vec::new();
        for i in 0..4u8 {
            starts.push(stream.len());
            stream.extend(bb_packet(i, i % 2));
        }
        starts.push(stream.len());
        stream.extend(encode_packet(T2MI_TYPE_TIMESTAMP, 4, &[0x04; 11]));

        let mut ch = T2miChannel::new(0x40, 1000);
        let mut total = 0;
        for (payload, pusi) in packetize(&stream, &starts) {
            total += ch.feed(&payload, pusi);
        }
        assert_eq!(total, 5);
        assert_eq!(ch.stats.count_errors, 0);
        assert_eq!(ch.plp_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(ch.plp(1).unwrap().packets().len(), 2);
        assert_eq!(ch.timestamp.map(|t| t.bandwidth), Some(4));
        assert_eq!(ch.stats.by_type[&T2MI_TYPE_BBFRAME], 4);
    }

    #[test]
    fn test_waits_for_unit_start() {
        let packet = bb_packet(0, 0);
        let mut ch = T2miChannel::new(0x40, 1000);
        // continuation bytes before any pointer are ignored
        assert_eq!(ch.feed(&packet[10..], false), 0);
        let mut first = vec![0];
        first.extend_from_slice(&packet);
        assert_eq!(ch.feed(&first, true), 1);
    }

    #[test]
    fn test_crc_error_keeps_following_packets() {
        let mut bad = bb_packet(0, 0);
        bad[20] ^= 1;
        let good = bb_packet(1, 0);
        let timestamp = encode_packet(T2MI_TYPE_TIMESTAMP, 2, &[0x04; 11]);

        // all three start inside one payload behind a single pointer
        let mut ch = T2miChannel::new(0x40, 1000);
        let mut p = vec![0];
        p.extend_from_slice(&bad);
        p.extend_from_slice(&good[..40]);
        assert_eq!(ch.feed(&p, true), 0);
        assert_eq!(ch.stats.crc_errors, 1);

        let mut rest = good[40..].to_vec();
        rest.extend_from_slice(&timestamp);
        assert_eq!(ch.feed(&rest, false), 2);
        assert_eq!(ch.plp(0).unwrap().packets()[0].packet_count, 1);
        assert!(ch.timestamp.is_some());
        assert_eq!(ch.stats.resyncs, 0);
    }

    #[test]
    fn test_backlog_limit() {
        let mut ch = T2miChannel::new(0x40, 3);
        for i in 0..5u8 {
            let mut p = vec![0];
            p.extend_from_slice(&bb_packet(i, 7));
            ch.feed(&p, true);
        }
        let plp = ch.plp(7).unwrap();
        assert_eq!(plp.packets().len(), 3);
        assert_eq!(plp.received, 5);
        assert_eq!(plp.dropped, 2);
    }
}
