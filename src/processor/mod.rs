//! Main packet processing logic: per-PID continuity, classification, PCR
//! tracking and dispatch into section, PES or T2-MI reassembly.

use std::collections::BTreeMap;

use crate::constants::*;
use crate::error::DemuxError;
use crate::es::{EsSink, NullSink, PesAssembler};
use crate::packet::Frame;
use crate::psi::{SectionAssembler, TableIdentity, UpdateOutcome, VersionedTableStore};
use crate::stats::{ChannelState, ChannelStats, Continuity, Reassembly};
use crate::t2mi::{PlpExtractor, T2miChannel};
use crate::types::DemuxConfig;

/// A section that became available through the last processed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionUpdate {
    pub identity: TableIdentity,
    pub instance_key: u64,
    pub section_number: u8,
    pub version: Option<u8>,
    pub outcome: UpdateOutcome,
}

pub struct Demultiplexer {
    config: DemuxConfig,
    channels: BTreeMap<u16, ChannelState>,
    store: VersionedTableStore,
    sink: Box<dyn EsSink + Send>,
    packet_index: u64,
    pub null_packets: u64,
    pub invalid_packets: u64,
}

impl Demultiplexer {
    pub fn new(config: DemuxConfig) -> Self {
        Self::with_sink(config, Box::new(NullSink))
    }

    pub fn with_sink(config: DemuxConfig, sink: Box<dyn EsSink + Send>) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
            store: VersionedTableStore::new(),
            sink,
            packet_index: 0,
            null_packets: 0,
            invalid_packets: 0,
        }
    }

    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    /// Packets seen so far, the invalid and null ones included.
    pub fn packet_count(&self) -> u64 {
        self.packet_index
    }

    /// Parse and process one raw packet. Unparseable packets are counted and skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SectionUpdate> {
        match Frame::parse(chunk) {
            Ok(frame) => self.process(&frame),
            Err(err) => {
                tracing::debug!(index = self.packet_index, %err, "invalid packet");
                self.invalid_packets += 1;
                self.packet_index += 1;
                Vec::new()
            }
        }
    }

    /// Consume one frame in arrival order.
    pub fn process(&mut self, frame: &Frame) -> Vec<SectionUpdate> {
        let index = self.packet_index;
        self.packet_index += 1;

        if frame.pid == self.config.null_pid {
            self.null_packets += 1;
            return Vec::new();
        }

        let config = &self.config;
        let channel = self
            .channels
            .entry(frame.pid)
            .or_insert_with(|| open_channel(frame.pid, config));
        channel.total += 1;

        if frame.transport_error {
            channel.transport_errors += 1;
            tracing::trace!(pid = frame.pid, "transport_error_indicator set");
            return Vec::new();
        }

        if frame.has_payload() {
            match channel.check_continuity(frame.continuity_counter, frame.discontinuity()) {
                Continuity::Accept => {}
                Continuity::Duplicate => return Vec::new(),
                Continuity::Discontinuity { .. } => {
                    if channel.classification() == crate::types::Classification::ElementaryStream {
                        self.sink.on_discontinuity(frame.pid);
                    }
                }
            }
        }

        if let Some(pcr) = frame.pcr() {
            channel
                .clock
                .update(pcr, index, frame.discontinuity(), config.packet_size, config.clock_hz);
        }

        if !frame.has_payload() || frame.payload.is_empty() {
            return Vec::new();
        }
        if frame.is_scrambled() {
            if !channel.scrambled {
                tracing::debug!(pid = frame.pid, sc = frame.scrambling_control, "channel is scrambled");
                channel.scrambled = true;
            }
            channel.scrambled_packets += 1;
            return Vec::new();
        }
        channel.payload_bytes += frame.payload.len() as u64;

        if let Reassembly::Unclassified = channel.reassembly {
            if let Some(reassembly) = classify(frame, config) {
                tracing::debug!(pid = frame.pid, class = ?reassembly.classification(), "channel classified");
                channel.reassembly = reassembly;
            }
        }

        let mut updates = Vec::new();
        match &mut channel.reassembly {
            Reassembly::Unclassified => {}
            Reassembly::Sections(assembler) => {
                for result in assembler.feed(frame.payload, frame.payload_unit_start, index) {
                    match result {
                        Ok(section) => {
                            channel.sections += 1;
                            let identity = TableIdentity::of(&section);
                            let instance_key = section.instance_key;
                            let section_number = section.section_number();
                            let version = section.version();
                            let outcome = self.store.update(section);
                            tracing::trace!(pid = frame.pid, table_id = identity.table_id, ?outcome, "section");
                            if outcome.is_new() {
                                updates.push(SectionUpdate {
                                    identity,
                                    instance_key,
                                    section_number,
                                    version,
                                    outcome,
                                });
                            }
                        }
                        Err(DemuxError::SectionCrc { pid, table_id }) => {
                            tracing::warn!(pid, table_id, "section CRC-32 mismatch");
                            channel.section_crc_errors += 1;
                        }
                        Err(err) => {
                            tracing::debug!(pid = frame.pid, %err, "malformed section");
                            channel.malformed_sections += 1;
                        }
                    }
                }
            }
            Reassembly::Stream(pes) => {
                self.sink.on_payload(frame.pid, frame.payload_unit_start, frame.payload);
                if let Some(pes) = pes {
                    pes.feed(frame.payload, frame.payload_unit_start, self.sink.as_mut());
                }
            }
            Reassembly::T2mi(t2mi) => {
                t2mi.feed(frame.payload, frame.payload_unit_start);
            }
        }
        updates
    }

    pub fn channel(&self, pid: u16) -> Option<&ChannelState> {
        self.channels.get(&pid)
    }

    /// Channels in PID order.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.values()
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.channels.values().map(ChannelState::stats).collect()
    }

    pub fn store(&self) -> &VersionedTableStore {
        &self.store
    }

    pub fn t2mi(&self, pid: u16) -> Option<&T2miChannel> {
        match &self.channels.get(&pid)?.reassembly {
            Reassembly::T2mi(t2mi) => Some(t2mi),
            _ => None,
        }
    }

    pub fn t2mi_mut(&mut self, pid: u16) -> Option<&mut T2miChannel> {
        match &mut self.channels.get_mut(&pid)?.reassembly {
            Reassembly::T2mi(t2mi) => Some(t2mi),
            _ => None,
        }
    }

    pub fn t2mi_channels(&self) -> impl Iterator<Item = &T2miChannel> {
        self.channels.values().filter_map(|ch| match &ch.reassembly {
            Reassembly::T2mi(t2mi) => Some(t2mi.as_ref()),
            _ => None,
        })
    }

    /// Pull iterator over the transport packets rebuilt from one PLP.
    pub fn plp_extractor(&mut self, pid: u16, plp: u8) -> Option<PlpExtractor<'_>> {
        Some(self.t2mi_mut(pid)?.plp_mut(plp)?.extractor())
    }
}

fn open_channel(pid: u16, config: &DemuxConfig) -> ChannelState {
    let mut channel = ChannelState::new(pid);
    if config.t2mi_pids.contains(&pid) {
        channel.reassembly = Reassembly::T2mi(Box::new(T2miChannel::new(pid, config.max_plp_backlog)));
    }
    channel
}

/// Decide from the first unit start what the channel carries.
fn classify(frame: &Frame, config: &DemuxConfig) -> Option<Reassembly> {
    if !frame.payload_unit_start {
        return None;
    }
    let payload = frame.payload;
    if payload.starts_with(&PES_START_CODE) {
        let pes = config.collect_pes.then(|| PesAssembler::new(frame.pid));
        return Some(Reassembly::Stream(pes));
    }
    let pointer = *payload.first()? as usize;
    match payload.get(1 + pointer) {
        Some(&table_id) if table_id != STUFFING_BYTE => Some(Reassembly::Sections(SectionAssembler::with_limit(
            frame.pid,
            config.max_section_length,
        ))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::long_section;
    use crate::types::Classification;

    fn ts(pid: u16, cc: u8, pusi: bool, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![
            TS_SYNC_BYTE,
            (if pusi { 0x40 } else { 0 }) | (pid >> 8) as u8,
            pid as u8,
            0x10 | cc,
        ];
        p.extend_from_slice(payload);
        p.resize(TS_PACKET_SIZE, STUFFING_BYTE);
        p
    }

    fn pcr_packet(pid: u16, cc: u8, base: u64, discontinuity: bool) -> Vec<u8> {
        let mut p = vec![TS_SYNC_BYTE, (pid >> 8) as u8, pid as u8, 0x20 | cc, 183];
        p.push(0x10 | if discontinuity { 0x80 } else { 0 });
        p.extend_from_slice(&[
            (base >> 25) as u8,
            (base >> 17) as u8,
            (base >> 9) as u8,
            (base >> 1) as u8,
            ((base & 1) << 7) as u8 | 0x7E,
            0,
        ]);
        p.resize(TS_PACKET_SIZE, STUFFING_BYTE);
        p
    }

    fn section_packet(cc: u8, version: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0];
        payload.extend(long_section(0x02, 1, version, 0, 0, body));
        ts(0x100, cc, true, &payload)
    }

    #[test]
    fn test_counter_property() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        // in order, duplicate, repeated duplicate, jump, restart, in order
        for cc in [0, 1, 2, 2, 2, 7, 8, 9] {
            demux.feed(&ts(0x200, cc, false, &[0x11; 10]));
        }
        let ch = demux.channel(0x200).unwrap();
        assert_eq!(ch.total, 8);
        assert_eq!(ch.duplicates, 1);
        assert_eq!(ch.cc_errors, 1);
        assert_eq!(ch.last_cc(), Some(9));
    }

    #[test]
    fn test_null_pid_never_tracked() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        for cc in [0, 5, 5, 3] {
            demux.feed(&ts(NULL_PID, cc, false, &[]));
        }
        assert!(demux.channel(NULL_PID).is_none());
        assert_eq!(demux.null_packets, 4);
        assert_eq!(demux.packet_count(), 4);
    }

    #[test]
    fn test_adaptation_only_does_not_advance_counter() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        demux.feed(&ts(0x30, 4, false, &[1]));
        demux.feed(&pcr_packet(0x30, 4, 1000, false));
        demux.feed(&ts(0x30, 5, false, &[1]));
        let ch = demux.channel(0x30).unwrap();
        assert_eq!(ch.cc_errors, 0);
        assert_eq!(ch.duplicates, 0);
    }

    #[test]
    fn test_scrambled_payload_skipped() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        let mut p = ts(0x300, 0, true, &[0, 0x02, 0xB0]);
        p[3] |= 0x80;
        demux.feed(&p);
        let ch = demux.channel(0x300).unwrap();
        assert!(ch.scrambled);
        assert_eq!(ch.classification(), Classification::Unknown);
        assert_eq!(ch.payload_bytes, 0);
    }

    #[test]
    fn test_transport_error_counted_and_ignored() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        demux.feed(&ts(0x40, 0, false, &[]));
        let mut p = ts(0x40, 9, false, &[]);
        p[1] |= 0x80;
        demux.feed(&p);
        demux.feed(&ts(0x40, 1, false, &[]));
        let ch = demux.channel(0x40).unwrap();
        assert_eq!(ch.transport_errors, 1);
        assert_eq!(ch.cc_errors, 0);
    }

    #[test]
    fn test_classification() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        demux.feed(&ts(0x101, 0, true, &[0x00, 0x00, 0x01, 0xE0, 0, 0]));
        demux.feed(&section_packet(0, 1, &[1, 2, 3]));
        // continuation without a unit start stays unknown
        demux.feed(&ts(0x102, 0, false, &[0x00, 0x00, 0x01]));
        assert_eq!(demux.channel(0x101).unwrap().classification(), Classification::ElementaryStream);
        assert_eq!(demux.channel(0x100).unwrap().classification(), Classification::Table);
        assert_eq!(demux.channel(0x102).unwrap().classification(), Classification::Unknown);
    }

    #[test]
    fn test_section_updates_and_version_replacement() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        let first = demux.feed(&section_packet(0, 1, b"AAAA"));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome, UpdateOutcome::New);

        assert!(demux.feed(&section_packet(1, 1, b"AAAA")).is_empty());
        let changed = demux.feed(&section_packet(2, 2, b"BBBB"));
        assert_eq!(changed[0].outcome, UpdateOutcome::VersionChanged { previous: 1 });
        // the superseded version coming back is not new
        assert!(demux.feed(&section_packet(3, 1, b"AAAA")).is_empty());

        let identity = TableIdentity { pid: 0x100, table_id: 0x02 };
        let stored = demux.store().get(identity, 1, 0).unwrap();
        assert_eq!(stored.version(), Some(2));
        assert_eq!(stored.body(), b"BBBB");
        assert_eq!(stored.occurrences, 1);
    }

    #[test]
    fn test_bad_section_crc_counted() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        let mut p = section_packet(0, 1, b"AAAA");
        p[14] ^= 0xFF;
        assert!(demux.feed(&p).is_empty());
        assert_eq!(demux.channel(0x100).unwrap().section_crc_errors, 1);
        assert_eq!(demux.store().stats.sections_stored, 0);
    }

    #[test]
    fn test_bitrate_from_pcr() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        // 1000 packets apart, 0.0752 s of 90 kHz clock => 20 Mbit/s
        demux.feed(&pcr_packet(0x31, 0, 0, false));
        for i in 0..999u32 {
            demux.feed(&ts(0x200, (i % 16) as u8, false, &[]));
        }
        demux.feed(&pcr_packet(0x31, 0, 6768, false));
        let ch = demux.channel(0x31).unwrap();
        assert_eq!(ch.clock.bitrate, Some(1000 * 188 * 8 * 90_000 / 6768));
    }

    #[test]
    fn test_pcr_discontinuity_restarts_window() {
        let mut demux = Demultiplexer::new(DemuxConfig::default());
        demux.feed(&pcr_packet(0x31, 0, 0, false));
        demux.feed(&pcr_packet(0x31, 0, 900, false));
        assert!(demux.channel(0x31).unwrap().clock.bitrate.is_some());
        demux.feed(&pcr_packet(0x31, 0, 5_000_000, true));
        let clock = &demux.channel(0x31).unwrap().clock;
        assert_eq!(clock.bitrate, None);
        assert_eq!(clock.first, clock.last);
    }

    #[test]
    fn test_pes_sink() {
        #[derive(Default)]
        struct Count {
            payloads: usize,
            pes: usize,
        }
        impl EsSink for std::sync::Arc<std::sync::Mutex<Count>> {
            fn on_payload(&mut self, _pid: u16, _unit_start: bool, _payload: &[u8]) {
                self.lock().unwrap().payloads += 1;
            }
            fn on_pes(&mut self, _pid: u16, _packet: &[u8]) {
                self.lock().unwrap().pes += 1;
            }
        }

        let count = std::sync::Arc::new(std::sync::Mutex::new(Count::default()));
        let config = DemuxConfig {
            collect_pes: true,
            ..Default::default()
        };
        let mut demux = Demultiplexer::with_sink(config, Box::new(count.clone()));
        // PES_packet_length 178 fits exactly in one payload of 184
        let mut pes = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 178];
        pes.resize(184, 0x55);
        demux.feed(&ts(0x150, 0, true, &pes));
        demux.feed(&ts(0x150, 1, false, &[0x55; 184]));
        let count = count.lock().unwrap();
        assert_eq!(count.payloads, 2);
        assert_eq!(count.pes, 1);
    }
}
