//! Per-PID runtime state and the serialisable statistics derived from it

use serde::Serialize;

use crate::constants::CC_MODULUS;
use crate::es::PesAssembler;
use crate::pcr::{ClockReference, ClockSample};
use crate::psi::SectionAssembler;
use crate::t2mi::T2miChannel;
use crate::types::Classification;

/// Reassembly machinery owned by a channel, chosen by its classification.
#[derive(Debug, Default)]
pub enum Reassembly {
    #[default]
    Unclassified,
    Sections(SectionAssembler),
    /// `None` unless PES collection is enabled
    Stream(Option<PesAssembler>),
    T2mi(Box<T2miChannel>),
}

impl Reassembly {
    pub fn classification(&self) -> Classification {
        match self {
            Reassembly::Unclassified => Classification::Unknown,
            Reassembly::Sections(_) => Classification::Table,
            Reassembly::Stream(_) => Classification::ElementaryStream,
            Reassembly::T2mi(_) => Classification::T2mi,
        }
    }

    /// Abandon whatever partial unit is buffered.
    pub fn reset(&mut self) {
        match self {
            Reassembly::Unclassified | Reassembly::Stream(None) => {}
            Reassembly::Sections(assembler) => assembler.reset(),
            Reassembly::Stream(Some(pes)) => pes.reset(),
            Reassembly::T2mi(t2mi) => t2mi.reset(),
        }
    }
}

/// Result of the continuity check on one payload-bearing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// In sequence, first packet, or restarted by discontinuity_indicator
    Accept,
    /// Repeat of the previous counter; payload must be dropped
    Duplicate,
    /// Counter jumped; partial units are gone
    Discontinuity { expected: u8 },
}

/// Runtime record for one PID. Created on first sight, never removed.
#[derive(Debug, Default)]
pub struct ChannelState {
    pub pid: u16,
    pub scrambled: bool,
    pub total: u64,
    pub duplicates: u64,
    pub cc_errors: u64,
    pub transport_errors: u64,
    pub scrambled_packets: u64,
    last_cc: Option<u8>,
    duplicate_seen: bool,
    pub clock: ClockReference,
    pub sections: u64,
    pub section_crc_errors: u64,
    pub malformed_sections: u64,
    pub payload_bytes: u64,
    pub reassembly: Reassembly,
}

impl ChannelState {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    pub fn classification(&self) -> Classification {
        self.reassembly.classification()
    }

    pub fn last_cc(&self) -> Option<u8> {
        self.last_cc
    }

    /// Continuity check for a packet that carries payload.
    ///
    /// `restart` is the adaptation field's discontinuity_indicator: the
    /// counter may legitimately jump, so the packet is taken as a new start.
    pub fn check_continuity(&mut self, cc: u8, restart: bool) -> Continuity {
        let Some(prev) = self.last_cc else {
            self.accept(cc);
            return Continuity::Accept;
        };
        let expected = (prev + 1) % CC_MODULUS;
        if cc == expected {
            self.accept(cc);
            return Continuity::Accept;
        }
        if restart {
            tracing::debug!(pid = self.pid, prev, cc, "counter restarted by discontinuity_indicator");
            self.accept(cc);
            return Continuity::Accept;
        }
        if cc == prev {
            if self.duplicate_seen {
                tracing::warn!(pid = self.pid, cc, "counter repeated more than once");
            } else {
                self.duplicate_seen = true;
                self.duplicates += 1;
                tracing::trace!(pid = self.pid, cc, "duplicate packet");
            }
            return Continuity::Duplicate;
        }

        tracing::warn!(pid = self.pid, expected, got = cc, "continuity error");
        self.cc_errors += 1;
        self.last_cc = None;
        self.duplicate_seen = false;
        self.reassembly.reset();
        Continuity::Discontinuity { expected }
    }

    fn accept(&mut self, cc: u8) {
        self.last_cc = Some(cc);
        self.duplicate_seen = false;
    }

    pub fn stats(&self) -> ChannelStats {
        let (pes_packets, t2mi_packets) = match &self.reassembly {
            Reassembly::Stream(Some(pes)) => (Some(pes.completed), None),
            Reassembly::T2mi(t2mi) => (None, Some(t2mi.stats.packets)),
            _ => (None, None),
        };
        ChannelStats {
            pid: self.pid,
            classification: self.classification(),
            scrambled: self.scrambled,
            total: self.total,
            duplicates: self.duplicates,
            cc_errors: self.cc_errors,
            transport_errors: self.transport_errors,
            last_cc: self.last_cc,
            first_pcr: self.clock.first,
            last_pcr: self.clock.last,
            pcr_wraps: self.clock.wraps,
            bitrate: self.clock.bitrate,
            sections: self.sections,
            section_crc_errors: self.section_crc_errors,
            payload_bytes: self.payload_bytes,
            pes_packets,
            t2mi_packets,
        }
    }
}

/// Snapshot of one channel for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub pid: u16,
    pub classification: Classification,
    pub scrambled: bool,
    pub total: u64,
    pub duplicates: u64,
    pub cc_errors: u64,
    pub transport_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cc: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_pcr: Option<ClockSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pcr: Option<ClockSample>,
    pub pcr_wraps: u64,
    /// bits/s over the current PCR window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    pub sections: u64,
    pub section_crc_errors: u64,
    pub payload_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pes_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2mi_packets: Option<u64>,
}
