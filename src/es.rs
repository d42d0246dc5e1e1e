//! Elementary-stream forwarding and optional PES reassembly.
//!
//! Codec parsing is not done here; it belongs to whatever implements
//! [`EsSink`].

use crate::constants::{PES_HEADER_SIZE, PES_START_CODE};

/// Receives elementary-stream data from the demultiplexer.
pub trait EsSink {
    /// Payload of every accepted, unscrambled packet on an ES channel.
    fn on_payload(&mut self, _pid: u16, _unit_start: bool, _payload: &[u8]) {}

    /// One complete PES packet, header included. Only called when PES
    /// collection is enabled.
    fn on_pes(&mut self, _pid: u16, _packet: &[u8]) {}

    /// The channel lost continuity; any partial unit is gone.
    fn on_discontinuity(&mut self, _pid: u16) {}
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EsSink for NullSink {}

/// Collects PES packets for one PID.
///
/// Bounded packets complete after `6 + PES_packet_length` bytes. A
/// PES_packet_length of zero (video) means unbounded: the packet ends at the
/// next unit start and the buffer grows as needed.
#[derive(Debug)]
pub struct PesAssembler {
    pid: u16,
    buf: Vec<u8>,
    /// Total size when bounded
    declared: Option<usize>,
    active: bool,
    pub completed: u64,
    pub truncated: u64,
}

impl PesAssembler {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            buf: Vec::new(),
            declared: None,
            active: false,
            completed: 0,
            truncated: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.declared = None;
        self.active = false;
    }

    pub fn feed(&mut self, payload: &[u8], unit_start: bool, sink: &mut dyn EsSink) {
        if unit_start {
            if self.active && !self.buf.is_empty() {
                if self.declared.is_none() {
                    self.emit(sink);
                } else {
                    tracing::debug!(pid = self.pid, have = self.buf.len(), "PES packet cut short");
                    self.truncated += 1;
                }
            }
            self.reset();
            if payload.len() < PES_HEADER_SIZE || !payload.starts_with(&PES_START_CODE) {
                return;
            }
            let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
            self.declared = (length != 0).then_some(PES_HEADER_SIZE + length);
            self.active = true;
        } else if !self.active {
            return;
        }

        self.buf.extend_from_slice(payload);
        if let Some(total) = self.declared {
            if self.buf.len() >= total {
                self.buf.truncate(total);
                self.emit(sink);
                self.reset();
            }
        }
    }

    fn emit(&mut self, sink: &mut dyn EsSink) {
        self.completed += 1;
        sink.on_pes(self.pid, &self.buf);
    }
}
