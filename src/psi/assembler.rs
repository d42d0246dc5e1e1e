//! Reassembles sections spread over consecutive packets of one PID.

use bytes::Bytes;

use crate::constants::{MAX_SECTION_LENGTH, SECTION_HEADER_SIZE, STUFFING_BYTE};
use crate::error::Result;
use crate::psi::section::{Section, declared_length};

/// Section buffer for collecting PSI data across packets.
#[derive(Debug)]
pub struct SectionAssembler {
    pid: u16,
    pending: Vec<u8>,
    /// Total size (header included) once the 3-byte header is known
    expected: Option<usize>,
    /// False until a unit start has been seen since creation or the last reset
    synced: bool,
    max_section_length: usize,
    pub oversized: u64,
    pub truncated: u64,
}

impl SectionAssembler {
    pub fn new(pid: u16) -> Self {
        Self::with_limit(pid, MAX_SECTION_LENGTH)
    }

    pub fn with_limit(pid: u16, max_section_length: usize) -> Self {
        Self {
            pid,
            pending: Vec::new(),
            expected: None,
            synced: false,
            max_section_length,
            oversized: 0,
            truncated: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop any partial section and wait for the next unit start.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.expected = None;
        self.synced = false;
    }

    /// Feed one packet payload; returns every section completed by it.
    pub fn feed(&mut self, payload: &[u8], unit_start: bool, packet_index: u64) -> Vec<Result<Section>> {
        let mut out = Vec::new();
        let mut data = payload;

        if unit_start {
            let Some((&pointer, rest)) = data.split_first() else {
                return out;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                tracing::warn!(pid = self.pid, pointer, "pointer_field beyond payload");
                self.reset();
                return out;
            }
            let (tail, head) = rest.split_at(pointer);
            if self.in_progress() {
                self.consume(tail, packet_index, true, &mut out);
            }
            if self.in_progress() {
                tracing::debug!(pid = self.pid, have = self.pending.len(), "section cut short by unit start");
                self.truncated += 1;
            }
            self.pending.clear();
            self.expected = None;
            self.synced = true;
            data = head;
        } else if !self.synced {
            return out;
        }

        self.consume(data, packet_index, false, &mut out);
        out
    }

    /// With `single`, stop after the section in progress completes; used for
    /// the bytes in front of the pointer target.
    fn consume(&mut self, mut data: &[u8], packet_index: u64, single: bool, out: &mut Vec<Result<Section>>) {
        while !data.is_empty() {
            if self.pending.is_empty() && data[0] == STUFFING_BYTE {
                break; // remainder of the payload is stuffing
            }

            let total = match self.expected {
                Some(total) => total,
                None => {
                    let take = (SECTION_HEADER_SIZE - self.pending.len()).min(data.len());
                    self.pending.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    let Some(length) = declared_length(&self.pending) else {
                        continue;
                    };
                    if length > self.max_section_length {
                        tracing::warn!(pid = self.pid, length, "section_length over limit, resyncing");
                        self.oversized += 1;
                        self.reset();
                        return;
                    }
                    let total = SECTION_HEADER_SIZE + length;
                    self.pending.reserve_exact(total - self.pending.len());
                    self.expected = Some(total);
                    total
                }
            };

            let take = (total - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == total {
                let raw = Bytes::from(std::mem::take(&mut self.pending));
                self.expected = None;
                out.push(Section::parse(self.pid, raw, packet_index));
                if single {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::long_section;

    fn payload(pointer: Option<u8>, parts: &[&[u8]]) -> Vec<u8> {
        let mut p = Vec::new();
        if let Some(ptr) = pointer {
            p.push(ptr);
        }
        for part in parts {
            p.extend_from_slice(part);
        }
        p.resize(184, STUFFING_BYTE);
        p
    }

    fn ok(results: Vec<Result<Section>>) -> Vec<Section> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_single_packet_section_then_stuffing() {
        let sec = long_section(0x00, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let mut asm = SectionAssembler::new(0);
        let done = ok(asm.feed(&payload(Some(0), &[&sec]), true, 0));
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].raw[..], &sec[..]);
        assert!(!asm.in_progress());
    }

    #[test]
    fn test_two_sections_in_one_payload() {
        let a = long_section(0x4E, 1, 0, 0, 1, &[0; 6]);
        let b = long_section(0x4E, 1, 0, 1, 1, &[0; 6]);
        let mut asm = SectionAssembler::new(0x12);
        let done = ok(asm.feed(&payload(Some(0), &[&a, &b]), true, 0));
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].section_number(), 1);
    }

    #[test]
    fn test_section_spanning_packets() {
        let body: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let sec = long_section(0x42, 7, 1, 0, 0, &body);
        let mut asm = SectionAssembler::new(0x11);

        let first = payload(Some(0), &[&sec[..183]]);
        assert!(asm.feed(&first, true, 0).is_empty());
        assert!(asm.in_progress());

        let second = payload(None, &[&sec[183..]]);
        let done = ok(asm.feed(&second, false, 1));
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].raw[..], &sec[..]);
        assert_eq!(done[0].first_packet, 1);
    }

    #[test]
    fn test_pointer_completes_previous_section() {
        let a = long_section(0x02, 1, 0, 0, 0, &[0xAA; 200]);
        let b = long_section(0x02, 2, 0, 0, 0, &[0xBB; 4]);
        let mut asm = SectionAssembler::new(0x100);

        assert!(asm.feed(&payload(Some(0), &[&a[..183]]), true, 0).is_empty());
        let rest = &a[183..];
        let second = payload(Some(rest.len() as u8), &[rest, &b]);
        let done = ok(asm.feed(&second, true, 1));
        assert_eq!(done.len(), 2);
        assert_eq!(&done[0].raw[..], &a[..]);
        assert_eq!(&done[1].raw[..], &b[..]);
    }

    #[test]
    fn test_header_split_across_packets() {
        let sec = long_section(0x02, 1, 0, 0, 0, &[0x11; 8]);
        let mut asm = SectionAssembler::new(0x100);
        // the pointer skips a section nobody was waiting for; the next
        // section's header starts in the last two bytes
        let mut first = vec![181u8];
        let filler = long_section(0x02, 9, 0, 0, 0, &[0x22; 169]);
        assert_eq!(filler.len(), 181);
        first.extend_from_slice(&filler);
        first.extend_from_slice(&sec[..2]);
        assert_eq!(first.len(), 184);
        assert!(ok(asm.feed(&first, true, 0)).is_empty());

        let done = ok(asm.feed(&payload(None, &[&sec[2..]]), false, 1));
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].raw[..], &sec[..]);
    }

    #[test]
    fn test_continuation_without_unit_start_is_ignored() {
        let sec = long_section(0x02, 1, 0, 0, 0, &[0; 4]);
        let mut asm = SectionAssembler::new(0x100);
        assert!(asm.feed(&payload(None, &[&sec]), false, 0).is_empty());
        assert!(!asm.in_progress());
    }

    #[test]
    fn test_reset_abandons_partial_section() {
        let sec = long_section(0x02, 1, 0, 0, 0, &[0x33; 300]);
        let mut asm = SectionAssembler::new(0x100);
        asm.feed(&payload(Some(0), &[&sec[..183]]), true, 0);
        asm.reset();
        assert!(asm.feed(&payload(None, &[&sec[183..]]), false, 1).is_empty());
        assert!(!asm.in_progress());
    }

    #[test]
    fn test_oversized_section_rejected() {
        let mut asm = SectionAssembler::with_limit(0x100, 1021);
        // section_length = 0xFFF
        let done = asm.feed(&payload(Some(0), &[&[0x02, 0xBF, 0xFF]]), true, 0);
        assert!(done.is_empty());
        assert_eq!(asm.oversized, 1);
        assert!(!asm.in_progress());
    }
}
