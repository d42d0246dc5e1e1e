// psi/section.rs
//! Completed PSI / SI sections with CRC-32 (MPEG-2) validation.

use bytes::Bytes;
use crc::{CRC_32_MPEG_2, Crc};
use serde::Serialize;

use crate::constants::*;
use crate::error::{DemuxError, Result};

pub(crate) const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Fields present only when section_syntax_indicator is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LongHeader {
    pub table_id_extension: u16,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section_number: u8,
}

/// One complete section as reassembled from its PID.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub pid: u16,
    pub table_id: u8,
    /// Disambiguates concurrent instances of one table id (program, service, ...)
    pub instance_key: u64,
    pub long: Option<LongHeader>,
    #[serde(skip)]
    pub raw: Bytes,
    pub occurrences: u64,
    pub first_packet: u64,
    pub last_packet: u64,
}

/// `section_length` from the first three bytes of a section.
pub fn declared_length(head: &[u8]) -> Option<usize> {
    if head.len() < SECTION_HEADER_SIZE {
        return None;
    }
    Some((((head[1] & 0x0F) as usize) << 8) | head[2] as usize)
}

impl Section {
    /// Validates length and, for long-form sections, the CRC-32.
    ///
    /// `raw` holds exactly `3 + section_length` bytes.
    pub fn parse(pid: u16, raw: Bytes, packet_index: u64) -> Result<Self> {
        if raw.len() < SECTION_HEADER_SIZE {
            return Err(DemuxError::SectionTooShort { pid, length: raw.len() });
        }
        let table_id = raw[0];
        let syntax_indicator = raw[1] & 0x80 != 0;

        let long = if syntax_indicator {
            if raw.len() < LONG_SECTION_HEADER_SIZE + SECTION_CRC_SIZE {
                return Err(DemuxError::SectionTooShort { pid, length: raw.len() });
            }
            let end = raw.len();
            let crc_calc = CRC_MPEG.checksum(&raw[..end - SECTION_CRC_SIZE]);
            let crc_pkt = u32::from_be_bytes([raw[end - 4], raw[end - 3], raw[end - 2], raw[end - 1]]);
            if crc_calc != crc_pkt {
                return Err(DemuxError::SectionCrc { pid, table_id });
            }
            Some(LongHeader {
                table_id_extension: u16::from_be_bytes([raw[3], raw[4]]),
                version: (raw[5] & 0x3E) >> 1,
                current_next: raw[5] & 0x01 != 0,
                section_number: raw[6],
                last_section_number: raw[7],
            })
        } else {
            None
        };

        let instance_key = instance_key(table_id, long.as_ref(), &raw);
        Ok(Self {
            pid,
            table_id,
            instance_key,
            long,
            raw,
            occurrences: 1,
            first_packet: packet_index,
            last_packet: packet_index,
        })
    }

    pub fn syntax_extended(&self) -> bool {
        self.long.is_some()
    }

    pub fn version(&self) -> Option<u8> {
        self.long.map(|h| h.version)
    }

    pub fn section_number(&self) -> u8 {
        self.long.map_or(0, |h| h.section_number)
    }

    pub fn last_section_number(&self) -> u8 {
        self.long.map_or(0, |h| h.last_section_number)
    }

    /// Bytes between the fixed header and the CRC (long form) or after the
    /// 3-byte header (short form).
    pub fn body(&self) -> &[u8] {
        if self.long.is_some() {
            &self.raw[LONG_SECTION_HEADER_SIZE..self.raw.len() - SECTION_CRC_SIZE]
        } else {
            &self.raw[SECTION_HEADER_SIZE..]
        }
    }

    pub fn same_content(&self, other: &Section) -> bool {
        self.raw == other.raw
    }

    /// CRC-32 over the whole section, used to remember superseded content.
    pub fn digest(&self) -> u32 {
        CRC_MPEG.checksum(&self.raw)
    }
}

/// table_id_extension, widened with the ids that DVB SI tables repeat per
/// transport stream (SDT: original_network_id; EIT: transport_stream_id +
/// original_network_id).
fn instance_key(table_id: u8, long: Option<&LongHeader>, raw: &[u8]) -> u64 {
    let Some(h) = long else { return 0 };
    let ext = h.table_id_extension as u64;
    let body = &raw[LONG_SECTION_HEADER_SIZE..raw.len() - SECTION_CRC_SIZE];
    match table_id {
        SDT_ACTUAL | SDT_OTHER if body.len() >= 2 => {
            (ext << 16) | u16::from_be_bytes([body[0], body[1]]) as u64
        }
        EIT_FIRST..=EIT_LAST if body.len() >= 4 => {
            (ext << 32)
                | (u16::from_be_bytes([body[0], body[1]]) as u64) << 16
                | u16::from_be_bytes([body[2], body[3]]) as u64
        }
        _ => ext,
    }
}

/// Build a long-form section with a valid CRC. Test fixture shared by the psi tests.
#[cfg(test)]
pub(crate) fn long_section(table_id: u8, ext: u16, version: u8, number: u8, last: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + SECTION_CRC_SIZE;
    let mut s = vec![
        table_id,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (ext >> 8) as u8,
        ext as u8,
        0xC1 | ((version & 0x1F) << 1),
        number,
        last,
    ];
    s.extend_from_slice(body);
    let crc = CRC_MPEG.checksum(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_long_section() {
        let raw = long_section(0x02, 0x0101, 3, 0, 1, &[0xE1, 0x00, 0xF0, 0x00]);
        let sec = Section::parse(0x0100, Bytes::from(raw), 42).unwrap();
        assert_eq!(sec.table_id, 0x02);
        assert_eq!(sec.instance_key, 0x0101);
        assert_eq!(sec.version(), Some(3));
        assert_eq!(sec.section_number(), 0);
        assert_eq!(sec.last_section_number(), 1);
        assert_eq!(sec.body(), &[0xE1, 0x00, 0xF0, 0x00]);
        assert_eq!(sec.first_packet, 42);
        assert_eq!(sec.occurrences, 1);
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut raw = long_section(0x00, 1, 0, 0, 0, &[0x00, 0x01, 0xE0, 0x10]);
        raw[9] ^= 0x01;
        assert!(matches!(
            Section::parse(0, Bytes::from(raw), 0),
            Err(DemuxError::SectionCrc { pid: 0, table_id: 0x00 })
        ));
    }

    #[test]
    fn test_short_section_has_no_long_header() {
        // TDT: table_id 0x70, syntax 0, 5 bytes UTC
        let raw = vec![0x70, 0x70, 0x05, 0xE7, 0x8C, 0x12, 0x00, 0x00];
        let sec = Section::parse(0x14, Bytes::from(raw), 0).unwrap();
        assert!(!sec.syntax_extended());
        assert_eq!(sec.version(), None);
        assert_eq!(sec.instance_key, 0);
        assert_eq!(sec.body().len(), 5);
    }

    #[test]
    fn test_eit_instance_key_includes_ts_and_network() {
        let body = [0x00, 0x07, 0x20, 0x85, 0x00, 0x4E];
        let raw = long_section(0x4E, 0x1234, 0, 0, 1, &body);
        let sec = Section::parse(0x12, Bytes::from(raw), 0).unwrap();
        assert_eq!(sec.instance_key, (0x1234u64 << 32) | (0x0007 << 16) | 0x2085);
    }
}
