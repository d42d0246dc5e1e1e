//! DVB-T2 baseband frame header (ETSI EN 302 755, 5.1.7).

use bitstream_io::{BigEndian, BitRead, BitReader};
use crc::{CRC_8_DVB_S2, Crc};
use serde::Serialize;

use crate::constants::{BBHEADER_SIZE, SYNCD_NO_BOUNDARY};
use crate::error::{Result, truncated};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_DVB_S2);

/// Input stream mode, signalled by XOR-ing the header CRC-8 with MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BbMode {
    /// Normal mode: each user packet keeps a leading byte (CRC-8 of the previous packet).
    Normal,
    /// High efficiency mode: the sync byte is removed from user packets.
    HighEfficiency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BbHeader {
    /// MATYPE-1: 0b11 = transport stream
    pub ts_gs: u8,
    pub single_input_stream: bool,
    pub constant_coding: bool,
    pub issy_indicator: bool,
    pub null_packet_deletion: bool,
    pub ext: u8,
    /// MATYPE-2
    pub input_stream_id: u8,
    /// UPL in NM, ISSY in HEM
    pub upl: u16,
    /// Data field length in bits
    pub dfl: u16,
    pub sync: u8,
    /// Distance in bits from the start of the data field to the first user packet
    pub syncd: u16,
    pub crc8: u8,
    /// `None` when the CRC-8 matches neither mode
    pub mode: Option<BbMode>,
}

impl BbHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut br = BitReader::endian(bytes, BigEndian);
        let ts_gs = br.read::<2, u8>().map_err(truncated("BBHEADER"))?;
        let single_input_stream = br.read_bit().map_err(truncated("BBHEADER"))?;
        let constant_coding = br.read_bit().map_err(truncated("BBHEADER"))?;
        let issy_indicator = br.read_bit().map_err(truncated("BBHEADER"))?;
        let null_packet_deletion = br.read_bit().map_err(truncated("BBHEADER"))?;
        let ext = br.read::<2, u8>().map_err(truncated("BBHEADER"))?;
        let input_stream_id = br.read::<8, u8>().map_err(truncated("BBHEADER"))?;
        let upl = br.read::<16, u16>().map_err(truncated("BBHEADER"))?;
        let dfl = br.read::<16, u16>().map_err(truncated("BBHEADER"))?;
        let sync = br.read::<8, u8>().map_err(truncated("BBHEADER"))?;
        let syncd = br.read::<16, u16>().map_err(truncated("BBHEADER"))?;
        let crc8 = br.read::<8, u8>().map_err(truncated("BBHEADER"))?;

        let calc = CRC8.checksum(&bytes[..BBHEADER_SIZE - 1]);
        let mode = if crc8 == calc {
            Some(BbMode::Normal)
        } else if crc8 == calc ^ 0x01 {
            Some(BbMode::HighEfficiency)
        } else {
            None
        };

        Ok(Self {
            ts_gs,
            single_input_stream,
            constant_coding,
            issy_indicator,
            null_packet_deletion,
            ext,
            input_stream_id,
            upl,
            dfl,
            sync,
            syncd,
            crc8,
            mode,
        })
    }

    /// Declared data field length, in whole bytes.
    pub fn data_field_len(&self) -> usize {
        self.dfl as usize / 8
    }

    /// Byte offset of the first user packet in the data field, if one starts here.
    pub fn sync_distance(&self) -> Option<usize> {
        (self.syncd != SYNCD_NO_BOUNDARY).then_some(self.syncd as usize / 8)
    }

    /// Deleted-null-packet counter bytes following each user packet.
    pub fn dnp_len(&self) -> usize {
        usize::from(self.null_packet_deletion)
    }

    pub fn is_transport_stream(&self) -> bool {
        self.ts_gs == 0b11
    }
}

/// Encode a header with a valid CRC-8. Test fixture shared by the t2mi tests.
#[cfg(test)]
pub(crate) fn encode_bbheader(dfl_bytes: usize, syncd_bytes: Option<usize>, npd: bool, mode: BbMode) -> [u8; BBHEADER_SIZE] {
    let syncd = syncd_bytes.map_or(SYNCD_NO_BOUNDARY, |b| (b * 8) as u16);
    let dfl = (dfl_bytes * 8) as u16;
    let matype1 = 0b1111_0000 | if npd { 0x04 } else { 0 };
    let mut h = [
        matype1,
        0x00,
        0x05,
        0xE0, // UPL = 188 * 8
        (dfl >> 8) as u8,
        dfl as u8,
        0x47,
        (syncd >> 8) as u8,
        syncd as u8,
        0,
    ];
    let crc = CRC8.checksum(&h[..BBHEADER_SIZE - 1]);
    h[9] = match mode {
        BbMode::Normal => crc,
        BbMode::HighEfficiency => crc ^ 0x01,
    };
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hem_header() {
        let raw = encode_bbheader(200, Some(17), true, BbMode::HighEfficiency);
        let h = BbHeader::parse(&raw).unwrap();
        assert!(h.is_transport_stream());
        assert!(h.single_input_stream);
        assert!(h.null_packet_deletion);
        assert_eq!(h.upl, 188 * 8);
        assert_eq!(h.data_field_len(), 200);
        assert_eq!(h.sync_distance(), Some(17));
        assert_eq!(h.dnp_len(), 1);
        assert_eq!(h.mode, Some(BbMode::HighEfficiency));
    }

    #[test]
    fn test_mode_detection() {
        let raw = encode_bbheader(100, None, false, BbMode::Normal);
        let h = BbHeader::parse(&raw).unwrap();
        assert_eq!(h.mode, Some(BbMode::Normal));
        assert_eq!(h.sync_distance(), None);

        let mut broken = raw;
        broken[9] ^= 0x80;
        assert_eq!(BbHeader::parse(&broken).unwrap().mode, None);
    }

    #[test]
    fn test_truncated_header() {
        assert!(BbHeader::parse(&[0xF0, 0x00, 0x05]).is_err());
    }
}
