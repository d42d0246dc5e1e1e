//! T2-MI packets (ETSI TS 102 773) and their typed payloads.

use bitstream_io::{BigEndian, BitRead, BitReader};
use bytes::Bytes;
use serde::Serialize;

use crate::constants::*;
use crate::error::{DemuxError, Result, truncated};
use crate::t2mi::bbframe::BbHeader;

/// One CRC-checked T2-MI packet.
#[derive(Debug, Clone)]
pub struct T2miPacket {
    pub packet_type: u8,
    pub packet_count: u8,
    pub superframe_idx: u8,
    pub stream_id: u8,
    pub payload_len_bits: u16,
    pub crc: u32,
    pub payload: T2miPayload,
}

#[derive(Debug, Clone)]
pub enum T2miPayload {
    BasebandFrame(BasebandFrame),
    L1Current(L1Current),
    Timestamp(T2Timestamp),
    IndividualAddressing(IndividualAddressing),
    Unknown { packet_type: u8, data: Bytes },
}

/// Payload of packet type 0x00.
#[derive(Debug, Clone)]
pub struct BasebandFrame {
    pub frame_idx: u8,
    pub plp_id: u8,
    pub intl_frame_start: bool,
    pub header: BbHeader,
    /// Everything after the BBHEADER, as carried (padding included)
    pub data_field: Bytes,
}

/// A bit string whose length need not be a multiple of 8. The last byte is left-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BitField {
    pub bits: u16,
    pub data: Vec<u8>,
}

/// Payload of packet type 0x10.
#[derive(Debug, Clone, Serialize)]
pub struct L1Current {
    pub frame_idx: u8,
    pub l1_pre: Vec<u8>,
    pub l1_conf: BitField,
    pub l1_dyn_curr: BitField,
    pub l1_ext: BitField,
}

/// Payload of packet type 0x20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct T2Timestamp {
    pub bandwidth: u8,
    pub seconds_since_2000: u64,
    pub subseconds: u32,
    pub utc_offset: u16,
}

/// Payload of packet type 0x21.
#[derive(Debug, Clone, Default)]
pub struct IndividualAddressing {
    pub transmitters: Vec<TxAddressing>,
}

#[derive(Debug, Clone)]
pub struct TxAddressing {
    pub tx_identifier: u16,
    pub functions: Vec<AddressingFunction>,
}

#[derive(Debug, Clone)]
pub struct AddressingFunction {
    pub tag: u8,
    pub body: Bytes,
}

impl T2miPacket {
    /// Decode a packet whose CRC has already been checked.
    ///
    /// `raw` is header + payload, without the trailing CRC.
    pub fn parse(raw: Bytes, crc: u32) -> Result<Self> {
        let mut br = BitReader::endian(&raw[..], BigEndian);
        let packet_type = br.read::<8, u8>().map_err(truncated("T2-MI header"))?;
        let packet_count = br.read::<8, u8>().map_err(truncated("T2-MI header"))?;
        let superframe_idx = br.read::<4, u8>().map_err(truncated("T2-MI header"))?;
        br.skip(9).map_err(truncated("T2-MI header"))?;
        let stream_id = br.read::<3, u8>().map_err(truncated("T2-MI header"))?;
        let payload_len_bits = br.read::<16, u16>().map_err(truncated("T2-MI header"))?;

        let end = (T2MI_HEADER_SIZE + (payload_len_bits as usize).div_ceil(8)).min(raw.len());
        let body = raw.slice(T2MI_HEADER_SIZE..end);

        let payload = match decode_payload(packet_type, &body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(packet_type, %err, "undecodable T2-MI payload kept as raw bytes");
                T2miPayload::Unknown { packet_type, data: body }
            }
        };

        Ok(Self {
            packet_type,
            packet_count,
            superframe_idx,
            stream_id,
            payload_len_bits,
            crc,
            payload,
        })
    }

    /// PLP carried by a baseband frame packet.
    pub fn plp_id(&self) -> Option<u8> {
        match &self.payload {
            T2miPayload::BasebandFrame(bb) => Some(bb.plp_id),
            _ => None,
        }
    }

    pub fn baseband_frame(&self) -> Option<&BasebandFrame> {
        match &self.payload {
            T2miPayload::BasebandFrame(bb) => Some(bb),
            _ => None,
        }
    }
}

fn decode_payload(packet_type: u8, body: &Bytes) -> Result<T2miPayload> {
    Ok(match packet_type {
        T2MI_TYPE_BBFRAME => T2miPayload::BasebandFrame(parse_baseband_frame(body)?),
        T2MI_TYPE_L1_CURRENT => T2miPayload::L1Current(parse_l1_current(body)?),
        T2MI_TYPE_TIMESTAMP => T2miPayload::Timestamp(parse_timestamp(body)?),
        T2MI_TYPE_INDIVIDUAL_ADDRESSING => T2miPayload::IndividualAddressing(parse_individual_addressing(body)?),
        _ => T2miPayload::Unknown {
            packet_type,
            data: body.clone(),
        },
    })
}

fn parse_baseband_frame(body: &Bytes) -> Result<BasebandFrame> {
    let header_end = BBFRAME_PAYLOAD_HEADER_SIZE + BBHEADER_SIZE;
    if body.len() < header_end {
        return Err(DemuxError::Truncated {
            what: "baseband frame",
            source: std::io::ErrorKind::UnexpectedEof.into(),
        });
    }
    Ok(BasebandFrame {
        frame_idx: body[0],
        plp_id: body[1],
        intl_frame_start: body[2] & 0x80 != 0,
        header: BbHeader::parse(&body[BBFRAME_PAYLOAD_HEADER_SIZE..header_end])?,
        data_field: body.slice(header_end..),
    })
}

fn parse_l1_current(body: &[u8]) -> Result<L1Current> {
    let mut br = BitReader::endian(body, BigEndian);
    let frame_idx = br.read::<8, u8>().map_err(truncated("L1-current"))?;
    br.skip(8).map_err(truncated("L1-current"))?;
    let mut l1_pre = vec![0u8; L1_PRE_BYTES];
    br.read_bytes(&mut l1_pre).map_err(truncated("L1-pre"))?;
    let l1_conf = read_length_prefixed(&mut br).map_err(truncated("L1-post configurable"))?;
    let l1_dyn_curr = read_length_prefixed(&mut br).map_err(truncated("L1-post dynamic"))?;
    let l1_ext = read_length_prefixed(&mut br).map_err(truncated("L1-post extension"))?;
    Ok(L1Current {
        frame_idx,
        l1_pre,
        l1_conf,
        l1_dyn_curr,
        l1_ext,
    })
}

/// 16-bit length in bits followed by that many bits.
fn read_length_prefixed<R: BitRead>(br: &mut R) -> std::io::Result<BitField> {
    let bits = br.read::<16, u16>()?;
    let mut data = Vec::with_capacity((bits as usize).div_ceil(8));
    let mut left = bits as u32;
    while left >= 8 {
        data.push(br.read::<8, u8>()?);
        left -= 8;
    }
    if left > 0 {
        let tail: u8 = br.read_var(left)?;
        data.push(tail << (8 - left));
    }
    Ok(BitField { bits, data })
}

fn parse_timestamp(body: &[u8]) -> Result<T2Timestamp> {
    let mut br = BitReader::endian(body, BigEndian);
    br.skip(4).map_err(truncated("T2 timestamp"))?;
    Ok(T2Timestamp {
        bandwidth: br.read::<4, u8>().map_err(truncated("T2 timestamp"))?,
        seconds_since_2000: br.read::<40, u64>().map_err(truncated("T2 timestamp"))?,
        subseconds: br.read::<27, u32>().map_err(truncated("T2 timestamp"))?,
        utc_offset: br.read::<13, u16>().map_err(truncated("T2 timestamp"))?,
    })
}

/// Loop lengths that overrun the payload are clamped to what is there.
fn parse_individual_addressing(body: &Bytes) -> Result<IndividualAddressing> {
    if body.len() < 2 {
        return Err(DemuxError::Truncated {
            what: "individual addressing",
            source: std::io::ErrorKind::UnexpectedEof.into(),
        });
    }
    let length = (body[1] as usize).min(body.len() - 2);
    let data = body.slice(2..2 + length);

    let mut transmitters = Vec::new();
    let mut idx = 0;
    while idx + 3 <= data.len() {
        let tx_identifier = u16::from_be_bytes([data[idx], data[idx + 1]]);
        let loop_end = (idx + 3 + data[idx + 2] as usize).min(data.len());
        idx += 3;

        let mut functions = Vec::new();
        while idx + 2 <= loop_end {
            let tag = data[idx];
            let end = (idx + 2 + data[idx + 1] as usize).min(loop_end);
            functions.push(AddressingFunction {
                tag,
                body: data.slice(idx + 2..end),
            });
            idx = end;
        }
        idx = loop_end;
        transmitters.push(TxAddressing {
            tx_identifier,
            functions,
        });
    }
    Ok(IndividualAddressing { transmitters })
}

/// Build a complete T2-MI packet (header, payload, CRC). Test fixture.
#[cfg(test)]
pub(crate) fn encode_packet(packet_type: u8, packet_count: u8, payload: &[u8]) -> Vec<u8> {
    let bits = (payload.len() * 8) as u16;
    let mut p = vec![packet_type, packet_count, 0x10, 0x00, (bits >> 8) as u8, bits as u8];
    p.extend_from_slice(payload);
    let crc = crate::psi::section::CRC_MPEG.checksum(&p);
    p.extend_from_slice(&crc.to_be_bytes());
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t2mi::bbframe::{BbMode, encode_bbheader};

    fn parse(packet: &[u8]) -> T2miPacket {
        let end = packet.len() - T2MI_CRC_SIZE;
        let crc = u32::from_be_bytes(packet[end..].try_into().unwrap());
        T2miPacket::parse(Bytes::copy_from_slice(&packet[..end]), crc).unwrap()
    }

    #[test]
    fn test_header_fields() {
        let p = parse(&encode_packet(0x31, 9, &[1, 2, 3]));
        assert_eq!(p.packet_type, 0x31);
        assert_eq!(p.packet_count, 9);
        assert_eq!(p.superframe_idx, 1);
        assert_eq!(p.payload_len_bits, 24);
        match p.payload {
            T2miPayload::Unknown { packet_type, data } => {
                assert_eq!(packet_type, 0x31);
                assert_eq!(&data[..], &[1, 2, 3]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_baseband_frame() {
        let mut payload = vec![7, 3, 0x80];
        payload.extend_from_slice(&encode_bbheader(4, Some(0), false, BbMode::HighEfficiency));
        payload.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let p = parse(&encode_packet(T2MI_TYPE_BBFRAME, 0, &payload));
        assert_eq!(p.plp_id(), Some(3));
        let bb = p.baseband_frame().unwrap();
        assert_eq!(bb.frame_idx, 7);
        assert!(bb.intl_frame_start);
        assert_eq!(bb.header.data_field_len(), 4);
        assert_eq!(&bb.data_field[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_truncated_baseband_frame_falls_back_to_unknown() {
        let p = parse(&encode_packet(T2MI_TYPE_BBFRAME, 0, &[7, 3, 0x80, 0xF0]));
        assert!(matches!(p.payload, T2miPayload::Unknown { packet_type: 0x00, .. }));
        assert_eq!(p.plp_id(), None);
    }

    #[test]
    fn test_timestamp() {
        // bw = 4 (8 MHz), seconds = 0x01_2345_6789, subseconds = 5, utco = 37
        let mut bits: u128 = 0x4;
        bits = (bits << 40) | 0x01_2345_6789;
        bits = (bits << 27) | 5;
        bits = (bits << 13) | 37;
        let bytes = bits.to_be_bytes();
        let p = parse(&encode_packet(T2MI_TYPE_TIMESTAMP, 0, &bytes[16 - 11..]));
        match p.payload {
            T2miPayload::Timestamp(ts) => {
                assert_eq!(ts.bandwidth, 4);
                assert_eq!(ts.seconds_since_2000, 0x01_2345_6789);
                assert_eq!(ts.subseconds, 5);
                assert_eq!(ts.utc_offset, 37);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_l1_current_bit_fields() {
        let mut payload = vec![5, 0];
        payload.extend_from_slice(&[0xAB; L1_PRE_BYTES]);
        // L1CONF: 12 bits = 0xFFF, L1DYN: 8 bits = 0x5A, L1EXT: 0 bits
        // 0x000C | FF F0 | (4 bits into next) ...
        // lay out bit-exactly: 16 + 12 + 16 + 8 + 16 = 68 bits
        let mut bits: u128 = 12;
        bits = (bits << 12) | 0xFFF;
        bits = (bits << 16) | 8;
        bits = (bits << 8) | 0x5A;
        bits = (bits << 16) | 0;
        bits <<= 4; // pad to 72 bits
        let bytes = bits.to_be_bytes();
        payload.extend_from_slice(&bytes[16 - 9..]);

        let p = parse(&encode_packet(T2MI_TYPE_L1_CURRENT, 0, &payload));
        match p.payload {
            T2miPayload::L1Current(l1) => {
                assert_eq!(l1.frame_idx, 5);
                assert_eq!(l1.l1_pre, vec![0xAB; L1_PRE_BYTES]);
                assert_eq!(l1.l1_conf, BitField { bits: 12, data: vec![0xFF, 0xF0] });
                assert_eq!(l1.l1_dyn_curr, BitField { bits: 8, data: vec![0x5A] });
                assert_eq!(l1.l1_ext, BitField::default());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_individual_addressing() {
        // rfu, length, tx 0x0102 with two functions, tx 0x0304 with none
        let payload = [
            0x00, 13, //
            0x01, 0x02, 7, 0x10, 1, 0xAA, 0x11, 2, 0xBB, 0xCC, //
            0x03, 0x04, 0,
        ];
        let p = parse(&encode_packet(T2MI_TYPE_INDIVIDUAL_ADDRESSING, 0, &payload));
        match p.payload {
            T2miPayload::IndividualAddressing(ia) => {
                assert_eq!(ia.transmitters.len(), 2);
                let tx = &ia.transmitters[0];
                assert_eq!(tx.tx_identifier, 0x0102);
                assert_eq!(tx.functions.len(), 2);
                assert_eq!(tx.functions[1].tag, 0x11);
                assert_eq!(&tx.functions[1].body[..], &[0xBB, 0xCC]);
                assert_eq!(ia.transmitters[1].tx_identifier, 0x0304);
                assert!(ia.transmitters[1].functions.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
