//! Transport packet header and adaptation field decoding

use crate::constants::{TS_HEADER_SIZE, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::error::{DemuxError, Result};
use crate::pcr::Pcr;

/// One decoded transport packet. Borrows its payload from the input buffer.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub pid: u16,
    pub continuity_counter: u8,
    pub payload_unit_start: bool,
    pub transport_error: bool,
    pub transport_priority: bool,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub adaptation: Option<AdaptationField>,
    pub payload: &'a [u8],
}

/// Fields of the adaptation field this crate acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptationField {
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    pub pcr: Option<Pcr>,
    pub opcr: Option<Pcr>,
}

impl<'a> Frame<'a> {
    /// Parse a single 188-byte transport packet.
    pub fn parse(chunk: &'a [u8]) -> Result<Self> {
        if chunk.len() < TS_PACKET_SIZE {
            return Err(DemuxError::ShortPacket(chunk.len(), TS_PACKET_SIZE));
        }
        if chunk[0] != TS_SYNC_BYTE {
            return Err(DemuxError::LostSync(chunk[0]));
        }
        let chunk = &chunk[..TS_PACKET_SIZE];

        let pid = (((chunk[1] & 0x1F) as u16) << 8) | (chunk[2] as u16);
        let adaptation_field_control = (chunk[3] & 0x30) >> 4;

        let mut payload_offset = TS_HEADER_SIZE;
        let mut adaptation = None;
        if adaptation_field_control & 0x02 != 0 {
            let length = chunk[4] as usize;
            payload_offset += 1 + length;
            if payload_offset > TS_PACKET_SIZE {
                return Err(DemuxError::AdaptationOverflow { length });
            }
            adaptation = Some(parse_adaptation_field(&chunk[5..5 + length]));
        }

        let payload = if adaptation_field_control & 0x01 != 0 {
            &chunk[payload_offset..]
        } else {
            &[]
        };

        Ok(Self {
            pid,
            continuity_counter: chunk[3] & 0x0F,
            payload_unit_start: chunk[1] & 0x40 != 0,
            transport_error: chunk[1] & 0x80 != 0,
            transport_priority: chunk[1] & 0x20 != 0,
            scrambling_control: (chunk[3] & 0xC0) >> 6,
            adaptation_field_control,
            adaptation,
            payload,
        })
    }

    /// Payload bit of adaptation_field_control. Only these packets advance the CC.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }

    pub fn discontinuity(&self) -> bool {
        self.adaptation.as_ref().is_some_and(|af| af.discontinuity)
    }

    pub fn pcr(&self) -> Option<Pcr> {
        self.adaptation.as_ref().and_then(|af| af.pcr)
    }
}

/// `body` is the adaptation field without its length byte.
fn parse_adaptation_field(body: &[u8]) -> AdaptationField {
    let mut af = AdaptationField {
        length: body.len(),
        ..Default::default()
    };
    let Some(&flags) = body.first() else {
        return af; // single stuffing byte
    };
    af.discontinuity = flags & 0x80 != 0;
    af.random_access = flags & 0x40 != 0;

    let mut idx = 1;
    if flags & 0x10 != 0 {
        af.pcr = body.get(idx..idx + 6).map(Pcr::from_bytes);
        idx += 6;
    }
    if flags & 0x08 != 0 {
        af.opcr = body.get(idx..idx + 6).map(Pcr::from_bytes);
    }
    af
}
