//! Constants for MPEG-TS demultiplexing and DVB-T2 MI decapsulation

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_HEADER_SIZE: usize = 4;
pub const NULL_PID: u16 = 0x1FFF;
pub const CC_MODULUS: u8 = 16;

/// PES packet constants
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
pub const PES_HEADER_SIZE: usize = 6;

/// PCR constants
pub const PCR_CLOCK_HZ: u64 = 27_000_000; // 27 MHz
pub const PCR_BASE_BITS: u32 = 33;
pub const PCR_BASE_MODULUS: u64 = 1u64 << PCR_BASE_BITS;
pub const PCR_EXT_PER_BASE: u64 = 300; // 90 kHz base * 300 = 27 MHz

/// PSI / SI section constants
pub const SECTION_HEADER_SIZE: usize = 3;
pub const LONG_SECTION_HEADER_SIZE: usize = 8;
pub const SECTION_CRC_SIZE: usize = 4;
pub const STUFFING_BYTE: u8 = 0xFF;
/// Largest section_length a 12-bit field can carry for private sections
pub const MAX_SECTION_LENGTH: usize = 4093;

/// Table ids that carry an extra instance discriminator after the long header
pub const SDT_ACTUAL: u8 = 0x42;
pub const SDT_OTHER: u8 = 0x46;
pub const EIT_FIRST: u8 = 0x4E;
pub const EIT_LAST: u8 = 0x6F;

/// T2-MI packet constants (ETSI TS 102 773)
pub const T2MI_HEADER_SIZE: usize = 6;
pub const T2MI_CRC_SIZE: usize = 4;

/// T2-MI packet types
pub const T2MI_TYPE_BBFRAME: u8 = 0x00;
pub const T2MI_TYPE_L1_CURRENT: u8 = 0x10;
pub const T2MI_TYPE_TIMESTAMP: u8 = 0x20;
pub const T2MI_TYPE_INDIVIDUAL_ADDRESSING: u8 = 0x21;

/// BBFrame constants (ETSI EN 302 755)
pub const BBFRAME_PAYLOAD_HEADER_SIZE: usize = 3; // frame_idx, plp_id, intl_frame_start/rfu
pub const BBHEADER_SIZE: usize = 10;
/// SYNCD value meaning no user packet starts inside this data field
pub const SYNCD_NO_BOUNDARY: u16 = 0xFFFF;
/// L1-pre signalling is a fixed 168 bits
pub const L1_PRE_BYTES: usize = 21;
