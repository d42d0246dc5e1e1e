use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::constants::*;
use crate::error::{DemuxError, Result};

/// What a channel carries, decided on its first payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Classification {
    #[default]
    Unknown,
    /// PSI/SI sections behind a pointer field
    Table,
    /// PES packets
    ElementaryStream,
    /// T2-MI packets; only by configuration
    T2mi,
}

/// Demultiplexer tuning. Every field has a default, so an empty JSON
/// object is a valid config.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Padding PID: always accepted, never counted
    pub null_pid: u16,
    /// Packet size used in bit-rate arithmetic
    pub packet_size: usize,
    /// PCR tick frequency
    pub clock_hz: u64,
    /// PIDs decoded as T2-MI instead of sections
    pub t2mi_pids: BTreeSet<u16>,
    /// Reassemble PES packets on elementary-stream channels
    pub collect_pes: bool,
    /// Sections declaring more than this many bytes after the length field are dropped
    pub max_section_length: usize,
    /// Baseband frames kept per PLP before the oldest are discarded
    pub max_plp_backlog: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            null_pid: NULL_PID,
            packet_size: TS_PACKET_SIZE,
            clock_hz: PCR_CLOCK_HZ,
            t2mi_pids: BTreeSet::new(),
            collect_pes: false,
            max_section_length: MAX_SECTION_LENGTH,
            max_plp_backlog: 4096,
        }
    }
}

impl DemuxConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.null_pid > 0x1FFF {
            return Err(DemuxError::InvalidConfig(format!("null_pid 0x{:X} is not a 13-bit PID", self.null_pid)));
        }
        if let Some(pid) = self.t2mi_pids.iter().find(|&&pid| pid > 0x1FFF) {
            return Err(DemuxError::InvalidConfig(format!("T2-MI PID 0x{pid:X} is not a 13-bit PID")));
        }
        if self.packet_size < TS_PACKET_SIZE {
            return Err(DemuxError::InvalidConfig(format!("packet_size {} below {TS_PACKET_SIZE}", self.packet_size)));
        }
        if self.clock_hz == 0 {
            return Err(DemuxError::InvalidConfig("clock_hz must be non-zero".into()));
        }
        if self.max_section_length < SECTION_HEADER_SIZE || self.max_section_length > MAX_SECTION_LENGTH {
            return Err(DemuxError::InvalidConfig(format!(
                "max_section_length {} outside {SECTION_HEADER_SIZE}..={MAX_SECTION_LENGTH}",
                self.max_section_length
            )));
        }
        if self.max_plp_backlog == 0 {
            return Err(DemuxError::InvalidConfig("max_plp_backlog must be non-zero".into()));
        }
        Ok(())
    }
}

/// Where packets come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A recorded .ts file, read to the end
    File(PathBuf),
    /// UDP unicast or multicast (IPv4); `iface` selects the interface for multicast joins
    Udp { addr: SocketAddr, iface: Option<Ipv4Addr> },
}

/// PLP extraction request for the inspector.
#[derive(Debug, Clone)]
pub struct PlpOutput {
    /// T2-MI PID; when `None` the first configured T2-MI PID is used
    pub pid: Option<u16>,
    pub plp: u8,
    /// Write the rebuilt transport stream here
    pub path: Option<PathBuf>,
    /// Run a nested demultiplexer over the rebuilt stream and include it in reports
    pub inspect: bool,
}

/// Configuration options for the inspector
#[derive(Debug, Clone)]
pub struct Options {
    pub input: InputSource,
    pub refresh_secs: u64,
    pub extract: Option<PlpOutput>,
    pub config: DemuxConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        let config = DemuxConfig::from_json("{}").unwrap();
        assert_eq!(config.null_pid, NULL_PID);
        assert_eq!(config.packet_size, 188);
        assert!(config.t2mi_pids.is_empty());
    }

    #[test]
    fn test_partial_json() {
        let config = DemuxConfig::from_json(r#"{"t2mi_pids": [64, 4096], "collect_pes": true}"#).unwrap();
        assert!(config.t2mi_pids.contains(&0x40));
        assert!(config.collect_pes);
        assert_eq!(config.clock_hz, PCR_CLOCK_HZ);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(DemuxConfig::from_json(r#"{"null_pid": 8192}"#).is_err());
        assert!(DemuxConfig::from_json(r#"{"clock_hz": 0}"#).is_err());
        assert!(DemuxConfig::from_json(r#"{"max_section_length": 5000}"#).is_err());
        assert!(DemuxConfig::from_json(r#"{"packet_size": 100}"#).is_err());
    }
}
