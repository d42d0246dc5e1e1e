//! Streaming MPEG-TS demultiplexer.
//!
//! Tracks continuity per PID, reassembles PSI/SI sections into a versioned
//! table store, estimates bit rate from PCRs and decapsulates DVB-T2 MI
//! streams down to the transport stream carried in a single PLP.

pub mod constants;
pub mod error;
pub mod es;
pub mod network;
pub mod packet;
pub mod pcr;
pub mod processor;
pub mod psi;
pub mod report;
pub mod stats;
pub mod t2mi;
pub mod types;

mod core;

pub use error::{DemuxError, Result};
pub use es::{EsSink, NullSink};
pub use packet::{AdaptationField, Frame};
pub use pcr::{ClockReference, Pcr};
pub use processor::{Demultiplexer, SectionUpdate};
pub use psi::{Section, TableIdentity, UpdateOutcome, VersionedTableStore};
pub use report::{Report, Reporter};
pub use stats::ChannelStats;
pub use t2mi::{PlpExtractor, T2miPacket, T2miPayload};
pub use types::{Classification, DemuxConfig};

pub mod inspector {
    pub use crate::types::{InputSource, Options, PlpOutput};

    /// Async entry-point; returns at end of file, on Ctrl-C, or on socket error
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        crate::core::run(opts).await
    }
}
