pub mod assembler;
pub mod section;
pub mod store;

pub use assembler::SectionAssembler;
pub use section::{LongHeader, Section};
pub use store::{TableIdentity, TableSlot, TableSummary, UpdateOutcome, VersionedTableStore};
