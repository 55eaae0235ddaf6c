//! The sequence-memory algorithms: the connectivity store and the temporal
//! memory state machine built on top of it.

pub mod connections;
pub mod temporal_memory;

pub use connections::{
    Connections, ConnectionsEventHandler, ConnectionsParams, SegmentData, SynapseData,
};
pub use temporal_memory::{TemporalMemory, TemporalMemoryParams};

#[cfg(feature = "serde")]
pub use connections::{CellRecord, ConnectionsRecord, SegmentRecord, SynapseRecord};
#[cfg(feature = "serde")]
pub use temporal_memory::TemporalMemoryRecord;
