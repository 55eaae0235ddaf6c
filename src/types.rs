//! Fundamental index and scalar types shared across the engine.
//!
//! The engine addresses everything through dense integer indices. Cells are
//! plain indices into a conceptual grid; segments and synapses are referenced
//! by *flat indices* into dense record vectors owned by
//! [`Connections`](crate::algorithms::Connections). Flat indices of destroyed
//! records are recycled through a free-list, so a handle stays valid for the
//! lifetime of the record it names.

/// Unsigned integer used for counts, thresholds and column indices.
pub type UInt = u32;

/// Wide unsigned integer used for the iteration counter.
pub type UInt64 = u64;

/// Floating point scalar.
pub type Real = f32;

/// Index of a cell in `[0, num_cells)`.
pub type CellIdx = UInt;

/// Position of a segment within its owning cell's segment list.
pub type SegmentIdx = u16;

/// Position of a synapse within its owning segment's synapse list.
pub type SynapseIdx = u16;

/// Stable flat-index handle to a dendritic segment.
pub type Segment = UInt;

/// Stable flat-index handle to a synapse.
pub type Synapse = UInt;

/// Synaptic permanence, strictly positive for every live synapse.
pub type Permanence = Real;

/// Absolute tolerance for permanence comparisons.
///
/// Minimum-permanence selection and connected-threshold tests are performed
/// within this tolerance so results stay identical across floating-point
/// environments.
pub const EPSILON: Permanence = 0.000_01;
