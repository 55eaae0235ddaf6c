//! Graph store for cells, dendritic segments, and synapses.
//!
//! [`Connections`] owns the connectivity of the whole cell population. Cells
//! are fixed at construction; segments and synapses are created and destroyed
//! freely. Records live in dense vectors addressed by flat-index handles
//! ([`Segment`], [`Synapse`]); destroyed slots are pushed onto free-lists and
//! reused by the next creation, so handles dereference in O(1) and stay valid
//! for the lifetime of the record they name.
//!
//! A reverse index maps each presynaptic cell to the synapses that listen to
//! it, which makes activity computation O(synapses incident on active cells)
//! instead of O(all synapses).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::mem;

use crate::error::{Result, VelesError};
use crate::serialization::{io_error, TokenReader};
use crate::types::{CellIdx, Permanence, Segment, SegmentIdx, Synapse, SynapseIdx, UInt, UInt64, EPSILON};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Configuration for a [`Connections`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionsParams {
    /// Number of cells in the population. Fixed for the instance lifetime.
    pub num_cells: CellIdx,
    /// Hard cap on segments per cell; creating past it recycles the
    /// least-recently-used segment.
    pub max_segments_per_cell: SegmentIdx,
    /// Hard cap on synapses per segment; creating past it recycles the
    /// lowest-permanence synapse.
    pub max_synapses_per_segment: SynapseIdx,
}

/// Per-cell record: the ordered list of segments the cell owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CellData {
    segments: Vec<Segment>,
}

/// Data carried by a live segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentData {
    /// Ordered synapse handles on this segment.
    pub synapses: Vec<Synapse>,
    /// Iteration at which this segment last became active.
    pub last_used_iteration: UInt64,
    /// Owning cell.
    pub cell: CellIdx,
    /// Position of this segment in the owning cell's segment list.
    pub idx_on_cell: SegmentIdx,
}

/// Data carried by a live synapse.
#[derive(Debug, Clone, Default)]
pub struct SynapseData {
    /// Cell this synapse listens to.
    pub presynaptic_cell: CellIdx,
    /// Connection strength, strictly positive while the synapse is live.
    pub permanence: Permanence,
    /// Owning segment.
    pub segment: Segment,
    /// Position of this synapse in the owning segment's synapse list.
    pub idx_on_segment: SynapseIdx,
}

/// Observer of structural changes to a [`Connections`] instance.
///
/// Handlers run synchronously inside the mutating call and receive only the
/// affected handle, so they cannot re-enter the store. All methods default to
/// no-ops; implement the ones you care about.
pub trait ConnectionsEventHandler {
    /// A segment was created.
    fn on_create_segment(&mut self, _segment: Segment) {}
    /// A synapse was created.
    fn on_create_synapse(&mut self, _synapse: Synapse) {}
    /// A segment is about to be destroyed.
    fn on_destroy_segment(&mut self, _segment: Segment) {}
    /// A synapse is about to be destroyed.
    fn on_destroy_synapse(&mut self, _synapse: Synapse) {}
    /// A synapse permanence is about to be overwritten.
    fn on_update_synapse_permanence(&mut self, _synapse: Synapse, _permanence: Permanence) {}
}

/// Dense-indexed store of cells, segments, and synapses.
pub struct Connections {
    cells: Vec<CellData>,
    segments: Vec<SegmentData>,
    synapses: Vec<SynapseData>,
    /// presynaptic cell -> synapses listening to it; entries are removed
    /// (not emptied) when the last synapse goes away.
    synapses_for_presynaptic_cell: HashMap<CellIdx, Vec<Synapse>>,
    destroyed_segments: Vec<Segment>,
    destroyed_synapses: Vec<Synapse>,
    max_segments_per_cell: SegmentIdx,
    max_synapses_per_segment: SynapseIdx,
    iteration: UInt64,
    next_event_token: u32,
    handlers: Vec<(u32, Box<dyn ConnectionsEventHandler>)>,
}

impl Connections {
    /// Serialization format version. Version 1 streams carried per-record
    /// "destroyed" flags; readers still accept them.
    pub const VERSION: UInt = 2;

    /// Creates an empty store for `params.num_cells` cells.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidParameter`] when the cell count or either
    /// capacity is zero.
    pub fn new(params: ConnectionsParams) -> Result<Self> {
        if params.num_cells == 0 {
            return Err(VelesError::InvalidParameter {
                name: "num_cells",
                message: "must be positive".to_string(),
            });
        }
        if params.max_segments_per_cell == 0 {
            return Err(VelesError::InvalidParameter {
                name: "max_segments_per_cell",
                message: "must be positive".to_string(),
            });
        }
        if params.max_synapses_per_segment == 0 {
            return Err(VelesError::InvalidParameter {
                name: "max_synapses_per_segment",
                message: "must be positive".to_string(),
            });
        }

        Ok(Connections {
            cells: vec![CellData::default(); params.num_cells as usize],
            segments: Vec::new(),
            synapses: Vec::new(),
            synapses_for_presynaptic_cell: HashMap::new(),
            destroyed_segments: Vec::new(),
            destroyed_synapses: Vec::new(),
            max_segments_per_cell: params.max_segments_per_cell,
            max_synapses_per_segment: params.max_synapses_per_segment,
            iteration: 0,
            next_event_token: 0,
            handlers: Vec::new(),
        })
    }

    /// Registers an event handler and returns a token for unsubscribing.
    /// Handlers are invoked in subscription order.
    pub fn subscribe(&mut self, handler: Box<dyn ConnectionsEventHandler>) -> u32 {
        let token = self.next_event_token;
        self.next_event_token += 1;
        self.handlers.push((token, handler));
        token
    }

    /// Removes the handler registered under `token`, if any.
    pub fn unsubscribe(&mut self, token: u32) {
        self.handlers.retain(|(t, _)| *t != token);
    }

    /// Creates a segment on `cell`.
    ///
    /// If the cell is at capacity, the least-recently-used segment (smallest
    /// `last_used_iteration`, ties to the lowest `idx_on_cell`) is destroyed
    /// first. The returned handle may reuse the flat index of a previously
    /// destroyed segment.
    pub fn create_segment(&mut self, cell: CellIdx) -> Segment {
        while self.num_segments_for_cell(cell) >= self.max_segments_per_cell as usize {
            let lru = self.least_recently_used_segment(cell);
            self.destroy_segment(lru);
        }

        let segment = match self.destroyed_segments.pop() {
            Some(recycled) => recycled,
            None => {
                self.segments.push(SegmentData::default());
                (self.segments.len() - 1) as Segment
            }
        };

        let idx_on_cell = self.cells[cell as usize].segments.len() as SegmentIdx;
        {
            let data = &mut self.segments[segment as usize];
            debug_assert!(data.synapses.is_empty());
            data.cell = cell;
            data.last_used_iteration = self.iteration;
            data.idx_on_cell = idx_on_cell;
        }
        self.cells[cell as usize].segments.push(segment);

        for (_, handler) in &mut self.handlers {
            handler.on_create_segment(segment);
        }

        segment
    }

    /// Creates a synapse on `segment` toward `presynaptic_cell`.
    ///
    /// If the segment is at capacity, the lowest-permanence synapse is
    /// destroyed first (comparison within [`EPSILON`], first minimum wins).
    ///
    /// # Panics
    ///
    /// Panics when `permanence` is not strictly positive.
    pub fn create_synapse(
        &mut self,
        segment: Segment,
        presynaptic_cell: CellIdx,
        permanence: Permanence,
    ) -> Synapse {
        assert!(permanence > 0.0, "synapse permanence must be positive");

        while self.num_synapses_for_segment(segment) >= self.max_synapses_per_segment as usize {
            let weakest = self.min_permanence_synapse(segment);
            self.destroy_synapse(weakest);
        }

        let synapse = match self.destroyed_synapses.pop() {
            Some(recycled) => recycled,
            None => {
                self.synapses.push(SynapseData::default());
                (self.synapses.len() - 1) as Synapse
            }
        };

        let idx_on_segment = self.segments[segment as usize].synapses.len() as SynapseIdx;
        {
            let data = &mut self.synapses[synapse as usize];
            data.segment = segment;
            data.presynaptic_cell = presynaptic_cell;
            data.permanence = permanence;
            data.idx_on_segment = idx_on_segment;
        }
        self.segments[segment as usize].synapses.push(synapse);
        self.synapses_for_presynaptic_cell
            .entry(presynaptic_cell)
            .or_default()
            .push(synapse);

        for (_, handler) in &mut self.handlers {
            handler.on_create_synapse(synapse);
        }

        synapse
    }

    /// Destroys `segment` and every synapse on it, releasing all their flat
    /// indices for reuse. Later segments on the owning cell shift down one
    /// position.
    pub fn destroy_segment(&mut self, segment: Segment) {
        debug_assert!(self.segment_exists(segment));

        for (_, handler) in &mut self.handlers {
            handler.on_destroy_segment(segment);
        }

        // The segment is going away, so its synapse list needs no
        // index-shifting; just unhook each synapse from the reverse index.
        let synapses = mem::take(&mut self.segments[segment as usize].synapses);
        for synapse in synapses {
            self.remove_synapse_from_presynaptic_map(synapse);
            self.destroyed_synapses.push(synapse);
        }

        let cell = self.segments[segment as usize].cell;
        let idx = self.segments[segment as usize].idx_on_cell as usize;
        self.cells[cell as usize].segments.remove(idx);
        let shifted = &self.cells[cell as usize].segments;
        for &later in &shifted[idx..] {
            self.segments[later as usize].idx_on_cell -= 1;
        }

        self.destroyed_segments.push(segment);
    }

    /// Destroys `synapse`, releasing its flat index for reuse. Later synapses
    /// on the owning segment shift down one position.
    pub fn destroy_synapse(&mut self, synapse: Synapse) {
        debug_assert!(self.synapse_exists(synapse));

        for (_, handler) in &mut self.handlers {
            handler.on_destroy_synapse(synapse);
        }

        self.remove_synapse_from_presynaptic_map(synapse);

        let segment = self.synapses[synapse as usize].segment;
        let idx = self.synapses[synapse as usize].idx_on_segment as usize;
        self.segments[segment as usize].synapses.remove(idx);
        let shifted = &self.segments[segment as usize].synapses;
        for &later in &shifted[idx..] {
            self.synapses[later as usize].idx_on_segment -= 1;
        }

        self.destroyed_synapses.push(synapse);
    }

    /// Overwrites the permanence of `synapse`.
    ///
    /// The store does not clamp or destroy here; callers that drive a
    /// permanence to zero or below must destroy the synapse instead.
    pub fn update_synapse_permanence(&mut self, synapse: Synapse, permanence: Permanence) {
        for (_, handler) in &mut self.handlers {
            handler.on_update_synapse_permanence(synapse, permanence);
        }
        self.synapses[synapse as usize].permanence = permanence;
    }

    /// The segments on `cell`, in creation order.
    pub fn segments_for_cell(&self, cell: CellIdx) -> &[Segment] {
        &self.cells[cell as usize].segments
    }

    /// The synapses on `segment`, in creation order.
    pub fn synapses_for_segment(&self, segment: Segment) -> &[Synapse] {
        &self.segments[segment as usize].synapses
    }

    /// Resolves a (cell, position) pair to a segment handle.
    pub fn get_segment(&self, cell: CellIdx, idx: SegmentIdx) -> Segment {
        self.cells[cell as usize].segments[idx as usize]
    }

    /// The cell owning `segment`.
    pub fn cell_for_segment(&self, segment: Segment) -> CellIdx {
        self.segments[segment as usize].cell
    }

    /// The segment owning `synapse`.
    pub fn segment_for_synapse(&self, synapse: Synapse) -> Segment {
        self.synapses[synapse as usize].segment
    }

    /// Full record for `segment`.
    pub fn data_for_segment(&self, segment: Segment) -> &SegmentData {
        &self.segments[segment as usize]
    }

    /// Full record for `synapse`.
    pub fn data_for_synapse(&self, synapse: Synapse) -> &SynapseData {
        &self.synapses[synapse as usize]
    }

    /// Length of the flat segment list, including recycled slots. Activity
    /// buffers must be sized to this.
    pub fn segment_flat_list_length(&self) -> usize {
        self.segments.len()
    }

    /// Orders segments by (owning cell, position on cell) — the stable
    /// iteration order for per-tick segment lists.
    pub fn compare_segments(&self, a: Segment, b: Segment) -> Ordering {
        let a_data = &self.segments[a as usize];
        let b_data = &self.segments[b as usize];
        (a_data.cell, a_data.idx_on_cell).cmp(&(b_data.cell, b_data.idx_on_cell))
    }

    /// The synapses listening to `presynaptic_cell`; empty when none do.
    pub fn synapses_for_presynaptic_cell(&self, presynaptic_cell: CellIdx) -> &[Synapse] {
        self.synapses_for_presynaptic_cell
            .get(&presynaptic_cell)
            .map_or(&[][..], Vec::as_slice)
    }

    /// Accumulates per-segment activity for a set of active presynaptic
    /// cells.
    ///
    /// For every synapse listening to an active cell, the potential count of
    /// its segment is incremented; the connected count is additionally
    /// incremented when the permanence reaches `connected_permanence` within
    /// [`EPSILON`]. Both buffers must be pre-sized to
    /// [`segment_flat_list_length`](Self::segment_flat_list_length).
    pub fn compute_activity(
        &self,
        num_active_connected_synapses_for_segment: &mut [UInt],
        num_active_potential_synapses_for_segment: &mut [UInt],
        active_presynaptic_cells: &[CellIdx],
        connected_permanence: Permanence,
    ) {
        for &cell in active_presynaptic_cells {
            self.compute_activity_for_cell(
                num_active_connected_synapses_for_segment,
                num_active_potential_synapses_for_segment,
                cell,
                connected_permanence,
            );
        }
    }

    /// Single-cell variant of [`compute_activity`](Self::compute_activity).
    pub fn compute_activity_for_cell(
        &self,
        num_active_connected_synapses_for_segment: &mut [UInt],
        num_active_potential_synapses_for_segment: &mut [UInt],
        active_presynaptic_cell: CellIdx,
        connected_permanence: Permanence,
    ) {
        debug_assert_eq!(
            num_active_connected_synapses_for_segment.len(),
            self.segments.len()
        );
        debug_assert_eq!(
            num_active_potential_synapses_for_segment.len(),
            self.segments.len()
        );

        if let Some(synapses) = self.synapses_for_presynaptic_cell.get(&active_presynaptic_cell) {
            for &synapse in synapses {
                let data = &self.synapses[synapse as usize];
                num_active_potential_synapses_for_segment[data.segment as usize] += 1;

                debug_assert!(data.permanence > 0.0);
                if data.permanence >= connected_permanence - EPSILON {
                    num_active_connected_synapses_for_segment[data.segment as usize] += 1;
                }
            }
        }
    }

    /// Stamps `segment` as used at the current iteration.
    pub fn record_segment_activity(&mut self, segment: Segment) {
        self.segments[segment as usize].last_used_iteration = self.iteration;
    }

    /// Advances the iteration counter. Called once per temporal-memory tick.
    pub fn start_new_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Current iteration counter.
    pub fn iteration(&self) -> UInt64 {
        self.iteration
    }

    /// Number of cells in the population.
    pub fn num_cells(&self) -> CellIdx {
        self.cells.len() as CellIdx
    }

    /// Segment cap per cell.
    pub fn max_segments_per_cell(&self) -> SegmentIdx {
        self.max_segments_per_cell
    }

    /// Synapse cap per segment.
    pub fn max_synapses_per_segment(&self) -> SynapseIdx {
        self.max_synapses_per_segment
    }

    /// Number of live segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len() - self.destroyed_segments.len()
    }

    /// Number of live segments on `cell`.
    pub fn num_segments_for_cell(&self, cell: CellIdx) -> usize {
        self.cells[cell as usize].segments.len()
    }

    /// Number of live synapses.
    pub fn num_synapses(&self) -> usize {
        self.synapses.len() - self.destroyed_synapses.len()
    }

    /// Number of live synapses on `segment`.
    pub fn num_synapses_for_segment(&self, segment: Segment) -> usize {
        self.segments[segment as usize].synapses.len()
    }

    /// Whether `segment` is currently live (listed by its owning cell).
    pub fn segment_exists(&self, segment: Segment) -> bool {
        let data = &self.segments[segment as usize];
        self.cells[data.cell as usize].segments.contains(&segment)
    }

    /// Whether `synapse` is currently live (listed by its owning segment).
    pub fn synapse_exists(&self, synapse: Synapse) -> bool {
        let data = &self.synapses[synapse as usize];
        self.segments[data.segment as usize]
            .synapses
            .contains(&synapse)
    }

    fn least_recently_used_segment(&self, cell: CellIdx) -> Segment {
        let segments = &self.cells[cell as usize].segments;
        let mut min_segment = segments[0];
        let mut min_iteration = self.segments[min_segment as usize].last_used_iteration;
        for &segment in &segments[1..] {
            let iteration = self.segments[segment as usize].last_used_iteration;
            if iteration < min_iteration {
                min_iteration = iteration;
                min_segment = segment;
            }
        }
        min_segment
    }

    /// The synapse with the lowest permanence on `segment`. A candidate must
    /// beat the running minimum by more than [`EPSILON`], so near-ties
    /// resolve to the earliest synapse regardless of rounding environment.
    ///
    /// # Panics
    ///
    /// Panics when the segment has no synapses.
    fn min_permanence_synapse(&self, segment: Segment) -> Synapse {
        let mut min_synapse = None;
        let mut min_permanence = Permanence::MAX;

        for &synapse in &self.segments[segment as usize].synapses {
            let permanence = self.synapses[synapse as usize].permanence;
            if permanence < min_permanence - EPSILON {
                min_synapse = Some(synapse);
                min_permanence = permanence;
            }
        }

        min_synapse.expect("minimum-permanence synapse requested on an empty segment")
    }

    fn remove_synapse_from_presynaptic_map(&mut self, synapse: Synapse) {
        let presynaptic_cell = self.synapses[synapse as usize].presynaptic_cell;
        let entry = self
            .synapses_for_presynaptic_cell
            .get_mut(&presynaptic_cell)
            .expect("reverse index entry missing for live synapse");
        let position = entry
            .iter()
            .position(|&s| s == synapse)
            .expect("synapse missing from its reverse index entry");
        entry.remove(position);
        if entry.is_empty() {
            self.synapses_for_presynaptic_cell.remove(&presynaptic_cell);
        }
    }

    fn restore_segment(&mut self, cell: CellIdx, last_used_iteration: UInt64) -> Segment {
        let segment = self.segments.len() as Segment;
        let idx_on_cell = self.cells[cell as usize].segments.len() as SegmentIdx;
        self.segments.push(SegmentData {
            synapses: Vec::new(),
            last_used_iteration,
            cell,
            idx_on_cell,
        });
        self.cells[cell as usize].segments.push(segment);
        segment
    }

    fn restore_synapse(&mut self, segment: Segment, presynaptic_cell: CellIdx, permanence: Permanence) {
        let synapse = self.synapses.len() as Synapse;
        let idx_on_segment = self.segments[segment as usize].synapses.len() as SynapseIdx;
        self.synapses.push(SynapseData {
            presynaptic_cell,
            permanence,
            segment,
            idx_on_segment,
        });
        self.segments[segment as usize].synapses.push(synapse);
        self.synapses_for_presynaptic_cell
            .entry(presynaptic_cell)
            .or_default()
            .push(synapse);
    }

    /// Writes the store to a human-readable stream.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] when the underlying writer fails.
    pub fn save<W: Write>(&self, stream: &mut W) -> Result<()> {
        writeln!(stream, "Connections").map_err(io_error)?;
        writeln!(stream, "{}", Self::VERSION).map_err(io_error)?;
        writeln!(
            stream,
            "{} {} {}",
            self.cells.len(),
            self.max_segments_per_cell,
            self.max_synapses_per_segment
        )
        .map_err(io_error)?;

        for cell_data in &self.cells {
            write!(stream, "{} ", cell_data.segments.len()).map_err(io_error)?;
            for &segment in &cell_data.segments {
                let segment_data = &self.segments[segment as usize];
                write!(
                    stream,
                    "{} {} ",
                    segment_data.last_used_iteration,
                    segment_data.synapses.len()
                )
                .map_err(io_error)?;
                for &synapse in &segment_data.synapses {
                    let synapse_data = &self.synapses[synapse as usize];
                    write!(
                        stream,
                        "{} {} ",
                        synapse_data.presynaptic_cell, synapse_data.permanence
                    )
                    .map_err(io_error)?;
                }
            }
            writeln!(stream).map_err(io_error)?;
        }

        writeln!(stream, "{}", self.iteration).map_err(io_error)?;
        writeln!(stream, "~Connections").map_err(io_error)?;
        Ok(())
    }

    /// Reads a store previously written by [`save`](Self::save).
    ///
    /// Version 1 streams carry a destroyed flag per segment and synapse;
    /// flagged entries are accepted and dropped. Flat indices are assigned
    /// fresh in traversal order, so handles from before the save are
    /// meaningless against the loaded instance.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on a bad marker, a version
    /// newer than [`Self::VERSION`], or a truncated or malformed stream.
    pub fn load<R: BufRead>(stream: &mut R) -> Result<Self> {
        let mut reader = TokenReader::new(stream);
        Self::load_from_tokens(&mut reader)
    }

    /// Token-level loader, shared with the temporal memory's nested block.
    pub(crate) fn load_from_tokens<R: BufRead>(reader: &mut TokenReader<'_, R>) -> Result<Self> {
        reader.expect_marker("Connections")?;

        let version: UInt = reader.parse()?;
        if version > Self::VERSION {
            return Err(VelesError::SerializationError {
                message: format!(
                    "unsupported Connections version {version} (current is {})",
                    Self::VERSION
                ),
            });
        }

        let num_cells: CellIdx = reader.parse()?;
        let max_segments_per_cell: SegmentIdx = reader.parse()?;
        let max_synapses_per_segment: SynapseIdx = reader.parse()?;

        let mut connections = Connections::new(ConnectionsParams {
            num_cells,
            max_segments_per_cell,
            max_synapses_per_segment,
        })?;

        for cell in 0..num_cells {
            let num_segments: usize = reader.parse()?;
            for _ in 0..num_segments {
                let destroyed_segment = version < 2 && reader.parse::<u8>()? != 0;
                let last_used_iteration: UInt64 = reader.parse()?;

                let segment = if destroyed_segment {
                    None
                } else {
                    Some(connections.restore_segment(cell, last_used_iteration))
                };

                let num_synapses: usize = reader.parse()?;
                for _ in 0..num_synapses {
                    let presynaptic_cell: CellIdx = reader.parse()?;
                    let permanence: Permanence = reader.parse()?;
                    let destroyed_synapse = version < 2 && reader.parse::<u8>()? != 0;

                    if let Some(segment) = segment {
                        if !destroyed_synapse {
                            connections.restore_synapse(segment, presynaptic_cell, permanence);
                        }
                    }
                }
            }
        }

        connections.iteration = reader.parse()?;
        reader.expect_marker("~Connections")?;
        Ok(connections)
    }
}

impl fmt::Debug for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connections")
            .field("num_cells", &self.cells.len())
            .field("num_segments", &self.num_segments())
            .field("num_synapses", &self.num_synapses())
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl Clone for Connections {
    /// Clones the graph. Event subscriptions are observers, not state, and
    /// are not carried over.
    fn clone(&self) -> Self {
        Connections {
            cells: self.cells.clone(),
            segments: self.segments.clone(),
            synapses: self.synapses.clone(),
            synapses_for_presynaptic_cell: self.synapses_for_presynaptic_cell.clone(),
            destroyed_segments: self.destroyed_segments.clone(),
            destroyed_synapses: self.destroyed_synapses.clone(),
            max_segments_per_cell: self.max_segments_per_cell,
            max_synapses_per_segment: self.max_synapses_per_segment,
            iteration: self.iteration,
            next_event_token: 0,
            handlers: Vec::new(),
        }
    }
}

impl PartialEq for Connections {
    /// Structural equality: the cell → segment → synapse topology, order
    /// within every list, permanences, positional indices, last-used stamps,
    /// capacities, the iteration counter, and the reverse index must all
    /// match. Flat-index numbering is deliberately ignored; two instances
    /// that differ only by handle recycling history compare equal.
    fn eq(&self, other: &Self) -> bool {
        if self.max_segments_per_cell != other.max_segments_per_cell
            || self.max_synapses_per_segment != other.max_synapses_per_segment
            || self.iteration != other.iteration
            || self.cells.len() != other.cells.len()
        {
            return false;
        }

        for (cell_data, other_cell_data) in self.cells.iter().zip(&other.cells) {
            if cell_data.segments.len() != other_cell_data.segments.len() {
                return false;
            }

            for (&segment, &other_segment) in
                cell_data.segments.iter().zip(&other_cell_data.segments)
            {
                let segment_data = &self.segments[segment as usize];
                let other_segment_data = &other.segments[other_segment as usize];

                if segment_data.synapses.len() != other_segment_data.synapses.len()
                    || segment_data.last_used_iteration != other_segment_data.last_used_iteration
                    || segment_data.cell != other_segment_data.cell
                    || segment_data.idx_on_cell != other_segment_data.idx_on_cell
                {
                    return false;
                }

                for (&synapse, &other_synapse) in
                    segment_data.synapses.iter().zip(&other_segment_data.synapses)
                {
                    let synapse_data = &self.synapses[synapse as usize];
                    let other_synapse_data = &other.synapses[other_synapse as usize];

                    if synapse_data.presynaptic_cell != other_synapse_data.presynaptic_cell
                        || synapse_data.permanence != other_synapse_data.permanence
                        || synapse_data.idx_on_segment != other_synapse_data.idx_on_segment
                    {
                        return false;
                    }
                }
            }
        }

        self.reverse_index_positions() == other.reverse_index_positions()
    }
}

impl Connections {
    /// Flat-index-free view of the reverse index: for each presynaptic cell,
    /// the sorted positions (cell, `idx_on_cell`, `idx_on_segment`) of every
    /// listening synapse. Lets equality ignore both handle numbering and the
    /// incidental order in which synapses were appended to an entry.
    fn reverse_index_positions(&self) -> HashMap<CellIdx, Vec<(CellIdx, SegmentIdx, SynapseIdx)>> {
        let mut positions = HashMap::new();
        for (&presynaptic_cell, synapses) in &self.synapses_for_presynaptic_cell {
            let mut entry: Vec<(CellIdx, SegmentIdx, SynapseIdx)> = synapses
                .iter()
                .map(|&synapse| {
                    let synapse_data = &self.synapses[synapse as usize];
                    let segment_data = &self.segments[synapse_data.segment as usize];
                    (
                        segment_data.cell,
                        segment_data.idx_on_cell,
                        synapse_data.idx_on_segment,
                    )
                })
                .collect();
            entry.sort_unstable();
            positions.insert(presynaptic_cell, entry);
        }
        positions
    }
}

// ---------------------------------------------------------------------------
// Structured (schema) serialization
// ---------------------------------------------------------------------------

/// One synapse in the serialized schema. The `destroyed` flag survives from
/// the legacy format; writers always emit `false` and readers skip flagged
/// entries.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseRecord {
    /// Presynaptic cell index.
    pub presynaptic_cell: CellIdx,
    /// Permanence value.
    pub permanence: Permanence,
    /// Legacy tombstone flag; always `false` on write.
    pub destroyed: bool,
}

/// One segment in the serialized schema.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Iteration at which the segment last became active.
    pub last_used_iteration: UInt64,
    /// Legacy tombstone flag; always `false` on write.
    pub destroyed: bool,
    /// Synapses on the segment, in list order.
    pub synapses: Vec<SynapseRecord>,
}

/// One cell in the serialized schema.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRecord {
    /// Segments on the cell, in list order.
    pub segments: Vec<SegmentRecord>,
}

/// Serialized form of a whole [`Connections`] instance.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsRecord {
    /// Format version; see [`Connections::VERSION`].
    pub version: UInt,
    /// Caps, as configured.
    pub max_segments_per_cell: SegmentIdx,
    /// Caps, as configured.
    pub max_synapses_per_segment: SynapseIdx,
    /// Iteration counter.
    pub iteration: UInt64,
    /// Per-cell structure.
    pub cells: Vec<CellRecord>,
}

#[cfg(feature = "serde")]
impl Connections {
    /// Converts the store into its schema record.
    pub fn to_record(&self) -> ConnectionsRecord {
        ConnectionsRecord {
            version: Self::VERSION,
            max_segments_per_cell: self.max_segments_per_cell,
            max_synapses_per_segment: self.max_synapses_per_segment,
            iteration: self.iteration,
            cells: self
                .cells
                .iter()
                .map(|cell_data| CellRecord {
                    segments: cell_data
                        .segments
                        .iter()
                        .map(|&segment| {
                            let segment_data = &self.segments[segment as usize];
                            SegmentRecord {
                                last_used_iteration: segment_data.last_used_iteration,
                                destroyed: false,
                                synapses: segment_data
                                    .synapses
                                    .iter()
                                    .map(|&synapse| {
                                        let synapse_data = &self.synapses[synapse as usize];
                                        SynapseRecord {
                                            presynaptic_cell: synapse_data.presynaptic_cell,
                                            permanence: synapse_data.permanence,
                                            destroyed: false,
                                        }
                                    })
                                    .collect(),
                            }
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Rebuilds a store from its schema record, skipping entries flagged
    /// destroyed. Flat indices are assigned fresh in traversal order.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] for a version newer than
    /// [`Self::VERSION`], or [`VelesError::InvalidParameter`] for degenerate
    /// configuration values.
    pub fn from_record(record: &ConnectionsRecord) -> Result<Self> {
        if record.version > Self::VERSION {
            return Err(VelesError::SerializationError {
                message: format!(
                    "unsupported Connections version {} (current is {})",
                    record.version,
                    Self::VERSION
                ),
            });
        }

        let mut connections = Connections::new(ConnectionsParams {
            num_cells: record.cells.len() as CellIdx,
            max_segments_per_cell: record.max_segments_per_cell,
            max_synapses_per_segment: record.max_synapses_per_segment,
        })?;

        for (cell, cell_record) in record.cells.iter().enumerate() {
            for segment_record in &cell_record.segments {
                if segment_record.destroyed {
                    continue;
                }
                let segment = connections
                    .restore_segment(cell as CellIdx, segment_record.last_used_iteration);
                for synapse_record in &segment_record.synapses {
                    if synapse_record.destroyed {
                        continue;
                    }
                    connections.restore_synapse(
                        segment,
                        synapse_record.presynaptic_cell,
                        synapse_record.permanence,
                    );
                }
            }
        }

        connections.iteration = record.iteration;
        Ok(connections)
    }
}

#[cfg(feature = "serde")]
impl Serialize for Connections {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Connections {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = ConnectionsRecord::deserialize(deserializer)?;
        Connections::from_record(&record).map_err(serde::de::Error::custom)
    }
}
