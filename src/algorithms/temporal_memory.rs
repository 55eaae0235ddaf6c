//! Sequence learning over a cortical column grid.
//!
//! [`TemporalMemory`] consumes one sparse set of active columns per time
//! step and maintains, tick over tick, which cells are active, which earned
//! learning credit (winners), and which expect to fire next (predictive).
//! Columns whose activation was predicted activate only their predicted
//! cells; unpredicted columns burst, activating every cell and electing a
//! single winner. Learning reinforces the segments that predicted correctly,
//! grows new synapses toward the previous winners, and punishes segments
//! that predicted columns which then stayed silent.
//!
//! All structural state lives in the embedded [`Connections`] store; this
//! type owns the configuration, the per-tick summaries, and the PRNG.

use std::io::{BufRead, Write};
use std::mem;

use crate::algorithms::connections::{Connections, ConnectionsParams};
use crate::error::{Result, VelesError};
use crate::serialization::{io_error, TokenReader};
use crate::types::{CellIdx, Permanence, Segment, SegmentIdx, SynapseIdx, UInt, EPSILON};
use crate::utils::Random;

#[cfg(feature = "serde")]
use crate::algorithms::connections::ConnectionsRecord;
#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Configuration for a [`TemporalMemory`].
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalMemoryParams {
    /// Column grid shape; the column count is the product of the entries.
    pub column_dimensions: Vec<UInt>,
    /// Cells per column.
    pub cells_per_column: UInt,
    /// Connected-active synapses needed for a segment to become active.
    pub activation_threshold: UInt,
    /// Permanence assigned to newly grown synapses.
    pub initial_permanence: Permanence,
    /// Permanence at or above which a synapse counts as connected.
    pub connected_permanence: Permanence,
    /// Potential-active synapses needed for a segment to be matching.
    pub min_threshold: UInt,
    /// Cap on synapses grown per learning event on one segment.
    pub max_new_synapse_count: UInt,
    /// Reward applied to synapses that predicted correctly.
    pub permanence_increment: Permanence,
    /// Penalty applied to inactive synapses on reinforced segments.
    pub permanence_decrement: Permanence,
    /// Penalty applied to matching segments of columns that stayed silent.
    /// Zero disables punishment.
    pub predicted_segment_decrement: Permanence,
    /// PRNG seed.
    pub seed: u64,
    /// Segment cap per cell, forwarded to [`Connections`].
    pub max_segments_per_cell: SegmentIdx,
    /// Synapse cap per segment, forwarded to [`Connections`].
    pub max_synapses_per_segment: SynapseIdx,
}

impl Default for TemporalMemoryParams {
    fn default() -> Self {
        TemporalMemoryParams {
            column_dimensions: vec![2048],
            cells_per_column: 32,
            activation_threshold: 13,
            initial_permanence: 0.21,
            connected_permanence: 0.5,
            min_threshold: 10,
            max_new_synapse_count: 20,
            permanence_increment: 0.1,
            permanence_decrement: 0.1,
            predicted_segment_decrement: 0.0,
            seed: 42,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
        }
    }
}

/// Sequence-memory state machine.
///
/// See the [module documentation](self) for the per-tick contract.
#[derive(Debug, Clone)]
pub struct TemporalMemory {
    column_dimensions: Vec<UInt>,
    num_columns: UInt,
    cells_per_column: UInt,
    activation_threshold: UInt,
    initial_permanence: Permanence,
    connected_permanence: Permanence,
    min_threshold: UInt,
    max_new_synapse_count: UInt,
    permanence_increment: Permanence,
    permanence_decrement: Permanence,
    predicted_segment_decrement: Permanence,
    seed: u64,
    rng: Random,

    /// The graph store. Public so tests and collaborators can seed and
    /// inspect structure directly.
    pub connections: Connections,

    active_cells: Vec<CellIdx>,
    winner_cells: Vec<CellIdx>,
    /// Segments active this tick, sorted by (owning cell, position on cell).
    active_segments: Vec<Segment>,
    /// Segments matching this tick, same order as `active_segments`.
    matching_segments: Vec<Segment>,
    num_active_connected_synapses_for_segment: Vec<UInt>,
    num_active_potential_synapses_for_segment: Vec<UInt>,
}

impl TemporalMemory {
    /// Serialization format version for the textual stream.
    pub const VERSION: UInt = 1;

    /// Creates a temporal memory from `params`.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidDimensions`] when `column_dimensions` is
    /// empty or contains a zero, and [`VelesError::InvalidParameter`] when
    /// `cells_per_column` or either capacity is zero.
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        if params.column_dimensions.is_empty() {
            return Err(VelesError::InvalidDimensions(
                "column_dimensions must not be empty".to_string(),
            ));
        }
        if params.column_dimensions.contains(&0) {
            return Err(VelesError::InvalidDimensions(format!(
                "column_dimensions must be positive, got {:?}",
                params.column_dimensions
            )));
        }
        if params.cells_per_column == 0 {
            return Err(VelesError::InvalidParameter {
                name: "cells_per_column",
                message: "must be positive".to_string(),
            });
        }

        let num_columns: UInt = params.column_dimensions.iter().product();
        let connections = Connections::new(ConnectionsParams {
            num_cells: num_columns * params.cells_per_column,
            max_segments_per_cell: params.max_segments_per_cell,
            max_synapses_per_segment: params.max_synapses_per_segment,
        })?;

        Ok(TemporalMemory {
            column_dimensions: params.column_dimensions,
            num_columns,
            cells_per_column: params.cells_per_column,
            activation_threshold: params.activation_threshold,
            initial_permanence: params.initial_permanence,
            connected_permanence: params.connected_permanence,
            min_threshold: params.min_threshold,
            max_new_synapse_count: params.max_new_synapse_count,
            permanence_increment: params.permanence_increment,
            permanence_decrement: params.permanence_decrement,
            predicted_segment_decrement: params.predicted_segment_decrement,
            seed: params.seed,
            rng: Random::new(params.seed),
            connections,
            active_cells: Vec::new(),
            winner_cells: Vec::new(),
            active_segments: Vec::new(),
            matching_segments: Vec::new(),
            num_active_connected_synapses_for_segment: Vec::new(),
            num_active_potential_synapses_for_segment: Vec::new(),
        })
    }

    /// Feeds one time step of column activity into the memory.
    ///
    /// `active_columns` is an unordered, duplicate-free list of column
    /// indices in `[0, num_columns)`; an empty list is valid and clears the
    /// active, winner, and predictive sets while still punishing stale
    /// predictions when configured to. With `learn` false the connections
    /// graph is left untouched.
    pub fn compute(&mut self, active_columns: &[UInt], learn: bool) {
        let prev_active_cells = mem::take(&mut self.active_cells);
        let prev_winner_cells = mem::take(&mut self.winner_cells);
        let prev_active_segments = mem::take(&mut self.active_segments);
        let prev_matching_segments = mem::take(&mut self.matching_segments);
        // Potential-overlap counts from the previous tick size this tick's
        // synapse growth.
        let prev_potential = mem::take(&mut self.num_active_potential_synapses_for_segment);
        self.num_active_connected_synapses_for_segment.clear();

        self.connections.start_new_iteration();

        let mut active_columns = active_columns.to_vec();
        active_columns.sort_unstable();
        debug_assert!(
            active_columns.windows(2).all(|w| w[0] != w[1]),
            "active columns must not contain duplicates"
        );
        debug_assert!(active_columns.iter().all(|&c| c < self.num_columns));

        // Walk the sorted active columns and the previous tick's segment
        // lists (both sorted by column) in lockstep, visiting every column
        // that is active or owns a previously active or matching segment.
        let mut column_cursor = 0;
        let mut active_cursor = 0;
        let mut matching_cursor = 0;
        loop {
            let pending_active = active_columns.get(column_cursor).copied();
            let pending_from_active_segments = prev_active_segments
                .get(active_cursor)
                .map(|&s| self.column_for_segment(s));
            let pending_from_matching_segments = prev_matching_segments
                .get(matching_cursor)
                .map(|&s| self.column_for_segment(s));

            let column = match [
                pending_active,
                pending_from_active_segments,
                pending_from_matching_segments,
            ]
            .iter()
            .flatten()
            .min()
            {
                Some(&column) => column,
                None => break,
            };

            let active_start = active_cursor;
            while active_cursor < prev_active_segments.len()
                && self.column_for_segment(prev_active_segments[active_cursor]) == column
            {
                active_cursor += 1;
            }
            let matching_start = matching_cursor;
            while matching_cursor < prev_matching_segments.len()
                && self.column_for_segment(prev_matching_segments[matching_cursor]) == column
            {
                matching_cursor += 1;
            }

            if pending_active == Some(column) {
                column_cursor += 1;
                if active_start != active_cursor {
                    self.activate_predicted_column(
                        &prev_active_segments[active_start..active_cursor],
                        &prev_active_cells,
                        &prev_winner_cells,
                        &prev_potential,
                        learn,
                    );
                } else {
                    self.burst_column(
                        column,
                        &prev_matching_segments[matching_start..matching_cursor],
                        &prev_active_cells,
                        &prev_winner_cells,
                        &prev_potential,
                        learn,
                    );
                }
            } else if learn && self.predicted_segment_decrement > 0.0 {
                self.punish_predicted_column(
                    &prev_matching_segments[matching_start..matching_cursor],
                    &prev_active_cells,
                );
            }
        }

        // Recompute segment activity against the cells that just fired; they
        // are the presynaptic input of the next tick.
        let length = self.connections.segment_flat_list_length();
        let mut active_connected = vec![0; length];
        let mut active_potential = vec![0; length];
        self.connections.compute_activity(
            &mut active_connected,
            &mut active_potential,
            &self.active_cells,
            self.connected_permanence,
        );

        let mut active_segments = Vec::new();
        let mut matching_segments = Vec::new();
        for flat in 0..length {
            if active_connected[flat] >= self.activation_threshold {
                active_segments.push(flat as Segment);
            }
            if active_potential[flat] >= self.min_threshold {
                matching_segments.push(flat as Segment);
            }
        }
        active_segments.sort_unstable_by(|&a, &b| self.connections.compare_segments(a, b));
        matching_segments.sort_unstable_by(|&a, &b| self.connections.compare_segments(a, b));

        for &segment in &active_segments {
            self.connections.record_segment_activity(segment);
        }

        self.active_segments = active_segments;
        self.matching_segments = matching_segments;
        self.num_active_connected_synapses_for_segment = active_connected;
        self.num_active_potential_synapses_for_segment = active_potential;
    }

    /// Marks a sequence boundary: forgets the previous tick's summary so the
    /// next input is processed without temporal context. Learned structure
    /// is untouched.
    pub fn reset(&mut self) {
        self.active_cells.clear();
        self.winner_cells.clear();
        self.active_segments.clear();
        self.matching_segments.clear();
        self.num_active_connected_synapses_for_segment.clear();
        self.num_active_potential_synapses_for_segment.clear();
    }

    fn activate_predicted_column(
        &mut self,
        column_active_segments: &[Segment],
        prev_active_cells: &[CellIdx],
        prev_winner_cells: &[CellIdx],
        prev_potential: &[UInt],
        learn: bool,
    ) {
        for &segment in column_active_segments {
            let cell = self.connections.cell_for_segment(segment);
            // Segments on the same cell are adjacent in the sorted list.
            if self.active_cells.last() != Some(&cell) {
                self.active_cells.push(cell);
                self.winner_cells.push(cell);
            }

            if learn {
                let alive = self.adapt_segment(
                    segment,
                    prev_active_cells,
                    self.permanence_increment,
                    self.permanence_decrement,
                );
                let desired = i64::from(self.max_new_synapse_count)
                    - i64::from(prev_potential.get(segment as usize).copied().unwrap_or(0));
                if alive && desired > 0 {
                    self.grow_synapses(segment, desired as usize, prev_winner_cells);
                }
            }
        }
    }

    fn burst_column(
        &mut self,
        column: UInt,
        column_matching_segments: &[Segment],
        prev_active_cells: &[CellIdx],
        prev_winner_cells: &[CellIdx],
        prev_potential: &[UInt],
        learn: bool,
    ) {
        let start = column * self.cells_per_column;
        for cell in start..start + self.cells_per_column {
            self.active_cells.push(cell);
        }

        if column_matching_segments.is_empty() {
            // Nothing predicted anything here; learn on the least-used cell.
            let winner = self.least_used_cell(column);
            if learn && !prev_winner_cells.is_empty() {
                let desired =
                    (self.max_new_synapse_count as usize).min(prev_winner_cells.len());
                let segment = self.connections.create_segment(winner);
                self.grow_synapses(segment, desired, prev_winner_cells);
            }
            self.winner_cells.push(winner);
        } else {
            let best = self.best_matching_segment(column_matching_segments, prev_potential);
            let winner = self.connections.cell_for_segment(best);
            if learn {
                let alive = self.adapt_segment(
                    best,
                    prev_active_cells,
                    self.permanence_increment,
                    self.permanence_decrement,
                );
                let desired = i64::from(self.max_new_synapse_count)
                    - i64::from(prev_potential.get(best as usize).copied().unwrap_or(0));
                if alive && desired > 0 {
                    self.grow_synapses(best, desired as usize, prev_winner_cells);
                }
            }
            self.winner_cells.push(winner);
        }
    }

    fn punish_predicted_column(
        &mut self,
        column_matching_segments: &[Segment],
        prev_active_cells: &[CellIdx],
    ) {
        for &segment in column_matching_segments {
            self.adapt_segment(
                segment,
                prev_active_cells,
                -self.predicted_segment_decrement,
                0.0,
            );
        }
    }

    /// The matching segment with the greatest potential overlap; ties go to
    /// the segment created earliest (lowest flat index).
    fn best_matching_segment(
        &self,
        column_matching_segments: &[Segment],
        prev_potential: &[UInt],
    ) -> Segment {
        let mut best = column_matching_segments[0];
        let mut best_overlap = prev_potential.get(best as usize).copied().unwrap_or(0);
        for &segment in &column_matching_segments[1..] {
            let overlap = prev_potential.get(segment as usize).copied().unwrap_or(0);
            if overlap > best_overlap || (overlap == best_overlap && segment < best) {
                best = segment;
                best_overlap = overlap;
            }
        }
        best
    }

    /// Applies the Hebbian update to every synapse on `segment`: synapses
    /// from previously active cells move by `increment`, the rest move by
    /// `-decrement`, clamped to `[0, 1]`. Synapses that fall to zero are
    /// destroyed, and a segment left with no synapses is destroyed with
    /// them. Returns whether the segment survived.
    fn adapt_segment(
        &mut self,
        segment: Segment,
        prev_active_cells: &[CellIdx],
        increment: Permanence,
        decrement: Permanence,
    ) -> bool {
        // Destruction shifts list positions but never invalidates other
        // handles, so a snapshot of the handles is safe to iterate.
        let synapses = self.connections.synapses_for_segment(segment).to_vec();
        for synapse in synapses {
            let data = self.connections.data_for_synapse(synapse);
            let active = prev_active_cells.binary_search(&data.presynaptic_cell).is_ok();
            let mut permanence = data.permanence + if active { increment } else { -decrement };
            permanence = permanence.clamp(0.0, 1.0);

            if permanence < EPSILON {
                self.connections.destroy_synapse(synapse);
            } else {
                self.connections.update_synapse_permanence(synapse, permanence);
            }
        }

        if self.connections.num_synapses_for_segment(segment) == 0 {
            self.connections.destroy_segment(segment);
            false
        } else {
            true
        }
    }

    /// Grows up to `desired` synapses on `segment` toward previous winner
    /// cells it is not already connected to, sampling without replacement.
    fn grow_synapses(&mut self, segment: Segment, desired: usize, prev_winner_cells: &[CellIdx]) {
        let mut candidates = prev_winner_cells.to_vec();

        for &synapse in self.connections.synapses_for_segment(segment) {
            let presynaptic_cell = self.connections.data_for_synapse(synapse).presynaptic_cell;
            if let Ok(position) = candidates.binary_search(&presynaptic_cell) {
                candidates.remove(position);
            }
        }

        let actual = desired.min(candidates.len());
        for _ in 0..actual {
            let pick = self.rng.get_usize(candidates.len());
            self.connections
                .create_synapse(segment, candidates[pick], self.initial_permanence);
            candidates.remove(pick);
        }
    }

    /// The cell with the fewest segments in `column`; ties are broken
    /// uniformly at random.
    fn least_used_cell(&mut self, column: UInt) -> CellIdx {
        let start = column * self.cells_per_column;
        let end = start + self.cells_per_column;

        let mut min_segments = usize::MAX;
        let mut num_tied = 0;
        for cell in start..end {
            let num_segments = self.connections.num_segments_for_cell(cell);
            if num_segments < min_segments {
                min_segments = num_segments;
                num_tied = 1;
            } else if num_segments == min_segments {
                num_tied += 1;
            }
        }

        let winner_index = self.rng.get_usize(num_tied);
        let mut tied_seen = 0;
        for cell in start..end {
            if self.connections.num_segments_for_cell(cell) == min_segments {
                if tied_seen == winner_index {
                    return cell;
                }
                tied_seen += 1;
            }
        }
        unreachable!("tie winner index out of range");
    }

    fn column_for_segment(&self, segment: Segment) -> UInt {
        self.connections.cell_for_segment(segment) / self.cells_per_column
    }

    /// Cells that fired this tick, ascending.
    pub fn active_cells(&self) -> &[CellIdx] {
        &self.active_cells
    }

    /// Cells holding learning credit this tick, ascending.
    pub fn winner_cells(&self) -> &[CellIdx] {
        &self.winner_cells
    }

    /// Cells owning at least one active segment, ascending; they expect to
    /// fire on the next tick.
    pub fn predictive_cells(&self) -> Vec<CellIdx> {
        let mut cells: Vec<CellIdx> = Vec::new();
        for &segment in &self.active_segments {
            let cell = self.connections.cell_for_segment(segment);
            if cells.last() != Some(&cell) {
                cells.push(cell);
            }
        }
        cells
    }

    /// Segments active this tick, sorted by (owning cell, position on cell).
    pub fn active_segments(&self) -> &[Segment] {
        &self.active_segments
    }

    /// Segments matching this tick, same ordering as
    /// [`active_segments`](Self::active_segments).
    pub fn matching_segments(&self) -> &[Segment] {
        &self.matching_segments
    }

    /// This tick's potential-overlap count for `segment`.
    pub fn num_active_potential_synapses_for_segment(&self, segment: Segment) -> UInt {
        self.num_active_potential_synapses_for_segment
            .get(segment as usize)
            .copied()
            .unwrap_or(0)
    }

    /// This tick's connected-overlap count for `segment`.
    pub fn num_active_connected_synapses_for_segment(&self, segment: Segment) -> UInt {
        self.num_active_connected_synapses_for_segment
            .get(segment as usize)
            .copied()
            .unwrap_or(0)
    }

    /// The column grid shape.
    pub fn column_dimensions(&self) -> &[UInt] {
        &self.column_dimensions
    }

    /// Total number of columns.
    pub fn num_columns(&self) -> UInt {
        self.num_columns
    }

    /// Total number of cells.
    pub fn num_cells(&self) -> UInt {
        self.num_columns * self.cells_per_column
    }

    /// Cells per column.
    pub fn cells_per_column(&self) -> UInt {
        self.cells_per_column
    }

    /// The column containing `cell`.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IndexOutOfBounds`] when `cell` is outside the
    /// cell population.
    pub fn column_for_cell(&self, cell: CellIdx) -> Result<UInt> {
        if cell >= self.num_cells() {
            return Err(VelesError::IndexOutOfBounds {
                index: cell as usize,
                size: self.num_cells() as usize,
            });
        }
        Ok(cell / self.cells_per_column)
    }

    /// Connected-synapse threshold for segment activation.
    pub fn activation_threshold(&self) -> UInt {
        self.activation_threshold
    }

    /// Permanence given to newly grown synapses.
    pub fn initial_permanence(&self) -> Permanence {
        self.initial_permanence
    }

    /// Connected-synapse permanence threshold.
    pub fn connected_permanence(&self) -> Permanence {
        self.connected_permanence
    }

    /// Potential-synapse threshold for a matching segment.
    pub fn min_threshold(&self) -> UInt {
        self.min_threshold
    }

    /// Cap on synapses grown per learning event.
    pub fn max_new_synapse_count(&self) -> UInt {
        self.max_new_synapse_count
    }

    /// Hebbian reward step.
    pub fn permanence_increment(&self) -> Permanence {
        self.permanence_increment
    }

    /// Hebbian penalty step.
    pub fn permanence_decrement(&self) -> Permanence {
        self.permanence_decrement
    }

    /// Penalty for wrongly predicting segments; zero disables punishment.
    pub fn predicted_segment_decrement(&self) -> Permanence {
        self.predicted_segment_decrement
    }

    /// The configured PRNG seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Segment cap per cell.
    pub fn max_segments_per_cell(&self) -> SegmentIdx {
        self.connections.max_segments_per_cell()
    }

    /// Synapse cap per segment.
    pub fn max_synapses_per_segment(&self) -> SynapseIdx {
        self.connections.max_synapses_per_segment()
    }

    /// Writes the memory to a human-readable stream: configuration, PRNG
    /// state, the previous-tick summary, and the nested connections block.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] when the underlying writer fails.
    pub fn save<W: Write>(&self, stream: &mut W) -> Result<()> {
        writeln!(stream, "TemporalMemory").map_err(io_error)?;
        writeln!(stream, "{}", Self::VERSION).map_err(io_error)?;

        write!(stream, "{}", self.column_dimensions.len()).map_err(io_error)?;
        for dim in &self.column_dimensions {
            write!(stream, " {dim}").map_err(io_error)?;
        }
        writeln!(stream).map_err(io_error)?;

        writeln!(
            stream,
            "{} {} {} {} {} {} {} {} {} {}",
            self.cells_per_column,
            self.activation_threshold,
            self.initial_permanence,
            self.connected_permanence,
            self.min_threshold,
            self.max_new_synapse_count,
            self.permanence_increment,
            self.permanence_decrement,
            self.predicted_segment_decrement,
            self.seed,
        )
        .map_err(io_error)?;

        writeln!(stream, "{} {}", self.rng.seed(), self.rng.steps()).map_err(io_error)?;

        Self::save_cell_list(stream, &self.active_cells)?;
        Self::save_cell_list(stream, &self.winner_cells)?;
        self.save_segment_list(stream, &self.active_segments)?;
        self.save_segment_list(stream, &self.matching_segments)?;

        self.connections.save(stream)?;
        writeln!(stream, "~TemporalMemory").map_err(io_error)?;
        Ok(())
    }

    fn save_cell_list<W: Write>(stream: &mut W, cells: &[CellIdx]) -> Result<()> {
        write!(stream, "{}", cells.len()).map_err(io_error)?;
        for cell in cells {
            write!(stream, " {cell}").map_err(io_error)?;
        }
        writeln!(stream).map_err(io_error)
    }

    /// Segments are persisted as (cell, position) pairs; flat indices are
    /// renumbered on load.
    fn save_segment_list<W: Write>(&self, stream: &mut W, segments: &[Segment]) -> Result<()> {
        write!(stream, "{}", segments.len()).map_err(io_error)?;
        for &segment in segments {
            let data = self.connections.data_for_segment(segment);
            write!(stream, " {} {}", data.cell, data.idx_on_cell).map_err(io_error)?;
        }
        writeln!(stream).map_err(io_error)
    }

    /// Reads a memory previously written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on a bad marker, a version
    /// newer than [`Self::VERSION`], or a truncated or inconsistent stream.
    pub fn load<R: BufRead>(stream: &mut R) -> Result<Self> {
        let mut reader = TokenReader::new(stream);
        reader.expect_marker("TemporalMemory")?;

        let version: UInt = reader.parse()?;
        if version > Self::VERSION {
            return Err(VelesError::SerializationError {
                message: format!(
                    "unsupported TemporalMemory version {version} (current is {})",
                    Self::VERSION
                ),
            });
        }

        let num_dimensions: usize = reader.parse()?;
        let mut column_dimensions = Vec::with_capacity(num_dimensions);
        for _ in 0..num_dimensions {
            column_dimensions.push(reader.parse::<UInt>()?);
        }

        let cells_per_column: UInt = reader.parse()?;
        let activation_threshold: UInt = reader.parse()?;
        let initial_permanence: Permanence = reader.parse()?;
        let connected_permanence: Permanence = reader.parse()?;
        let min_threshold: UInt = reader.parse()?;
        let max_new_synapse_count: UInt = reader.parse()?;
        let permanence_increment: Permanence = reader.parse()?;
        let permanence_decrement: Permanence = reader.parse()?;
        let predicted_segment_decrement: Permanence = reader.parse()?;
        let seed: u64 = reader.parse()?;

        let rng_seed: u64 = reader.parse()?;
        let rng_steps: u64 = reader.parse()?;

        let active_cells = Self::load_cell_list(&mut reader)?;
        let winner_cells = Self::load_cell_list(&mut reader)?;
        let active_segment_positions = Self::load_segment_positions(&mut reader)?;
        let matching_segment_positions = Self::load_segment_positions(&mut reader)?;

        let connections = Connections::load_from_tokens(&mut reader)?;
        reader.expect_marker("~TemporalMemory")?;

        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions,
            cells_per_column,
            activation_threshold,
            initial_permanence,
            connected_permanence,
            min_threshold,
            max_new_synapse_count,
            permanence_increment,
            permanence_decrement,
            predicted_segment_decrement,
            seed,
            max_segments_per_cell: connections.max_segments_per_cell(),
            max_synapses_per_segment: connections.max_synapses_per_segment(),
        })?;
        tm.connections = connections;
        tm.rng = Random::from_state(rng_seed, rng_steps);
        tm.active_cells = active_cells;
        tm.winner_cells = winner_cells;
        tm.active_segments = Self::resolve_segments(&tm.connections, &active_segment_positions)?;
        tm.matching_segments =
            Self::resolve_segments(&tm.connections, &matching_segment_positions)?;
        tm.rebuild_activity_counts();
        Ok(tm)
    }

    fn load_cell_list<R: BufRead>(reader: &mut TokenReader<'_, R>) -> Result<Vec<CellIdx>> {
        let count: usize = reader.parse()?;
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            cells.push(reader.parse::<CellIdx>()?);
        }
        Ok(cells)
    }

    fn load_segment_positions<R: BufRead>(
        reader: &mut TokenReader<'_, R>,
    ) -> Result<Vec<(CellIdx, SegmentIdx)>> {
        let count: usize = reader.parse()?;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            let cell: CellIdx = reader.parse()?;
            let idx: SegmentIdx = reader.parse()?;
            positions.push((cell, idx));
        }
        Ok(positions)
    }

    fn resolve_segments(
        connections: &Connections,
        positions: &[(CellIdx, SegmentIdx)],
    ) -> Result<Vec<Segment>> {
        positions
            .iter()
            .map(|&(cell, idx)| {
                if cell >= connections.num_cells() {
                    return Err(VelesError::SerializationError {
                        message: format!("segment reference to nonexistent cell {cell}"),
                    });
                }
                connections
                    .segments_for_cell(cell)
                    .get(idx as usize)
                    .copied()
                    .ok_or_else(|| VelesError::SerializationError {
                        message: format!("segment reference ({cell}, {idx}) has no target"),
                    })
            })
            .collect()
    }

    /// Rebuilds the per-segment activity counts from the restored active
    /// cells. The counts are integer functions of the restored structure, so
    /// this reproduces the saved values exactly.
    fn rebuild_activity_counts(&mut self) {
        let length = self.connections.segment_flat_list_length();
        let mut active_connected = vec![0; length];
        let mut active_potential = vec![0; length];
        self.connections.compute_activity(
            &mut active_connected,
            &mut active_potential,
            &self.active_cells,
            self.connected_permanence,
        );
        self.num_active_connected_synapses_for_segment = active_connected;
        self.num_active_potential_synapses_for_segment = active_potential;
    }
}

// ---------------------------------------------------------------------------
// Structured (schema) serialization
// ---------------------------------------------------------------------------

/// Serialized form of a whole [`TemporalMemory`].
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalMemoryRecord {
    /// Format version; see [`TemporalMemory::VERSION`].
    pub version: UInt,
    /// Column grid shape.
    pub column_dimensions: Vec<UInt>,
    /// Cells per column.
    pub cells_per_column: UInt,
    /// Segment activation threshold.
    pub activation_threshold: UInt,
    /// Initial permanence for grown synapses.
    pub initial_permanence: Permanence,
    /// Connected permanence threshold.
    pub connected_permanence: Permanence,
    /// Matching-segment threshold.
    pub min_threshold: UInt,
    /// Growth cap per learning event.
    pub max_new_synapse_count: UInt,
    /// Hebbian reward step.
    pub permanence_increment: Permanence,
    /// Hebbian penalty step.
    pub permanence_decrement: Permanence,
    /// Wrong-prediction penalty.
    pub predicted_segment_decrement: Permanence,
    /// Configured seed.
    pub seed: u64,
    /// PRNG state at save time.
    pub rng: Random,
    /// Active cells of the last tick.
    pub active_cells: Vec<CellIdx>,
    /// Winner cells of the last tick.
    pub winner_cells: Vec<CellIdx>,
    /// Active segments as (cell, position) pairs.
    pub active_segments: Vec<(CellIdx, SegmentIdx)>,
    /// Matching segments as (cell, position) pairs.
    pub matching_segments: Vec<(CellIdx, SegmentIdx)>,
    /// Nested connections record.
    pub connections: ConnectionsRecord,
}

#[cfg(feature = "serde")]
impl TemporalMemory {
    /// Converts the memory into its schema record.
    pub fn to_record(&self) -> TemporalMemoryRecord {
        let positions = |segments: &[Segment]| {
            segments
                .iter()
                .map(|&segment| {
                    let data = self.connections.data_for_segment(segment);
                    (data.cell, data.idx_on_cell)
                })
                .collect()
        };

        TemporalMemoryRecord {
            version: Self::VERSION,
            column_dimensions: self.column_dimensions.clone(),
            cells_per_column: self.cells_per_column,
            activation_threshold: self.activation_threshold,
            initial_permanence: self.initial_permanence,
            connected_permanence: self.connected_permanence,
            min_threshold: self.min_threshold,
            max_new_synapse_count: self.max_new_synapse_count,
            permanence_increment: self.permanence_increment,
            permanence_decrement: self.permanence_decrement,
            predicted_segment_decrement: self.predicted_segment_decrement,
            seed: self.seed,
            rng: self.rng.clone(),
            active_cells: self.active_cells.clone(),
            winner_cells: self.winner_cells.clone(),
            active_segments: positions(&self.active_segments),
            matching_segments: positions(&self.matching_segments),
            connections: self.connections.to_record(),
        }
    }

    /// Rebuilds a memory from its schema record.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] for a future version or
    /// dangling segment references, and configuration errors for degenerate
    /// parameters.
    pub fn from_record(record: &TemporalMemoryRecord) -> Result<Self> {
        if record.version > Self::VERSION {
            return Err(VelesError::SerializationError {
                message: format!(
                    "unsupported TemporalMemory version {} (current is {})",
                    record.version,
                    Self::VERSION
                ),
            });
        }

        let connections = Connections::from_record(&record.connections)?;
        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: record.column_dimensions.clone(),
            cells_per_column: record.cells_per_column,
            activation_threshold: record.activation_threshold,
            initial_permanence: record.initial_permanence,
            connected_permanence: record.connected_permanence,
            min_threshold: record.min_threshold,
            max_new_synapse_count: record.max_new_synapse_count,
            permanence_increment: record.permanence_increment,
            permanence_decrement: record.permanence_decrement,
            predicted_segment_decrement: record.predicted_segment_decrement,
            seed: record.seed,
            max_segments_per_cell: record.connections.max_segments_per_cell,
            max_synapses_per_segment: record.connections.max_synapses_per_segment,
        })?;
        tm.connections = connections;
        tm.rng = record.rng.clone();
        tm.active_cells = record.active_cells.clone();
        tm.winner_cells = record.winner_cells.clone();
        tm.active_segments = Self::resolve_segments(&tm.connections, &record.active_segments)?;
        tm.matching_segments = Self::resolve_segments(&tm.connections, &record.matching_segments)?;
        tm.rebuild_activity_counts();
        Ok(tm)
    }
}

#[cfg(feature = "serde")]
impl Serialize for TemporalMemory {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for TemporalMemory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = TemporalMemoryRecord::deserialize(deserializer)?;
        TemporalMemory::from_record(&record).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_column_dimensions() {
        let result = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![],
            ..TemporalMemoryParams::default()
        });
        assert!(matches!(result, Err(VelesError::InvalidDimensions(_))));
    }

    #[test]
    fn rejects_zero_dimension() {
        let result = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![64, 0],
            ..TemporalMemoryParams::default()
        });
        assert!(matches!(result, Err(VelesError::InvalidDimensions(_))));
    }

    #[test]
    fn rejects_zero_cells_per_column() {
        let result = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![2048],
            cells_per_column: 0,
            ..TemporalMemoryParams::default()
        });
        assert!(matches!(
            result,
            Err(VelesError::InvalidParameter { name: "cells_per_column", .. })
        ));
    }

    #[test]
    fn grid_accounting() {
        let tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![64, 64],
            cells_per_column: 32,
            ..TemporalMemoryParams::default()
        })
        .unwrap();

        assert_eq!(tm.num_columns(), 64 * 64);
        assert_eq!(tm.num_cells(), 64 * 64 * 32);
        assert_eq!(tm.cells_per_column(), 32);
        assert_eq!(tm.column_dimensions(), &[64, 64]);
    }

    #[test]
    fn config_getters_echo_params() {
        let tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![32],
            cells_per_column: 4,
            activation_threshold: 3,
            initial_permanence: 0.21,
            connected_permanence: 0.5,
            min_threshold: 2,
            max_new_synapse_count: 3,
            permanence_increment: 0.1,
            permanence_decrement: 0.07,
            predicted_segment_decrement: 0.02,
            seed: 99,
            max_segments_per_cell: 128,
            max_synapses_per_segment: 64,
        })
        .unwrap();

        assert_eq!(tm.activation_threshold(), 3);
        assert!((tm.initial_permanence() - 0.21).abs() < f32::EPSILON);
        assert!((tm.connected_permanence() - 0.5).abs() < f32::EPSILON);
        assert_eq!(tm.min_threshold(), 2);
        assert_eq!(tm.max_new_synapse_count(), 3);
        assert!((tm.permanence_increment() - 0.1).abs() < f32::EPSILON);
        assert!((tm.permanence_decrement() - 0.07).abs() < f32::EPSILON);
        assert!((tm.predicted_segment_decrement() - 0.02).abs() < f32::EPSILON);
        assert_eq!(tm.seed(), 99);
        assert_eq!(tm.max_segments_per_cell(), 128);
        assert_eq!(tm.max_synapses_per_segment(), 64);
    }

    #[test]
    fn column_for_cell_maps_dense_ranges() {
        let tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![2048],
            cells_per_column: 5,
            ..TemporalMemoryParams::default()
        })
        .unwrap();

        assert_eq!(tm.column_for_cell(0).unwrap(), 0);
        assert_eq!(tm.column_for_cell(4).unwrap(), 0);
        assert_eq!(tm.column_for_cell(5).unwrap(), 1);
        assert_eq!(tm.column_for_cell(10239).unwrap(), 2047);
        assert!(tm.column_for_cell(10240).is_err());
    }

    #[test]
    fn reset_clears_tick_state_but_not_structure() {
        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![50],
            cells_per_column: 4,
            activation_threshold: 3,
            min_threshold: 2,
            max_new_synapse_count: 3,
            ..TemporalMemoryParams::default()
        })
        .unwrap();

        tm.compute(&[0, 1, 2], true);
        tm.compute(&[3, 4, 5], true);
        assert!(!tm.active_cells().is_empty());
        let segments_before = tm.connections.num_segments();
        assert!(segments_before > 0);

        tm.reset();
        assert!(tm.active_cells().is_empty());
        assert!(tm.winner_cells().is_empty());
        assert!(tm.predictive_cells().is_empty());
        assert!(tm.active_segments().is_empty());
        assert!(tm.matching_segments().is_empty());
        assert_eq!(tm.connections.num_segments(), segments_before);
    }

    #[test]
    fn returned_cell_lists_are_ascending() {
        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![64],
            cells_per_column: 4,
            activation_threshold: 3,
            min_threshold: 2,
            max_new_synapse_count: 4,
            ..TemporalMemoryParams::default()
        })
        .unwrap();

        // Deliberately unordered input.
        tm.compute(&[9, 3, 27, 15], true);
        tm.compute(&[30, 2, 17], true);

        let ascending = |cells: &[CellIdx]| cells.windows(2).all(|w| w[0] < w[1]);
        assert!(ascending(tm.active_cells()));
        assert!(ascending(tm.winner_cells()));
        assert!(ascending(&tm.predictive_cells()));
    }
}
