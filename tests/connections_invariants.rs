//! Property-based invariant sweeps over the connections store.
//!
//! Random interleavings of creation and destruction must leave every
//! positional index, the reverse index, the capacity bounds, and the
//! permanence positivity intact, and the textual codec must round-trip to a
//! semantically equal store.

use proptest::prelude::*;
use veles::prelude::*;

const NUM_CELLS: CellIdx = 16;
const MAX_SEGMENTS_PER_CELL: SegmentIdx = 4;
const MAX_SYNAPSES_PER_SEGMENT: SynapseIdx = 4;

#[derive(Debug, Clone)]
enum Op {
    CreateSegment { cell: CellIdx },
    CreateSynapse { pick: usize, presynaptic: CellIdx, permanence: f32 },
    DestroySegment { pick: usize },
    DestroySynapse { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..NUM_CELLS).prop_map(|cell| Op::CreateSegment { cell }),
        4 => (any::<usize>(), 0..NUM_CELLS, 0.01f32..1.0f32)
            .prop_map(|(pick, presynaptic, permanence)| Op::CreateSynapse {
                pick,
                presynaptic,
                permanence,
            }),
        1 => any::<usize>().prop_map(|pick| Op::DestroySegment { pick }),
        2 => any::<usize>().prop_map(|pick| Op::DestroySynapse { pick }),
    ]
}

fn live_segments(conn: &Connections) -> Vec<Segment> {
    (0..conn.num_cells())
        .flat_map(|cell| conn.segments_for_cell(cell).to_vec())
        .collect()
}

fn live_synapses(conn: &Connections) -> Vec<Synapse> {
    live_segments(conn)
        .into_iter()
        .flat_map(|segment| conn.synapses_for_segment(segment).to_vec())
        .collect()
}

fn apply_ops(conn: &mut Connections, ops: &[Op]) {
    for op in ops {
        match *op {
            Op::CreateSegment { cell } => {
                conn.create_segment(cell);
            }
            Op::CreateSynapse {
                pick,
                presynaptic,
                permanence,
            } => {
                let segments = live_segments(conn);
                if !segments.is_empty() {
                    conn.create_synapse(segments[pick % segments.len()], presynaptic, permanence);
                }
            }
            Op::DestroySegment { pick } => {
                let segments = live_segments(conn);
                if !segments.is_empty() {
                    conn.destroy_segment(segments[pick % segments.len()]);
                }
            }
            Op::DestroySynapse { pick } => {
                let synapses = live_synapses(conn);
                if !synapses.is_empty() {
                    conn.destroy_synapse(synapses[pick % synapses.len()]);
                }
            }
        }
    }
}

fn check_invariants(conn: &Connections) {
    let mut total_segments = 0;
    let mut total_synapses = 0;

    for cell in 0..conn.num_cells() {
        let segments = conn.segments_for_cell(cell);
        assert!(segments.len() <= MAX_SEGMENTS_PER_CELL as usize);

        for (position, &segment) in segments.iter().enumerate() {
            total_segments += 1;
            let segment_data = conn.data_for_segment(segment);
            assert_eq!(segment_data.cell, cell);
            assert_eq!(segment_data.idx_on_cell as usize, position);

            let synapses = conn.synapses_for_segment(segment);
            assert!(synapses.len() <= MAX_SYNAPSES_PER_SEGMENT as usize);

            for (slot, &synapse) in synapses.iter().enumerate() {
                total_synapses += 1;
                let synapse_data = conn.data_for_synapse(synapse);
                assert_eq!(synapse_data.segment, segment);
                assert_eq!(synapse_data.idx_on_segment as usize, slot);
                assert!(synapse_data.permanence > 0.0);

                // Exactly one reverse-index entry points back.
                let reverse = conn.synapses_for_presynaptic_cell(synapse_data.presynaptic_cell);
                assert_eq!(reverse.iter().filter(|&&s| s == synapse).count(), 1);
            }
        }
    }

    // Bookkeeping counts agree with a full traversal.
    assert_eq!(conn.num_segments(), total_segments);
    assert_eq!(conn.num_synapses(), total_synapses);

    // Every reverse-index entry points at a live synapse on a live segment.
    for cell in 0..conn.num_cells() {
        for &synapse in conn.synapses_for_presynaptic_cell(cell) {
            assert!(conn.synapse_exists(synapse));
            assert_eq!(conn.data_for_synapse(synapse).presynaptic_cell, cell);
        }
    }
}

fn fresh_connections() -> Connections {
    Connections::new(ConnectionsParams {
        num_cells: NUM_CELLS,
        max_segments_per_cell: MAX_SEGMENTS_PER_CELL,
        max_synapses_per_segment: MAX_SYNAPSES_PER_SEGMENT,
    })
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn structure_invariants_survive_arbitrary_op_sequences(
        ops in proptest::collection::vec(op_strategy(), 0..120)
    ) {
        let mut conn = fresh_connections();
        apply_ops(&mut conn, &ops);
        check_invariants(&conn);
    }

    #[test]
    fn textual_round_trip_is_semantically_equal(
        ops in proptest::collection::vec(op_strategy(), 0..80)
    ) {
        let mut conn = fresh_connections();
        apply_ops(&mut conn, &ops);

        let mut buffer = Vec::new();
        conn.save(&mut buffer).unwrap();
        let restored = Connections::load(&mut buffer.as_slice()).unwrap();

        prop_assert!(conn == restored);
        check_invariants(&restored);
    }

    #[test]
    fn compute_without_learning_never_mutates_connections(
        ticks in proptest::collection::vec(
            proptest::collection::btree_set(0u32..32, 0..6),
            1..8
        )
    ) {
        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![32],
            cells_per_column: 4,
            activation_threshold: 3,
            min_threshold: 2,
            max_new_synapse_count: 4,
            predicted_segment_decrement: 0.02,
            ..TemporalMemoryParams::default()
        }).unwrap();

        // Build some structure first so the ticks exercise predicted,
        // bursting, and punished columns.
        for _ in 0..3 {
            tm.compute(&[0, 5, 9, 13], true);
            tm.compute(&[2, 5, 21, 30], true);
        }

        let before = tm.connections.clone();
        for tick in &ticks {
            let columns: Vec<UInt> = tick.iter().copied().collect();
            tm.compute(&columns, false);
        }
        prop_assert!(before == tm.connections);
    }
}

#[cfg(feature = "serde")]
mod serde_round_trips {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn binary_round_trip_is_semantically_equal(
            ops in proptest::collection::vec(op_strategy(), 0..80)
        ) {
            let mut conn = fresh_connections();
            apply_ops(&mut conn, &ops);

            let bytes = conn.to_bytes(SerializableFormat::Binary).unwrap();
            let restored = Connections::from_bytes(&bytes, SerializableFormat::Binary).unwrap();

            prop_assert!(conn == restored);
            check_invariants(&restored);
        }
    }
}
