//! # Veles - Sequence Memory in Rust
//!
//! Veles is an idiomatic Rust implementation of the sequence-memory core of
//! Hierarchical Temporal Memory (HTM): a Temporal Memory state machine over
//! a cortical column grid, backed by a dense-indexed connectivity store of
//! cells, dendritic segments, and synapses.
//!
//! ## Overview
//!
//! The engine is fed one sparse set of active column indices per time step
//! and answers three questions about the cell population:
//!
//! - **Active cells**: which cells fired this step
//! - **Winner cells**: which cells received learning credit
//! - **Predictive cells**: which cells expect to fire next step
//!
//! Learning is Hebbian: segments that predicted correctly are reinforced and
//! extended toward the previous winners, segments that predicted columns
//! which stayed silent are punished. Encoders, spatial pooling, and
//! classification are out of scope; the engine consumes column activations
//! from whatever produces them.
//!
//! ## Quick Start
//!
//! ```rust
//! use veles::prelude::*;
//!
//! let mut tm = TemporalMemory::new(TemporalMemoryParams {
//!     column_dimensions: vec![2048],
//!     cells_per_column: 32,
//!     ..Default::default()
//! }).unwrap();
//!
//! // Feed a repeating sequence; predictions firm up over time.
//! for _ in 0..10 {
//!     tm.compute(&[3, 57, 604, 1011], true);
//!     tm.compute(&[19, 220, 725, 1900], true);
//! }
//!
//! let predicted = tm.predictive_cells();
//! # let _ = predicted;
//! ```
//!
//! ## Feature Flags
//!
//! - `std` (default): Enable standard library features
//! - `serde` (default): Binary/JSON serialization of the engine state

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)]

pub mod types;
pub mod algorithms;
pub mod utils;

pub mod serialization;

/// Re-export of commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::types::{
        CellIdx, Permanence, Real, Segment, SegmentIdx, Synapse, SynapseIdx, UInt, UInt64,
    };
    pub use crate::algorithms::{
        Connections, ConnectionsEventHandler, ConnectionsParams, SegmentData, SynapseData,
        TemporalMemory, TemporalMemoryParams,
    };
    pub use crate::utils::Random;

    #[cfg(feature = "serde")]
    pub use crate::serialization::{Serializable, SerializableFormat};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library.
pub mod error {
    use thiserror::Error;

    /// Main error type for veles operations.
    #[derive(Error, Debug)]
    pub enum VelesError {
        /// Invalid dimensions provided.
        #[error("Invalid dimensions: {0}")]
        InvalidDimensions(String),

        /// Invalid parameter value.
        #[error("Invalid parameter '{name}': {message}")]
        InvalidParameter {
            /// Name of the invalid parameter.
            name: &'static str,
            /// Description of the error.
            message: String,
        },

        /// Index out of bounds.
        #[error("Index {index} out of bounds (size: {size})")]
        IndexOutOfBounds {
            /// The invalid index.
            index: usize,
            /// The valid size.
            size: usize,
        },

        /// Serialization error.
        #[error("Serialization error: {message}")]
        SerializationError {
            /// Description of the serialization error.
            message: String,
        },

        /// I/O error.
        #[error("I/O error: {message}")]
        IoError {
            /// Description of the I/O error.
            message: String,
        },
    }

    /// Result type alias using VelesError.
    pub type Result<T> = std::result::Result<T, VelesError>;
}

pub use error::{Result, VelesError};
