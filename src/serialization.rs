//! Serialization support for the engine.
//!
//! Two independent layers live here:
//!
//! - The token reader backing the human-readable stream format that
//!   [`Connections`](crate::algorithms::Connections) and
//!   [`TemporalMemory`](crate::algorithms::TemporalMemory) implement with
//!   their `save`/`load` methods. It is plain `std::io` and always available.
//! - The [`Serializable`] convenience trait (feature `serde`), which gives
//!   every serde-capable type — including the two engine types, which
//!   serialize through explicit schema records — binary (bincode) and JSON
//!   transport to bytes, strings, writers, and files.

use crate::error::{Result, VelesError};
use std::collections::VecDeque;
use std::io::BufRead;
use std::str::FromStr;

#[cfg(feature = "serde")]
use std::fs::File;
#[cfg(feature = "serde")]
use std::io::{BufReader, BufWriter, Read, Write};
#[cfg(feature = "serde")]
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{de::DeserializeOwned, Serialize};

/// Maps an I/O failure into the engine error type.
pub(crate) fn io_error(err: std::io::Error) -> VelesError {
    VelesError::IoError {
        message: err.to_string(),
    }
}

/// Whitespace-token reader over a buffered stream.
///
/// The textual stream format is a flat sequence of whitespace-separated
/// tokens; this reader hands them out one at a time and parses them on
/// demand, reporting truncation and malformed values as serialization
/// errors.
pub(crate) struct TokenReader<'a, R: BufRead> {
    stream: &'a mut R,
    tokens: VecDeque<String>,
}

impl<'a, R: BufRead> TokenReader<'a, R> {
    pub(crate) fn new(stream: &'a mut R) -> Self {
        TokenReader {
            stream,
            tokens: VecDeque::new(),
        }
    }

    /// Returns the next token, reading further lines as needed.
    pub(crate) fn token(&mut self) -> Result<String> {
        while self.tokens.is_empty() {
            let mut line = String::new();
            let read = self.stream.read_line(&mut line).map_err(io_error)?;
            if read == 0 {
                return Err(VelesError::SerializationError {
                    message: "unexpected end of stream".to_string(),
                });
            }
            self.tokens
                .extend(line.split_whitespace().map(str::to_string));
        }
        Ok(self.tokens.pop_front().expect("token queue non-empty"))
    }

    /// Parses the next token as `T`.
    pub(crate) fn parse<T: FromStr>(&mut self) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        let token = self.token()?;
        token.parse().map_err(|err| VelesError::SerializationError {
            message: format!("invalid token '{token}': {err}"),
        })
    }

    /// Consumes the next token and checks it against an expected marker.
    pub(crate) fn expect_marker(&mut self, marker: &str) -> Result<()> {
        let token = self.token()?;
        if token == marker {
            Ok(())
        } else {
            Err(VelesError::SerializationError {
                message: format!("expected marker '{marker}', found '{token}'"),
            })
        }
    }
}

/// Serialization format options.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializableFormat {
    /// Fast binary serialization (default).
    #[default]
    Binary,

    /// Human-readable JSON.
    Json,
}

#[cfg(feature = "serde")]
impl std::fmt::Display for SerializableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializableFormat::Binary => write!(f, "BINARY"),
            SerializableFormat::Json => write!(f, "JSON"),
        }
    }
}

#[cfg(feature = "serde")]
impl FromStr for SerializableFormat {
    type Err = VelesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BINARY" | "BIN" => Ok(SerializableFormat::Binary),
            "JSON" => Ok(SerializableFormat::Json),
            _ => Err(VelesError::InvalidParameter {
                name: "format",
                message: format!("Unknown format '{s}'. Expected: BINARY, JSON"),
            }),
        }
    }
}

/// Trait for types that can be serialized and deserialized.
///
/// Provides a unified interface for saving and loading engine components
/// to and from various formats and destinations.
#[cfg(feature = "serde")]
pub trait Serializable: Serialize + DeserializeOwned + Sized {
    /// Serializes to a byte vector.
    fn to_bytes(&self, format: SerializableFormat) -> Result<Vec<u8>> {
        match format {
            SerializableFormat::Binary => {
                bincode::serialize(self).map_err(|e| VelesError::SerializationError {
                    message: format!("Binary serialization failed: {e}"),
                })
            }
            SerializableFormat::Json => {
                serde_json::to_vec_pretty(self).map_err(|e| VelesError::SerializationError {
                    message: format!("JSON serialization failed: {e}"),
                })
            }
        }
    }

    /// Deserializes from a byte slice.
    fn from_bytes(bytes: &[u8], format: SerializableFormat) -> Result<Self> {
        match format {
            SerializableFormat::Binary => {
                bincode::deserialize(bytes).map_err(|e| VelesError::SerializationError {
                    message: format!("Binary deserialization failed: {e}"),
                })
            }
            SerializableFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| VelesError::SerializationError {
                    message: format!("JSON deserialization failed: {e}"),
                })
            }
        }
    }

    /// Serializes to a JSON string.
    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VelesError::SerializationError {
            message: format!("JSON serialization failed: {e}"),
        })
    }

    /// Deserializes from a JSON string.
    fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VelesError::SerializationError {
            message: format!("JSON deserialization failed: {e}"),
        })
    }

    /// Serializes to a writer.
    fn dump<W: Write>(&self, writer: W, format: SerializableFormat) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        match format {
            SerializableFormat::Binary => bincode::serialize_into(&mut writer, self).map_err(|e| {
                VelesError::SerializationError {
                    message: format!("Binary serialization failed: {e}"),
                }
            }),
            SerializableFormat::Json => serde_json::to_writer_pretty(&mut writer, self).map_err(
                |e| VelesError::SerializationError {
                    message: format!("JSON serialization failed: {e}"),
                },
            ),
        }
    }

    /// Deserializes from a reader.
    fn restore<R: Read>(reader: R, format: SerializableFormat) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        match format {
            SerializableFormat::Binary => bincode::deserialize_from(&mut reader).map_err(|e| {
                VelesError::SerializationError {
                    message: format!("Binary deserialization failed: {e}"),
                }
            }),
            SerializableFormat::Json => {
                serde_json::from_reader(&mut reader).map_err(|e| VelesError::SerializationError {
                    message: format!("JSON deserialization failed: {e}"),
                })
            }
        }
    }

    /// Saves to a file.
    fn save_to_file<P: AsRef<Path>>(&self, path: P, format: SerializableFormat) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| VelesError::IoError {
            message: format!("Failed to create file: {e}"),
        })?;
        self.dump(file, format)
    }

    /// Loads from a file.
    fn load_from_file<P: AsRef<Path>>(path: P, format: SerializableFormat) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| VelesError::IoError {
            message: format!("Failed to open file: {e}"),
        })?;
        Self::restore(file, format)
    }

    /// Saves to a file, inferring format from the file extension.
    ///
    /// - `.json` -> JSON format
    /// - All other extensions -> Binary format
    fn save_to_file_auto<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let format = infer_format_from_path(path.as_ref());
        self.save_to_file(path, format)
    }

    /// Loads from a file, inferring format from the file extension.
    ///
    /// - `.json` -> JSON format
    /// - All other extensions -> Binary format
    fn load_from_file_auto<P: AsRef<Path>>(path: P) -> Result<Self> {
        let format = infer_format_from_path(path.as_ref());
        Self::load_from_file(path, format)
    }
}

/// Blanket implementation for all types that implement Serialize + DeserializeOwned.
#[cfg(feature = "serde")]
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Sized {}

/// Infers serialization format from file extension.
#[cfg(feature = "serde")]
fn infer_format_from_path(path: &Path) -> SerializableFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => SerializableFormat::Json,
        _ => SerializableFormat::Binary,
    }
}
