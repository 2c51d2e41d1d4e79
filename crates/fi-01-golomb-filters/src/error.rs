//! Error types for the filter codec and line format

use thiserror::Error;

/// Errors raised while building, decoding or parsing filters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid Golomb-Rice parameter: {p} (must be between 1 and 32)")]
    InvalidParameter { p: u8 },

    #[error("Too many filter items: {count} exceeds {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("Filter bit length {bit_len} does not fit a {bytes}-byte buffer")]
    BitLengthMismatch { bit_len: u32, bytes: usize },

    #[error("Empty filter must have no encoded bits, found {bit_len}")]
    NonEmptyBitstream { bit_len: u32 },

    #[error("Malformed filter line: {0}")]
    MalformedLine(String),
}
