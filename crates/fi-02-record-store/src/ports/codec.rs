//! Record serialization strategy plugged into a [`RecordLog`].
//!
//! [`RecordLog`]: crate::adapters::record_log::RecordLog

use crate::error::StorageError;

/// Encodes and decodes the body of one log record.
///
/// Framing (magic, length, checksum) belongs to the log. A codec only
/// sees the body bytes.
pub trait RecordCodec {
    type Record;

    /// Reject a record before anything is written.
    ///
    /// Failures must be [`StorageError::InvalidArgument`].
    fn validate(&self, _record: &Self::Record) -> Result<(), StorageError> {
        Ok(())
    }

    /// Append the body of `record` to `out`.
    fn encode(&self, record: &Self::Record, out: &mut Vec<u8>);

    /// Decode a body previously produced by [`RecordCodec::encode`].
    fn decode(&self, body: &[u8]) -> Result<Self::Record, StorageError>;
}
