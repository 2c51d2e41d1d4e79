//! Ports Layer - seams between the generic logs and their record types

pub mod codec;

pub use codec::RecordCodec;
