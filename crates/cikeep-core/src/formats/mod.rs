//! # Wire Formats
//!
//! Byte-level encodings owned by the CORE. Storage backends persist what
//! these produce and never interpret the bytes themselves.

pub mod codec;

pub use codec::{MarshalledValue, marshal, unmarshal};
