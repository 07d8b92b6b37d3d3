//! # Primitives
//!
//! Hardcoded constants for the cikeep CORE.
//!
//! The wire constants are shared with every other implementation that reads
//! or writes stored attribute values, so none of them may change without a
//! format version bump.

// =============================================================================
// ATTRIBUTE VALUE WIRE FORMAT
// =============================================================================

/// Current attribute value wire format version (first control byte).
pub const FORMAT_VERSION: u8 = 0x02;

/// The first wire format version. Values stored with it cannot be decoded
/// any more and are reported as obsolete.
pub const OBSOLETE_FORMAT_VERSION: u8 = 0x01;

/// Second control byte of a scalar value.
pub const SCALAR_MARKER: u8 = 0x01;

/// Second control byte of an array value.
pub const ARRAY_MARKER: u8 = 0x02;

/// Length of the control header (version + scalar/array marker).
pub const CONTROL_HEADER_LEN: usize = 2;

/// Length of a raw SHA-256 hash as stored in image control bytes.
pub const HASH_LENGTH: usize = 32;

/// Width of an encoded Double element (IEEE 754, little-endian).
pub const DOUBLE_WIDTH: usize = 8;

/// Width of an encoded Boolean element.
pub const BOOLEAN_WIDTH: usize = 1;

/// Width of an encoded DateTimeWithOffset element.
///
/// - 8 bytes: UTC instant as 100ns ticks since 0001-01-01T00:00:00Z (i64 LE)
/// - 2 bytes: offset from UTC in minutes (i16 LE)
pub const DATE_TIME_WIDTH: usize = 10;

/// Ticks (100ns units) per second in the DateTimeWithOffset encoding.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch.
pub const TICKS_EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

/// Separator used when rendering an array value as a single string.
pub const ARRAY_RENDER_SEPARATOR: char = ',';

// =============================================================================
// DOMAIN CONSTANTS
// =============================================================================

/// Reserved attribute holding the human-readable name of a CI.
///
/// It is not part of any trait but is cleared when a trait is deleted
/// from a CI.
pub const NAME_ATTRIBUTE: &str = "__name";

/// Maximum number of ID fields in a composite identity.
pub const MAX_COMPOSITE_ID_FIELDS: usize = 8;

/// Maximum number of elements accepted when decoding an array value.
///
/// Counts above this are treated as malformed control bytes, which keeps a
/// corrupted count from driving huge allocations.
pub const MAX_ARRAY_ELEMENTS: usize = 1_000_000;
