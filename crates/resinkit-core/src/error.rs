//! Error handling for ResinKit
//!
//! Provides error types for all layers of the engine:
//! - Format errors (file structure, versions, geometry)
//! - Codec errors (compression/decompression of layer payloads)
//! - Integrity errors (checksums, ciphers)
//! - G-Code errors (embedded machine-code text)
//! - Pipeline errors (parallel batch execution)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Format error type
///
/// Represents errors raised while decoding or encoding a job file's
/// structure: magic numbers, record boundaries, versions and geometry.
#[derive(Error, Debug, Clone)]
pub enum FormatError {
    /// File magic/identifier did not match the expected constant
    #[error("Invalid file identifier: expected {expected}, got {actual}")]
    InvalidMagic {
        /// The identifier the format requires, rendered as hex or text.
        expected: String,
        /// The identifier actually present in the file.
        actual: String,
    },

    /// A record ended before all of its declared fields
    #[error("Truncated {record} record at offset {offset}")]
    Truncated {
        /// The record being decoded when the stream ran out.
        record: String,
        /// The stream offset at which data ran out.
        offset: u64,
    },

    /// A record contained a structurally invalid field value
    #[error("Malformed {record} record: {reason}")]
    MalformedRecord {
        /// The record containing the bad field.
        record: String,
        /// Why the field is invalid.
        reason: String,
    },

    /// The requested file version is outside the format's declared set
    #[error("Version {version} not supported, allowed: {allowed:?}")]
    UnsupportedVersion {
        /// The version requested or found in the file.
        version: u32,
        /// The versions this format accepts.
        allowed: Vec<u32>,
    },

    /// No registered format accepts the file
    #[error("No format can process {path}")]
    UnknownFormat {
        /// The path that no content probe accepted.
        path: String,
    },

    /// Two consecutive printable layers have decreasing Z
    #[error("Layer {index} has Z {z} below previous layer Z {previous_z}")]
    ZInconsistency {
        /// The offending layer index.
        index: u32,
        /// The offending layer's Z position in millimeters.
        z: f32,
        /// The previous printable layer's Z position in millimeters.
        previous_z: f32,
    },

    /// Resolution is zero and cannot be inferred from any layer raster
    #[error("Resolution is zero and no layer raster is available to infer it")]
    UnresolvableResolution,

    /// Layer height carries more decimal digits than the format precision
    #[error("Layer height {value}mm exceeds {max_decimals} decimal digits")]
    LayerHeightPrecision {
        /// The out-of-precision layer height in millimeters.
        value: f32,
        /// The maximum number of decimal digits allowed.
        max_decimals: u32,
    },

    /// A full re-encode was requested on a partially decoded document
    #[error("Document was decoded in partial mode; {operation} requires a full decode")]
    PartialDocument {
        /// The operation that needs the full document.
        operation: String,
    },

    /// A partial save was requested after layer pixel data changed
    #[error("Partial save is not possible: layer pixel data changed since decode")]
    PartialSaveInvalidated,

    /// Generic format error
    #[error("Format error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Codec error type
///
/// Represents errors from the layer-image compressors and decompressors.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    /// Decoded pixel stream ran past the expected raster size
    #[error("Compressed layer data overruns the {expected} pixel raster")]
    PayloadOverrun {
        /// The number of pixels the raster holds.
        expected: usize,
    },

    /// Decoded pixel stream ended before the expected raster size
    #[error("Compressed layer data ends after {actual} of {expected} pixels")]
    PayloadUnderrun {
        /// The number of pixels actually produced.
        actual: usize,
        /// The number of pixels the raster holds.
        expected: usize,
    },

    /// Compressed stream ended in the middle of a run record
    #[error("Compressed layer data is truncated inside a run record")]
    TruncatedRun,

    /// A run coordinate exceeds what the wire format can represent
    #[error("Run coordinate {value} exceeds the {bits}-bit field limit")]
    CoordinateOverflow {
        /// The coordinate value that does not fit.
        value: u32,
        /// The width of the wire field in bits.
        bits: u32,
    },

    /// A standard image codec failed on a wrapped raster
    #[error("Image codec error: {reason}")]
    Image {
        /// The underlying image codec failure.
        reason: String,
    },
}

/// Integrity error type
///
/// Represents checksum and cipher failures.
#[derive(Error, Debug, Clone)]
pub enum IntegrityError {
    /// Stored and computed checksums disagree; the file is corrupt
    #[error("Checksum mismatch: file says {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// The checksum stored in the file.
        expected: u32,
        /// The checksum computed over the covered bytes.
        computed: u32,
    },

    /// An encrypted block has an invalid length or padding
    #[error("Invalid cipher block: {reason}")]
    InvalidBlock {
        /// Why the block cannot be decrypted.
        reason: String,
    },
}

/// G-Code error type
///
/// Represents errors in the embedded machine-code text that some archive
/// formats carry alongside layer images.
#[derive(Error, Debug, Clone)]
pub enum GcodeError {
    /// A command line does not fit the fixed encryption block
    #[error("G-Code line {line_number} is {length} bytes, limit is {max}")]
    LineTooLong {
        /// The 1-based line number.
        line_number: usize,
        /// The UTF-8 byte length of the line.
        length: usize,
        /// The maximum payload the cipher block can carry.
        max: usize,
    },

    /// A metadata comment value failed to parse
    #[error("Invalid value for '{key}' at line {line_number}: {value}")]
    InvalidValue {
        /// The 1-based line number.
        line_number: usize,
        /// The metadata key.
        key: String,
        /// The unparseable value text.
        value: String,
    },

    /// The text references a layer index outside the document
    #[error("G-Code references layer {index} but the document has {layer_count}")]
    LayerOutOfRange {
        /// The referenced layer index.
        index: u32,
        /// The document layer count.
        layer_count: u32,
    },
}

/// Pipeline error type
///
/// Represents errors from the batched parallel layer pipeline.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// The operation was cancelled through its progress token
    #[error("Operation cancelled")]
    Cancelled,

    /// The worker pool could not be constructed
    #[error("Worker pool error: {reason}")]
    WorkerPool {
        /// Why the pool could not be built.
        reason: String,
    },
}

/// Main error type for ResinKit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Format error
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Codec error
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Integrity error
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// G-Code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Pipeline error
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Pipeline(PipelineError::Cancelled))
    }

    /// Check if this is a checksum mismatch
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Error::Integrity(IntegrityError::ChecksumMismatch { .. }))
    }

    /// Check if this is a structural format error
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::Format(_))
    }

    /// Check if this is a layer codec error
    pub fn is_codec_error(&self) -> bool {
        matches!(self, Error::Codec(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
