//! # ResinKit Formats
//!
//! The binary codec engine: declarative field streams, the run-length
//! image codecs, checksums and ciphers, and the four concrete vendor
//! formats that plug into the unified document model from
//! `resinkit-core`.
//!
//! Entry points:
//! - [`registry::decode_file`] resolves a path through the format
//!   registry and decodes it
//! - [`FormatCodec`] is the per-format interface (probe, decode, encode,
//!   partial save)
//! - [`convert::convert_document`] re-targets a document to another
//!   format through the unified model

pub mod checksum;
pub mod codec;
pub mod convert;
pub mod crypto;
pub mod fieldio;
pub mod formats;
pub mod registry;
pub mod rle;

pub use codec::{
    check_full_document, require_version, write_atomically, DecodeOptions, EncodeOptions,
    FormatCodec,
};
pub use convert::convert_document;
pub use registry::{
    codec_for, decode_file, formats_for_extension, probe, FormatDescriptor, FormatType, FORMATS,
};
