//! # ResinKit
//!
//! A Rust toolkit for reading, editing and writing masked-SLA resin
//! printer job files across vendor binary and archive formats.
//!
//! ## Architecture
//!
//! ResinKit is organized as a workspace with multiple crates:
//!
//! 1. **resinkit-core** - unified job document, layer entities, parameter
//!    registry, embedded G-Code protocol, batched parallel pipeline
//! 2. **resinkit-formats** - binary field streams, RLE image codecs,
//!    checksums and ciphers, the concrete format implementations and the
//!    format registry
//! 3. **resinkit** - thin command-line binary that integrates the crates
//!
//! ## Features
//!
//! - **Unified model**: one document type every format reads from and
//!   writes into, with deterministic bottom/normal/transition resolution
//! - **Four wire formats**: plain and encrypted ZIP+G-Code archives, a
//!   big-endian packed binary with trailer checksums, a little-endian
//!   keyed binary with stream-ciphered layers
//! - **Safe writes**: encodes land in a temporary sibling file and
//!   replace the target atomically
//! - **Parallel layer work**: bounded worker batches with pause/cancel
//!   checkpoints and ordered sequential output

pub use resinkit_core::{
    Capabilities, DocumentSummary, Error, JobDocument, Layer, LayerImage, LayerMetrics,
    LayerSettings, Parameter, ProgressToken, Rect, Result, Thumbnail,
};

pub use resinkit_formats::{
    codec_for, convert_document, decode_file, probe, DecodeOptions, EncodeOptions, FormatCodec,
    FormatType, FORMATS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output on stderr
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
