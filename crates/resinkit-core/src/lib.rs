//! # ResinKit Core
//!
//! Core job model for ResinKit: the unified document and layer entities,
//! the print parameter registry, the embedded G-Code protocol and the
//! batched parallel pipeline that format codecs run their layer work
//! through.
//!
//! Format codecs themselves live in `resinkit-formats`; this crate knows
//! nothing about any wire layout.

pub mod document;
pub mod error;
pub mod gcode;
pub mod issues;
pub mod layer;
pub mod params;
pub mod pipeline;

pub use document::{
    DocumentSummary, JobDocument, Thumbnail, DEFAULT_LIGHT_PWM, DISPLAY_DECIMALS,
    LAYER_HEIGHT_DECIMALS,
};
pub use error::{
    CodecError, Error, FormatError, GcodeError, IntegrityError, PipelineError, Result,
};
pub use issues::{IssueKind, IssueRecord, IssueSink};
pub use layer::{Layer, LayerImage, LayerMetrics, LayerSettings, Rect};
pub use params::{
    fits_decimals, round_to, Capabilities, Parameter, ParameterChange, ParameterMeta,
};
pub use pipeline::{effective_workers, run_batched, ProgressToken};
