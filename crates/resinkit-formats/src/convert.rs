//! Format-to-format conversion
//!
//! Conversion always goes through the unified document: a fresh document
//! of the target format is built, every semantically equivalent global
//! parameter is copied through the registry, layers and thumbnails are
//! deep-cloned, and the target codec encodes the result. Codecs never
//! talk to each other directly.

use std::path::Path;

use tracing::info;

use resinkit_core::error::{FormatError, Result};
use resinkit_core::pipeline::ProgressToken;
use resinkit_core::JobDocument;

use crate::codec::EncodeOptions;
use crate::registry::{codec_for, FormatType};

/// Pick the slower of two stage speeds, ignoring an unused (zero) second
/// stage.
fn slower(primary: f32, secondary: f32) -> f32 {
    if secondary > 0.0 {
        primary.min(secondary)
    } else {
        primary
    }
}

/// Convert a document into `target_type` and encode it at `path`.
///
/// Returns the converted document. On any failure nothing is written to
/// `path` (the codec writes through a temporary file).
pub fn convert_document(
    source: &JobDocument,
    target_type: FormatType,
    path: &Path,
    options: EncodeOptions,
    progress: &ProgressToken,
) -> Result<JobDocument> {
    if source.is_partial() {
        return Err(FormatError::PartialDocument {
            operation: "convert".to_string(),
        }
        .into());
    }

    let codec = codec_for(target_type);
    let caps = codec.capabilities();
    let mut target = JobDocument::new(*caps);
    // An explicitly requested version survives if the target allows it.
    target.version = codec.resolve_version(source.version);

    target.machine_name = source.machine_name.clone();
    target.created_at = source.created_at.clone();
    target.resolution_x = source.resolution_x;
    target.resolution_y = source.resolution_y;
    target.display_width = source.display_width;
    target.display_height = source.display_height;
    target.machine_z = source.machine_z;
    target.layer_height = source.layer_height;
    target.anti_alias_level = source.anti_alias_level;
    target.volume_ml = source.volume_ml;
    target.weight_g = source.weight_g;
    target.cost = source.cost;
    target.print_time = source.print_time;

    target.batch_mutate(false, |target| {
        // Every parameter both sides understand copies straight across;
        // parameters the source does not carry stay at target defaults.
        for &parameter in caps.global {
            if let Some(value) = source.parameter(parameter) {
                target.set_parameter(parameter, value);
            }
        }

        // Dual-stage motion: both support it -> both stages copied above;
        // target lacks it -> collapse into one stage by summing heights
        // and taking the slower speed of the two stages.
        let source_dual = source.capabilities().supports_dual_stage;
        if source_dual && !caps.supports_dual_stage {
            target.lift_height = source.lift_height + source.lift_height2;
            target.lift_speed = slower(source.lift_speed, source.lift_speed2);
            target.bottom_lift_height = source.bottom_lift_height + source.bottom_lift_height2;
            target.bottom_lift_speed = slower(source.bottom_lift_speed, source.bottom_lift_speed2);
            target.retract_speed = slower(source.retract_speed, source.retract_speed2);
            target.bottom_retract_speed =
                slower(source.bottom_retract_speed, source.bottom_retract_speed2);
        }
    });

    // Deep-clone the layer array and thumbnails; set_layers reassigns
    // indices and re-derives settings from the copied globals.
    target.set_layers(source.layers().to_vec());
    target.thumbnails = source.thumbnails.clone();

    codec.encode(&mut target, path, options, progress)?;
    info!(
        target = target_type.name(),
        layers = target.layer_count(),
        "converted document"
    );
    Ok(target)
}
