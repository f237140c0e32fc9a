//! Embedded G-Code program handling
//!
//! Archive formats carry a textual machine-code program alongside the
//! layer images. This module generates that program from the document and
//! parses it back into global and per-layer parameters on decode.
//!
//! Metadata travels in `;key:value` comment lines. The key set is a
//! compile-time table mapping names to document fields; there is no
//! runtime reflection.

use tracing::debug;

use crate::document::JobDocument;
use crate::error::{GcodeError, Result};
use crate::params::Parameter;

/// Comment marker for metadata and structure lines.
pub const COMMENT: char = ';';
/// Marks the start of the metadata header block.
pub const HEADER_START: &str = ";START_GCODE_HEADER";
/// Marks the end of the metadata header block.
pub const HEADER_END: &str = ";END_GCODE_HEADER";
/// Per-layer block prefix, followed by the 0-based layer index.
pub const LAYER_START: &str = ";LAYER_START:";
/// Per-layer block terminator.
pub const LAYER_END: &str = ";LAYER_END";
/// Program terminator.
pub const PROGRAM_END: &str = ";END_GCODE";

type FloatSetter = fn(&mut JobDocument, f32);

/// Header fields that are not registry parameters, name to setter.
///
/// Consulted by name lookup during parse; built once at compile time.
const FLOAT_FIELDS: &[(&str, FloatSetter)] = &[
    ("displayWidth", |doc, v| doc.display_width = v),
    ("displayHeight", |doc, v| doc.display_height = v),
    ("machineZ", |doc, v| doc.machine_z = v),
    ("layerHeight", |doc, v| doc.layer_height = v),
    ("resolutionX", |doc, v| doc.resolution_x = v as u32),
    ("resolutionY", |doc, v| doc.resolution_y = v as u32),
    ("antiAliasLevel", |doc, v| doc.anti_alias_level = v as u32),
    ("volumeMl", |doc, v| doc.volume_ml = v),
    ("weightG", |doc, v| doc.weight_g = v),
    ("cost", |doc, v| doc.cost = v),
    ("printTime", |doc, v| doc.print_time = v),
];

/// Build the full program text for a document.
///
/// The program is line-oriented: a metadata header, a machine preamble,
/// one block per layer (lift, retract, waits, light on/off) and a
/// postamble. The layer image for block `i` is the archive entry
/// `{i+1}.png`.
pub fn build_program(doc: &JobDocument) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(32 + doc.layer_count() as usize * 12);

    lines.push(HEADER_START.to_string());
    // layerCount leads so the parser can size the layer array before any
    // parameter whose bounds depend on it.
    lines.push(format!(";layerCount:{}", doc.layer_count()));
    lines.push(format!(";machineName:{}", doc.machine_name));
    lines.push(format!(";createdAt:{}", doc.created_at));
    lines.push(format!(";resolutionX:{}", doc.resolution_x));
    lines.push(format!(";resolutionY:{}", doc.resolution_y));
    lines.push(format!(";displayWidth:{:.2}", doc.display_width));
    lines.push(format!(";displayHeight:{:.2}", doc.display_height));
    lines.push(format!(";machineZ:{:.2}", doc.machine_z));
    lines.push(format!(";layerHeight:{:.3}", doc.layer_height));
    lines.push(format!(";antiAliasLevel:{}", doc.anti_alias_level));
    for &parameter in doc.capabilities().global {
        if let Some(value) = doc.parameter(parameter) {
            let decimals = parameter.meta().decimals as usize;
            lines.push(format!(
                ";{}:{:.decimals$}",
                parameter.key(),
                value,
                decimals = decimals
            ));
        }
    }
    lines.push(format!(";volumeMl:{:.2}", doc.volume_ml));
    lines.push(format!(";weightG:{:.2}", doc.weight_g));
    lines.push(format!(";cost:{:.2}", doc.cost));
    lines.push(format!(";printTime:{:.0}", doc.print_time));
    lines.push(HEADER_END.to_string());

    lines.push("G21".to_string());
    lines.push("G90".to_string());
    lines.push("M17".to_string());
    lines.push("M106 S0".to_string());

    for layer in doc.layers() {
        let s = &layer.settings;
        let index = layer.index();
        lines.push(format!("{}{}", LAYER_START, index));
        lines.push(format!(";currPos:{:.3}", s.position_z));
        lines.push(format!("M6054 \"{}.png\"", index + 1));
        if s.lift_acceleration > 0.0 {
            lines.push(format!("M204 S{:.0}", s.lift_acceleration));
        }
        lines.push(format!(
            "G0 Z{:.3} F{:.0}",
            s.position_z + s.lift_height,
            s.lift_speed
        ));
        if s.lift_height2 > 0.0 {
            lines.push(format!(
                "G0 Z{:.3} F{:.0}",
                s.position_z + s.lift_height + s.lift_height2,
                s.lift_speed2
            ));
        }
        if s.retract_acceleration > 0.0 {
            lines.push(format!("M204 S{:.0}", s.retract_acceleration));
        }
        lines.push(format!("G0 Z{:.3} F{:.0}", s.position_z, s.retract_speed));
        if s.wait_before_cure > 0.0 {
            lines.push(format!("G4 P{:.0}", s.wait_before_cure * 1000.0));
        }
        lines.push(format!("M106 S{}", s.light_pwm));
        lines.push(format!("G4 P{:.0}", s.exposure_time * 1000.0));
        lines.push("M106 S0".to_string());
        if s.light_off_delay > 0.0 {
            lines.push(format!("G4 P{:.0}", s.light_off_delay * 1000.0));
        }
        lines.push(LAYER_END.to_string());
    }

    lines.push("M18".to_string());
    lines.push(PROGRAM_END.to_string());

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Which G4 delay the parser is positioned to consume inside a layer.
#[derive(PartialEq)]
enum DelaySlot {
    BeforeCure,
    Exposure,
    AfterExposure,
}

/// Parse a program back into the document.
///
/// The header populates the global parameters (through the registry, so
/// unsupported keys are a no-op) and allocates the layer array; each layer
/// block then overwrites that layer's derived settings with the values the
/// program actually encodes.
pub fn parse_program(text: &str, doc: &mut JobDocument) -> Result<()> {
    doc.batch_mutate(false, |doc| parse_lines(text, doc))
}

fn parse_lines(text: &str, doc: &mut JobDocument) -> Result<()> {
    let mut current_layer: Option<u32> = None;
    let mut delay_slot = DelaySlot::BeforeCure;
    let mut light_on = false;
    let mut lift_moves_seen = 0u32;
    let mut pending_acceleration: Option<f32> = None;

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if line == HEADER_END {
            // All globals are in; re-derive layer settings from them
            // before the per-layer blocks overwrite the fields they carry.
            doc.rebuild_layer_settings();
            continue;
        }
        if let Some(rest) = line.strip_prefix(LAYER_START) {
            let index: u32 =
                rest.trim()
                    .parse()
                    .map_err(|_| GcodeError::InvalidValue {
                        line_number: number + 1,
                        key: "LAYER_START".to_string(),
                        value: rest.to_string(),
                    })?;
            if index >= doc.layer_count() {
                return Err(GcodeError::LayerOutOfRange {
                    index,
                    layer_count: doc.layer_count(),
                }
                .into());
            }
            current_layer = Some(index);
            delay_slot = DelaySlot::BeforeCure;
            light_on = false;
            lift_moves_seen = 0;
            pending_acceleration = None;
            continue;
        }
        if line == LAYER_END {
            current_layer = None;
            continue;
        }

        if let Some(stripped) = line.strip_prefix(COMMENT) {
            if let Some((key, value)) = stripped.split_once(':') {
                apply_metadata(doc, current_layer, number + 1, key.trim(), value.trim())?;
            }
            continue;
        }

        let Some(layer_index) = current_layer else {
            // Preamble/postamble commands carry no parameters.
            continue;
        };
        let layer = doc
            .layer_mut(layer_index)
            .expect("layer index validated at block start");

        if let Some(rest) = line.strip_prefix("M204 S") {
            pending_acceleration = rest.parse().ok();
        } else if let Some(rest) = line.strip_prefix("M106 S") {
            let value: f32 = rest.parse().map_err(|_| GcodeError::InvalidValue {
                line_number: number + 1,
                key: "M106".to_string(),
                value: rest.to_string(),
            })?;
            if value > 0.0 {
                layer.settings.light_pwm = value as u8;
                light_on = true;
                delay_slot = DelaySlot::Exposure;
            } else if light_on {
                light_on = false;
                delay_slot = DelaySlot::AfterExposure;
            }
        } else if let Some(rest) = line.strip_prefix("G4 P") {
            let millis: f32 = rest.parse().map_err(|_| GcodeError::InvalidValue {
                line_number: number + 1,
                key: "G4".to_string(),
                value: rest.to_string(),
            })?;
            let seconds = millis / 1000.0;
            match delay_slot {
                DelaySlot::BeforeCure => layer.settings.wait_before_cure = seconds,
                DelaySlot::Exposure => layer.settings.exposure_time = seconds,
                DelaySlot::AfterExposure => layer.settings.light_off_delay = seconds,
            }
        } else if let Some(rest) = line.strip_prefix("G0 Z").or_else(|| line.strip_prefix("G1 Z")) {
            let mut parts = rest.split_whitespace();
            let z: f32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| GcodeError::InvalidValue {
                    line_number: number + 1,
                    key: "G0 Z".to_string(),
                    value: rest.to_string(),
                })?;
            let feed: Option<f32> = parts
                .next()
                .and_then(|f| f.strip_prefix('F'))
                .and_then(|f| f.parse().ok());
            let current_z = layer.settings.position_z;
            if z > current_z + 1e-4 {
                lift_moves_seen += 1;
                if lift_moves_seen == 1 {
                    layer.settings.lift_height = z - current_z;
                    layer.settings.lift_height2 = 0.0;
                    if let Some(feed) = feed {
                        layer.settings.lift_speed = feed;
                    }
                    if let Some(acceleration) = pending_acceleration.take() {
                        layer.settings.lift_acceleration = acceleration;
                    }
                } else {
                    layer.settings.lift_height2 = z - current_z - layer.settings.lift_height;
                    if let Some(feed) = feed {
                        layer.settings.lift_speed2 = feed;
                    }
                }
            } else {
                // Downward move back to the layer position: the retract.
                if let Some(feed) = feed {
                    layer.settings.retract_speed = feed;
                }
                if let Some(acceleration) = pending_acceleration.take() {
                    layer.settings.retract_acceleration = acceleration;
                }
            }
        }
    }

    debug!("parsed G-Code program: {} layers", doc.layer_count());
    Ok(())
}

fn apply_metadata(
    doc: &mut JobDocument,
    current_layer: Option<u32>,
    line_number: usize,
    key: &str,
    value: &str,
) -> Result<()> {
    if let Some(layer_index) = current_layer {
        if key == "currPos" {
            let z = parse_float(line_number, key, value)?;
            if let Some(layer) = doc.layer_mut(layer_index) {
                layer.settings.position_z = z;
            }
        }
        return Ok(());
    }

    match key {
        "machineName" => doc.machine_name = value.to_string(),
        "createdAt" => doc.created_at = value.to_string(),
        "layerCount" => {
            doc.init(parse_float(line_number, key, value)? as u32);
        }
        _ => {
            let field = FLOAT_FIELDS.iter().find(|(name, _)| *name == key);
            let parameter = Parameter::ALL.iter().find(|p| p.key() == key);
            if field.is_none() && parameter.is_none() {
                // Unknown keys are ignored; slicers add their own.
                return Ok(());
            }
            let number = parse_float(line_number, key, value)?;
            if let Some(&(_, setter)) = field {
                setter(doc, number);
            } else if let Some(&parameter) = parameter {
                doc.set_parameter(parameter, number);
            }
        }
    }
    Ok(())
}

fn parse_float(line_number: usize, key: &str, value: &str) -> Result<f32> {
    value.parse().map_err(|_| {
        GcodeError::InvalidValue {
            line_number,
            key: key.to_string(),
            value: value.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Capabilities;

    fn gcode_caps() -> Capabilities {
        Capabilities {
            global: Parameter::ALL,
            per_layer: &[
                Parameter::ExposureTime,
                Parameter::LightOffDelay,
                Parameter::LiftHeight,
                Parameter::LiftSpeed,
                Parameter::RetractSpeed,
                Parameter::LightPwm,
            ],
            supports_gcode: true,
            supports_dual_stage: true,
            supports_layer_overrides: true,
            supports_wait_before_cure: true,
            supports_light_off_delay: true,
        }
    }

    fn sample_doc() -> JobDocument {
        let mut doc = JobDocument::new(gcode_caps());
        doc.machine_name = "test-printer".to_string();
        doc.resolution_x = 1620;
        doc.resolution_y = 2560;
        doc.display_width = 81.0;
        doc.display_height = 128.0;
        doc.machine_z = 150.0;
        doc.layer_height = 0.05;
        doc.bottom_layer_count = 1;
        doc.bottom_exposure_time = 35.0;
        doc.exposure_time = 7.0;
        doc.init(2);
        doc
    }

    #[test]
    fn test_round_trip_globals() {
        let source = sample_doc();
        let text = build_program(&source);
        let mut parsed = JobDocument::new(gcode_caps());
        parse_program(&text, &mut parsed).unwrap();
        assert_eq!(parsed.machine_name, "test-printer");
        assert_eq!(parsed.resolution_x, 1620);
        assert_eq!(parsed.layer_count(), 2);
        assert_eq!(parsed.bottom_layer_count, 1);
        assert_eq!(parsed.bottom_exposure_time, 35.0);
        assert_eq!(parsed.exposure_time, 7.0);
    }

    #[test]
    fn test_round_trip_layer_values() {
        let source = sample_doc();
        let text = build_program(&source);
        let mut parsed = JobDocument::new(gcode_caps());
        parse_program(&text, &mut parsed).unwrap();
        assert_eq!(parsed.layer(0).unwrap().settings.exposure_time, 35.0);
        assert_eq!(parsed.layer(1).unwrap().settings.exposure_time, 7.0);
        assert!((parsed.layer(1).unwrap().settings.position_z - 0.10).abs() < 1e-6);
        assert_eq!(parsed.layer(1).unwrap().settings.light_pwm, 255);
    }

    #[test]
    fn test_layer_out_of_range() {
        let text = format!("{}\n{}5\n", HEADER_END, LAYER_START);
        let mut doc = JobDocument::new(gcode_caps());
        let err = parse_program(&text, &mut doc).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Gcode(GcodeError::LayerOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let text = ";someVendorKey:42\n;vendorNote:not a number\n;layerCount:0\n;END_GCODE_HEADER\n";
        let mut doc = JobDocument::new(gcode_caps());
        assert!(parse_program(text, &mut doc).is_ok());
    }

    #[test]
    fn test_acceleration_round_trip() {
        let mut source = sample_doc();
        source.batch_mutate(true, |doc| {
            doc.set_parameter(Parameter::LiftAcceleration, 800.0);
            doc.set_parameter(Parameter::RetractAcceleration, 1200.0);
        });
        let text = build_program(&source);
        assert!(text.contains("M204 S800"));
        let mut parsed = JobDocument::new(gcode_caps());
        parse_program(&text, &mut parsed).unwrap();
        assert_eq!(parsed.lift_acceleration, 800.0);
        // layer 1 is a normal layer, so it carries the normal values
        assert_eq!(parsed.layer(1).unwrap().settings.lift_acceleration, 800.0);
        assert_eq!(parsed.layer(1).unwrap().settings.retract_acceleration, 1200.0);
    }

    #[test]
    fn test_known_key_with_bad_value_fails() {
        let text = ";exposureTime:fast\n";
        let mut doc = JobDocument::new(gcode_caps());
        assert!(parse_program(text, &mut doc).is_err());
    }
}
