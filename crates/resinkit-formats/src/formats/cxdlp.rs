//! CXDLP packed binary format
//!
//! Big-endian throughout, with a UTF-16BE length-prefixed machine string
//! and every timing/motion value stored as a scaled integer (tenths of a
//! second, tenths of a millimeter, micrometers). Layers are vertical-run
//! line records with 13/14-bit packed coordinates; the preview is raw
//! RGB565.
//!
//! The file ends with a footer tag and a trailer checksum over everything
//! before it: CRC32 for version 3, the single-byte additive checksum for
//! the legacy version 2. The version field selects which.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use resinkit_core::error::{FormatError, IntegrityError, Result};
use resinkit_core::params::{Capabilities, Parameter};
use resinkit_core::pipeline::{run_batched, ProgressToken};
use resinkit_core::{JobDocument, Thumbnail};

use crate::checksum::{additive_checksum, crc32};
use crate::codec::{
    check_full_document, write_atomically, DecodeOptions, EncodeOptions, FormatCodec,
};
use crate::fieldio::{Endian, FieldReader, FieldWriter, TextEncoding};
use crate::registry::FormatType;
use crate::rle;

/// Leading file identifier.
pub const MAGIC: &[u8; 8] = b"CXDLPFMT";
/// Trailing file identifier, just before the checksum.
pub const FOOTER: &[u8; 8] = b"CXDLPEND";

const ALLOWED_VERSIONS: &[u32] = &[2, 3];

static CAPABILITIES: Capabilities = Capabilities {
    global: &[
        Parameter::BottomLayerCount,
        Parameter::TransitionLayerCount,
        Parameter::BottomExposureTime,
        Parameter::ExposureTime,
        Parameter::BottomLightOffDelay,
        Parameter::LightOffDelay,
        Parameter::BottomLiftHeight,
        Parameter::LiftHeight,
        Parameter::BottomLiftSpeed,
        Parameter::LiftSpeed,
        Parameter::BottomRetractSpeed,
        Parameter::RetractSpeed,
        Parameter::BottomLightPwm,
        Parameter::LightPwm,
    ],
    per_layer: &[Parameter::ExposureTime, Parameter::LightOffDelay],
    supports_gcode: false,
    supports_dual_stage: false,
    supports_layer_overrides: true,
    supports_wait_before_cure: false,
    supports_light_off_delay: true,
};

/// Codec for the CXDLP packed binary format.
pub struct CxdlpCodec;

struct CxdlpLayerRecord {
    exposure_time: f32,
    light_off_delay: f32,
    position_z: f32,
    custom: bool,
    data_start: usize,
    data_len: usize,
}

impl CxdlpCodec {
    fn checksum_len(version: u32) -> usize {
        if version >= 3 {
            4
        } else {
            1
        }
    }

    fn verify_checksum(buf: &[u8], version: u32) -> Result<()> {
        let cs_len = Self::checksum_len(version);
        if buf.len() < cs_len {
            return Err(FormatError::Truncated {
                record: "checksum".to_string(),
                offset: buf.len() as u64,
            }
            .into());
        }
        let covered = &buf[..buf.len() - cs_len];
        let stored = &buf[buf.len() - cs_len..];
        let (expected, computed) = if version >= 3 {
            (
                u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]),
                crc32(covered),
            )
        } else {
            (stored[0] as u32, additive_checksum(covered) as u32)
        };
        if expected != computed {
            return Err(IntegrityError::ChecksumMismatch { expected, computed }.into());
        }
        Ok(())
    }

    fn write_header(writer: &mut FieldWriter, doc: &JobDocument, version: u32) {
        writer.write_bytes(MAGIC);
        writer.write_u16(version as u16);
        writer.write_string_prefixed(&doc.machine_name, TextEncoding::Utf16Be);
        writer.write_u16(doc.resolution_x as u16);
        writer.write_u16(doc.resolution_y as u16);
        writer.write_scaled_u32(doc.display_width, 100.0, 2);
        writer.write_scaled_u32(doc.display_height, 100.0, 2);
        writer.write_scaled_u32(doc.machine_z, 100.0, 2);
        writer.write_scaled_u16(doc.layer_height, 1000.0, 3);
        writer.write_scaled_u16(doc.exposure_time, 10.0, 1);
        writer.write_scaled_u16(doc.bottom_exposure_time, 10.0, 1);
        writer.write_scaled_u16(doc.light_off_delay, 10.0, 1);
        writer.write_scaled_u16(doc.bottom_light_off_delay, 10.0, 1);
        writer.write_u16(doc.bottom_layer_count as u16);
        writer.write_scaled_u16(doc.bottom_lift_height, 10.0, 1);
        writer.write_scaled_u16(doc.bottom_lift_speed, 10.0, 1);
        writer.write_scaled_u16(doc.lift_height, 10.0, 1);
        writer.write_scaled_u16(doc.lift_speed, 10.0, 1);
        writer.write_scaled_u16(doc.bottom_retract_speed, 10.0, 1);
        writer.write_scaled_u16(doc.retract_speed, 10.0, 1);
        writer.write_u16(doc.light_pwm as u16);
        writer.write_u16(doc.bottom_light_pwm as u16);
        writer.write_u16(doc.transition_layer_count as u16);
        writer.write_u32(doc.layer_count());
    }

    fn read_header(reader: &mut FieldReader<'_>, doc: &mut JobDocument) -> Result<u32> {
        reader.expect_magic(MAGIC)?;
        let version = reader.u16()? as u32;
        doc.machine_name = reader.string_prefixed(TextEncoding::Utf16Be)?;
        doc.resolution_x = reader.u16()? as u32;
        doc.resolution_y = reader.u16()? as u32;
        doc.display_width = reader.scaled_u32(100.0)?;
        doc.display_height = reader.scaled_u32(100.0)?;
        doc.machine_z = reader.scaled_u32(100.0)?;
        doc.layer_height = reader.scaled_u16(1000.0)?;
        doc.exposure_time = reader.scaled_u16(10.0)?;
        doc.bottom_exposure_time = reader.scaled_u16(10.0)?;
        doc.light_off_delay = reader.scaled_u16(10.0)?;
        doc.bottom_light_off_delay = reader.scaled_u16(10.0)?;
        doc.bottom_layer_count = reader.u16()? as u32;
        doc.bottom_lift_height = reader.scaled_u16(10.0)?;
        doc.bottom_lift_speed = reader.scaled_u16(10.0)?;
        doc.lift_height = reader.scaled_u16(10.0)?;
        doc.lift_speed = reader.scaled_u16(10.0)?;
        doc.bottom_retract_speed = reader.scaled_u16(10.0)?;
        doc.retract_speed = reader.scaled_u16(10.0)?;
        doc.light_pwm = reader.u16()? as u8;
        doc.bottom_light_pwm = reader.u16()? as u8;
        doc.transition_layer_count = reader.u16()? as u32;
        Ok(version)
    }

    fn write_preview(writer: &mut FieldWriter, thumbnail: Option<&Thumbnail>) {
        let Some(t) = thumbnail else {
            writer.write_u16(0);
            writer.write_u16(0);
            return;
        };
        writer.write_u16(t.width as u16);
        writer.write_u16(t.height as u16);
        for px in t.rgb.chunks_exact(3) {
            let code = (((px[0] >> 3) as u16) << 11)
                | (((px[1] >> 2) as u16) << 5)
                | ((px[2] >> 3) as u16);
            writer.write_u16(code);
        }
    }

    fn read_preview(reader: &mut FieldReader<'_>) -> Result<Option<Thumbnail>> {
        reader.enter_record("preview");
        let width = reader.u16()? as u32;
        let height = reader.u16()? as u32;
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            let code = reader.u16()?;
            let r5 = ((code >> 11) & 0x1F) as u8;
            let g6 = ((code >> 5) & 0x3F) as u8;
            let b5 = (code & 0x1F) as u8;
            rgb.push((r5 << 3) | (r5 >> 2));
            rgb.push((g6 << 2) | (g6 >> 4));
            rgb.push((b5 << 3) | (b5 >> 2));
        }
        Ok(Some(Thumbnail { width, height, rgb }))
    }

    fn read_layer_records(
        reader: &mut FieldReader<'_>,
        layer_count: u32,
    ) -> Result<Vec<CxdlpLayerRecord>> {
        reader.enter_record("layer record");
        let mut records = Vec::with_capacity(layer_count as usize);
        for _ in 0..layer_count {
            let exposure_time = reader.scaled_u16(10.0)?;
            let light_off_delay = reader.scaled_u16(10.0)?;
            let position_z = reader.scaled_u32(1000.0)?;
            let custom = reader.u8()? != 0;
            let line_count = reader.u32()? as usize;
            let data_len = line_count * rle::LINE_RECORD_LEN;
            let data_start = reader.position();
            reader.skip(data_len)?;
            records.push(CxdlpLayerRecord {
                exposure_time,
                light_off_delay,
                position_z,
                custom,
                data_start,
                data_len,
            });
        }
        Ok(records)
    }
}

impl FormatCodec for CxdlpCodec {
    fn format_type(&self) -> FormatType {
        FormatType::Cxdlp
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn allowed_versions(&self) -> &'static [u32] {
        ALLOWED_VERSIONS
    }

    fn can_process(&self, path: &Path) -> bool {
        let Ok(bytes) = super::read_prefix(path, MAGIC.len()) else {
            return false;
        };
        bytes == *MAGIC
    }

    fn decode(
        &self,
        path: &Path,
        options: DecodeOptions,
        progress: &ProgressToken,
    ) -> Result<JobDocument> {
        let buf = fs::read(path)?;
        let mut doc = JobDocument::new(CAPABILITIES);

        // The version field picks the checksum algorithm, so the header
        // parse runs twice conceptually: magic+version first, then the
        // checksum gate, then the rest of the fields.
        {
            let mut reader = FieldReader::new(&buf, Endian::Big, "cxdlp header");
            reader.expect_magic(MAGIC)?;
            let version = reader.u16()? as u32;
            Self::verify_checksum(&buf, self.resolve_version(version))?;
        }

        let mut reader = FieldReader::new(&buf, Endian::Big, "cxdlp header");
        let version = Self::read_header(&mut reader, &mut doc)?;
        doc.version = self.resolve_version(version);
        let layer_count = reader.u32()?;

        if let Some(thumbnail) = Self::read_preview(&mut reader)? {
            doc.thumbnails.push(thumbnail);
        }

        let records = Self::read_layer_records(&mut reader, layer_count)?;
        reader.enter_record("footer");
        reader.expect_magic(FOOTER)?;

        doc.init(layer_count);
        for (index, record) in records.iter().enumerate() {
            let layer = doc.layer_mut(index as u32).expect("just initialized");
            layer.settings.exposure_time = record.exposure_time;
            layer.settings.light_off_delay = record.light_off_delay;
            layer.settings.position_z = record.position_z;
            layer.set_custom_settings(record.custom);
        }

        if options.partial {
            for (index, record) in records.iter().enumerate() {
                doc.layer_mut(index as u32)
                    .expect("just initialized")
                    .set_encoded(buf[record.data_start..record.data_start + record.data_len].to_vec());
            }
            doc.set_partial(true);
        } else {
            let (width, height) = (doc.resolution_x, doc.resolution_y);
            if (width == 0 || height == 0) && !records.is_empty() {
                // line records address pixels by coordinate; a zero
                // resolution cannot be inferred from them
                return Err(FormatError::UnresolvableResolution.into());
            }
            let records = &records;
            let buf = &buf;
            run_batched(
                records.len(),
                options.max_workers,
                progress,
                move |index| {
                    let record = &records[index];
                    let data = &buf[record.data_start..record.data_start + record.data_len];
                    rle::decode_lines(data, width, height)
                },
                |index, image| {
                    doc.layer_mut(index as u32)
                        .expect("index within records")
                        .set_raster(image);
                    Ok(())
                },
            )?;
        }

        doc.resolve_resolution()?;
        doc.sanitize_after_decode()?;
        info!(layers = doc.layer_count(), version = doc.version, "decoded cxdlp file");
        Ok(doc)
    }

    fn encode(
        &self,
        document: &mut JobDocument,
        path: &Path,
        options: EncodeOptions,
        progress: &ProgressToken,
    ) -> Result<()> {
        check_full_document(document, "encode")?;
        document.apply_before_encode();
        let version = self.resolve_version(document.version);

        let layer_count = document.layer_count() as usize;
        let mut writer = FieldWriter::new(Endian::Big);
        Self::write_header(&mut writer, document, version);
        Self::write_preview(&mut writer, document.thumbnails.first());

        // Parallel line-encoding phase, then a strictly sequential write
        // of the per-layer records in ascending index order.
        let doc = &*document;
        run_batched(
            layer_count,
            options.max_workers,
            progress,
            |index| {
                let layer = doc.layer(index as u32).expect("index in range");
                match layer.raster() {
                    Some(raster) => rle::encode_lines(raster),
                    // A retained compressed payload passes through
                    // unchanged (metadata-only edits).
                    None => layer
                        .encoded()
                        .map(|bytes| bytes.to_vec())
                        .ok_or_else(|| {
                            FormatError::Other {
                                message: format!("layer {index} has no payload to encode"),
                            }
                            .into()
                        }),
                }
            },
            |index, lines| {
                let layer = doc.layer(index as u32).expect("index in range");
                let s = &layer.settings;
                writer.write_scaled_u16(s.exposure_time, 10.0, 1);
                writer.write_scaled_u16(s.light_off_delay, 10.0, 1);
                writer.write_scaled_u32(s.position_z, 1000.0, 3);
                writer.write_u8(layer.has_custom_settings() as u8);
                writer.write_u32((lines.len() / rle::LINE_RECORD_LEN) as u32);
                writer.write_bytes(&lines);
                Ok(())
            },
        )?;

        writer.write_bytes(FOOTER);

        // The checksum covers every byte written so far and runs only
        // after the sequential phase has finished.
        let mut bytes = writer.into_bytes();
        if version >= 3 {
            let checksum = crc32(&bytes);
            bytes.extend_from_slice(&checksum.to_be_bytes());
        } else {
            let checksum = additive_checksum(&bytes);
            bytes.push(checksum);
        }

        write_atomically(path, |temp| {
            fs::write(temp, &bytes)?;
            Ok(())
        })?;
        info!(layers = layer_count, version, path = %path.display(), "encoded cxdlp file");
        Ok(())
    }

    fn partial_save(&self, document: &JobDocument, path: &Path) -> Result<()> {
        if document.pixels_dirty() {
            return Err(FormatError::PartialSaveInvalidated.into());
        }
        let buf = fs::read(path)?;
        let mut probe = JobDocument::new(CAPABILITIES);
        {
            let mut reader = FieldReader::new(&buf, Endian::Big, "cxdlp header");
            reader.expect_magic(MAGIC)?;
            let version = reader.u16()? as u32;
            Self::verify_checksum(&buf, self.resolve_version(version))?;
        }
        let mut reader = FieldReader::new(&buf, Endian::Big, "cxdlp header");
        let version = self.resolve_version(Self::read_header(&mut reader, &mut probe)?);
        let layer_count = reader.u32()?;
        if layer_count != document.layer_count() {
            return Err(FormatError::MalformedRecord {
                record: "cxdlp header".to_string(),
                reason: format!(
                    "layer count changed ({} on disk, {} in memory); full encode required",
                    layer_count,
                    document.layer_count()
                ),
            }
            .into());
        }
        let preview = Self::read_preview(&mut reader)?;
        let records = Self::read_layer_records(&mut reader, layer_count)?;

        // Rebuild the patchable regions around the untouched payloads.
        let mut writer = FieldWriter::new(Endian::Big);
        Self::write_header(&mut writer, document, version);
        Self::write_preview(&mut writer, preview.as_ref());
        for (index, record) in records.iter().enumerate() {
            let layer = document.layer(index as u32).expect("count verified");
            let s = &layer.settings;
            writer.write_scaled_u16(s.exposure_time, 10.0, 1);
            writer.write_scaled_u16(s.light_off_delay, 10.0, 1);
            writer.write_scaled_u32(s.position_z, 1000.0, 3);
            writer.write_u8(layer.has_custom_settings() as u8);
            writer.write_u32((record.data_len / rle::LINE_RECORD_LEN) as u32);
            writer.write_bytes(&buf[record.data_start..record.data_start + record.data_len]);
        }
        writer.write_bytes(FOOTER);

        let mut bytes = writer.into_bytes();
        if version >= 3 {
            let checksum = crc32(&bytes);
            bytes.extend_from_slice(&checksum.to_be_bytes());
        } else {
            bytes.push(additive_checksum(&bytes));
        }

        write_atomically(path, |temp| {
            fs::write(temp, &bytes)?;
            Ok(())
        })?;
        debug!(path = %path.display(), "partial save rewrote cxdlp metadata");
        Ok(())
    }
}
