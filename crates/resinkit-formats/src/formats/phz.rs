//! PHZ keyed binary format
//!
//! Little-endian, offset-table layout: a fixed header pointing at the
//! machine name, two preview images and the layer table. Layer payloads
//! are grey7 RLE, optionally wrapped in the layer-index-keyed XOR stream
//! cipher; an `encryption_seed` of zero in the header marks the plaintext
//! variant of the same container. Previews are rgb555 runs.
//!
//! Per-layer records carry explicit exposure/light-off/lift overrides, so
//! a layer can diverge from the globals without a G-Code sidecar.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use resinkit_core::error::{FormatError, Result};
use resinkit_core::params::{Capabilities, Parameter};
use resinkit_core::pipeline::{run_batched, ProgressToken};
use resinkit_core::{JobDocument, LayerImage, Thumbnail};

use crate::codec::{
    check_full_document, write_atomically, DecodeOptions, EncodeOptions, FormatCodec,
};
use crate::crypto::crypt_layer;
use crate::fieldio::{Endian, FieldReader, FieldWriter};
use crate::registry::FormatType;
use crate::rle;

/// File identifier, reads as `PHZ1` on disk.
pub const MAGIC: &[u8; 4] = b"PHZ1";

/// Byte length of the fixed header, magic and version included.
const HEADER_LEN: usize = 132;
/// Byte length of one layer table entry.
const LAYER_RECORD_LEN: usize = 36;
/// Layer record flag: the layer carries explicit overrides.
const FLAG_CUSTOM_SETTINGS: u32 = 0x1;

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
    per_layer: &[
        Parameter::ExposureTime,
        Parameter::LightOffDelay,
        Parameter::LiftHeight,
        Parameter::LiftSpeed,
        Parameter::LightPwm,
    ],
    supports_gcode: false,
    supports_dual_stage: false,
    supports_layer_overrides: true,
    supports_wait_before_cure: false,
    supports_light_off_delay: true,
};

const ALLOWED_VERSIONS: &[u32] = &[1, 2];

/// Codec for the PHZ keyed binary format.
pub struct PhzCodec;

impl PhzCodec {
    fn decode_header(&self, reader: &mut FieldReader<'_>, doc: &mut JobDocument) -> Result<PhzOffsets> {
        reader.expect_magic(MAGIC)?;
        let version = reader.u32()?;
        doc.version = self.resolve_version(version);

        doc.resolution_x = reader.u32()?;
        doc.resolution_y = reader.u32()?;
        doc.display_width = reader.f32()?;
        doc.display_height = reader.f32()?;
        doc.machine_z = reader.f32()?;
        doc.layer_height = reader.f32()?;
        doc.exposure_time = reader.f32()?;
        doc.bottom_exposure_time = reader.f32()?;
        doc.light_off_delay = reader.f32()?;
        doc.bottom_light_off_delay = reader.f32()?;
        doc.bottom_layer_count = reader.u32()?;
        doc.bottom_lift_height = reader.f32()?;
        doc.bottom_lift_speed = reader.f32()?;
        doc.lift_height = reader.f32()?;
        doc.lift_speed = reader.f32()?;
        doc.bottom_retract_speed = reader.f32()?;
        doc.retract_speed = reader.f32()?;
        doc.volume_ml = reader.f32()?;
        doc.weight_g = reader.f32()?;
        doc.cost = reader.f32()?;
        doc.print_time = reader.u32()? as f32;
        doc.light_pwm = reader.u16()? as u8;
        doc.bottom_light_pwm = reader.u16()? as u8;
        doc.anti_alias_level = reader.u32()?;
        let encryption_seed = reader.u32()?;
        doc.transition_layer_count = reader.u32()?;

        Ok(PhzOffsets {
            encryption_seed,
            machine_name: reader.u32()?,
            machine_name_len: reader.u32()?,
            large_preview: reader.u32()?,
            small_preview: reader.u32()?,
            layer_table: reader.u32()?,
            layer_count: reader.u32()?,
        })
    }

    fn encode_header(
        &self,
        doc: &JobDocument,
        seed: u32,
        offsets: &PhzOffsets,
    ) -> FieldWriter {
        let mut writer = FieldWriter::new(Endian::Little);
        writer.write_bytes(MAGIC);
        writer.write_u32(self.resolve_version(doc.version));
        writer.write_u32(doc.resolution_x);
        writer.write_u32(doc.resolution_y);
        writer.write_f32(doc.display_width);
        writer.write_f32(doc.display_height);
        writer.write_f32(doc.machine_z);
        writer.write_f32(doc.layer_height);
        writer.write_f32(doc.exposure_time);
        writer.write_f32(doc.bottom_exposure_time);
        writer.write_f32(doc.light_off_delay);
        writer.write_f32(doc.bottom_light_off_delay);
        writer.write_u32(doc.bottom_layer_count);
        writer.write_f32(doc.bottom_lift_height);
        writer.write_f32(doc.bottom_lift_speed);
        writer.write_f32(doc.lift_height);
        writer.write_f32(doc.lift_speed);
        writer.write_f32(doc.bottom_retract_speed);
        writer.write_f32(doc.retract_speed);
        writer.write_f32(doc.volume_ml);
        writer.write_f32(doc.weight_g);
        writer.write_f32(doc.cost);
        writer.write_u32(doc.print_time as u32);
        writer.write_u16(doc.light_pwm as u16);
        writer.write_u16(doc.bottom_light_pwm as u16);
        writer.write_u32(doc.anti_alias_level);
        writer.write_u32(seed);
        writer.write_u32(doc.transition_layer_count);
        writer.write_u32(offsets.machine_name);
        writer.write_u32(offsets.machine_name_len);
        writer.write_u32(offsets.large_preview);
        writer.write_u32(offsets.small_preview);
        writer.write_u32(offsets.layer_table);
        writer.write_u32(offsets.layer_count);
        debug_assert_eq!(writer.position(), HEADER_LEN);
        writer
    }

    fn decode_preview(&self, buf: &[u8], offset: u32) -> Result<Option<Thumbnail>> {
        if offset == 0 {
            return Ok(None);
        }
        let mut reader = FieldReader::new(buf, Endian::Little, "preview");
        reader.seek(offset as usize);
        let width = reader.u32()?;
        let height = reader.u32()?;
        let data_len = reader.u32()? as usize;
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let data = reader.bytes(data_len)?;
        let rgb = rle::decode_rgb555(data, (width * height) as usize)?;
        Ok(Some(Thumbnail { width, height, rgb }))
    }

    fn write_preview(&self, writer: &mut FieldWriter, thumbnail: Option<&Thumbnail>) -> u32 {
        let offset = writer.position() as u32;
        match thumbnail {
            Some(t) => {
                let data = rle::encode_rgb555(&t.rgb);
                writer.write_u32(t.width);
                writer.write_u32(t.height);
                writer.write_u32(data.len() as u32);
                writer.write_bytes(&data);
            }
            None => {
                writer.write_u32(0);
                writer.write_u32(0);
                writer.write_u32(0);
            }
        }
        offset
    }

    fn write_layer_record(
        writer: &mut FieldWriter,
        layer: &resinkit_core::Layer,
        data_offset: u32,
        data_len: u32,
    ) {
        let s = &layer.settings;
        writer.write_f32(s.position_z);
        writer.write_f32(s.exposure_time);
        writer.write_f32(s.light_off_delay);
        writer.write_f32(s.lift_height);
        writer.write_f32(s.lift_speed);
        writer.write_u32(s.light_pwm as u32);
        writer.write_u32(if layer.has_custom_settings() {
            FLAG_CUSTOM_SETTINGS
        } else {
            0
        });
        writer.write_u32(data_offset);
        writer.write_u32(data_len);
    }
}

struct PhzOffsets {
    encryption_seed: u32,
    machine_name: u32,
    machine_name_len: u32,
    large_preview: u32,
    small_preview: u32,
    layer_table: u32,
    layer_count: u32,
}

struct PhzLayerRecord {
    position_z: f32,
    exposure_time: f32,
    light_off_delay: f32,
    lift_height: f32,
    lift_speed: f32,
    light_pwm: u32,
    flags: u32,
    data_offset: u32,
    data_len: u32,
}

fn read_layer_record(reader: &mut FieldReader<'_>) -> Result<PhzLayerRecord> {
    Ok(PhzLayerRecord {
        position_z: reader.f32()?,
        exposure_time: reader.f32()?,
        light_off_delay: reader.f32()?,
        lift_height: reader.f32()?,
        lift_speed: reader.f32()?,
        light_pwm: reader.u32()?,
        flags: reader.u32()?,
        data_offset: reader.u32()?,
        data_len: reader.u32()?,
    })
}

impl FormatCodec for PhzCodec {
    fn format_type(&self) -> FormatType {
        FormatType::Phz
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

        let mut reader = FieldReader::new(&buf, Endian::Little, "phz header");
        let offsets = self.decode_header(&mut reader, &mut doc)?;

        reader.enter_record("machine name");
        reader.seek(offsets.machine_name as usize);
        doc.machine_name = String::from_utf8_lossy(
            reader.bytes(offsets.machine_name_len as usize)?,
        )
        .into_owned();

        if let Some(thumbnail) = self.decode_preview(&buf, offsets.large_preview)? {
            doc.thumbnails.push(thumbnail);
        }
        if let Some(thumbnail) = self.decode_preview(&buf, offsets.small_preview)? {
            doc.thumbnails.push(thumbnail);
        }

        reader.enter_record("layer table");
        reader.seek(offsets.layer_table as usize);
        let mut records = Vec::with_capacity(offsets.layer_count as usize);
        for _ in 0..offsets.layer_count {
            records.push(read_layer_record(&mut reader)?);
        }

        doc.init(offsets.layer_count as u32);
        for (index, record) in records.iter().enumerate() {
            let layer = doc.layer_mut(index as u32).expect("just initialized");
            layer.settings.position_z = record.position_z;
            layer.settings.exposure_time = record.exposure_time;
            layer.settings.light_off_delay = record.light_off_delay;
            layer.settings.lift_height = record.lift_height;
            layer.settings.lift_speed = record.lift_speed;
            layer.settings.light_pwm = record.light_pwm as u8;
            layer.set_custom_settings(record.flags & FLAG_CUSTOM_SETTINGS != 0);
        }

        if options.partial {
            for (index, record) in records.iter().enumerate() {
                let start = record.data_offset as usize;
                let end = start + record.data_len as usize;
                let slice = buf.get(start..end).ok_or(FormatError::Truncated {
                    record: "layer data".to_string(),
                    offset: record.data_offset as u64,
                })?;
                doc.layer_mut(index as u32)
                    .expect("just initialized")
                    .set_encoded(slice.to_vec());
            }
            doc.set_partial(true);
        } else {
            let (width, height) = (doc.resolution_x, doc.resolution_y);
            let pixel_count = (width * height) as usize;
            if pixel_count == 0 && !records.is_empty() {
                // grey7 runs carry no dimensions, so a zero resolution
                // cannot be inferred from the payload
                return Err(FormatError::UnresolvableResolution.into());
            }
            let seed = offsets.encryption_seed;
            let records = &records;
            let buf = &buf;
            run_batched(
                records.len(),
                options.max_workers,
                progress,
                move |index| {
                    let record = &records[index];
                    let start = record.data_offset as usize;
                    let end = start + record.data_len as usize;
                    let slice = buf.get(start..end).ok_or(FormatError::Truncated {
                        record: "layer data".to_string(),
                        offset: record.data_offset as u64,
                    })?;
                    let mut payload = slice.to_vec();
                    crypt_layer(seed, index as u32, &mut payload);
                    let pixels = rle::decode_grey7(&payload, pixel_count)?;
                    LayerImage::from_pixels(width, height, pixels)
                },
                |index, image| {
                    doc.layer_mut(index as u32)
                        .expect("index within layer table")
                        .set_raster(image);
                    Ok(())
                },
            )?;
        }

        doc.resolve_resolution()?;
        doc.sanitize_after_decode()?;
        info!(
            layers = doc.layer_count(),
            encrypted = offsets.encryption_seed != 0,
            "decoded phz file"
        );
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
        let seed = options.encryption_seed;

        // Parallel compress-then-encrypt phase; results land in index
        // order so the offset table is populated in encounter order.
        let layer_count = document.layer_count() as usize;
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(layer_count);
        {
            let doc = &*document;
            run_batched(
                layer_count,
                options.max_workers,
                progress,
                |index| {
                    let layer = doc.layer(index as u32).expect("index in range");
                    let raster = layer.raster().ok_or(FormatError::Other {
                        message: format!("layer {index} has no raster to encode"),
                    })?;
                    let mut payload = rle::encode_grey7(raster.pixels());
                    crypt_layer(seed, index as u32, &mut payload);
                    Ok(payload)
                },
                |_, payload| {
                    payloads.push(payload);
                    Ok(())
                },
            )?;
        }

        // Sequential assembly: machine name, previews, layer table, data.
        let mut body = FieldWriter::new(Endian::Little);
        let machine_name_offset = HEADER_LEN as u32;
        body.write_bytes(document.machine_name.as_bytes());
        let large_preview =
            HEADER_LEN as u32 + self.write_preview(&mut body, document.thumbnails.first());
        let small_preview =
            HEADER_LEN as u32 + self.write_preview(&mut body, document.thumbnails.get(1));

        let layer_table = HEADER_LEN + body.position();
        let data_start = layer_table + layer_count * LAYER_RECORD_LEN;
        let mut data_offset = data_start as u32;
        for (index, payload) in payloads.iter().enumerate() {
            let layer = document.layer(index as u32).expect("index in range");
            Self::write_layer_record(&mut body, layer, data_offset, payload.len() as u32);
            data_offset += payload.len() as u32;
        }
        for payload in &payloads {
            body.write_bytes(payload);
        }

        let offsets = PhzOffsets {
            encryption_seed: seed,
            machine_name: machine_name_offset,
            machine_name_len: document.machine_name.len() as u32,
            large_preview,
            small_preview,
            layer_table: layer_table as u32,
            layer_count: layer_count as u32,
        };
        let header = self.encode_header(document, seed, &offsets);

        let mut bytes = header.into_bytes();
        bytes.extend_from_slice(body.bytes());
        write_atomically(path, |temp| {
            fs::write(temp, &bytes)?;
            Ok(())
        })?;
        info!(layers = layer_count, path = %path.display(), "encoded phz file");
        Ok(())
    }

    fn partial_save(&self, document: &JobDocument, path: &Path) -> Result<()> {
        if document.pixels_dirty() {
            return Err(FormatError::PartialSaveInvalidated.into());
        }
        let mut buf = fs::read(path)?;
        let mut probe = JobDocument::new(CAPABILITIES);
        let mut reader = FieldReader::new(&buf, Endian::Little, "phz header");
        let offsets = self.decode_header(&mut reader, &mut probe)?;
        if offsets.layer_count != document.layer_count() {
            return Err(FormatError::MalformedRecord {
                record: "phz header".to_string(),
                reason: format!(
                    "layer count changed ({} on disk, {} in memory); full encode required",
                    offsets.layer_count,
                    document.layer_count()
                ),
            }
            .into());
        }

        // Patch the parameter header, keeping the on-disk offsets.
        let header = self.encode_header(document, offsets.encryption_seed, &offsets);
        buf[..HEADER_LEN].copy_from_slice(header.bytes());

        // Patch the per-layer metadata table, keeping each payload range.
        let table_start = offsets.layer_table as usize;
        let mut table = FieldWriter::new(Endian::Little);
        for index in 0..offsets.layer_count {
            let mut record_reader = FieldReader::new(&buf, Endian::Little, "layer table");
            record_reader.seek(table_start + index as usize * LAYER_RECORD_LEN);
            let on_disk = read_layer_record(&mut record_reader)?;
            let layer = document.layer(index).expect("count verified");
            Self::write_layer_record(&mut table, layer, on_disk.data_offset, on_disk.data_len);
        }
        let table_end = table_start + table.position();
        buf[table_start..table_end].copy_from_slice(table.bytes());

        fs::write(path, &buf)?;
        debug!(path = %path.display(), "partial save patched phz header and layer table");
        Ok(())
    }
}

