//! RSZ archive format
//!
//! A standard ZIP container with well-known entry names: a `run.gcode`
//! program carrying every global and per-layer parameter, two preview
//! PNGs and one greyscale PNG per layer (`1.png`, `2.png`, ...). The
//! presence of the `run.gcode` entry is what identifies this format; its
//! absence signals the encrypted sibling sub-format.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use resinkit_core::error::{CodecError, FormatError, Result};
use resinkit_core::gcode;
use resinkit_core::params::{Capabilities, Parameter};
use resinkit_core::pipeline::{run_batched, ProgressToken};
use resinkit_core::{JobDocument, LayerImage, Thumbnail};

use crate::codec::{
    check_full_document, write_atomically, DecodeOptions, EncodeOptions, FormatCodec,
};
use crate::registry::FormatType;

/// The G-Code program entry; its presence identifies this format.
pub const GCODE_ENTRY: &str = "run.gcode";
/// Large preview entry.
pub const PREVIEW_ENTRY: &str = "preview.png";
/// Cropped preview entry.
pub const PREVIEW_CROP_ENTRY: &str = "preview_cropping.png";

const ALLOWED_VERSIONS: &[u32] = &[1];

pub(crate) static CAPABILITIES: Capabilities = Capabilities {
    global: &[
        Parameter::BottomLayerCount,
        Parameter::TransitionLayerCount,
        Parameter::BottomExposureTime,
        Parameter::ExposureTime,
        Parameter::BottomWaitBeforeCure,
        Parameter::WaitBeforeCure,
        Parameter::BottomWaitAfterCure,
        Parameter::WaitAfterCure,
        Parameter::BottomWaitAfterLift,
        Parameter::WaitAfterLift,
        Parameter::BottomLightOffDelay,
        Parameter::LightOffDelay,
        Parameter::BottomLiftHeight,
        Parameter::LiftHeight,
        Parameter::BottomLiftSpeed,
        Parameter::LiftSpeed,
        Parameter::BottomLiftHeight2,
        Parameter::LiftHeight2,
        Parameter::BottomLiftSpeed2,
        Parameter::LiftSpeed2,
        Parameter::BottomLiftAcceleration,
        Parameter::LiftAcceleration,
        Parameter::BottomRetractSpeed,
        Parameter::RetractSpeed,
        Parameter::BottomRetractAcceleration,
        Parameter::RetractAcceleration,
        Parameter::BottomRetractHeight2,
        Parameter::RetractHeight2,
        Parameter::BottomRetractSpeed2,
        Parameter::RetractSpeed2,
        Parameter::BottomLightPwm,
        Parameter::LightPwm,
    ],
    per_layer: &[
        Parameter::ExposureTime,
        Parameter::WaitBeforeCure,
        Parameter::LightOffDelay,
        Parameter::LiftHeight,
        Parameter::LiftSpeed,
        Parameter::LiftHeight2,
        Parameter::LiftSpeed2,
        Parameter::RetractSpeed,
        Parameter::LightPwm,
    ],
    supports_gcode: true,
    supports_dual_stage: true,
    supports_layer_overrides: true,
    supports_wait_before_cure: true,
    supports_light_off_delay: true,
};

/// Codec for the plain ZIP+G-Code archive format.
pub struct RszCodec;

/// Regenerate the embedded program if a parameter mutation invalidated
/// it, then return the current text.
pub(crate) fn current_gcode(doc: &mut JobDocument) -> String {
    if let Some(text) = doc.gcode_text() {
        return text.to_owned();
    }
    let text = gcode::build_program(doc);
    doc.set_gcode_text(text.clone());
    text
}

pub(crate) fn zip_entry_bytes(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(|e| FormatError::MalformedRecord {
        record: name.to_string(),
        reason: e.to_string(),
    })?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub(crate) fn decode_layer_png(bytes: &[u8]) -> Result<LayerImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
        .map_err(|e| CodecError::Image {
            reason: e.to_string(),
        })?
        .to_luma8();
    LayerImage::from_pixels(image.width(), image.height(), image.into_raw())
}

pub(crate) fn encode_layer_png(raster: &LayerImage) -> Result<Vec<u8>> {
    let image =
        image::GrayImage::from_raw(raster.width(), raster.height(), raster.pixels().to_vec())
            .ok_or(CodecError::Image {
                reason: "raster buffer does not match its dimensions".to_string(),
            })?;
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| CodecError::Image {
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

pub(crate) fn decode_thumbnail_png(bytes: &[u8]) -> Result<Thumbnail> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
        .map_err(|e| CodecError::Image {
            reason: e.to_string(),
        })?
        .to_rgb8();
    Ok(Thumbnail {
        width: image.width(),
        height: image.height(),
        rgb: image.into_raw(),
    })
}

pub(crate) fn encode_thumbnail_png(thumbnail: &Thumbnail) -> Result<Vec<u8>> {
    let image =
        image::RgbImage::from_raw(thumbnail.width, thumbnail.height, thumbnail.rgb.clone())
            .ok_or(CodecError::Image {
                reason: "thumbnail buffer does not match its dimensions".to_string(),
            })?;
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| CodecError::Image {
            reason: e.to_string(),
        })?;
    Ok(bytes)
}

pub(crate) fn zip_error(e: zip::result::ZipError) -> resinkit_core::Error {
    FormatError::Other {
        message: format!("zip container: {e}"),
    }
    .into()
}

/// Shared decode for both archive formats; `read_program` supplies the
/// (possibly decrypted) program text.
pub(crate) fn decode_archive<F>(
    capabilities: Capabilities,
    path: &Path,
    options: DecodeOptions,
    progress: &ProgressToken,
    read_program: F,
) -> Result<JobDocument>
where
    F: FnOnce(&mut ZipArchive<File>) -> Result<String>,
{
    let mut archive = ZipArchive::new(File::open(path)?).map_err(zip_error)?;
    let mut doc = JobDocument::new(capabilities);

    let text = read_program(&mut archive)?;
    gcode::parse_program(&text, &mut doc)?;
    doc.set_gcode_text(text);

    for name in [PREVIEW_ENTRY, PREVIEW_CROP_ENTRY] {
        if archive.by_name(name).is_ok() {
            let bytes = zip_entry_bytes(&mut archive, name)?;
            doc.thumbnails.push(decode_thumbnail_png(&bytes)?);
        }
    }

    // Sequential read of the layer entries (the archive has one cursor),
    // then parallel PNG decoding.
    let layer_count = doc.layer_count() as usize;
    let mut encoded: Vec<Vec<u8>> = Vec::with_capacity(layer_count);
    for index in 0..layer_count {
        encoded.push(zip_entry_bytes(&mut archive, &format!("{}.png", index + 1))?);
    }

    if options.partial {
        for (index, bytes) in encoded.into_iter().enumerate() {
            doc.layer_mut(index as u32)
                .expect("layer array sized by program")
                .set_encoded(bytes);
        }
        doc.set_partial(true);
    } else {
        let encoded = &encoded;
        run_batched(
            layer_count,
            options.max_workers,
            progress,
            move |index| decode_layer_png(&encoded[index]),
            |index, image| {
                doc.layer_mut(index as u32)
                    .expect("layer array sized by program")
                    .set_raster(image);
                Ok(())
            },
        )?;
    }

    doc.resolve_resolution()?;
    doc.sanitize_after_decode()?;
    Ok(doc)
}

/// Shared encode for both archive formats; `write_program` stores the
/// (possibly encrypted) program text into the archive.
pub(crate) fn encode_archive<F>(
    document: &mut JobDocument,
    path: &Path,
    options: EncodeOptions,
    progress: &ProgressToken,
    write_program: F,
) -> Result<()>
where
    F: FnOnce(&mut ZipWriter<File>, &str) -> Result<()>,
{
    check_full_document(document, "encode")?;
    document.apply_before_encode();
    let text = current_gcode(document);

    write_atomically(path, |temp| {
        let mut writer = ZipWriter::new(File::create(temp)?);
        let zip_options = SimpleFileOptions::default();

        write_program(&mut writer, &text)?;

        for (index, name) in [PREVIEW_ENTRY, PREVIEW_CROP_ENTRY].iter().enumerate() {
            if let Some(thumbnail) = document.thumbnails.get(index) {
                writer.start_file(*name, zip_options).map_err(zip_error)?;
                writer.write_all(&encode_thumbnail_png(thumbnail)?)?;
            }
        }

        // Parallel PNG encoding; the sequential sink writes entries in
        // ascending layer order because the archive has one cursor.
        let doc = &*document;
        run_batched(
            doc.layer_count() as usize,
            options.max_workers,
            progress,
            |index| {
                let layer = doc.layer(index as u32).expect("index in range");
                match layer.raster() {
                    Some(raster) => encode_layer_png(raster),
                    None => layer.encoded().map(|b| b.to_vec()).ok_or_else(|| {
                        FormatError::Other {
                            message: format!("layer {index} has no payload to encode"),
                        }
                        .into()
                    }),
                }
            },
            |index, png| {
                writer
                    .start_file(format!("{}.png", index + 1), zip_options)
                    .map_err(zip_error)?;
                writer.write_all(&png)?;
                Ok(())
            },
        )?;

        writer.finish().map_err(zip_error)?;
        Ok(())
    })
}

impl FormatCodec for RszCodec {
    fn format_type(&self) -> FormatType {
        FormatType::Rsz
    }

    fn capabilities(&self) -> &'static Capabilities {
        &CAPABILITIES
    }

    fn allowed_versions(&self) -> &'static [u32] {
        ALLOWED_VERSIONS
    }

    fn can_process(&self, path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        let Ok(mut archive) = ZipArchive::new(file) else {
            return false;
        };
        let found = archive.by_name(GCODE_ENTRY).is_ok();
        found
    }

    fn decode(
        &self,
        path: &Path,
        options: DecodeOptions,
        progress: &ProgressToken,
    ) -> Result<JobDocument> {
        let doc = decode_archive(CAPABILITIES, path, options, progress, |archive| {
            let bytes = zip_entry_bytes(archive, GCODE_ENTRY)?;
            String::from_utf8(bytes).map_err(|_| {
                FormatError::MalformedRecord {
                    record: GCODE_ENTRY.to_string(),
                    reason: "program text is not valid UTF-8".to_string(),
                }
                .into()
            })
        })?;
        info!(layers = doc.layer_count(), "decoded rsz archive");
        Ok(doc)
    }

    fn encode(
        &self,
        document: &mut JobDocument,
        path: &Path,
        options: EncodeOptions,
        progress: &ProgressToken,
    ) -> Result<()> {
        encode_archive(document, path, options, progress, |writer, text| {
            writer
                .start_file(GCODE_ENTRY, SimpleFileOptions::default())
                .map_err(zip_error)?;
            writer.write_all(text.as_bytes())?;
            Ok(())
        })?;
        info!(layers = document.layer_count(), path = %path.display(), "encoded rsz archive");
        Ok(())
    }

    fn partial_save(&self, document: &JobDocument, path: &Path) -> Result<()> {
        if document.pixels_dirty() {
            return Err(FormatError::PartialSaveInvalidated.into());
        }
        // The program entry is the only patchable region; every other
        // entry is copied through raw, compressed bytes untouched.
        let mut document = document.clone();
        let text = current_gcode(&mut document);
        let source = File::open(path)?;
        let mut archive = ZipArchive::new(source).map_err(zip_error)?;
        write_atomically(path, |temp| {
            let mut writer = ZipWriter::new(File::create(temp)?);
            writer
                .start_file(GCODE_ENTRY, SimpleFileOptions::default())
                .map_err(zip_error)?;
            writer.write_all(text.as_bytes())?;
            for index in 0..archive.len() {
                let entry = archive.by_index_raw(index).map_err(zip_error)?;
                if entry.name() == GCODE_ENTRY {
                    continue;
                }
                writer.raw_copy_file(entry).map_err(zip_error)?;
            }
            writer.finish().map_err(zip_error)?;
            Ok(())
        })
    }
}
