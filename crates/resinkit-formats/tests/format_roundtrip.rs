//! End-to-end encode/decode scenarios across the four formats.

use std::fs;

use resinkit_core::params::Parameter;
use resinkit_core::pipeline::ProgressToken;
use resinkit_core::{JobDocument, LayerImage};
use resinkit_formats::{
    codec_for, convert_document, decode_file, DecodeOptions, EncodeOptions, FormatCodec,
    FormatType,
};

/// A small raster whose pixel values survive grey7 quantization (all
/// even, none above 0xF8), so every format round-trips it exactly.
fn test_raster(width: u32, height: u32, salt: u8) -> LayerImage {
    let mut image = LayerImage::new(width, height);
    for y in 2..height - 2 {
        for x in 2..width - 2 {
            let value = ((x as u8).wrapping_add(y as u8).wrapping_mul(2)).wrapping_add(salt & 0xFE);
            image.set_pixel(x, y, value.min(0xF8) & 0xFE);
        }
    }
    image
}

fn sample_document(format: FormatType, layer_count: u32) -> JobDocument {
    let codec = codec_for(format);
    let mut doc = JobDocument::new(*codec.capabilities());
    doc.machine_name = "TEST-MACHINE".to_string();
    doc.resolution_x = 24;
    doc.resolution_y = 16;
    doc.display_width = 120.0;
    doc.display_height = 80.0;
    doc.machine_z = 160.0;
    doc.layer_height = 0.05;
    doc.bottom_layer_count = 1;
    doc.bottom_exposure_time = 35.0;
    doc.exposure_time = 7.0;
    doc.lift_height = 6.0;
    doc.lift_speed = 60.0;
    doc.bottom_lift_height = 6.0;
    doc.bottom_lift_speed = 60.0;
    doc.retract_speed = 150.0;
    doc.bottom_retract_speed = 150.0;
    doc.init(layer_count);
    for index in 0..layer_count {
        let raster = test_raster(24, 16, index as u8);
        doc.layer_mut(index).unwrap().set_raster(raster);
    }
    doc
}

fn encode_to(
    doc: &mut JobDocument,
    format: FormatType,
    path: &std::path::Path,
    seed: u32,
) {
    let options = EncodeOptions {
        max_workers: 2,
        encryption_seed: seed,
    };
    codec_for(format)
        .encode(doc, path, options, &ProgressToken::new())
        .expect("encode should succeed");
}

fn decode(path: &std::path::Path) -> JobDocument {
    decode_file(path, DecodeOptions::default(), &ProgressToken::new()).expect("decode should succeed")
}

#[test]
fn scenario_a_archive_exposures_and_z() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.rsz");
    let mut doc = sample_document(FormatType::Rsz, 2);
    encode_to(&mut doc, FormatType::Rsz, &path, 0);

    let decoded = decode(&path);
    assert_eq!(decoded.layer_count(), 2);
    assert_eq!(decoded.layer(0).unwrap().settings.exposure_time, 35.0);
    assert_eq!(decoded.layer(1).unwrap().settings.exposure_time, 7.0);
    assert!((decoded.layer(1).unwrap().settings.position_z - 0.10).abs() < 1e-4);
}

#[test]
fn scenario_b_zero_seed_skips_cipher() {
    let dir = tempfile::tempdir().unwrap();
    let plain_a = dir.path().join("a.phz");
    let plain_b = dir.path().join("b.phz");
    let mut doc = sample_document(FormatType::Phz, 3);
    encode_to(&mut doc, FormatType::Phz, &plain_a, 0);
    encode_to(&mut doc, FormatType::Phz, &plain_b, 0);
    // the no-op cipher path is deterministic: byte-identical output
    assert_eq!(fs::read(&plain_a).unwrap(), fs::read(&plain_b).unwrap());

    let encrypted = dir.path().join("c.phz");
    encode_to(&mut doc, FormatType::Phz, &encrypted, 0xC0FF_EE01);
    assert_ne!(fs::read(&plain_a).unwrap(), fs::read(&encrypted).unwrap());

    // both variants decode to the same rasters
    let from_plain = decode(&plain_a);
    let from_encrypted = decode(&encrypted);
    for index in 0..3 {
        assert_eq!(
            from_plain.layer(index).unwrap().raster().unwrap().pixels(),
            from_encrypted.layer(index).unwrap().raster().unwrap().pixels(),
        );
    }
}

#[test]
fn scenario_c_corrupted_checksum_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.cxdlp");
    let mut doc = sample_document(FormatType::Cxdlp, 2);
    encode_to(&mut doc, FormatType::Cxdlp, &path, 0);

    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    let err = decode_file(&path, DecodeOptions::default(), &ProgressToken::new()).unwrap_err();
    assert!(err.is_checksum_mismatch(), "got {err:?}");
}

#[test]
fn scenario_d_single_stage_into_dual_stage_target() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("job.phz");
    let target_path = dir.path().join("job.rsz");
    let mut source = sample_document(FormatType::Phz, 2);
    source.bottom_lift_height = 5.5;
    source.rebuild_layer_settings();
    encode_to(&mut source, FormatType::Phz, &source_path, 0);

    let decoded = decode(&source_path);
    let converted = convert_document(
        &decoded,
        FormatType::Rsz,
        &target_path,
        EncodeOptions::default(),
        &ProgressToken::new(),
    )
    .unwrap();
    assert_eq!(converted.bottom_lift_height, decoded.bottom_lift_height);
    assert_eq!(converted.bottom_lift_height2, 0.0);
    assert!(target_path.is_file());
}

#[test]
fn round_trip_every_format() {
    let dir = tempfile::tempdir().unwrap();
    for format in [
        FormatType::Rsz,
        FormatType::Rsgz,
        FormatType::Cxdlp,
        FormatType::Phz,
    ] {
        let path = dir.path().join(format!("job.{}", format.name()));
        let mut doc = sample_document(format, 3);
        let seed = if format == FormatType::Phz { 0x1234 } else { 0 };
        encode_to(&mut doc, format, &path, seed);
        let decoded = decode(&path);

        assert_eq!(decoded.layer_count(), 3, "{format:?}");
        assert_eq!(decoded.machine_name, "TEST-MACHINE", "{format:?}");
        assert_eq!(decoded.bottom_layer_count, 1, "{format:?}");
        assert_eq!(decoded.bottom_exposure_time, 35.0, "{format:?}");
        assert_eq!(decoded.exposure_time, 7.0, "{format:?}");
        assert!((decoded.layer_height - 0.05).abs() < 1e-6, "{format:?}");
        for index in 0..3 {
            assert_eq!(
                decoded.layer(index).unwrap().raster().unwrap().pixels(),
                doc.layer(index).unwrap().raster().unwrap().pixels(),
                "{format:?} layer {index}"
            );
        }
    }
}

#[test]
fn round_trip_supported_parameters() {
    let dir = tempfile::tempdir().unwrap();
    for format in [
        FormatType::Rsz,
        FormatType::Rsgz,
        FormatType::Cxdlp,
        FormatType::Phz,
    ] {
        let path = dir.path().join(format!("job.{}", format.name()));
        let mut doc = sample_document(format, 3);
        // nudge every supported parameter to a distinctive, wire-exact value
        doc.batch_mutate(true, |doc| {
            doc.set_parameter(Parameter::LightOffDelay, 1.5);
            doc.set_parameter(Parameter::BottomLightOffDelay, 2.5);
            doc.set_parameter(Parameter::LightPwm, 250.0);
            doc.set_parameter(Parameter::BottomLightPwm, 200.0);
        });
        encode_to(&mut doc, format, &path, 0);
        let decoded = decode(&path);
        for &parameter in codec_for(format).capabilities().global {
            assert_eq!(
                decoded.parameter(parameter),
                doc.parameter(parameter),
                "{format:?} {parameter:?}"
            );
        }
    }
}

#[test]
fn partial_decode_blocks_encode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.phz");
    let mut doc = sample_document(FormatType::Phz, 2);
    encode_to(&mut doc, FormatType::Phz, &path, 0);

    let options = DecodeOptions {
        partial: true,
        ..DecodeOptions::default()
    };
    let mut partial = decode_file(&path, options, &ProgressToken::new()).unwrap();
    assert!(partial.is_partial());
    assert!(partial.layer(0).unwrap().raster().is_none());
    assert!(partial.layer(0).unwrap().encoded().is_some());

    let out = dir.path().join("out.phz");
    let err = codec_for(FormatType::Phz)
        .encode(&mut partial, &out, EncodeOptions::default(), &ProgressToken::new())
        .unwrap_err();
    assert!(err.is_format_error());
    assert!(!out.exists());
}

#[test]
fn partial_save_patches_parameters_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.phz");
    let mut doc = sample_document(FormatType::Phz, 2);
    encode_to(&mut doc, FormatType::Phz, &path, 0);

    let mut decoded = decode(&path);
    decoded.set_parameter(Parameter::ExposureTime, 9.5);
    codec_for(FormatType::Phz)
        .partial_save(&decoded, &path)
        .unwrap();

    let reread = decode(&path);
    assert_eq!(reread.exposure_time, 9.5);
    assert_eq!(reread.layer(1).unwrap().settings.exposure_time, 9.5);
    for index in 0..2 {
        assert_eq!(
            reread.layer(index).unwrap().raster().unwrap().pixels(),
            doc.layer(index).unwrap().raster().unwrap().pixels(),
        );
    }
}

#[test]
fn partial_save_refused_after_pixel_edit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.cxdlp");
    let mut doc = sample_document(FormatType::Cxdlp, 2);
    encode_to(&mut doc, FormatType::Cxdlp, &path, 0);

    let mut decoded = decode(&path);
    decoded.layer_mut(0).unwrap().set_raster(test_raster(24, 16, 99));
    decoded.mark_pixels_dirty();
    assert!(codec_for(FormatType::Cxdlp)
        .partial_save(&decoded, &path)
        .is_err());
}

#[test]
fn cancelled_encode_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.cxdlp");
    let mut doc = sample_document(FormatType::Cxdlp, 4);
    let progress = ProgressToken::new();
    progress.cancel();
    let err = codec_for(FormatType::Cxdlp)
        .encode(&mut doc, &path, EncodeOptions::default(), &progress)
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!path.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn shared_extension_probe_picks_encrypted_sibling() {
    let dir = tempfile::tempdir().unwrap();
    // an encrypted archive saved under the plain extension
    let path = dir.path().join("job.rsz");
    let mut doc = sample_document(FormatType::Rsgz, 2);
    encode_to(&mut doc, FormatType::Rsgz, &path, 0);

    let codec = resinkit_formats::probe(&path).unwrap();
    assert_eq!(codec.format_type(), FormatType::Rsgz);
    let decoded = decode(&path);
    assert_eq!(decoded.layer_count(), 2);
}

#[test]
fn convert_preserves_rasters_across_formats() {
    let dir = tempfile::tempdir().unwrap();
    let rsz_path = dir.path().join("job.rsz");
    let cxdlp_path = dir.path().join("job.cxdlp");
    let mut doc = sample_document(FormatType::Rsz, 2);
    encode_to(&mut doc, FormatType::Rsz, &rsz_path, 0);

    let decoded = decode(&rsz_path);
    convert_document(
        &decoded,
        FormatType::Cxdlp,
        &cxdlp_path,
        EncodeOptions::default(),
        &ProgressToken::new(),
    )
    .unwrap();

    let converted = decode(&cxdlp_path);
    for index in 0..2 {
        assert_eq!(
            converted.layer(index).unwrap().raster().unwrap().pixels(),
            decoded.layer(index).unwrap().raster().unwrap().pixels(),
        );
    }
    assert_eq!(converted.exposure_time, decoded.exposure_time);
}

#[test]
fn legacy_version_uses_additive_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let v2 = dir.path().join("v2.cxdlp");
    let v3 = dir.path().join("v3.cxdlp");
    let mut doc = sample_document(FormatType::Cxdlp, 2);
    doc.version = 2;
    encode_to(&mut doc, FormatType::Cxdlp, &v2, 0);
    doc.version = 3;
    encode_to(&mut doc, FormatType::Cxdlp, &v3, 0);

    // the v2 trailer is one byte, the v3 trailer four
    let len_v2 = fs::read(&v2).unwrap().len();
    let len_v3 = fs::read(&v3).unwrap().len();
    assert_eq!(len_v3, len_v2 + 3);

    assert_eq!(decode(&v2).version, 2);
    assert_eq!(decode(&v3).version, 3);
}
