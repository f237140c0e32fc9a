//! Layer image run-length codecs
//!
//! Three wire representations, selectable per format:
//!
//! * **grey7**: row-major 7-bit greyscale runs with a repeat flag in the
//!   colour byte and a split 12-bit repeat count (keyed binary layers)
//! * **rgb555**: 15-bit colour runs with the same repeat convention over
//!   a 16-bit code (preview thumbnails)
//! * **lines**: one 6-byte record per vertical run of constant grey,
//!   with 13/14-bit packed coordinates (packed binary layers)
//!
//! Encoders are deterministic: the same raster always produces identical
//! bytes. Decoders validate against the expected raster size and fail on
//! overrun or underrun instead of truncating or wrapping.

use resinkit_core::error::{CodecError, Result};
use resinkit_core::LayerImage;

// =============================================================================
// GREY7: 7-bit grey + repeat-count runs
// =============================================================================

/// Highest representable 7-bit grey; quantized values clamp here.
const GREY7_MAX: u8 = 0x7C;
/// Repeat flag in the colour byte.
const GREY7_REPEAT: u8 = 0x80;
/// Longest run a single chunk can carry (12-bit count).
const RUN_LIMIT: usize = 0x0FFF;

/// Quantize an 8-bit grey to the 7-bit wire value: a shift with no
/// rounding, clamped at `0x7c`.
#[inline]
pub fn quantize_grey7(value: u8) -> u8 {
    (value >> 1).min(GREY7_MAX)
}

#[inline]
fn expand_grey7(value: u8) -> u8 {
    value << 1
}

/// Encode an 8-bit raster into grey7 runs, row-major.
///
/// Runs of one or two pixels are emitted as literal colour bytes; longer
/// runs set the repeat flag and append the count in one byte (`< 0x80`)
/// or two (`0x80 | hi, lo`, 12-bit limit). Runs past the limit split.
///
/// Quantization makes this lossy to 7 bits once; re-encoding the decoded
/// output is byte-identical.
pub fn encode_grey7(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 8);
    let mut iter = pixels.iter().map(|&p| quantize_grey7(p)).peekable();
    while let Some(color) = iter.next() {
        let mut run = 1usize;
        while iter.peek() == Some(&color) {
            iter.next();
            run += 1;
        }
        emit_grey7_run(&mut out, color, run);
    }
    out
}

fn emit_grey7_run(out: &mut Vec<u8>, color: u8, mut run: usize) {
    while run > 0 {
        let chunk = run.min(RUN_LIMIT);
        if chunk <= 2 {
            for _ in 0..chunk {
                out.push(color);
            }
        } else {
            out.push(color | GREY7_REPEAT);
            if chunk < 0x80 {
                out.push(chunk as u8);
            } else {
                out.push(0x80 | (chunk >> 8) as u8);
                out.push(chunk as u8);
            }
        }
        run -= chunk;
    }
}

/// Decode grey7 runs into an 8-bit raster of exactly `pixel_count`
/// pixels.
pub fn decode_grey7(data: &[u8], pixel_count: usize) -> Result<Vec<u8>> {
    let mut pixels = Vec::with_capacity(pixel_count);
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        let color = expand_grey7(byte & !GREY7_REPEAT);
        let run = if byte & GREY7_REPEAT != 0 {
            let first = *iter.next().ok_or(CodecError::TruncatedRun)?;
            if first & 0x80 != 0 {
                let second = *iter.next().ok_or(CodecError::TruncatedRun)?;
                (((first & 0x7F) as usize) << 8) | second as usize
            } else {
                first as usize
            }
        } else {
            1
        };
        if pixels.len() + run > pixel_count {
            return Err(CodecError::PayloadOverrun {
                expected: pixel_count,
            }
            .into());
        }
        pixels.resize(pixels.len() + run, color);
    }
    if pixels.len() != pixel_count {
        return Err(CodecError::PayloadUnderrun {
            actual: pixels.len(),
            expected: pixel_count,
        }
        .into());
    }
    Ok(pixels)
}

// =============================================================================
// RGB555: 15-bit colour runs for preview thumbnails
// =============================================================================

/// Repeat flag in the 16-bit colour code.
const RGB555_REPEAT: u16 = 0x8000;
/// Marker bits carried by the 16-bit repeat-count word.
const RGB555_COUNT_MARKER: u16 = 0x3000;

#[inline]
fn quantize_rgb555(r: u8, g: u8, b: u8) -> u16 {
    (((r >> 3) as u16) << 10) | (((g >> 3) as u16) << 5) | ((b >> 3) as u16)
}

#[inline]
fn expand_rgb555(code: u16) -> (u8, u8, u8) {
    let r5 = ((code >> 10) & 0x1F) as u8;
    let g5 = ((code >> 5) & 0x1F) as u8;
    let b5 = (code & 0x1F) as u8;
    // Replicate high bits so full white decodes to full white.
    ((r5 << 3) | (r5 >> 2), (g5 << 3) | (g5 >> 2), (b5 << 3) | (b5 >> 2))
}

/// Encode an RGB888 buffer into rgb555 runs, little-endian on the wire.
///
/// Runs of one or two pixels are literal codes; runs of three or more set
/// the repeat bit and carry a 12-bit count in the following word.
pub fn encode_rgb555(rgb: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgb.len() / 6);
    let mut iter = rgb
        .chunks_exact(3)
        .map(|px| quantize_rgb555(px[0], px[1], px[2]))
        .peekable();
    while let Some(code) = iter.next() {
        let mut run = 1usize;
        while iter.peek() == Some(&code) {
            iter.next();
            run += 1;
        }
        while run > 0 {
            let chunk = run.min(RUN_LIMIT);
            if chunk <= 2 {
                for _ in 0..chunk {
                    out.extend_from_slice(&code.to_le_bytes());
                }
            } else {
                out.extend_from_slice(&(code | RGB555_REPEAT).to_le_bytes());
                out.extend_from_slice(
                    &(RGB555_COUNT_MARKER | chunk as u16).to_le_bytes(),
                );
            }
            run -= chunk;
        }
    }
    out
}

/// Decode rgb555 runs back into an RGB888 buffer of `pixel_count`
/// pixels.
pub fn decode_rgb555(data: &[u8], pixel_count: usize) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(CodecError::TruncatedRun.into());
    }
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    let mut words = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let mut produced = 0usize;
    while let Some(code) = words.next() {
        let run = if code & RGB555_REPEAT != 0 {
            let count = words.next().ok_or(CodecError::TruncatedRun)?;
            (count & 0x0FFF) as usize
        } else {
            1
        };
        if produced + run > pixel_count {
            return Err(CodecError::PayloadOverrun {
                expected: pixel_count,
            }
            .into());
        }
        let (r, g, b) = expand_rgb555(code & !RGB555_REPEAT);
        for _ in 0..run {
            rgb.extend_from_slice(&[r, g, b]);
        }
        produced += run;
    }
    if produced != pixel_count {
        return Err(CodecError::PayloadUnderrun {
            actual: produced,
            expected: pixel_count,
        }
        .into());
    }
    Ok(rgb)
}

// =============================================================================
// LINES: vertical runs with 13/14-bit packed coordinates
// =============================================================================

/// Size of one packed line record on the wire.
pub const LINE_RECORD_LEN: usize = 6;
/// Highest Y coordinate a 13-bit field can carry.
pub const LINE_MAX_Y: u16 = 0x1FFF;
/// Highest X coordinate a 14-bit field can carry.
pub const LINE_MAX_X: u16 = 0x3FFF;

/// Pack one vertical run into its 6-byte record.
///
/// Bytes 0-3 are a big-endian 32-bit word holding start-Y in bits 31..19
/// and end-Y in bits 18..6; the low two bits of end-Y land in the top of
/// byte 3, whose remaining bits start the 14-bit start-X that finishes in
/// byte 4. Byte 5 is the grey value.
pub fn pack_line(start_y: u16, end_y: u16, start_x: u16, grey: u8) -> Result<[u8; LINE_RECORD_LEN]> {
    if start_y > LINE_MAX_Y || end_y > LINE_MAX_Y {
        return Err(CodecError::CoordinateOverflow {
            value: start_y.max(end_y) as u32,
            bits: 13,
        }
        .into());
    }
    if start_x > LINE_MAX_X {
        return Err(CodecError::CoordinateOverflow {
            value: start_x as u32,
            bits: 14,
        }
        .into());
    }
    let head: u32 =
        ((start_y as u32) << 19) | ((end_y as u32) << 6) | ((start_x as u32) >> 8);
    let mut record = [0u8; LINE_RECORD_LEN];
    record[..4].copy_from_slice(&head.to_be_bytes());
    record[4] = start_x as u8;
    record[5] = grey;
    Ok(record)
}

/// Unpack a 6-byte record back into `(start_y, end_y, start_x, grey)`.
pub fn unpack_line(record: &[u8; LINE_RECORD_LEN]) -> (u16, u16, u16, u8) {
    let head = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
    let start_y = ((head >> 19) & 0x1FFF) as u16;
    let end_y = ((head >> 6) & 0x1FFF) as u16;
    let start_x = ((((head & 0x3F) as u16) << 8) | record[4] as u16) & LINE_MAX_X;
    (start_y, end_y, start_x, record[5])
}

/// Encode a raster as packed vertical-run records, column by column.
///
/// Only non-zero runs are stored; the record's Y range is inclusive.
pub fn encode_lines(image: &LayerImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for x in 0..image.width() {
        let mut y = 0u32;
        while y < image.height() {
            let grey = image.pixel(x, y);
            if grey == 0 {
                y += 1;
                continue;
            }
            let start = y;
            while y < image.height() && image.pixel(x, y) == grey {
                y += 1;
            }
            let record = pack_line(start as u16, (y - 1) as u16, x as u16, grey)?;
            out.extend_from_slice(&record);
        }
    }
    Ok(out)
}

/// Decode packed vertical-run records into a raster of the given size.
pub fn decode_lines(data: &[u8], width: u32, height: u32) -> Result<LayerImage> {
    if data.len() % LINE_RECORD_LEN != 0 {
        return Err(CodecError::TruncatedRun.into());
    }
    let mut image = LayerImage::new(width, height);
    for chunk in data.chunks_exact(LINE_RECORD_LEN) {
        let record: &[u8; LINE_RECORD_LEN] = chunk.try_into().expect("chunk size fixed");
        let (start_y, end_y, start_x, grey) = unpack_line(record);
        if start_x as u32 >= width || end_y as u32 >= height || start_y > end_y {
            return Err(CodecError::PayloadOverrun {
                expected: (width * height) as usize,
            }
            .into());
        }
        for y in start_y as u32..=end_y as u32 {
            image.set_pixel(start_x as u32, y, grey);
        }
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_grey7_round_trip_quantized() {
        let pixels = gradient(1000);
        let encoded = encode_grey7(&pixels);
        let decoded = decode_grey7(&encoded, pixels.len()).unwrap();
        for (&original, &restored) in pixels.iter().zip(&decoded) {
            assert_eq!(quantize_grey7(original), quantize_grey7(restored));
        }
    }

    #[test]
    fn test_grey7_reencode_is_byte_identical() {
        let pixels = gradient(4096);
        let first = encode_grey7(&pixels);
        let decoded = decode_grey7(&first, pixels.len()).unwrap();
        let second = encode_grey7(&decoded);
        assert_eq!(first, second);
    }

    #[test]
    fn test_grey7_long_runs_split() {
        let pixels = vec![0x80u8; RUN_LIMIT + 5];
        let encoded = encode_grey7(&pixels);
        let decoded = decode_grey7(&encoded, pixels.len()).unwrap();
        assert!(decoded.iter().all(|&p| p == 0x80));
    }

    #[test]
    fn test_grey7_clamps_bright_values() {
        let encoded = encode_grey7(&[0xFF]);
        let decoded = decode_grey7(&encoded, 1).unwrap();
        assert_eq!(decoded[0], GREY7_MAX << 1);
    }

    #[test]
    fn test_grey7_short_runs_are_literals() {
        // two identical pixels: two literal bytes, no repeat flag
        let encoded = encode_grey7(&[0x40, 0x40]);
        assert_eq!(encoded, vec![0x20, 0x20]);
        // three identical pixels: flagged colour plus one count byte
        let encoded = encode_grey7(&[0x40, 0x40, 0x40]);
        assert_eq!(encoded, vec![0x20 | GREY7_REPEAT, 3]);
    }

    #[test]
    fn test_grey7_overrun_detected() {
        let encoded = encode_grey7(&[7u8; 100]);
        let err = decode_grey7(&encoded, 50).unwrap_err();
        assert!(err.is_codec_error());
    }

    #[test]
    fn test_grey7_underrun_detected() {
        let encoded = encode_grey7(&[7u8; 50]);
        let err = decode_grey7(&encoded, 100).unwrap_err();
        assert!(err.is_codec_error());
    }

    #[test]
    fn test_rgb555_round_trip() {
        let mut rgb = Vec::new();
        for i in 0..500u32 {
            rgb.extend_from_slice(&[(i % 256) as u8, (i / 2 % 256) as u8, 0xF8]);
        }
        let encoded = encode_rgb555(&rgb);
        let decoded = decode_rgb555(&encoded, 500).unwrap();
        let reencoded = encode_rgb555(&decoded);
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn test_rgb555_run_convention() {
        // three identical pixels: flagged code + count word
        let rgb = [0xF8u8, 0x00, 0x00, 0xF8, 0x00, 0x00, 0xF8, 0x00, 0x00];
        let encoded = encode_rgb555(&rgb);
        assert_eq!(encoded.len(), 4);
        let code = u16::from_le_bytes([encoded[0], encoded[1]]);
        let count = u16::from_le_bytes([encoded[2], encoded[3]]);
        assert_ne!(code & RGB555_REPEAT, 0);
        assert_eq!(count, RGB555_COUNT_MARKER | 3);
    }

    #[test]
    fn test_rgb555_white_stays_white() {
        let rgb = [0xFFu8, 0xFF, 0xFF];
        let encoded = encode_rgb555(&rgb);
        let decoded = decode_rgb555(&encoded, 1).unwrap();
        assert_eq!(&decoded, &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_pack_line_bit_layout() {
        // Worked example: every field at its maximum.
        let record = pack_line(LINE_MAX_Y, LINE_MAX_Y, LINE_MAX_X, 0xAB).unwrap();
        assert_eq!(record, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xAB]);
        let record = pack_line(1, 2, 3, 4).unwrap();
        // startY=1 -> bits 31..19, endY=2 -> bits 18..6, startX=3 -> low 14
        let head = (1u32 << 19) | (2 << 6);
        let mut expected = [0u8; 6];
        expected[..4].copy_from_slice(&head.to_be_bytes());
        expected[4] = 3;
        expected[5] = 4;
        assert_eq!(record, expected);
    }

    #[test]
    fn test_pack_unpack_exhaustive_corners() {
        for &start_y in &[0u16, 1, 0x1000, LINE_MAX_Y] {
            for &end_y in &[0u16, 0x0FFF, LINE_MAX_Y] {
                for &start_x in &[0u16, 1, 0x2AAA, LINE_MAX_X] {
                    let record = pack_line(start_y, end_y, start_x, 0x55).unwrap();
                    assert_eq!(
                        unpack_line(&record),
                        (start_y, end_y, start_x, 0x55),
                        "y {start_y}..{end_y} x {start_x}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_pack_line_rejects_overflow() {
        assert!(pack_line(LINE_MAX_Y + 1, 0, 0, 0).is_err());
        assert!(pack_line(0, 0, LINE_MAX_X + 1, 0).is_err());
    }

    #[test]
    fn test_lines_round_trip() {
        let mut image = LayerImage::new(32, 32);
        for y in 4..20 {
            image.set_pixel(7, y, 0xC8);
        }
        for y in 0..5 {
            image.set_pixel(20, y, 0x32);
        }
        image.set_pixel(31, 31, 0xFF);
        let encoded = encode_lines(&image).unwrap();
        assert_eq!(encoded.len(), 3 * LINE_RECORD_LEN);
        let decoded = decode_lines(&encoded, 32, 32).unwrap();
        assert_eq!(decoded.pixels(), image.pixels());
    }

    #[test]
    fn test_lines_out_of_bounds_rejected() {
        let record = pack_line(0, 10, 3, 0xFF).unwrap();
        assert!(decode_lines(&record, 4, 4).is_err());
    }
}
