//! Layer entity
//!
//! One printable slice of a job: an image payload that is either a decoded
//! 8-bit greyscale raster or the retained compressed wire bytes (never
//! both), a Z position, and a full copy of the motion/exposure parameter
//! set so a layer can diverge from the file's global values.
//!
//! A layer does not hold a reference to its owning document; the document
//! is passed by reference into any method that needs global fallback
//! values, and indices are reassigned whenever the layer array is rebuilt.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Axis-aligned bounding rectangle of the lit pixels of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge, pixels.
    pub x: u32,
    /// Top edge, pixels.
    pub y: u32,
    /// Width, pixels.
    pub width: u32,
    /// Height, pixels.
    pub height: u32,
}

/// An owned 8-bit greyscale raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl LayerImage {
    /// Create a black raster of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    /// Wrap an existing pixel buffer. The buffer length must be
    /// `width * height`.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != width as usize * height as usize {
            return Err(CodecError::PayloadUnderrun {
                actual: pixels.len(),
                expected: width as usize * height as usize,
            }
            .into());
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Raster width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Raster height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The full pixel buffer, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable access to the pixel buffer, row-major.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Single pixel read. Callers must stay in bounds.
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Single pixel write. Callers must stay in bounds.
    pub fn set_pixel(&mut self, x: u32, y: u32, value: u8) {
        self.pixels[y as usize * self.width as usize + x as usize] = value;
    }

    /// One row of pixels.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.width as usize;
        &self.pixels[start..start + self.width as usize]
    }
}

/// Lazily computed per-layer statistics used by downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerMetrics {
    /// Bounding rectangle of lit pixels, if any pixel is lit.
    pub bounds: Option<Rect>,
    /// Number of pixels with a non-zero value.
    pub lit_pixels: u64,
}

/// The image payload of a layer.
///
/// The decoded raster and the retained compressed form are mutually
/// exclusive: materializing one drops the other.
#[derive(Debug, Clone, Default)]
enum LayerPayload {
    /// No image yet (freshly initialized layer).
    #[default]
    Empty,
    /// Decoded 8-bit raster.
    Raster(LayerImage),
    /// Compressed bytes exactly as read from (or destined for) the wire.
    Encoded(Vec<u8>),
}

/// Per-layer copy of the motion/exposure parameter set.
///
/// Field meanings mirror the global parameters; see the format headers in
/// `resinkit-formats` for the wire representations.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerSettings {
    /// Absolute Z position of the top of this layer, millimeters.
    pub position_z: f32,
    /// Exposure time, seconds.
    pub exposure_time: f32,
    /// Wait before curing, seconds.
    pub wait_before_cure: f32,
    /// Wait after curing, seconds.
    pub wait_after_cure: f32,
    /// Wait after the lift move, seconds.
    pub wait_after_lift: f32,
    /// Light-off delay, seconds.
    pub light_off_delay: f32,
    /// First-stage lift height, millimeters.
    pub lift_height: f32,
    /// First-stage lift speed, millimeters/minute.
    pub lift_speed: f32,
    /// Second-stage lift height, millimeters.
    pub lift_height2: f32,
    /// Second-stage lift speed, millimeters/minute.
    pub lift_speed2: f32,
    /// Lift acceleration, mm/s²; 0 leaves the firmware default.
    pub lift_acceleration: f32,
    /// First-stage retract speed, millimeters/minute.
    pub retract_speed: f32,
    /// Retract acceleration, mm/s²; 0 leaves the firmware default.
    pub retract_acceleration: f32,
    /// Second-stage retract height, millimeters.
    pub retract_height2: f32,
    /// Second-stage retract speed, millimeters/minute.
    pub retract_speed2: f32,
    /// UV light PWM, 0-255.
    pub light_pwm: u8,
}

impl LayerSettings {
    /// Total lift travel across both stages, millimeters.
    pub fn total_lift_height(&self) -> f32 {
        self.lift_height + self.lift_height2
    }

    /// Seconds spent in lift and retract motion for this layer.
    ///
    /// Speeds are mm/min; a zero speed contributes no time rather than
    /// dividing by zero. The first retract stage covers whatever travel the
    /// second stage does not.
    pub fn motion_seconds(&self) -> f32 {
        let retract_height = (self.total_lift_height() - self.retract_height2).max(0.0);
        let mut minutes = 0.0;
        for (height, speed) in [
            (self.lift_height, self.lift_speed),
            (self.lift_height2, self.lift_speed2),
            (retract_height, self.retract_speed),
            (self.retract_height2, self.retract_speed2),
        ] {
            if speed > 0.0 {
                minutes += height / speed;
            }
        }
        minutes * 60.0
    }
}

/// One printable slice.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    index: u32,
    /// The materialized parameter set for this layer.
    pub settings: LayerSettings,
    custom_settings: bool,
    payload: LayerPayload,
    metrics: Option<LayerMetrics>,
}

impl Layer {
    /// Create an empty layer at the given index.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Index of this layer within its document.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reassign the index. Called by the document whenever the layer array
    /// is rebuilt.
    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    /// Whether this layer carries an explicit per-layer parameter override
    /// that property rebuilds must not overwrite.
    pub fn has_custom_settings(&self) -> bool {
        self.custom_settings
    }

    /// Mark this layer as carrying explicit per-layer overrides.
    pub fn set_custom_settings(&mut self, custom: bool) {
        self.custom_settings = custom;
    }

    /// The decoded raster, if the payload is currently in raster form.
    pub fn raster(&self) -> Option<&LayerImage> {
        match &self.payload {
            LayerPayload::Raster(image) => Some(image),
            _ => None,
        }
    }

    /// The retained compressed bytes, if the payload is in wire form.
    pub fn encoded(&self) -> Option<&[u8]> {
        match &self.payload {
            LayerPayload::Encoded(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether this layer has any payload at all.
    pub fn has_payload(&self) -> bool {
        !matches!(self.payload, LayerPayload::Empty)
    }

    /// Install a decoded raster, dropping any retained compressed bytes.
    pub fn set_raster(&mut self, image: LayerImage) {
        self.payload = LayerPayload::Raster(image);
        self.metrics = None;
    }

    /// Install compressed wire bytes, dropping any decoded raster.
    pub fn set_encoded(&mut self, bytes: Vec<u8>) {
        self.payload = LayerPayload::Encoded(bytes);
        self.metrics = None;
    }

    /// Materialize the raster through `decode`, consuming the retained
    /// compressed form. A no-op when the raster is already present.
    pub fn materialize_raster<F>(&mut self, decode: F) -> Result<&LayerImage>
    where
        F: FnOnce(&[u8]) -> Result<LayerImage>,
    {
        if let LayerPayload::Encoded(bytes) = &self.payload {
            let image = decode(bytes)?;
            self.payload = LayerPayload::Raster(image);
            self.metrics = None;
        }
        match &self.payload {
            LayerPayload::Raster(image) => Ok(image),
            _ => Err(CodecError::PayloadUnderrun {
                actual: 0,
                expected: 0,
            }
            .into()),
        }
    }

    /// Bounding rectangle and lit-pixel count, computed on first use and
    /// cached until the payload changes.
    ///
    /// Returns the default (no bounds, zero pixels) when only the
    /// compressed form is held and nothing was cached at decode time.
    pub fn metrics(&mut self) -> LayerMetrics {
        if let Some(metrics) = self.metrics {
            return metrics;
        }
        let metrics = match &self.payload {
            LayerPayload::Raster(image) => compute_metrics(image),
            _ => LayerMetrics::default(),
        };
        self.metrics = Some(metrics);
        metrics
    }

    /// Whether the layer has more than one lit pixel; layers at or below
    /// one lit pixel are treated as empty/dummy for Z-ordering purposes.
    pub fn is_printable(&mut self) -> bool {
        self.metrics().lit_pixels > 1
    }
}

fn compute_metrics(image: &LayerImage) -> LayerMetrics {
    let mut lit = 0u64;
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    for y in 0..image.height() {
        for (x, &value) in image.row(y).iter().enumerate() {
            if value != 0 {
                let x = x as u32;
                lit += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }
    let bounds = (lit > 0).then(|| Rect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    });
    LayerMetrics {
        bounds,
        lit_pixels: lit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_exclusivity() {
        let mut layer = Layer::new(0);
        layer.set_encoded(vec![1, 2, 3]);
        assert!(layer.raster().is_none());
        layer
            .materialize_raster(|_| LayerImage::from_pixels(2, 2, vec![0, 255, 0, 0]))
            .unwrap();
        assert!(layer.encoded().is_none());
        assert!(layer.raster().is_some());
        layer.set_encoded(vec![9]);
        assert!(layer.raster().is_none());
    }

    #[test]
    fn test_metrics_bounds() {
        let mut layer = Layer::new(0);
        let mut image = LayerImage::new(4, 4);
        image.set_pixel(1, 1, 128);
        image.set_pixel(2, 3, 255);
        layer.set_raster(image);
        let metrics = layer.metrics();
        assert_eq!(metrics.lit_pixels, 2);
        assert_eq!(
            metrics.bounds,
            Some(Rect {
                x: 1,
                y: 1,
                width: 2,
                height: 3
            })
        );
    }

    #[test]
    fn test_motion_seconds_ignores_zero_speeds() {
        let settings = LayerSettings {
            lift_height: 6.0,
            lift_speed: 60.0,
            retract_speed: 0.0,
            ..LayerSettings::default()
        };
        assert!((settings.motion_seconds() - 6.0).abs() < 1e-6);
    }
}
