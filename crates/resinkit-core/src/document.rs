//! Unified job document
//!
//! The canonical in-memory model of a printable job. Every format codec
//! reads *from* and writes *into* this one struct; no format keeps a
//! parallel copy of resolution, display size or timing values.
//!
//! The document owns the ordered layer array, the preview thumbnails and
//! the optional embedded G-Code program, and implements the
//! bottom/normal/transition resolution rules that turn the global
//! parameter set into per-layer values.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FormatError, Result};
use crate::layer::{Layer, LayerSettings};
use crate::params::{
    fits_decimals, round_to, Capabilities, Parameter, ParameterChange,
};

/// Decimal places kept for display size values, millimeters.
pub const DISPLAY_DECIMALS: u32 = 2;
/// Maximum decimal digits a layer height may carry; more is a decode error.
pub const LAYER_HEIGHT_DECIMALS: u32 = 3;
/// PWM value used when a file stores the never-legal persisted value 0.
pub const DEFAULT_LIGHT_PWM: u8 = 255;

/// A decoded preview image, RGB888 row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// RGB888 pixel data, 3 bytes per pixel, row-major.
    pub rgb: Vec<u8>,
}

/// Serializable snapshot of a document's global state, used by the CLI
/// `inspect` command and by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    /// Machine name the file targets.
    pub machine_name: String,
    /// Printer resolution, pixels.
    pub resolution: (u32, u32),
    /// Display size, millimeters.
    pub display: (f32, f32),
    /// Layer height, millimeters.
    pub layer_height: f32,
    /// Total number of layers.
    pub layer_count: u32,
    /// Number of bottom layers.
    pub bottom_layer_count: u32,
    /// Number of software transition layers.
    pub transition_layer_count: u32,
    /// Exposure time for normal layers, seconds.
    pub exposure_time: f32,
    /// Exposure time for bottom layers, seconds.
    pub bottom_exposure_time: f32,
    /// Estimated print time, seconds.
    pub print_time: f32,
    /// Estimated resin volume, milliliters.
    pub volume_ml: f32,
    /// Estimated resin weight, grams.
    pub weight_g: f32,
    /// Estimated material cost in the user's currency.
    pub cost: f32,
    /// File format version.
    pub version: u32,
}

/// The unified file model.
///
/// Scalar globals are public: format codecs fill them on decode and read
/// them on encode. The layer array is private because every structural
/// mutation must reassign indices and re-derive layer settings.
#[derive(Debug, Clone)]
pub struct JobDocument {
    capabilities: Capabilities,

    /// Machine name the file targets.
    pub machine_name: String,
    /// File creation timestamp, `%Y-%m-%d %H:%M:%S`.
    pub created_at: String,
    /// Printer X resolution, pixels.
    pub resolution_x: u32,
    /// Printer Y resolution, pixels.
    pub resolution_y: u32,
    /// Display width, millimeters.
    pub display_width: f32,
    /// Display height, millimeters.
    pub display_height: f32,
    /// Build volume height, millimeters.
    pub machine_z: f32,
    /// Layer height, millimeters.
    pub layer_height: f32,
    /// Anti-aliasing level the slicer used (1 = off).
    pub anti_alias_level: u32,
    /// Format-specific file version.
    pub version: u32,

    /// Number of bottom layers.
    pub bottom_layer_count: u32,
    /// Number of software transition layers.
    pub transition_layer_count: u32,

    /// Exposure time for bottom layers, seconds.
    pub bottom_exposure_time: f32,
    /// Exposure time for normal layers, seconds.
    pub exposure_time: f32,
    /// Wait before cure for bottom layers, seconds.
    pub bottom_wait_before_cure: f32,
    /// Wait before cure for normal layers, seconds.
    pub wait_before_cure: f32,
    /// Wait after cure for bottom layers, seconds.
    pub bottom_wait_after_cure: f32,
    /// Wait after cure for normal layers, seconds.
    pub wait_after_cure: f32,
    /// Wait after lift for bottom layers, seconds.
    pub bottom_wait_after_lift: f32,
    /// Wait after lift for normal layers, seconds.
    pub wait_after_lift: f32,
    /// Light-off delay for bottom layers, seconds.
    pub bottom_light_off_delay: f32,
    /// Light-off delay for normal layers, seconds.
    pub light_off_delay: f32,

    /// First-stage lift height for bottom layers, millimeters.
    pub bottom_lift_height: f32,
    /// First-stage lift height for normal layers, millimeters.
    pub lift_height: f32,
    /// First-stage lift speed for bottom layers, mm/min.
    pub bottom_lift_speed: f32,
    /// First-stage lift speed for normal layers, mm/min.
    pub lift_speed: f32,
    /// Second-stage lift height for bottom layers, millimeters.
    pub bottom_lift_height2: f32,
    /// Second-stage lift height for normal layers, millimeters.
    pub lift_height2: f32,
    /// Second-stage lift speed for bottom layers, mm/min.
    pub bottom_lift_speed2: f32,
    /// Second-stage lift speed for normal layers, mm/min.
    pub lift_speed2: f32,
    /// Lift acceleration for bottom layers, mm/s² (0 = firmware default).
    pub bottom_lift_acceleration: f32,
    /// Lift acceleration for normal layers, mm/s² (0 = firmware default).
    pub lift_acceleration: f32,
    /// First-stage retract speed for bottom layers, mm/min.
    pub bottom_retract_speed: f32,
    /// First-stage retract speed for normal layers, mm/min.
    pub retract_speed: f32,
    /// Retract acceleration for bottom layers, mm/s² (0 = firmware default).
    pub bottom_retract_acceleration: f32,
    /// Retract acceleration for normal layers, mm/s² (0 = firmware default).
    pub retract_acceleration: f32,
    /// Second-stage retract height for bottom layers, millimeters.
    pub bottom_retract_height2: f32,
    /// Second-stage retract height for normal layers, millimeters.
    pub retract_height2: f32,
    /// Second-stage retract speed for bottom layers, mm/min.
    pub bottom_retract_speed2: f32,
    /// Second-stage retract speed for normal layers, mm/min.
    pub retract_speed2: f32,

    /// UV light PWM for bottom layers, 0-255.
    pub bottom_light_pwm: u8,
    /// UV light PWM for normal layers, 0-255.
    pub light_pwm: u8,

    /// Estimated resin volume, milliliters.
    pub volume_ml: f32,
    /// Estimated resin weight, grams.
    pub weight_g: f32,
    /// Estimated material cost.
    pub cost: f32,
    /// Estimated print time, seconds.
    pub print_time: f32,

    layers: Vec<Layer>,
    /// Preview images, largest first.
    pub thumbnails: Vec<Thumbnail>,

    gcode_text: Option<String>,
    gcode_dirty: bool,
    rebuild_suppressed: u32,
    partial: bool,
    pixels_dirty: bool,
}

impl JobDocument {
    /// Create an empty document for a format with the given capabilities.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            machine_name: String::from("default"),
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            resolution_x: 0,
            resolution_y: 0,
            display_width: 0.0,
            display_height: 0.0,
            machine_z: 0.0,
            layer_height: 0.05,
            anti_alias_level: 1,
            version: 0,
            bottom_layer_count: 4,
            transition_layer_count: 0,
            bottom_exposure_time: 35.0,
            exposure_time: 7.0,
            bottom_wait_before_cure: 0.0,
            wait_before_cure: 0.0,
            bottom_wait_after_cure: 0.0,
            wait_after_cure: 0.0,
            bottom_wait_after_lift: 0.0,
            wait_after_lift: 0.0,
            bottom_light_off_delay: 0.0,
            light_off_delay: 0.0,
            bottom_lift_height: 6.0,
            lift_height: 6.0,
            bottom_lift_speed: 60.0,
            lift_speed: 60.0,
            bottom_lift_height2: 0.0,
            lift_height2: 0.0,
            bottom_lift_speed2: 0.0,
            lift_speed2: 0.0,
            bottom_lift_acceleration: 0.0,
            lift_acceleration: 0.0,
            bottom_retract_speed: 150.0,
            retract_speed: 150.0,
            bottom_retract_acceleration: 0.0,
            retract_acceleration: 0.0,
            bottom_retract_height2: 0.0,
            retract_height2: 0.0,
            bottom_retract_speed2: 0.0,
            retract_speed2: 0.0,
            bottom_light_pwm: DEFAULT_LIGHT_PWM,
            light_pwm: DEFAULT_LIGHT_PWM,
            volume_ml: 0.0,
            weight_g: 0.0,
            cost: 0.0,
            print_time: 0.0,
            layers: Vec::new(),
            thumbnails: Vec::new(),
            gcode_text: None,
            gcode_dirty: true,
            rebuild_suppressed: 0,
            partial: false,
            pixels_dirty: false,
        }
    }

    /// The capability set of the format this document belongs to.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Number of layers.
    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// The ordered layer array.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// A single layer.
    pub fn layer(&self, index: u32) -> Option<&Layer> {
        self.layers.get(index as usize)
    }

    /// Mutable access to a single layer's payload/settings.
    ///
    /// Structural mutation (insert/remove/resize) must go through
    /// [`set_layers`](Self::set_layers) instead.
    pub fn layer_mut(&mut self, index: u32) -> Option<&mut Layer> {
        self.layers.get_mut(index as usize)
    }

    /// Record that some layer's pixel data changed since decode. This
    /// invalidates partial saves.
    pub fn mark_pixels_dirty(&mut self) {
        self.pixels_dirty = true;
    }

    /// Whether any layer pixel data changed since decode.
    pub fn pixels_dirty(&self) -> bool {
        self.pixels_dirty
    }

    /// Whether the document was decoded in metadata-only mode.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Flag the document as decoded in metadata-only mode. Full encodes
    /// are refused until a full decode replaces it.
    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    /// Allocate `layer_count` default layers, replacing any existing
    /// array, and derive their settings from the global values.
    pub fn init(&mut self, layer_count: u32) {
        self.layers = (0..layer_count).map(Layer::new).collect();
        self.rebuild_layer_settings();
    }

    /// Replace the whole layer array. Indices are reassigned and layer
    /// settings re-derived; this is the only structural mutation path.
    pub fn set_layers(&mut self, mut layers: Vec<Layer>) {
        for (index, layer) in layers.iter_mut().enumerate() {
            layer.set_index(index as u32);
        }
        self.layers = layers;
        self.rebuild_layer_settings();
    }

    /// Whether the layer at `index` belongs to the bottom block.
    pub fn is_bottom_layer(&self, index: u32) -> bool {
        index < self.bottom_layer_count
    }

    // =========================================================================
    // PARAMETER REGISTRY ACCESS
    // =========================================================================

    /// Read a global parameter, or `None` when the format does not support
    /// it. Unsupported parameters are a no-op by design, not an error.
    pub fn parameter(&self, parameter: Parameter) -> Option<f32> {
        if !self.capabilities.supports(parameter) {
            return None;
        }
        Some(self.parameter_unchecked(parameter))
    }

    /// Write a global parameter. Returns the applied change, or `None`
    /// when the format does not support the parameter.
    ///
    /// The value is clamped and rounded per the registry metadata, derived
    /// state is recomputed, and the layer settings are rebuilt unless a
    /// batch mutation is in progress.
    pub fn set_parameter(&mut self, parameter: Parameter, value: f32) -> Option<ParameterChange> {
        if !self.capabilities.supports(parameter) {
            return None;
        }
        let old = self.parameter_unchecked(parameter);
        let new = parameter.meta().sanitize(value);
        self.store_parameter(parameter, new);
        self.gcode_dirty = true;
        if self.rebuild_suppressed == 0 {
            self.rebuild_layer_settings();
        }
        Some(ParameterChange {
            parameter,
            old,
            new,
        })
    }

    fn parameter_unchecked(&self, parameter: Parameter) -> f32 {
        use Parameter::*;
        match parameter {
            BottomLayerCount => self.bottom_layer_count as f32,
            TransitionLayerCount => self.transition_layer_count as f32,
            BottomExposureTime => self.bottom_exposure_time,
            ExposureTime => self.exposure_time,
            BottomWaitBeforeCure => self.bottom_wait_before_cure,
            WaitBeforeCure => self.wait_before_cure,
            BottomWaitAfterCure => self.bottom_wait_after_cure,
            WaitAfterCure => self.wait_after_cure,
            BottomWaitAfterLift => self.bottom_wait_after_lift,
            WaitAfterLift => self.wait_after_lift,
            BottomLightOffDelay => self.bottom_light_off_delay,
            LightOffDelay => self.light_off_delay,
            BottomLiftHeight => self.bottom_lift_height,
            LiftHeight => self.lift_height,
            BottomLiftSpeed => self.bottom_lift_speed,
            LiftSpeed => self.lift_speed,
            BottomLiftHeight2 => self.bottom_lift_height2,
            LiftHeight2 => self.lift_height2,
            BottomLiftSpeed2 => self.bottom_lift_speed2,
            LiftSpeed2 => self.lift_speed2,
            BottomLiftAcceleration => self.bottom_lift_acceleration,
            LiftAcceleration => self.lift_acceleration,
            BottomRetractSpeed => self.bottom_retract_speed,
            RetractSpeed => self.retract_speed,
            BottomRetractAcceleration => self.bottom_retract_acceleration,
            RetractAcceleration => self.retract_acceleration,
            BottomRetractHeight2 => self.bottom_retract_height2,
            RetractHeight2 => self.retract_height2,
            BottomRetractSpeed2 => self.bottom_retract_speed2,
            RetractSpeed2 => self.retract_speed2,
            BottomLightPwm => self.bottom_light_pwm as f32,
            LightPwm => self.light_pwm as f32,
        }
    }

    fn store_parameter(&mut self, parameter: Parameter, value: f32) {
        use Parameter::*;
        match parameter {
            BottomLayerCount => self.bottom_layer_count = value as u32,
            TransitionLayerCount => {
                self.transition_layer_count = (value as u32).min(self.max_transition_layers())
            }
            BottomExposureTime => self.bottom_exposure_time = value,
            ExposureTime => self.exposure_time = value,
            BottomWaitBeforeCure => self.bottom_wait_before_cure = value,
            WaitBeforeCure => self.wait_before_cure = value,
            BottomWaitAfterCure => self.bottom_wait_after_cure = value,
            WaitAfterCure => self.wait_after_cure = value,
            BottomWaitAfterLift => self.bottom_wait_after_lift = value,
            WaitAfterLift => self.wait_after_lift = value,
            BottomLightOffDelay => self.bottom_light_off_delay = value,
            LightOffDelay => self.light_off_delay = value,
            BottomLiftHeight => self.bottom_lift_height = value,
            LiftHeight => self.lift_height = value,
            BottomLiftSpeed => self.bottom_lift_speed = value,
            LiftSpeed => self.lift_speed = value,
            BottomLiftHeight2 => self.bottom_lift_height2 = value,
            LiftHeight2 => self.lift_height2 = value,
            BottomLiftSpeed2 => self.bottom_lift_speed2 = value,
            LiftSpeed2 => self.lift_speed2 = value,
            BottomLiftAcceleration => self.bottom_lift_acceleration = value,
            LiftAcceleration => self.lift_acceleration = value,
            BottomRetractSpeed => self.bottom_retract_speed = value,
            RetractSpeed => self.retract_speed = value,
            BottomRetractAcceleration => self.bottom_retract_acceleration = value,
            RetractAcceleration => self.retract_acceleration = value,
            BottomRetractHeight2 => self.bottom_retract_height2 = value,
            RetractHeight2 => self.retract_height2 = value,
            BottomRetractSpeed2 => self.bottom_retract_speed2 = value,
            RetractSpeed2 => self.retract_speed2 = value,
            BottomLightPwm => self.bottom_light_pwm = value as u8,
            LightPwm => self.light_pwm = value as u8,
        }
    }

    /// Run a batch of mutations with layer-settings rebuilds suppressed,
    /// then optionally force a single rebuild at the end.
    pub fn batch_mutate<R>(&mut self, rebuild_after: bool, f: impl FnOnce(&mut Self) -> R) -> R {
        self.rebuild_suppressed += 1;
        let result = f(self);
        self.rebuild_suppressed -= 1;
        if rebuild_after && self.rebuild_suppressed == 0 {
            self.rebuild_layer_settings();
        }
        result
    }

    // =========================================================================
    // BOTTOM / NORMAL / TRANSITION RESOLUTION
    // =========================================================================

    /// Upper bound for software transition layers.
    pub fn max_transition_layers(&self) -> u32 {
        (self.layer_count())
            .saturating_sub(self.bottom_layer_count)
            .saturating_sub(1)
    }

    /// Effective exposure time for a layer index, applying the bottom
    /// block and the software transition fade.
    pub fn exposure_for_layer(&self, index: u32) -> f32 {
        if self.is_bottom_layer(index) {
            return self.bottom_exposure_time;
        }
        let fade = self.transition_layer_count.min(self.max_transition_layers());
        let position = index - self.bottom_layer_count;
        if position < fade {
            let span = self.bottom_exposure_time - self.exposure_time;
            let step = span / (fade + 1) as f32;
            return round_to(
                self.bottom_exposure_time - step * (position + 1) as f32,
                2,
            );
        }
        self.exposure_time
    }

    /// The full derived parameter set for a layer index, resolved from the
    /// bottom or normal global values.
    pub fn settings_for_layer(&self, index: u32) -> LayerSettings {
        let bottom = self.is_bottom_layer(index);
        let pick = |b: f32, n: f32| if bottom { b } else { n };
        LayerSettings {
            position_z: round_to(self.layer_height * (index + 1) as f32, LAYER_HEIGHT_DECIMALS),
            exposure_time: self.exposure_for_layer(index),
            wait_before_cure: pick(self.bottom_wait_before_cure, self.wait_before_cure),
            wait_after_cure: pick(self.bottom_wait_after_cure, self.wait_after_cure),
            wait_after_lift: pick(self.bottom_wait_after_lift, self.wait_after_lift),
            light_off_delay: pick(self.bottom_light_off_delay, self.light_off_delay),
            lift_height: pick(self.bottom_lift_height, self.lift_height),
            lift_speed: pick(self.bottom_lift_speed, self.lift_speed),
            lift_height2: pick(self.bottom_lift_height2, self.lift_height2),
            lift_speed2: pick(self.bottom_lift_speed2, self.lift_speed2),
            lift_acceleration: pick(self.bottom_lift_acceleration, self.lift_acceleration),
            retract_speed: pick(self.bottom_retract_speed, self.retract_speed),
            retract_acceleration: pick(
                self.bottom_retract_acceleration,
                self.retract_acceleration,
            ),
            retract_height2: pick(self.bottom_retract_height2, self.retract_height2),
            retract_speed2: pick(self.bottom_retract_speed2, self.retract_speed2),
            light_pwm: if bottom {
                self.bottom_light_pwm
            } else {
                self.light_pwm
            },
        }
    }

    /// Re-derive every layer's parameter set from the global values.
    ///
    /// Layers flagged with explicit per-layer overrides are left alone; a
    /// wire-carried non-zero Z is preserved.
    pub fn rebuild_layer_settings(&mut self) {
        for index in 0..self.layers.len() {
            if self.layers[index].has_custom_settings() {
                continue;
            }
            let mut settings = self.settings_for_layer(index as u32);
            let existing_z = self.layers[index].settings.position_z;
            if existing_z > 0.0 {
                settings.position_z = existing_z;
            }
            self.layers[index].settings = settings;
        }
        self.gcode_dirty = true;
    }

    // =========================================================================
    // DECODE-TIME SANITIZATION
    // =========================================================================

    /// Global-parameter sanitization run after a successful decode.
    ///
    /// * a zero light PWM is replaced with the format default (0 is never
    ///   a legal persisted value)
    /// * when layer 0 sits at exactly Z 0, every layer is shifted up one
    ///   layer height ("no Z baked in" means "Z starts at one layer height")
    /// * the software transition count is inferred from the actual
    ///   per-layer exposure decay when the file does not store one
    pub fn sanitize_after_decode(&mut self) -> Result<()> {
        if !fits_decimals(self.layer_height, LAYER_HEIGHT_DECIMALS) {
            return Err(FormatError::LayerHeightPrecision {
                value: self.layer_height,
                max_decimals: LAYER_HEIGHT_DECIMALS,
            }
            .into());
        }

        self.display_width = round_to(self.display_width, DISPLAY_DECIMALS);
        self.display_height = round_to(self.display_height, DISPLAY_DECIMALS);

        if self.light_pwm == 0 {
            warn!("light PWM of 0 replaced with default {}", DEFAULT_LIGHT_PWM);
            self.light_pwm = DEFAULT_LIGHT_PWM;
        }
        if self.bottom_light_pwm == 0 {
            self.bottom_light_pwm = DEFAULT_LIGHT_PWM;
        }

        if let Some(first) = self.layers.first() {
            if first.settings.position_z == 0.0 {
                debug!("layer 0 has Z 0, shifting all layers up one layer height");
                let height = self.layer_height;
                for layer in &mut self.layers {
                    layer.settings.position_z =
                        round_to(layer.settings.position_z + height, LAYER_HEIGHT_DECIMALS);
                }
            }
        }

        if self.transition_layer_count == 0 {
            self.transition_layer_count = self.infer_transition_layers();
            if self.transition_layer_count > 0 {
                debug!(
                    "inferred {} transition layers from exposure decay",
                    self.transition_layer_count
                );
            }
        }

        self.validate_z_order()?;
        Ok(())
    }

    /// Count layers after the bottom block whose exposure fades strictly
    /// from the bottom value toward the normal value.
    fn infer_transition_layers(&self) -> u32 {
        let mut count = 0u32;
        let mut previous = self.bottom_exposure_time;
        for layer in self.layers.iter().skip(self.bottom_layer_count as usize) {
            let exposure = layer.settings.exposure_time;
            if exposure < previous && exposure > self.exposure_time {
                count += 1;
                previous = exposure;
            } else {
                break;
            }
        }
        count.min(self.max_transition_layers())
    }

    /// Fail when two consecutive printable layers have decreasing Z.
    ///
    /// Layers with at most one lit pixel are dummy layers and may share or
    /// repeat a Z position.
    pub fn validate_z_order(&mut self) -> Result<()> {
        let mut previous_z = 0.0f32;
        for index in 0..self.layers.len() {
            let printable = self.layers[index].is_printable();
            let z = self.layers[index].settings.position_z;
            if printable {
                if z < previous_z {
                    return Err(FormatError::ZInconsistency {
                        index: index as u32,
                        z,
                        previous_z,
                    }
                    .into());
                }
                previous_z = z;
            }
        }
        Ok(())
    }

    /// Resolve a zero resolution from the first decoded raster, or fail.
    pub fn resolve_resolution(&mut self) -> Result<()> {
        if self.resolution_x != 0 && self.resolution_y != 0 {
            return Ok(());
        }
        let raster = self
            .layers
            .iter()
            .find_map(|layer| layer.raster())
            .ok_or(FormatError::UnresolvableResolution)?;
        self.resolution_x = raster.width();
        self.resolution_y = raster.height();
        debug!(
            "resolution inferred from first raster: {}x{}",
            self.resolution_x, self.resolution_y
        );
        Ok(())
    }

    // =========================================================================
    // ENCODE-TIME PREPARATION
    // =========================================================================

    /// The "before encode" pass.
    ///
    /// When the target format stores only a light-off delay, a non-zero
    /// wait-before-cure is folded into an equivalent light-off delay (wait
    /// plus motion time). The reverse direction is never synthesized; the
    /// asymmetry matches the firmware the files feed.
    pub fn apply_before_encode(&mut self) {
        if self.capabilities.supports_wait_before_cure
            || !self.capabilities.supports_light_off_delay
        {
            return;
        }
        self.batch_mutate(true, |doc| {
            if doc.wait_before_cure > 0.0 {
                let motion = doc.settings_for_layer(doc.bottom_layer_count).motion_seconds();
                doc.light_off_delay = round_to(doc.wait_before_cure + motion, 2);
                doc.wait_before_cure = 0.0;
            }
            if doc.bottom_wait_before_cure > 0.0 {
                let motion = doc.settings_for_layer(0).motion_seconds();
                doc.bottom_light_off_delay = round_to(doc.bottom_wait_before_cure + motion, 2);
                doc.bottom_wait_before_cure = 0.0;
            }
        });
    }

    // =========================================================================
    // DERIVED ESTIMATES
    // =========================================================================

    /// Area of one pixel, square millimeters. Zero when the display size
    /// is unknown.
    pub fn pixel_area_mm2(&self) -> f32 {
        if self.resolution_x == 0 || self.resolution_y == 0 {
            return 0.0;
        }
        (self.display_width / self.resolution_x as f32)
            * (self.display_height / self.resolution_y as f32)
    }

    /// Recompute material volume (ml) from lit pixels, then weight and
    /// cost from the given resin density (g/ml) and price per ml.
    pub fn recompute_material(&mut self, density_g_ml: f32, price_per_ml: f32) {
        let area = self.pixel_area_mm2();
        let height = self.layer_height;
        let mut volume_mm3 = 0.0f64;
        for layer in &mut self.layers {
            volume_mm3 += layer.metrics().lit_pixels as f64 * area as f64 * height as f64;
        }
        self.volume_ml = (volume_mm3 / 1000.0) as f32;
        self.weight_g = round_to(self.volume_ml * density_g_ml, 2);
        self.cost = round_to(self.volume_ml * price_per_ml, 2);
    }

    /// Recompute the estimated print time from per-layer settings.
    pub fn recompute_print_time(&mut self) {
        let mut seconds = 0.0f32;
        for layer in &self.layers {
            let s = &layer.settings;
            seconds += s.exposure_time
                + s.wait_before_cure
                + s.wait_after_cure
                + s.wait_after_lift
                + s.light_off_delay
                + s.motion_seconds();
        }
        self.print_time = seconds;
    }

    // =========================================================================
    // EMBEDDED G-CODE
    // =========================================================================

    /// Whether the cached G-Code program must be regenerated.
    pub fn gcode_dirty(&self) -> bool {
        self.gcode_dirty
    }

    /// The cached G-Code program, if one is present and current.
    pub fn gcode_text(&self) -> Option<&str> {
        if self.gcode_dirty {
            None
        } else {
            self.gcode_text.as_deref()
        }
    }

    /// Install a regenerated (or freshly parsed) G-Code program.
    pub fn set_gcode_text(&mut self, text: String) {
        self.gcode_text = Some(text);
        self.gcode_dirty = false;
    }

    /// Snapshot of the global state for display and testing.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            machine_name: self.machine_name.clone(),
            resolution: (self.resolution_x, self.resolution_y),
            display: (self.display_width, self.display_height),
            layer_height: self.layer_height,
            layer_count: self.layer_count(),
            bottom_layer_count: self.bottom_layer_count,
            transition_layer_count: self.transition_layer_count,
            exposure_time: self.exposure_time,
            bottom_exposure_time: self.bottom_exposure_time,
            print_time: self.print_time,
            volume_ml: self.volume_ml,
            weight_g: self.weight_g,
            cost: self.cost,
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerImage;
    use crate::params::Parameter;

    fn test_caps() -> Capabilities {
        Capabilities {
            global: Parameter::ALL,
            per_layer: &[],
            supports_gcode: false,
            supports_dual_stage: true,
            supports_layer_overrides: false,
            supports_wait_before_cure: true,
            supports_light_off_delay: true,
        }
    }

    #[test]
    fn test_bottom_normal_resolution() {
        let mut doc = JobDocument::new(test_caps());
        doc.bottom_layer_count = 3;
        doc.bottom_exposure_time = 35.0;
        doc.exposure_time = 7.0;
        doc.init(10);
        for i in 0..3 {
            assert_eq!(doc.layer(i).unwrap().settings.exposure_time, 35.0);
        }
        for i in 3..10 {
            assert_eq!(doc.layer(i).unwrap().settings.exposure_time, 7.0);
        }
    }

    #[test]
    fn test_transition_fade() {
        let mut doc = JobDocument::new(test_caps());
        doc.bottom_layer_count = 2;
        doc.bottom_exposure_time = 12.0;
        doc.exposure_time = 2.0;
        doc.init(10);
        doc.set_parameter(Parameter::TransitionLayerCount, 4.0);
        // fade spans 5 steps of 2s: 10, 8, 6, 4, then normal
        assert_eq!(doc.layer(2).unwrap().settings.exposure_time, 10.0);
        assert_eq!(doc.layer(3).unwrap().settings.exposure_time, 8.0);
        assert_eq!(doc.layer(4).unwrap().settings.exposure_time, 6.0);
        assert_eq!(doc.layer(5).unwrap().settings.exposure_time, 4.0);
        assert_eq!(doc.layer(6).unwrap().settings.exposure_time, 2.0);
    }

    #[test]
    fn test_transition_cap() {
        let mut doc = JobDocument::new(test_caps());
        doc.bottom_layer_count = 4;
        doc.init(6);
        doc.set_parameter(Parameter::TransitionLayerCount, 100.0);
        assert_eq!(doc.transition_layer_count, 1);
    }

    #[test]
    fn test_cumulative_z() {
        let mut doc = JobDocument::new(test_caps());
        doc.layer_height = 0.05;
        doc.init(3);
        assert!((doc.layer(2).unwrap().settings.position_z - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_per_layer_override_survives_rebuild() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(5);
        let layer = doc.layer_mut(2).unwrap();
        layer.settings.exposure_time = 99.0;
        layer.set_custom_settings(true);
        doc.set_parameter(Parameter::ExposureTime, 5.0);
        assert_eq!(doc.layer(2).unwrap().settings.exposure_time, 99.0);
        assert_eq!(doc.layer(3).unwrap().settings.exposure_time, 5.0);
    }

    #[test]
    fn test_batch_mutate_suppresses_rebuild() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(4);
        doc.batch_mutate(false, |doc| {
            doc.set_parameter(Parameter::ExposureTime, 3.0);
            // no rebuild yet: layers still carry the old value
            assert_eq!(doc.layer(3).unwrap().settings.exposure_time, 7.0);
        });
        doc.rebuild_layer_settings();
        assert_eq!(doc.layer(3).unwrap().settings.exposure_time, 3.0);
    }

    #[test]
    fn test_sanitize_shifts_zero_z() {
        let mut doc = JobDocument::new(test_caps());
        doc.layer_height = 0.1;
        doc.init(2);
        doc.layer_mut(0).unwrap().settings.position_z = 0.0;
        doc.layer_mut(1).unwrap().settings.position_z = 0.1;
        doc.sanitize_after_decode().unwrap();
        assert!((doc.layer(0).unwrap().settings.position_z - 0.1).abs() < 1e-6);
        assert!((doc.layer(1).unwrap().settings.position_z - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_sanitize_resets_zero_pwm() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(1);
        doc.light_pwm = 0;
        doc.sanitize_after_decode().unwrap();
        assert_eq!(doc.light_pwm, DEFAULT_LIGHT_PWM);
    }

    #[test]
    fn test_layer_height_precision_rejected() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(1);
        doc.layer_height = 0.0505;
        assert!(doc.sanitize_after_decode().is_err());
    }

    #[test]
    fn test_z_order_violation() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(2);
        for i in 0..2 {
            let mut image = LayerImage::new(4, 4);
            image.set_pixel(0, 0, 255);
            image.set_pixel(1, 0, 255);
            doc.layer_mut(i).unwrap().set_raster(image);
        }
        doc.layer_mut(0).unwrap().settings.position_z = 0.10;
        doc.layer_mut(1).unwrap().settings.position_z = 0.05;
        assert!(doc.validate_z_order().is_err());
    }

    #[test]
    fn test_dummy_layers_may_share_z() {
        let mut doc = JobDocument::new(test_caps());
        doc.init(2);
        // one lit pixel only: not printable, exempt from ordering
        let mut image = LayerImage::new(4, 4);
        image.set_pixel(0, 0, 255);
        doc.layer_mut(0).unwrap().set_raster(image);
        doc.layer_mut(0).unwrap().settings.position_z = 0.10;
        doc.layer_mut(1).unwrap().settings.position_z = 0.05;
        assert!(doc.validate_z_order().is_ok());
    }

    #[test]
    fn test_before_encode_folds_wait_into_light_off() {
        let mut caps = test_caps();
        caps.supports_wait_before_cure = false;
        let mut doc = JobDocument::new(caps);
        doc.init(4);
        doc.wait_before_cure = 2.0;
        doc.lift_height = 6.0;
        doc.lift_speed = 60.0;
        doc.retract_speed = 0.0;
        doc.bottom_retract_speed = 0.0;
        doc.apply_before_encode();
        assert_eq!(doc.wait_before_cure, 0.0);
        // 2s wait + 6mm at 60mm/min = 8s
        assert!((doc.light_off_delay - 8.0).abs() < 1e-3);
    }

    #[test]
    fn test_material_estimate_from_lit_pixels() {
        let mut doc = JobDocument::new(test_caps());
        doc.resolution_x = 10;
        doc.resolution_y = 10;
        doc.display_width = 10.0;
        doc.display_height = 10.0;
        doc.layer_height = 0.1;
        doc.init(2);
        // 50 lit pixels per layer at 1mm^2 each, 0.1mm tall
        for i in 0..2 {
            let mut image = LayerImage::new(10, 10);
            for x in 0..50 {
                image.set_pixel(x % 10, x / 10, 255);
            }
            doc.layer_mut(i).unwrap().set_raster(image);
        }
        doc.recompute_material(1.1, 0.05);
        assert!((doc.volume_ml - 0.01).abs() < 1e-6);
        doc.recompute_print_time();
        // 1 bottom-ish layer at 35s + 1 at 7s plus motion time
        assert!(doc.print_time > 42.0);
    }

    #[test]
    fn test_unsupported_parameter_is_noop() {
        let caps = Capabilities {
            global: &[Parameter::ExposureTime],
            per_layer: &[],
            supports_gcode: false,
            supports_dual_stage: false,
            supports_layer_overrides: false,
            supports_wait_before_cure: false,
            supports_light_off_delay: true,
        };
        let mut doc = JobDocument::new(caps);
        assert!(doc.parameter(Parameter::LiftSpeed).is_none());
        assert!(doc.set_parameter(Parameter::LiftSpeed, 10.0).is_none());
    }
}
