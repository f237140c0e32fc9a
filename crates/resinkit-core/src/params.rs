//! Print parameter registry
//!
//! A closed set of named, bounded print parameters shared by every file
//! format. Each format declares the subset it supports at the global level
//! and, separately, the subset it supports per layer; a parameter outside a
//! format's supported set must not be read or written for that format.
//!
//! Bounds metadata (min/max/step/decimals) lives here so that callers can
//! clamp and round without knowing anything about the concrete format.

use serde::{Deserialize, Serialize};

/// One print parameter of the unified job model.
///
/// Dual-valued parameters come in `Bottom*` / normal pairs; the effective
/// value for a layer is resolved through
/// [`bottom_counterpart`](Parameter::bottom_counterpart) and the document's
/// bottom layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    /// Number of bottom layers printed with the bottom parameter set
    BottomLayerCount,
    /// Number of software-faded transition layers after the bottom block
    TransitionLayerCount,
    /// Exposure time for bottom layers, seconds
    BottomExposureTime,
    /// Exposure time for normal layers, seconds
    ExposureTime,
    /// Wait before curing a bottom layer, seconds
    BottomWaitBeforeCure,
    /// Wait before curing a normal layer, seconds
    WaitBeforeCure,
    /// Wait after curing a bottom layer, seconds
    BottomWaitAfterCure,
    /// Wait after curing a normal layer, seconds
    WaitAfterCure,
    /// Wait after the lift move on a bottom layer, seconds
    BottomWaitAfterLift,
    /// Wait after the lift move on a normal layer, seconds
    WaitAfterLift,
    /// Light-off delay after a bottom layer, seconds
    BottomLightOffDelay,
    /// Light-off delay after a normal layer, seconds
    LightOffDelay,
    /// First-stage lift height after a bottom layer, millimeters
    BottomLiftHeight,
    /// First-stage lift height after a normal layer, millimeters
    LiftHeight,
    /// First-stage lift speed after a bottom layer, millimeters/minute
    BottomLiftSpeed,
    /// First-stage lift speed after a normal layer, millimeters/minute
    LiftSpeed,
    /// Second-stage lift height after a bottom layer, millimeters
    BottomLiftHeight2,
    /// Second-stage lift height after a normal layer, millimeters
    LiftHeight2,
    /// Second-stage lift speed after a bottom layer, millimeters/minute
    BottomLiftSpeed2,
    /// Second-stage lift speed after a normal layer, millimeters/minute
    LiftSpeed2,
    /// Lift acceleration for bottom layers, millimeters/second squared
    BottomLiftAcceleration,
    /// Lift acceleration for normal layers, millimeters/second squared
    LiftAcceleration,
    /// First-stage retract speed after a bottom layer, millimeters/minute
    BottomRetractSpeed,
    /// First-stage retract speed after a normal layer, millimeters/minute
    RetractSpeed,
    /// Retract acceleration for bottom layers, millimeters/second squared
    BottomRetractAcceleration,
    /// Retract acceleration for normal layers, millimeters/second squared
    RetractAcceleration,
    /// Second-stage retract height after a bottom layer, millimeters
    BottomRetractHeight2,
    /// Second-stage retract height after a normal layer, millimeters
    RetractHeight2,
    /// Second-stage retract speed after a bottom layer, millimeters/minute
    BottomRetractSpeed2,
    /// Second-stage retract speed after a normal layer, millimeters/minute
    RetractSpeed2,
    /// UV light PWM for bottom layers, 0-255
    BottomLightPwm,
    /// UV light PWM for normal layers, 0-255
    LightPwm,
}

/// Bounds and presentation metadata for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterMeta {
    /// Smallest accepted value.
    pub min: f32,
    /// Largest accepted value.
    pub max: f32,
    /// Increment used by spinner-style editors.
    pub step: f32,
    /// Number of decimal places the value is rounded to.
    pub decimals: u32,
}

impl ParameterMeta {
    /// Clamp a raw value into bounds and round it to the declared decimals.
    pub fn sanitize(&self, value: f32) -> f32 {
        round_to(value.clamp(self.min, self.max), self.decimals)
    }
}

const SECONDS: ParameterMeta = ParameterMeta {
    min: 0.0,
    max: 1000.0,
    step: 0.5,
    decimals: 2,
};
const MILLIMETERS: ParameterMeta = ParameterMeta {
    min: 0.0,
    max: 100.0,
    step: 0.5,
    decimals: 2,
};
const SPEED: ParameterMeta = ParameterMeta {
    min: 0.0,
    max: 5000.0,
    step: 5.0,
    decimals: 2,
};
const ACCELERATION: ParameterMeta = ParameterMeta {
    min: 0.0,
    max: 5000.0,
    step: 10.0,
    decimals: 0,
};
const PWM: ParameterMeta = ParameterMeta {
    min: 1.0,
    max: 255.0,
    step: 1.0,
    decimals: 0,
};
const COUNT: ParameterMeta = ParameterMeta {
    min: 0.0,
    max: 10000.0,
    step: 1.0,
    decimals: 0,
};

impl Parameter {
    /// Every parameter, in registry order.
    pub const ALL: &'static [Parameter] = &[
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
    ];

    /// Bounds metadata for this parameter.
    pub fn meta(self) -> ParameterMeta {
        use Parameter::*;
        match self {
            BottomLayerCount | TransitionLayerCount => COUNT,
            BottomExposureTime | ExposureTime | BottomWaitBeforeCure | WaitBeforeCure
            | BottomWaitAfterCure | WaitAfterCure | BottomWaitAfterLift | WaitAfterLift
            | BottomLightOffDelay | LightOffDelay => SECONDS,
            BottomLiftHeight | LiftHeight | BottomLiftHeight2 | LiftHeight2
            | BottomRetractHeight2 | RetractHeight2 => MILLIMETERS,
            BottomLiftSpeed | LiftSpeed | BottomLiftSpeed2 | LiftSpeed2 | BottomRetractSpeed
            | RetractSpeed | BottomRetractSpeed2 | RetractSpeed2 => SPEED,
            BottomLiftAcceleration | LiftAcceleration | BottomRetractAcceleration
            | RetractAcceleration => ACCELERATION,
            BottomLightPwm | LightPwm => PWM,
        }
    }

    /// Stable name used in G-Code metadata comments and summaries.
    pub fn key(self) -> &'static str {
        use Parameter::*;
        match self {
            BottomLayerCount => "bottomLayerCount",
            TransitionLayerCount => "transitionLayerCount",
            BottomExposureTime => "bottomExposureTime",
            ExposureTime => "exposureTime",
            BottomWaitBeforeCure => "bottomWaitBeforeCure",
            WaitBeforeCure => "waitBeforeCure",
            BottomWaitAfterCure => "bottomWaitAfterCure",
            WaitAfterCure => "waitAfterCure",
            BottomWaitAfterLift => "bottomWaitAfterLift",
            WaitAfterLift => "waitAfterLift",
            BottomLightOffDelay => "bottomLightOffDelay",
            LightOffDelay => "lightOffDelay",
            BottomLiftHeight => "bottomLiftHeight",
            LiftHeight => "liftHeight",
            BottomLiftSpeed => "bottomLiftSpeed",
            LiftSpeed => "liftSpeed",
            BottomLiftHeight2 => "bottomLiftHeight2",
            LiftHeight2 => "liftHeight2",
            BottomLiftSpeed2 => "bottomLiftSpeed2",
            LiftSpeed2 => "liftSpeed2",
            BottomLiftAcceleration => "bottomLiftAcceleration",
            LiftAcceleration => "liftAcceleration",
            BottomRetractSpeed => "bottomRetractSpeed",
            RetractSpeed => "retractSpeed",
            BottomRetractAcceleration => "bottomRetractAcceleration",
            RetractAcceleration => "retractAcceleration",
            BottomRetractHeight2 => "bottomRetractHeight2",
            RetractHeight2 => "retractHeight2",
            BottomRetractSpeed2 => "bottomRetractSpeed2",
            RetractSpeed2 => "retractSpeed2",
            BottomLightPwm => "bottomLightPwm",
            LightPwm => "lightPwm",
        }
    }

    /// Whether this is the bottom-layer variant of a dual-valued parameter.
    pub fn is_bottom_variant(self) -> bool {
        use Parameter::*;
        matches!(
            self,
            BottomExposureTime
                | BottomWaitBeforeCure
                | BottomWaitAfterCure
                | BottomWaitAfterLift
                | BottomLightOffDelay
                | BottomLiftHeight
                | BottomLiftSpeed
                | BottomLiftHeight2
                | BottomLiftSpeed2
                | BottomLiftAcceleration
                | BottomRetractSpeed
                | BottomRetractAcceleration
                | BottomRetractHeight2
                | BottomRetractSpeed2
                | BottomLightPwm
        )
    }

    /// The bottom-layer variant of a normal parameter, if one exists.
    pub fn bottom_counterpart(self) -> Option<Parameter> {
        use Parameter::*;
        Some(match self {
            ExposureTime => BottomExposureTime,
            WaitBeforeCure => BottomWaitBeforeCure,
            WaitAfterCure => BottomWaitAfterCure,
            WaitAfterLift => BottomWaitAfterLift,
            LightOffDelay => BottomLightOffDelay,
            LiftHeight => BottomLiftHeight,
            LiftSpeed => BottomLiftSpeed,
            LiftHeight2 => BottomLiftHeight2,
            LiftSpeed2 => BottomLiftSpeed2,
            LiftAcceleration => BottomLiftAcceleration,
            RetractAcceleration => BottomRetractAcceleration,
            RetractSpeed => BottomRetractSpeed,
            RetractHeight2 => BottomRetractHeight2,
            RetractSpeed2 => BottomRetractSpeed2,
            LightPwm => BottomLightPwm,
            _ => return None,
        })
    }
}

/// A recorded parameter mutation, kept only for UI diffing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    /// The parameter that changed.
    pub parameter: Parameter,
    /// The value before the mutation.
    pub old: f32,
    /// The value after the mutation.
    pub new: f32,
}

/// Capability flags and supported parameter sets declared by a format.
///
/// A static value of this type exists per format implementation; the
/// document consults it to gate parameter access and conversions.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Parameters the format stores at the file level.
    pub global: &'static [Parameter],
    /// Parameters the format stores per layer.
    pub per_layer: &'static [Parameter],
    /// The format embeds a textual G-Code program.
    pub supports_gcode: bool,
    /// The format stores two sequential lift/retract stages.
    pub supports_dual_stage: bool,
    /// The format can persist per-layer parameter overrides.
    pub supports_layer_overrides: bool,
    /// The format stores a wait-before-cure time distinct from light-off delay.
    pub supports_wait_before_cure: bool,
    /// The format stores a light-off delay.
    pub supports_light_off_delay: bool,
}

impl Capabilities {
    /// Whether a parameter may be read/written at the global level.
    pub fn supports(&self, parameter: Parameter) -> bool {
        self.global.contains(&parameter)
    }

    /// Whether a parameter may be read/written on an individual layer.
    pub fn supports_per_layer(&self, parameter: Parameter) -> bool {
        self.per_layer.contains(&parameter)
    }
}

/// Round a value to a fixed number of decimal places.
pub fn round_to(value: f32, decimals: u32) -> f32 {
    let factor = 10f32.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Whether a value is representable with at most `decimals` decimal places.
pub fn fits_decimals(value: f32, decimals: u32) -> bool {
    (round_to(value, decimals) - value).abs() < 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.0501, 3), 0.05);
        assert_eq!(round_to(35.004, 2), 35.0);
    }

    #[test]
    fn test_fits_decimals() {
        assert!(fits_decimals(0.05, 3));
        assert!(fits_decimals(0.025, 3));
        assert!(!fits_decimals(0.0255, 3));
    }

    #[test]
    fn test_bottom_counterpart_pairs() {
        assert_eq!(
            Parameter::ExposureTime.bottom_counterpart(),
            Some(Parameter::BottomExposureTime)
        );
        assert_eq!(Parameter::BottomExposureTime.bottom_counterpart(), None);
        for p in Parameter::ALL {
            if let Some(bottom) = p.bottom_counterpart() {
                assert!(bottom.is_bottom_variant());
                assert!(!p.is_bottom_variant());
            }
        }
    }

    #[test]
    fn test_sanitize_clamps_and_rounds() {
        let meta = Parameter::LightPwm.meta();
        assert_eq!(meta.sanitize(300.0), 255.0);
        assert_eq!(meta.sanitize(0.0), 1.0);
        let meta = Parameter::ExposureTime.meta();
        assert_eq!(meta.sanitize(7.005), 7.0);
    }
}
