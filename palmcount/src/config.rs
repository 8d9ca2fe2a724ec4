//! Run configuration resolved once per batch from the config JSON argument.
//!
//! The supervising process sends every option as loosely typed JSON: numbers may
//! arrive as numbers or numeric strings and booleans as the strings `"true"` /
//! `"false"`. This module turns that into an immutable, validated `RunConfig`.
//! Unknown keys are ignored.

use serde_json::{Map, Value};

use crate::error::ConfigError;

pub const DEFAULT_IMGSZ: u32 = 12800;
pub const DEFAULT_CONFIDENCE: f32 = 0.2;
pub const DEFAULT_IOU: f32 = 0.2;
pub const DEFAULT_MAX_DET: usize = 10000;
pub const DEFAULT_LINE_WIDTH: u32 = 3;

/// Which compute backend the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Cuda,
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "auto" => Ok(DevicePreference::Auto),
            other => Err(format!("Unknown device: {other}")),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Output toggles for the artifact writer
#[derive(Debug, Clone, PartialEq)]
pub struct OutputToggles {
    pub convert_kml: bool,
    pub convert_shp: bool,
    pub save_annotated: bool,
    pub line_width: u32,
    pub show_labels: bool,
    pub show_conf: bool,
}

impl Default for OutputToggles {
    fn default() -> Self {
        Self {
            convert_kml: false,
            convert_shp: false,
            save_annotated: true,
            line_width: DEFAULT_LINE_WIDTH,
            show_labels: true,
            show_conf: false,
        }
    }
}

/// Detection thresholds handed to the detection engine for every image
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    /// Inference resolution; images larger than this are processed in tiles of this size
    pub imgsz: u32,
    pub confidence: f32,
    pub iou_threshold: f32,
    pub max_det: usize,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            imgsz: DEFAULT_IMGSZ,
            confidence: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            max_det: DEFAULT_MAX_DET,
        }
    }
}

/// Immutable configuration for one batch
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub inference: InferenceParams,
    pub device: DevicePreference,
    pub outputs: OutputToggles,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            inference: InferenceParams::default(),
            device: DevicePreference::Auto,
            outputs: OutputToggles::default(),
        }
    }
}

impl RunConfig {
    /// Parse the config JSON argument, applying defaults for missing keys.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        let options = value.as_object().ok_or(ConfigError::NotAnObject)?;

        let device = match options.get("device") {
            None | Some(Value::Null) => DevicePreference::Auto,
            Some(raw) => {
                let text = value_text(raw);
                text.parse().unwrap_or_else(|_| {
                    log::warn!("Unknown device '{text}', using auto");
                    DevicePreference::Auto
                })
            }
        };

        let config = Self {
            inference: InferenceParams {
                imgsz: integer_option(options, "imgsz", DEFAULT_IMGSZ)?,
                confidence: probability_option(options, "conf", DEFAULT_CONFIDENCE)?,
                iou_threshold: probability_option(options, "iou", DEFAULT_IOU)?,
                max_det: integer_option(options, "max_det", DEFAULT_MAX_DET)?,
            },
            device,
            outputs: OutputToggles {
                convert_kml: flag_option(options, "convert_kml", false),
                convert_shp: flag_option(options, "convert_shp", false),
                save_annotated: flag_option(options, "save_annotated", true),
                line_width: integer_option(options, "line_width", DEFAULT_LINE_WIDTH)?,
                show_labels: flag_option(options, "show_labels", true),
                show_conf: flag_option(options, "show_conf", false),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inference.imgsz < 32 {
            return Err(ConfigError::InvalidValue {
                key: "imgsz",
                value: self.inference.imgsz.to_string(),
                expected: "an integer of at least 32",
            });
        }
        if self.inference.max_det == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_det",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        if self.outputs.line_width == 0 {
            return Err(ConfigError::InvalidValue {
                key: "line_width",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        Ok(())
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Boolean options arrive as strings; anything other than a case-insensitive
/// `"true"` is false. Native JSON booleans are accepted as well.
fn flag_option(options: &Map<String, Value>, key: &'static str, default: bool) -> bool {
    match options.get(key) {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(other) => value_text(other).trim().eq_ignore_ascii_case("true"),
    }
}

/// Non-negative integer option; values that do not fit `T` are rejected, not wrapped
fn integer_option<T: TryFrom<u64>>(
    options: &Map<String, Value>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let invalid = |raw: &Value| ConfigError::InvalidValue {
        key,
        value: value_text(raw),
        expected: "a non-negative integer",
    };

    let (raw, parsed) = match options.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(raw @ Value::Number(n)) => (raw, n.as_u64()),
        Some(raw @ Value::String(s)) => (raw, s.trim().parse::<u64>().ok()),
        Some(raw) => return Err(invalid(raw)),
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| invalid(raw))
}

fn probability_option(
    options: &Map<String, Value>,
    key: &'static str,
    default: f32,
) -> Result<f32, ConfigError> {
    let invalid = |raw: &Value| ConfigError::InvalidValue {
        key,
        value: value_text(raw),
        expected: "a number between 0.0 and 1.0",
    };

    let value = match options.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(raw @ Value::Number(n)) => n.as_f64().ok_or_else(|| invalid(raw))?,
        Some(raw @ Value::String(s)) => s.trim().parse::<f64>().map_err(|_| invalid(raw))?,
        Some(raw) => return Err(invalid(raw)),
    };

    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(&options[key]));
    }
    Ok(value as f32)
}
