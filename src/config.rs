//! Model configuration handed over by the serving host at initialization.
//!
//! The host passes its model config as JSON. Output declarations are looked
//! up once here and validated eagerly; the rest of the crate only sees the
//! typed [`PreprocessorConfig`].

use std::collections::HashMap;

use image::imageops::FilterType;
use serde::Deserialize;

use crate::error::{PreprocessError, Result};
use crate::image::{CANVAS_HEIGHT, CANVAS_WIDTH, CHANNELS};
use crate::tensor::DataType;

pub const INPUT_NAME: &str = "input";

/// The three outputs this model can produce, in response order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Normalized CHW tensor fed to the detector.
    Tensor,
    /// Resized HWC image passed through for later cropping.
    Image,
    /// Per-image (width, height) ratio to the processing canvas.
    Scale,
}

impl OutputKind {
    pub const ALL: [OutputKind; 3] = [OutputKind::Tensor, OutputKind::Image, OutputKind::Scale];

    pub fn name(self) -> &'static str {
        match self {
            OutputKind::Tensor => "output",
            OutputKind::Image => "image",
            OutputKind::Scale => "scale",
        }
    }

    /// Shape of one batch element of this output.
    pub fn item_shape(self) -> Vec<i64> {
        let height = i64::from(CANVAS_HEIGHT);
        let width = i64::from(CANVAS_WIDTH);
        let channels = CHANNELS as i64;
        match self {
            OutputKind::Tensor => vec![channels, height, width],
            OutputKind::Image => vec![height, width, channels],
            OutputKind::Scale => vec![2],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelConfigDocument {
    #[serde(default)]
    name: String,
    #[serde(default)]
    output: Vec<OutputDeclaration>,
    #[serde(default)]
    parameters: HashMap<String, ParameterValue>,
}

#[derive(Debug, Deserialize)]
struct OutputDeclaration {
    name: Option<String>,
    data_type: Option<String>,
    dims: Option<Vec<Dim>>,
}

/// proto3 JSON renders int64 dims as strings; hand-written configs use numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Dim {
    Int(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ParameterValue {
    string_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct PreprocessorConfig {
    pub model_name: String,
    pub tensor: OutputSpec,
    pub image: OutputSpec,
    pub scale: OutputSpec,
    pub resize_filter: FilterType,
    pub parallel_batch: bool,
}

impl PreprocessorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let document: ModelConfigDocument = serde_json::from_str(json)?;

        let tensor = resolve_output(&document, OutputKind::Tensor)?;
        let image = resolve_output(&document, OutputKind::Image)?;
        let scale = resolve_output(&document, OutputKind::Scale)?;

        let resize_filter = match document.parameters.get("resize_filter") {
            Some(value) => parse_filter(&value.string_value)?,
            None => FilterType::CatmullRom,
        };
        let parallel_batch = match document.parameters.get("parallel_batch") {
            Some(value) => parse_flag("parallel_batch", &value.string_value)?,
            None => false,
        };

        Ok(Self {
            model_name: document.name,
            tensor,
            image,
            scale,
            resize_filter,
            parallel_batch,
        })
    }

    pub fn output(&self, kind: OutputKind) -> &OutputSpec {
        match kind {
            OutputKind::Tensor => &self.tensor,
            OutputKind::Image => &self.image,
            OutputKind::Scale => &self.scale,
        }
    }
}

fn resolve_output(document: &ModelConfigDocument, kind: OutputKind) -> Result<OutputSpec> {
    let name = kind.name();
    let declaration = document
        .output
        .iter()
        .find(|output| output.name.as_deref() == Some(name))
        .ok_or_else(|| {
            PreprocessError::Configuration(format!(
                "output {name} is not defined in the model config"
            ))
        })?;

    let dims = declaration.dims.as_ref().ok_or_else(|| {
        PreprocessError::Configuration(format!(
            "dims for output {name} are not defined in the model config"
        ))
    })?;
    let data_type = declaration.data_type.as_deref().ok_or_else(|| {
        PreprocessError::Configuration(format!(
            "data type for output {name} is not defined in the model config"
        ))
    })?;

    let dims = dims
        .iter()
        .map(|dim| match dim {
            Dim::Int(value) => Ok(*value),
            Dim::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                PreprocessError::Configuration(format!(
                    "dims for output {name} contain a non-integer entry {text:?}"
                ))
            }),
        })
        .collect::<Result<Vec<_>>>()?;

    check_dims(kind, &dims)?;

    Ok(OutputSpec {
        name: name.to_string(),
        data_type: DataType::from_config_name(data_type)?,
        dims,
    })
}

/// Declared dims must describe one batch element, optionally behind a
/// variable batch dimension. `-1` matches any extent.
fn check_dims(kind: OutputKind, dims: &[i64]) -> Result<()> {
    let expected = kind.item_shape();
    let item = match dims.split_first() {
        Some((&-1, rest)) if rest.len() == expected.len() => rest,
        _ => dims,
    };
    let matches = item.len() == expected.len()
        && item
            .iter()
            .zip(&expected)
            .all(|(&declared, &actual)| declared == -1 || declared == actual);
    if matches {
        Ok(())
    } else {
        Err(PreprocessError::Configuration(format!(
            "dims {dims:?} for output {} do not match the produced shape {expected:?}",
            kind.name()
        )))
    }
}

fn parse_filter(value: &str) -> Result<FilterType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "nearest" => Ok(FilterType::Nearest),
        "triangle" | "bilinear" => Ok(FilterType::Triangle),
        "catmull_rom" | "bicubic" => Ok(FilterType::CatmullRom),
        "gaussian" => Ok(FilterType::Gaussian),
        "lanczos3" => Ok(FilterType::Lanczos3),
        other => Err(PreprocessError::Configuration(format!(
            "unknown resize_filter {other:?}"
        ))),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(PreprocessError::Configuration(format!(
            "parameter {key} must be a boolean, got {other:?}"
        ))),
    }
}
