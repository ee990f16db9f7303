use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("invalid model config: {0}")]
    Configuration(String),

    #[error("model config is not valid JSON: {0}")]
    ConfigSyntax(#[from] serde_json::Error),

    #[error("input tensor {input} not found in request {request_id}")]
    MissingInput { input: String, request_id: String },

    #[error("the output with name {output} is not in the requested outputs {requested:?}")]
    MissingOutput {
        output: String,
        requested: Vec<String>,
    },

    #[error("input datatype must be {expected}, got {actual}")]
    InvalidInputType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("image {index} in batch could not be decoded: {source}")]
    Decode {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("image {index} in batch has {channels} channels, only grayscale and 3-channel color are supported")]
    UnsupportedChannelLayout { index: usize, channels: u8 },

    #[error("image {index} in batch could not be laid out as a pixel array: {source}")]
    PixelLayout {
        index: usize,
        #[source]
        source: ndarray::ShapeError,
    },

    #[error("malformed tensor {name}: {reason}")]
    MalformedTensor { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PreprocessError>;
