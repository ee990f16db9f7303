pub mod config;
pub mod error;
pub mod image;
pub mod model;
pub mod server;
pub mod tensor;

pub use config::{OutputKind, PreprocessorConfig};
pub use error::{PreprocessError, Result};
pub use model::{ImagePreprocessor, InferenceRequest, InferenceResponse};
pub use tensor::{DataType, Tensor, TensorData};
