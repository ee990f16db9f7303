//! The preprocessing model as seen by the serving host.
//!
//! [`ImagePreprocessor::execute`] takes a batch of requests, each carrying a
//! `(batch, 1)` BYTES tensor of encoded images, and answers each with the
//! normalized detector input, the resized images and their scale factors.
//! Every failure aborts the whole call; there is no partial response.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{OutputKind, PreprocessorConfig, INPUT_NAME};
use crate::error::{PreprocessError, Result};
use crate::image::{self as img, ImageError, PreparedImage, CANVAS_HEIGHT, CANVAS_WIDTH, CHANNELS};
use crate::tensor::{DataType, Tensor, TensorData};

#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    id: String,
    inputs: Vec<Tensor>,
    requested_outputs: Vec<String>,
}

impl InferenceRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, tensor: Tensor) -> Self {
        self.inputs.push(tensor);
        self
    }

    pub fn with_requested_output(mut self, name: impl Into<String>) -> Self {
        self.requested_outputs.push(name.into());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.id
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.iter().find(|tensor| tensor.name == name)
    }

    pub fn requested_output_names(&self) -> &[String] {
        &self.requested_outputs
    }

    fn wants(&self, kind: OutputKind) -> bool {
        self.requested_outputs.iter().any(|name| name == kind.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResponse {
    pub outputs: Vec<Tensor>,
}

impl InferenceResponse {
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.iter().find(|tensor| tensor.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessorConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        info!(
            model = %config.model_name,
            output = %config.tensor.data_type,
            image = %config.image.data_type,
            scale = %config.scale.data_type,
            filter = ?config.resize_filter,
            parallel_batch = config.parallel_batch,
            "image preprocessor initialized"
        );
        Self { config }
    }

    /// Parses and validates the host's model config JSON.
    pub fn from_json(model_config: &str) -> Result<Self> {
        PreprocessorConfig::from_json(model_config).map(Self::new)
    }

    pub fn config(&self) -> &PreprocessorConfig {
        &self.config
    }

    /// Answers every request in order; the first failure aborts the call.
    pub fn execute(&self, requests: &[InferenceRequest]) -> Result<Vec<InferenceResponse>> {
        requests.iter().map(|request| self.process(request)).collect()
    }

    pub fn process(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let input = request
            .input(INPUT_NAME)
            .ok_or_else(|| PreprocessError::MissingInput {
                input: INPUT_NAME.to_string(),
                request_id: request.request_id().to_string(),
            })?;

        if !request.wants(OutputKind::Tensor) {
            return Err(PreprocessError::MissingOutput {
                output: OutputKind::Tensor.name().to_string(),
                requested: request.requested_output_names().to_vec(),
            });
        }

        let blobs = match &input.data {
            TensorData::Bytes(blobs) => blobs,
            other => {
                return Err(PreprocessError::InvalidInputType {
                    expected: DataType::Bytes.wire_name(),
                    actual: other.data_type().wire_name(),
                })
            }
        };
        input.check_shape()?;

        let started = Instant::now();
        let prepared = self.prepare_batch(blobs)?;

        let outputs = OutputKind::ALL
            .into_iter()
            .filter(|&kind| request.wants(kind))
            .map(|kind| self.build_output(kind, &prepared))
            .collect();

        debug!(
            request_id = request.request_id(),
            batch = prepared.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "preprocessed batch"
        );

        Ok(InferenceResponse { outputs })
    }

    fn prepare_batch(&self, blobs: &[Vec<u8>]) -> Result<Vec<PreparedImage>> {
        if self.config.parallel_batch {
            // Collect per-image results first so the lowest failing index wins.
            let results: Vec<Result<PreparedImage>> = blobs
                .par_iter()
                .enumerate()
                .map(|(index, blob)| self.prepare_one(index, blob))
                .collect();
            results.into_iter().collect()
        } else {
            blobs
                .iter()
                .enumerate()
                .map(|(index, blob)| self.prepare_one(index, blob))
                .collect()
        }
    }

    fn prepare_one(&self, index: usize, blob: &[u8]) -> Result<PreparedImage> {
        img::preprocess(blob, self.config.resize_filter).map_err(|err| match err {
            ImageError::Decode(source) => PreprocessError::Decode { index, source },
            ImageError::UnsupportedChannels(channels) => {
                PreprocessError::UnsupportedChannelLayout { index, channels }
            }
            ImageError::Layout(source) => PreprocessError::PixelLayout { index, source },
        })
    }

    fn build_output(&self, kind: OutputKind, prepared: &[PreparedImage]) -> Tensor {
        let spec = self.config.output(kind);
        let batch = prepared.len() as i64;
        let height = i64::from(CANVAS_HEIGHT);
        let width = i64::from(CANVAS_WIDTH);
        let channels = CHANNELS as i64;

        let (shape, data) = match kind {
            OutputKind::Tensor => (
                vec![batch, channels, height, width],
                TensorData::cast(
                    spec.data_type,
                    prepared
                        .iter()
                        .flat_map(|p| p.tensor.iter().map(|&v| f64::from(v))),
                ),
            ),
            OutputKind::Image => (
                vec![batch, height, width, channels],
                TensorData::cast(
                    spec.data_type,
                    prepared
                        .iter()
                        .flat_map(|p| p.resized.iter().map(|&v| f64::from(v))),
                ),
            ),
            OutputKind::Scale => (
                vec![batch, 2],
                TensorData::cast(
                    spec.data_type,
                    prepared.iter().flat_map(|p| [p.scale.0, p.scale.1]),
                ),
            ),
        };

        Tensor::new(spec.name.clone(), shape, data)
    }
}
