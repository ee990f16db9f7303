//! KServe v2 gRPC front end for running the preprocessor outside a host
//! runtime. Only the health and `ModelInfer` calls are served.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::config::OutputKind;
use crate::error::{PreprocessError, Result};
use crate::model::{ImagePreprocessor, InferenceRequest, InferenceResponse};
use crate::tensor::{DataType, Tensor, TensorData};

pub mod inference {
    tonic::include_proto!("inference");
}

use inference::grpc_inference_service_server::{GrpcInferenceService, GrpcInferenceServiceServer};
use inference::{
    model_infer_request::InferInputTensor, model_infer_response::InferOutputTensor,
    InferTensorContents, ModelInferRequest, ModelInferResponse,
};

/// One full-canvas FP32 tensor is ~50MB, so batches need far more than tonic's 4MB default.
pub const MAX_MESSAGE_BYTES: usize = 1 << 30;

#[derive(Clone)]
pub struct PreprocessService {
    preprocessor: Arc<ImagePreprocessor>,
}

impl PreprocessService {
    pub fn new(preprocessor: Arc<ImagePreprocessor>) -> Self {
        Self { preprocessor }
    }

    pub fn into_server(self) -> GrpcInferenceServiceServer<Self> {
        GrpcInferenceServiceServer::new(self)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES)
    }

    /// An unnamed config answers for any model name.
    fn serves(&self, model_name: &str) -> bool {
        let own = &self.preprocessor.config().model_name;
        own.is_empty() || own == model_name
    }
}

#[tonic::async_trait]
impl GrpcInferenceService for PreprocessService {
    async fn server_live(
        &self,
        _request: Request<inference::ServerLiveRequest>,
    ) -> std::result::Result<Response<inference::ServerLiveResponse>, Status> {
        Ok(Response::new(inference::ServerLiveResponse { live: true }))
    }

    async fn server_ready(
        &self,
        _request: Request<inference::ServerReadyRequest>,
    ) -> std::result::Result<Response<inference::ServerReadyResponse>, Status> {
        Ok(Response::new(inference::ServerReadyResponse { ready: true }))
    }

    async fn model_ready(
        &self,
        request: Request<inference::ModelReadyRequest>,
    ) -> std::result::Result<Response<inference::ModelReadyResponse>, Status> {
        let ready = self.serves(&request.into_inner().name);
        Ok(Response::new(inference::ModelReadyResponse { ready }))
    }

    async fn model_infer(
        &self,
        request: Request<ModelInferRequest>,
    ) -> std::result::Result<Response<ModelInferResponse>, Status> {
        let request = request.into_inner();
        if !self.serves(&request.model_name) {
            return Err(Status::not_found(format!(
                "unknown model {}",
                request.model_name
            )));
        }

        let model_name = request.model_name.clone();
        let model_version = request.model_version.clone();
        let id = request.id.clone();
        debug!(request_id = %id, inputs = request.inputs.len(), "model infer");

        let infer_request = decode_request(request).map_err(into_status)?;

        let preprocessor = Arc::clone(&self.preprocessor);
        let response = tokio::task::spawn_blocking(move || preprocessor.process(&infer_request))
            .await
            .map_err(|err| Status::internal(format!("preprocessing task failed: {err}")))?
            .map_err(into_status)?;

        Ok(Response::new(encode_response(
            model_name,
            model_version,
            id,
            response,
        )))
    }
}

/// Converts a wire request into the model's request type.
pub fn decode_request(request: ModelInferRequest) -> Result<InferenceRequest> {
    let ModelInferRequest {
        id,
        inputs,
        outputs,
        raw_input_contents,
        ..
    } = request;

    if !raw_input_contents.is_empty() && raw_input_contents.len() != inputs.len() {
        return Err(PreprocessError::MalformedTensor {
            name: "raw_input_contents".to_string(),
            reason: format!(
                "{} raw buffers for {} inputs",
                raw_input_contents.len(),
                inputs.len()
            ),
        });
    }

    let mut infer_request = InferenceRequest::new(id);
    for (index, input) in inputs.into_iter().enumerate() {
        let tensor = decode_input(input, raw_input_contents.get(index).map(Vec::as_slice))?;
        infer_request = infer_request.with_input(tensor);
    }

    if outputs.is_empty() {
        for kind in OutputKind::ALL {
            infer_request = infer_request.with_requested_output(kind.name());
        }
    } else {
        for output in outputs {
            infer_request = infer_request.with_requested_output(output.name);
        }
    }

    Ok(infer_request)
}

fn decode_input(input: InferInputTensor, raw: Option<&[u8]>) -> Result<Tensor> {
    let InferInputTensor {
        name,
        datatype,
        shape,
        contents,
        ..
    } = input;
    let malformed = |reason: String| PreprocessError::MalformedTensor {
        name: name.clone(),
        reason,
    };

    let data_type = DataType::from_wire_name(&datatype)
        .ok_or_else(|| malformed(format!("unknown datatype {datatype}")))?;

    let data = match raw {
        Some(raw) => TensorData::from_raw_bytes(data_type, raw).map_err(&malformed)?,
        None => from_contents(data_type, contents.unwrap_or_default()),
    };

    let tensor = Tensor::new(name.clone(), shape, data);
    tensor.check_shape()?;
    Ok(tensor)
}

fn from_contents(data_type: DataType, contents: InferTensorContents) -> TensorData {
    match data_type {
        DataType::Bool => TensorData::Bool(contents.bool_contents),
        DataType::Uint8 => TensorData::Uint8(contents.uint_contents.iter().map(|&v| v as u8).collect()),
        DataType::Uint16 => {
            TensorData::Uint16(contents.uint_contents.iter().map(|&v| v as u16).collect())
        }
        DataType::Uint32 => TensorData::Uint32(contents.uint_contents),
        DataType::Uint64 => TensorData::Uint64(contents.uint64_contents),
        DataType::Int8 => TensorData::Int8(contents.int_contents.iter().map(|&v| v as i8).collect()),
        DataType::Int16 => {
            TensorData::Int16(contents.int_contents.iter().map(|&v| v as i16).collect())
        }
        DataType::Int32 => TensorData::Int32(contents.int_contents),
        DataType::Int64 => TensorData::Int64(contents.int64_contents),
        DataType::Fp32 => TensorData::Fp32(contents.fp32_contents),
        DataType::Fp64 => TensorData::Fp64(contents.fp64_contents),
        DataType::Bytes => TensorData::Bytes(contents.bytes_contents),
    }
}

/// Encodes every output into `raw_output_contents`.
pub fn encode_response(
    model_name: String,
    model_version: String,
    id: String,
    response: InferenceResponse,
) -> ModelInferResponse {
    let mut outputs = Vec::with_capacity(response.outputs.len());
    let mut raw_output_contents = Vec::with_capacity(response.outputs.len());
    for tensor in response.outputs {
        raw_output_contents.push(tensor.data.to_raw_bytes());
        outputs.push(InferOutputTensor {
            datatype: tensor.data_type().wire_name().to_string(),
            name: tensor.name,
            shape: tensor.shape,
            ..Default::default()
        });
    }

    ModelInferResponse {
        model_name,
        model_version,
        id,
        outputs,
        raw_output_contents,
        ..Default::default()
    }
}

fn into_status(err: PreprocessError) -> Status {
    error!("preprocessing failed: {err}");
    match err {
        PreprocessError::Configuration(_)
        | PreprocessError::ConfigSyntax(_)
        | PreprocessError::PixelLayout { .. } => Status::internal(err.to_string()),
        _ => Status::invalid_argument(err.to_string()),
    }
}
