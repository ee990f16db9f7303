use std::{net::SocketAddr, sync::Arc};

use tonic::transport::Server;
use tracing::{error, info};

use text_det_preprocess::{server::PreprocessService, ImagePreprocessor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let addr: SocketAddr = std::env::var("PREPROCESS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8001".to_string())
        .parse()?;
    let config_path = std::env::var("PREPROCESS_MODEL_CONFIG")
        .unwrap_or_else(|_| "config/model_config.json".to_string());

    let model_config = tokio::fs::read_to_string(&config_path).await?;
    let preprocessor = ImagePreprocessor::from_json(&model_config)?;
    let service = PreprocessService::new(Arc::new(preprocessor));

    info!(%addr, config = %config_path, "Starting text detection preprocessor");

    if let Err(err) = Server::builder()
        .add_service(service.into_server())
        .serve(addr)
        .await
    {
        error!("server error: {err}");
    }

    Ok(())
}
