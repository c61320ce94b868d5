use crate::engine::errors::ToolkitError;
use crate::render::backend::GraphicsBackend;
use crate::render::device::{DeviceProvider, GraphicsApi};
use std::sync::Arc;

pub mod bridged;
pub mod direct;

/// Pick the backend for the host's graphics API.
pub fn create_backend(
    api: GraphicsApi,
    provider: Arc<dyn DeviceProvider>,
) -> Result<Box<dyn GraphicsBackend>, ToolkitError> {
    let backend: Box<dyn GraphicsBackend> = match api {
        GraphicsApi::Direct3D11 => {
            Box::new(direct::DirectBackend::new(provider).map_err(creation_failed)?)
        }
        GraphicsApi::Direct3D12 => {
            Box::new(bridged::BridgedBackend::new(provider).map_err(creation_failed)?)
        }
        GraphicsApi::Unknown => return Err(ToolkitError::UnsupportedGraphicsApi(api as i32)),
    };
    Ok(backend)
}

fn creation_failed(e: anyhow::Error) -> ToolkitError {
    ToolkitError::DeviceCreationFailed(format!("{e:#}"))
}
