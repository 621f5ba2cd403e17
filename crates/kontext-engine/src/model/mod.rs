//! The generative model seam.
//!
//! The worker treats the model as an opaque, read-only capability: one call
//! to [`ImageEditModel::generate`] turns a [`GenerationRequest`] into one
//! image. A backend signals that the compute device is exhausted or faulted
//! by returning a [`ModelFault`] anywhere in its error chain.

mod dryrun;
mod remote;

use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use kontext_contracts::geometry::Dimensions;

use crate::config::{HandlerConfig, ModelBackend};

pub use dryrun::DryrunModel;
pub use remote::RemoteModel;

/// Fully resolved inputs for one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Source image, already resampled to `width` x `height`.
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub seed: u64,
}

impl GenerationRequest {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

pub trait ImageEditModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelFault {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("backend fault: {0}")]
    Backend(String),
}

/// Builds the configured backend. Called once per process.
pub fn load_model(config: &HandlerConfig) -> Result<Arc<dyn ImageEditModel>> {
    let model: Arc<dyn ImageEditModel> = match config.model {
        ModelBackend::Dryrun => Arc::new(DryrunModel),
        ModelBackend::Remote => {
            let url = config
                .inference_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("KONTEXT_INFERENCE_URL not set"))?;
            Arc::new(RemoteModel::new(url, config.request_timeout_s))
        }
    };
    tracing::info!(model = model.name(), "model loaded");
    Ok(model)
}
