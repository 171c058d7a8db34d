use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::info;

use crate::{BlipLoader, DeviceMap, FluxLoader, Loader, ModelVariant, Pipeline, StableDiffusionLoader};

/// Where the weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub model_id: String,
    /// Access token for gated or private repositories.
    pub token: Option<String>,
}

impl ModelSource {
    pub fn api(&self) -> Result<Api> {
        ApiBuilder::new()
            .with_token(self.token.clone())
            .build()
            .context("failed to create hf hub API")
    }
}

/// Load the pipeline implementing `variant` from `source`.
pub async fn load_pipeline(
    variant: ModelVariant,
    source: &ModelSource,
    device_map: DeviceMap,
) -> Result<Box<dyn Pipeline>> {
    let api = source.api()?;
    let model_id = source.model_id.clone();

    info!("Loading model: {model_id} (variant: {variant}, device map: {device_map:?})");

    match variant {
        ModelVariant::TextToImage => boxed(FluxLoader::load(model_id, api, device_map).await),
        ModelVariant::ImageToImage => {
            boxed(StableDiffusionLoader::load(model_id, api, device_map).await)
        }
        ModelVariant::CaptioningVL => boxed(BlipLoader::load(model_id, api, device_map).await),
    }
}

fn boxed<P: Pipeline + 'static>(model: Result<P>) -> Result<Box<dyn Pipeline>> {
    Ok(Box::new(model?))
}
