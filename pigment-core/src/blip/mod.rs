//! BLIP conditional captioning backend.

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::{generation::LogitsProcessor, models::blip};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    image_to_tensor,
    params::{CaptioningPayload, Payload},
    select_best_device, DeviceMap, Loader, ModelError, ModelOutput, Pipeline,
};

const IMAGE_SIZE: u32 = 384;
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const MAX_CAPTION_TOKENS: usize = 128;
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

pub struct BlipModel {
    device: Device,
    tokenizer: Tokenizer,
    model: blip::BlipForConditionalGeneration,
}

impl BlipModel {
    fn preprocess(&self, image: &image::DynamicImage) -> Result<Tensor> {
        let data = image_to_tensor(image, IMAGE_SIZE, IMAGE_SIZE)?;
        let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
        let normalized = (data.to_dtype(DType::F32)? / 255.)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?;
        Ok(normalized.to_device(&self.device)?)
    }

    /// Greedy decoding, with the prompt as the caption prefix.
    fn caption(&mut self, request: CaptioningPayload) -> Result<String> {
        let image = self.preprocess(&request.image)?;
        let image_embeds = image.unsqueeze(0)?.apply(self.model.vision_model())?;

        let mut token_ids = vec![BOS_TOKEN_ID];
        let prefix = self
            .tokenizer
            .encode(request.prompt.as_str(), false)
            .map_err(Error::msg)?;
        token_ids.extend_from_slice(prefix.get_ids());

        let mut logits_processor = LogitsProcessor::new(0, None, None);
        self.model.reset_kv_cache();
        for index in 0..MAX_CAPTION_TOKENS {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        self.model.reset_kv_cache();

        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(Error::msg)?;
        debug!("Generated {} caption tokens", token_ids.len() - 1);
        Ok(caption)
    }
}

impl Pipeline for BlipModel {
    fn name(&self) -> &'static str {
        "blip"
    }

    fn run(&mut self, payload: Payload) -> Result<ModelOutput, ModelError> {
        match payload {
            Payload::Captioning(request) => Ok(ModelOutput::Text(self.caption(request)?)),
            other => Err(ModelError::unsupported(self.name(), &other)),
        }
    }
}

pub struct BlipLoader;

impl Loader for BlipLoader {
    type Model = BlipModel;

    async fn load(model_id: String, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        info!("Loading BLIP captioning model from {model_id}");

        let repo = api.model(model_id);
        let model_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get captioning model file")?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .context("failed to get captioning tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load captioning tokenizer")?;

        let config = blip::Config::image_captioning_large();
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, &device)
                .context("failed to build captioning var builder")?
        };
        let model = blip::BlipForConditionalGeneration::new(&config, vb)
            .context("failed to load captioning model")?;

        Ok(BlipModel {
            device,
            tokenizer,
            model,
        })
    }
}
