//! PaliGemma vision-language templates.
//!
//! Both templates share [`PaliGemmaBase`], which owns the attributes and a
//! [`TextGenerator`] that turns an image and a prompt into text.

mod detection;
mod inference;

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::paligemma;
use image::RgbImage;
use tokenizers::Tokenizer;

pub use detection::{parse_detections, PaliGemmaDetection};
pub use inference::PaliGemmaInference;

use crate::hub::Hub;
use crate::memory::DeviceScope;
use crate::{image_to_tensor, select_best_device, DataContainer, PaliGemmaAttributes};

const EOS_TOKEN: &str = "<eos>";

/// Produces text conditioned on an image.
pub trait TextGenerator: Send {
    fn generate(&mut self, image: &RgbImage, prompt: &str, max_new_tokens: usize) -> Result<String>;
}

/// PaliGemma weights and processor tokenizer on one device.
pub struct PaliGemmaModel {
    model: paligemma::Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    image_size: usize,
    eos_token: u32,
}

impl PaliGemmaModel {
    pub fn load(attributes: &PaliGemmaAttributes) -> Result<Self> {
        let device =
            select_best_device(attributes.device.into()).context("failed to set up device")?;
        let dtype = attributes.torch_dtype.dtype();
        let hub = Hub::new(&attributes.model_cache_dir)?;

        let (config, image_size) = if attributes.model_path.contains("448") {
            (paligemma::Config::paligemma_3b_448(), 448)
        } else {
            (paligemma::Config::paligemma_3b_224(), 224)
        };

        tracing::info!(
            model = %attributes.model_path,
            processor = %attributes.processor_path,
            image_size,
            "loading paligemma"
        );
        let _scope = DeviceScope::enter(&device, "load");
        let tokenizer_file = hub.source(&attributes.processor_path).get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(E::msg)
            .context("failed to load processor tokenizer")?;
        let eos_token = tokenizer
            .token_to_id(EOS_TOKEN)
            .with_context(|| format!("tokenizer has no `{EOS_TOKEN}` token"))?;

        let weights = hub
            .source(&attributes.model_path)
            .safetensors("model.safetensors.index.json", "model.safetensors")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
        let model = paligemma::Model::new(&config, vb)
            .with_context(|| format!("failed to load {}", attributes.model_path))?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            dtype,
            image_size,
            eos_token,
        })
    }
}

impl TextGenerator for PaliGemmaModel {
    fn generate(
        &mut self,
        image: &RgbImage,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<String> {
        let _scope = DeviceScope::enter(&self.device, "inference");
        let pixels = image_to_tensor(image, self.image_size, self.image_size)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let mut tokens = self
            .tokenizer
            .encode(format!("{prompt}\n"), true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();

        // Greedy decoding.
        let mut logits_processor = LogitsProcessor::new(0, None, None);
        let mut generated = Vec::new();
        self.model.clear_kv_cache();
        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                self.model.forward(&input)?
            } else {
                self.model.setup(&pixels, &input)?
            };
            let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
            let next_token = logits_processor.sample(&logits)?;
            if next_token == self.eos_token {
                break;
            }
            tokens.push(next_token);
            generated.push(next_token);
        }
        tracing::debug!(tokens = generated.len(), "generated text");

        self.tokenizer.decode(&generated, false).map_err(E::msg)
    }
}

/// Shared state of the PaliGemma templates.
pub struct PaliGemmaBase<G: TextGenerator = PaliGemmaModel> {
    name: String,
    attributes: PaliGemmaAttributes,
    generator: G,
}

impl PaliGemmaBase {
    pub fn new(name: impl Into<String>, attributes: PaliGemmaAttributes) -> Result<Self> {
        let generator = PaliGemmaModel::load(&attributes)?;
        Ok(Self::with_generator(name, attributes, generator))
    }
}

impl<G: TextGenerator> PaliGemmaBase<G> {
    pub fn with_generator(
        name: impl Into<String>,
        attributes: PaliGemmaAttributes,
        generator: G,
    ) -> Self {
        Self {
            name: name.into(),
            attributes,
            generator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &PaliGemmaAttributes {
        &self.attributes
    }

    /// The last text packet, falling back to the `prompt` attribute.
    pub fn prompt(&self, container: &DataContainer) -> Option<String> {
        container
            .last_text()
            .map(str::to_owned)
            .or_else(|| self.attributes.prompt.clone())
    }

    pub fn generate(&mut self, image: &RgbImage, prompt: &str) -> Result<String> {
        let text = self
            .generator
            .generate(image, prompt, self.attributes.max_new_tokens)?;
        Ok(text.trim().to_string())
    }
}
