use anyhow::{bail, Context, Error as E, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use super::{DiffusionPipeline, PipelineInputs, PipelineOutput};
use crate::hub::ModelSource;
use crate::{
    image_to_tensor, mask_to_tensor, GenerationParams, Generators, LoadRequest, ModelFamilyProvider,
};

const TOKENIZER2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const SDXL_VAE_FP16_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
const DEFAULT_STRENGTH: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StableDiffusionVersion {
    #[serde(rename = "v1_5")]
    V1_5,
    #[serde(rename = "v2_1")]
    V2_1,
    #[serde(rename = "xl")]
    Xl,
    #[serde(rename = "turbo")]
    Turbo,
}

impl StableDiffusionVersion {
    /// Detect the version from a repository id or directory name
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("TURBO") {
            StableDiffusionVersion::Turbo
        } else if name_upper.contains("XL") {
            StableDiffusionVersion::Xl
        } else if name_upper.contains("2-1")
            || name_upper.contains("2.1")
            || name_upper.contains("DIFFUSION-2")
        {
            StableDiffusionVersion::V2_1
        } else {
            StableDiffusionVersion::V1_5 // Default to 1.5 if no specific version is found
        }
    }

    fn config(self, height: Option<usize>, width: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, height, width),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, height, width),
            Self::Xl => StableDiffusionConfig::sdxl(None, height, width),
            Self::Turbo => StableDiffusionConfig::sdxl_turbo(None, height, width),
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
            Self::Xl | Self::Turbo => "openai/clip-vit-large-patch14",
        }
    }

    fn vae_scale(self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 0.18215,
            Self::Xl | Self::Turbo => 0.13025,
        }
    }

    fn default_steps(self) -> usize {
        match self {
            Self::Turbo => 1,
            _ => 30,
        }
    }

    fn default_guidance(self) -> f64 {
        match self {
            Self::Turbo => 0.0,
            _ => 7.5,
        }
    }

    fn supports_inpainting(self) -> bool {
        !matches!(self, Self::Turbo)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    TextToImage,
    ImageToImage,
    Inpainting,
}

/// Stable Diffusion model family, one variant per task.
#[derive(Clone, Copy, Debug)]
pub struct StableDiffusionFamily {
    pub task: Task,
    /// Detected from the model path when unset.
    pub version: Option<StableDiffusionVersion>,
}

impl StableDiffusionFamily {
    pub fn new(task: Task, version: Option<StableDiffusionVersion>) -> Self {
        Self { task, version }
    }
}

impl ModelFamilyProvider for StableDiffusionFamily {
    type Pipeline = StableDiffusion;

    fn load(&self, request: &LoadRequest<'_>) -> Result<Self::Pipeline> {
        let version = self
            .version
            .unwrap_or_else(|| StableDiffusionVersion::from_name(request.model_path));
        tracing::info!(
            "Loading model: {} (detected version: {:?}/task: {:?})",
            request.model_path,
            version,
            self.task
        );
        StableDiffusion::load(version, self.task, request)
    }
}

/// Tokenizer and CLIP text encoder pair.
struct ClipEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    device: Device,
}

impl ClipEncoder {
    fn load(
        config: &clip::Config,
        tokenizer_file: &Path,
        weights: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(E::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to load CLIP model")?;
        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
            device: device.clone(),
        })
    }

    fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        let (tokens, dropped) = fit_tokens(tokens, self.max_len, self.pad_id);
        if dropped > 0 {
            tracing::warn!(
                dropped,
                max_tokens = self.max_len,
                "prompt is longer than the text encoder context, truncating"
            );
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Truncates or pads `tokens` to exactly `max_len` entries. Truncation keeps the
/// final end-of-text token in the last slot. Returns the number of dropped tokens.
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> (Vec<u32>, usize) {
    let dropped = tokens.len().saturating_sub(max_len);
    if dropped > 0 && max_len > 0 {
        let end = tokens[tokens.len() - 1];
        tokens.truncate(max_len - 1);
        tokens.push(end);
    }
    tokens.resize(max_len, pad_id);
    (tokens, dropped)
}

pub struct StableDiffusion {
    version: StableDiffusionVersion,
    task: Task,
    device: Device,
    dtype: DType,
    height: usize,
    width: usize,
    encoders: Vec<ClipEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

fn weight_candidates(component: &str, stem: &str, use_f16: bool) -> Vec<String> {
    let full = format!("{component}/{stem}.safetensors");
    if use_f16 {
        vec![format!("{component}/{stem}.fp16.safetensors"), full]
    } else {
        vec![full]
    }
}

fn fetch_weights(
    source: &ModelSource,
    component: &str,
    stem: &str,
    use_f16: bool,
) -> Result<PathBuf> {
    let candidates = weight_candidates(component, stem, use_f16);
    let candidates: Vec<&str> = candidates.iter().map(String::as_str).collect();
    source.get_first(&candidates)
}

/// First timestep index to run for an image-to-image `strength`.
fn start_step(steps: usize, strength: f64) -> usize {
    let skipped = steps.saturating_sub((steps as f64 * strength) as usize);
    skipped.min(steps.saturating_sub(1))
}

impl StableDiffusion {
    pub fn load(
        version: StableDiffusionVersion,
        task: Task,
        request: &LoadRequest<'_>,
    ) -> Result<Self> {
        if task == Task::Inpainting && !version.supports_inpainting() {
            bail!("inpainting is not supported for {version:?} checkpoints");
        }
        let config = version.config(request.params.height, request.params.width);
        let source = request.hub.source(request.model_path);
        let use_f16 = request.dtype == DType::F16;
        let text_device = if request.cpu_offload {
            Device::Cpu
        } else {
            request.device.clone()
        };

        // --- Load CLIP text encoders and tokenizers ---
        let tokenizer = match source.local_file("tokenizer/tokenizer.json") {
            Some(path) => path,
            None => request.hub.file(version.tokenizer_repo(), "tokenizer.json")?,
        };
        let weights = fetch_weights(&source, "text_encoder", "model", use_f16)?;
        let mut encoders = vec![ClipEncoder::load(
            &config.clip,
            &tokenizer,
            &weights,
            &text_device,
        )?];
        if let Some(clip2) = &config.clip2 {
            let tokenizer = match source.local_file("tokenizer_2/tokenizer.json") {
                Some(path) => path,
                None => request.hub.file(TOKENIZER2_REPO, "tokenizer.json")?,
            };
            let weights = fetch_weights(&source, "text_encoder_2", "model", use_f16)?;
            encoders.push(ClipEncoder::load(clip2, &tokenizer, &weights, &text_device)?);
        }

        // --- Load UNet ---
        let unet_weights = fetch_weights(&source, "unet", "diffusion_pytorch_model", use_f16)?;
        let in_channels = match task {
            Task::Inpainting => 9,
            Task::TextToImage | Task::ImageToImage => 4,
        };
        let unet = config
            .build_unet(
                &unet_weights,
                request.device,
                in_channels,
                cfg!(feature = "flash-attn"),
                request.dtype,
            )
            .context("failed to load UNet")?;

        // --- Load autoencoder ---
        let vae_weights = match (&source, version) {
            (ModelSource::Remote { .. }, StableDiffusionVersion::Xl | StableDiffusionVersion::Turbo)
                if use_f16 =>
            {
                request.hub.file(SDXL_VAE_FP16_REPO, "diffusion_pytorch_model.safetensors")?
            }
            _ => fetch_weights(&source, "vae", "diffusion_pytorch_model", use_f16)?,
        };
        let vae = config
            .build_vae(&vae_weights, request.device, request.dtype)
            .context("failed to load autoencoder")?;

        tracing::info!(
            model = %source.name(),
            height = config.height,
            width = config.width,
            "loaded stable diffusion {version:?}"
        );
        Ok(Self {
            version,
            task,
            device: request.device.clone(),
            dtype: request.dtype,
            height: config.height,
            width: config.width,
            encoders,
            unet,
            vae,
        })
    }

    /// Prompt embeddings repeated for the batch, with the unconditional half first when
    /// classifier-free guidance is on.
    fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
        batch: usize,
    ) -> Result<Tensor> {
        let encode = |text: &str| -> Result<Tensor> {
            let parts = self
                .encoders
                .iter()
                .map(|encoder| encoder.encode(text))
                .collect::<Result<Vec<_>>>()?;
            let embeddings = Tensor::cat(&parts, D::Minus1)?
                .to_device(&self.device)?
                .to_dtype(self.dtype)?;
            Ok(embeddings.repeat((batch, 1, 1))?)
        };
        let text = encode(prompt)?;
        if use_guidance {
            let uncond = encode(negative_prompt)?;
            Ok(Tensor::cat(&[uncond, text], 0)?)
        } else {
            Ok(text)
        }
    }

    /// Encodes a (1, 3, h, w) image in `[-1, 1]` into scaled latents.
    fn encode_image(&self, image: &Tensor) -> Result<Tensor> {
        let latents = self.vae.encode(image)?.sample()?;
        Ok((latents * self.version.vae_scale())?)
    }

    fn device_tensor(&self, tensor: Tensor) -> Result<Tensor> {
        Ok(tensor.to_device(&self.device)?.to_dtype(self.dtype)?)
    }
}

impl DiffusionPipeline for StableDiffusion {
    fn generate(
        &mut self,
        inputs: PipelineInputs,
        params: &GenerationParams,
        generators: &mut Generators,
    ) -> Result<PipelineOutput> {
        let prompt = inputs
            .prompt
            .as_deref()
            .or(params.prompt.as_deref())
            .unwrap_or_default();
        let negative_prompt = params.negative_prompt.as_deref().unwrap_or_default();
        let steps = params
            .num_inference_steps
            .unwrap_or_else(|| self.version.default_steps());
        let guidance = params
            .guidance_scale
            .unwrap_or_else(|| self.version.default_guidance());
        let use_guidance = guidance > 1.0;
        let batch = params.num_images_per_prompt;
        let (height, width) = (self.height, self.width);

        let embeddings = self.text_embeddings(prompt, negative_prompt, use_guidance, batch)?;
        let mut scheduler = self
            .version
            .config(Some(height), Some(width))
            .build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_dims = [4, height / 8, width / 8];

        // --- Prepare initial latents ---
        let mut inpaint_latents = None;
        let (mut latents, t_start) = match self.task {
            Task::TextToImage => {
                let noise = generators.randn(batch, &latent_dims, DType::F32)?;
                ((noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?, 0)
            }
            Task::ImageToImage => {
                let image = inputs
                    .image
                    .as_ref()
                    .context("image-to-image requires a conditioning image")?;
                let image = self.device_tensor(image_to_tensor(image, width, height)?)?;
                let init = self.encode_image(&image)?.repeat((batch, 1, 1, 1))?;
                let strength = params.strength.unwrap_or(DEFAULT_STRENGTH);
                let t_start = start_step(timesteps.len(), strength);
                let noise = generators
                    .randn(batch, &latent_dims, DType::F32)?
                    .to_dtype(self.dtype)?;
                (scheduler.add_noise(&init, noise, timesteps[t_start])?, t_start)
            }
            Task::Inpainting => {
                let image = inputs.image.as_ref().context("inpainting requires an image")?;
                let mask = inputs
                    .mask_image
                    .as_ref()
                    .context("inpainting requires a mask image")?;
                let image = self.device_tensor(image_to_tensor(image, width, height)?)?;
                let keep = self
                    .device_tensor(mask_to_tensor(mask, width, height)?)?
                    .affine(-1., 1.)?;
                let masked_latents = self.encode_image(&image.broadcast_mul(&keep)?)?;
                let copies = if use_guidance { 2 * batch } else { batch };
                let mask_latents = self
                    .device_tensor(mask_to_tensor(mask, width / 8, height / 8)?)?
                    .repeat((copies, 1, 1, 1))?;
                inpaint_latents = Some((mask_latents, masked_latents.repeat((copies, 1, 1, 1))?));
                let noise = generators.randn(batch, &latent_dims, DType::F32)?;
                ((noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?, 0)
            }
        };

        // --- Denoise ---
        for &timestep in timesteps.iter().skip(t_start) {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let model_input = match &inpaint_latents {
                Some((mask, masked)) => Tensor::cat(&[&model_input, mask, masked], 1)?,
                None => model_input,
            };
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        tracing::debug!("Generated latent images");

        // --- Decode to (batch, height, width, 3) in [0, 1] ---
        let decoded = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        let decoded = ((decoded / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .permute((0, 2, 3, 1))?;
        let images = (0..batch)
            .map(|i| decoded.get(i))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(PipelineOutput {
            images,
            frames: Vec::new(),
        })
    }
}
