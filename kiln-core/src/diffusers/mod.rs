mod base;
mod pipeline;
mod stable_diffusion;
mod templates;

pub use base::BaseDiffusers;
pub use pipeline::{DiffusionPipeline, OutputField, PipelineInputs, PipelineOutput};
pub use stable_diffusion::{StableDiffusion, StableDiffusionFamily, StableDiffusionVersion, Task};
pub use templates::{ImageToImageDiffusers, InpaintingDiffusers, TextToImageDiffusers};
