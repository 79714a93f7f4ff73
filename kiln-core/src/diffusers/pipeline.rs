use anyhow::{anyhow, Result};
use candle_core::Tensor;
use image::{GrayImage, RgbImage};

use crate::{GenerationParams, Generators};

/// Which field of the raw pipeline output holds the generated elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputField {
    #[default]
    Images,
    /// Frames of the first generated clip.
    Frames,
}

/// Runtime inputs merged with the static generation parameters on each call.
#[derive(Clone, Debug, Default)]
pub struct PipelineInputs {
    /// Overrides `generation_params.prompt`.
    pub prompt: Option<String>,
    pub image: Option<RgbImage>,
    pub mask_image: Option<GrayImage>,
}

/// Raw pipeline output; every tensor is (height, width, 3) with values nominally in
/// `[0, 1]`.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub images: Vec<Tensor>,
    pub frames: Vec<Vec<Tensor>>,
}

impl PipelineOutput {
    pub fn into_field(self, field: OutputField) -> Result<Vec<Tensor>> {
        match field {
            OutputField::Images => Ok(self.images),
            OutputField::Frames => self
                .frames
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("pipeline output has no frames")),
        }
    }
}

pub trait DiffusionPipeline: Send {
    fn generate(
        &mut self,
        inputs: PipelineInputs,
        params: &GenerationParams,
        generators: &mut Generators,
    ) -> Result<PipelineOutput>;
}
