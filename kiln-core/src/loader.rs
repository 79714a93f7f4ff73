use anyhow::Result;
use candle_core::{DType, Device};

use crate::diffusers::{DiffusionPipeline, OutputField};
use crate::hub::Hub;
use crate::GenerationParams;

/// Everything a model family needs to place its weights.
pub struct LoadRequest<'a> {
    pub model_path: &'a str,
    pub hub: &'a Hub,
    pub device: &'a Device,
    pub dtype: DType,
    /// Keep auxiliary components (text encoders) on the CPU.
    pub cpu_offload: bool,
    pub params: &'a GenerationParams,
}

/// Selects the pretrained pipeline a diffusers template drives and the output field it
/// reads back.
pub trait ModelFamilyProvider: Send {
    type Pipeline: DiffusionPipeline;

    fn load(&self, request: &LoadRequest<'_>) -> Result<Self::Pipeline>;

    fn output_field(&self) -> OutputField {
        OutputField::Images
    }
}
