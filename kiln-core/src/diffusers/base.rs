use anyhow::{Context, Result};
use candle_core::Device;
use image::RgbImage;

use super::{DiffusionPipeline, PipelineInputs};
use crate::hub::Hub;
use crate::memory::DeviceScope;
use crate::{
    select_best_device, tensor_to_image, DataContainer, DiffusersAttributes, Generators,
    ImagePacket, LoadRequest, ModelFamilyProvider,
};

/// Shared driver for the diffusers templates: owns the loaded pipeline and the
/// generators, invokes the pipeline and merges results into the container.
pub struct BaseDiffusers<P: ModelFamilyProvider> {
    name: String,
    attributes: DiffusersAttributes,
    provider: P,
    pipeline: P::Pipeline,
    device: Device,
    generators: Generators,
}

impl<P: ModelFamilyProvider> BaseDiffusers<P> {
    pub fn new(
        name: impl Into<String>,
        attributes: DiffusersAttributes,
        provider: P,
    ) -> Result<Self> {
        let name = name.into();
        let device =
            select_best_device(attributes.device.into()).context("failed to set up device")?;
        let params = &attributes.generation_params;
        if !params.extra.is_empty() {
            tracing::warn!(
                template = %name,
                keys = ?params.extra.keys().collect::<Vec<_>>(),
                "ignoring unsupported generation parameters"
            );
        }

        tracing::info!(
            template = %name,
            model = %attributes.model_path,
            device = %attributes.device,
            dtype = %attributes.torch_dtype,
            cpu_offload = attributes.enable_model_cpu_offload,
            "loading diffusion pipeline"
        );
        let hub = Hub::new(&attributes.model_cache_dir)?;
        let pipeline = {
            let _scope = DeviceScope::enter(&device, "load");
            provider
                .load(&LoadRequest {
                    model_path: &attributes.model_path,
                    hub: &hub,
                    device: &device,
                    dtype: attributes.torch_dtype.dtype(),
                    cpu_offload: attributes.enable_model_cpu_offload,
                    params,
                })
                .with_context(|| format!("failed to load {}", attributes.model_path))?
        };
        let generators = Generators::from_spec(
            attributes.seed.as_ref(),
            params.num_images_per_prompt,
            &device,
        );

        Ok(Self {
            name,
            attributes,
            provider,
            pipeline,
            device,
            generators,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &DiffusersAttributes {
        &self.attributes
    }

    pub fn generators(&self) -> &Generators {
        &self.generators
    }

    /// Runs the pipeline once and returns the selected output field as RGB images.
    pub fn generate_images(&mut self, inputs: PipelineInputs) -> Result<Vec<RgbImage>> {
        let _scope = DeviceScope::enter(&self.device, "inference");
        let output = self.pipeline.generate(
            inputs,
            &self.attributes.generation_params,
            &mut self.generators,
        )?;
        output
            .into_field(self.provider.output_field())?
            .iter()
            .map(tensor_to_image)
            .collect()
    }

    pub fn update_images_in_container(
        &self,
        container: &mut DataContainer,
        images: Vec<RgbImage>,
    ) {
        let packets = images
            .into_iter()
            .map(|image| ImagePacket::new(image, self.name.as_str()))
            .collect();
        container.update_images(packets, self.attributes.overwrite_images);
    }
}
