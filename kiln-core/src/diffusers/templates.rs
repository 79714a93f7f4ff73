use anyhow::Result;

use super::{BaseDiffusers, PipelineInputs, StableDiffusionFamily, Task};
use crate::{DataContainer, DiffusersAttributes, ModelFamilyProvider, Template};

fn prompt_override(container: &DataContainer) -> Option<String> {
    container.last_text().map(str::to_owned)
}

/// Upstream text only stands in for the prompt when the config leaves it unset.
fn prompt_fallback(container: &DataContainer, attributes: &DiffusersAttributes) -> Option<String> {
    match attributes.generation_params.prompt {
        Some(_) => None,
        None => prompt_override(container),
    }
}

/// Generates images from the configured prompt.
pub struct TextToImageDiffusers<P: ModelFamilyProvider = StableDiffusionFamily> {
    base: BaseDiffusers<P>,
}

impl TextToImageDiffusers {
    pub fn new(name: impl Into<String>, attributes: DiffusersAttributes) -> Result<Self> {
        let family = StableDiffusionFamily::new(Task::TextToImage, attributes.sd_version);
        Self::with_provider(name, attributes, family)
    }
}

impl<P: ModelFamilyProvider> TextToImageDiffusers<P> {
    pub fn with_provider(
        name: impl Into<String>,
        attributes: DiffusersAttributes,
        provider: P,
    ) -> Result<Self> {
        Ok(Self {
            base: BaseDiffusers::new(name, attributes, provider)?,
        })
    }
}

impl<P: ModelFamilyProvider> Template for TextToImageDiffusers<P> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        let inputs = PipelineInputs {
            prompt: prompt_override(&container),
            ..Default::default()
        };
        let images = self.base.generate_images(inputs)?;
        self.base.update_images_in_container(&mut container, images);
        Ok(container)
    }
}

/// Generates variations of every image already in the container.
pub struct ImageToImageDiffusers<P: ModelFamilyProvider = StableDiffusionFamily> {
    base: BaseDiffusers<P>,
}

impl ImageToImageDiffusers {
    pub fn new(name: impl Into<String>, attributes: DiffusersAttributes) -> Result<Self> {
        let family = StableDiffusionFamily::new(Task::ImageToImage, attributes.sd_version);
        Self::with_provider(name, attributes, family)
    }
}

impl<P: ModelFamilyProvider> ImageToImageDiffusers<P> {
    pub fn with_provider(
        name: impl Into<String>,
        attributes: DiffusersAttributes,
        provider: P,
    ) -> Result<Self> {
        Ok(Self {
            base: BaseDiffusers::new(name, attributes, provider)?,
        })
    }
}

impl<P: ModelFamilyProvider> Template for ImageToImageDiffusers<P> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        if container.images.is_empty() {
            tracing::warn!(template = %self.base.name(), "no input images, nothing to do");
            return Ok(container);
        }
        let prompt = prompt_fallback(&container, self.base.attributes());
        let mut generated = Vec::new();
        for packet in &container.images {
            let inputs = PipelineInputs {
                prompt: prompt.clone(),
                image: Some(packet.content.clone()),
                mask_image: None,
            };
            generated.extend(self.base.generate_images(inputs)?);
        }
        self.base.update_images_in_container(&mut container, generated);
        Ok(container)
    }
}

/// Repaints the annotated regions of every image already in the container.
pub struct InpaintingDiffusers<P: ModelFamilyProvider = StableDiffusionFamily> {
    base: BaseDiffusers<P>,
}

impl InpaintingDiffusers {
    pub fn new(name: impl Into<String>, attributes: DiffusersAttributes) -> Result<Self> {
        let family = StableDiffusionFamily::new(Task::Inpainting, attributes.sd_version);
        Self::with_provider(name, attributes, family)
    }
}

impl<P: ModelFamilyProvider> InpaintingDiffusers<P> {
    pub fn with_provider(
        name: impl Into<String>,
        attributes: DiffusersAttributes,
        provider: P,
    ) -> Result<Self> {
        Ok(Self {
            base: BaseDiffusers::new(name, attributes, provider)?,
        })
    }
}

impl<P: ModelFamilyProvider> Template for InpaintingDiffusers<P> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        let prompt = prompt_fallback(&container, self.base.attributes());
        let mut generated = Vec::new();
        for (index, packet) in container.images.iter().enumerate() {
            let Some(mask) = packet.bbox_mask() else {
                tracing::warn!(
                    template = %self.base.name(),
                    index,
                    "image has no bounding boxes to inpaint, skipping"
                );
                continue;
            };
            let inputs = PipelineInputs {
                prompt: prompt.clone(),
                image: Some(packet.content.clone()),
                mask_image: Some(mask),
            };
            generated.extend(self.base.generate_images(inputs)?);
        }
        if !generated.is_empty() {
            self.base.update_images_in_container(&mut container, generated);
        }
        Ok(container)
    }
}
