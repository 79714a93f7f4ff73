use anyhow::Result;

use crate::attributes::parse_attributes;
use crate::diffusers::{ImageToImageDiffusers, InpaintingDiffusers, TextToImageDiffusers};
use crate::paligemma::{PaliGemmaDetection, PaliGemmaInference};
use crate::template::InputTemplate;
use crate::{ConfigError, Template, TemplateConfig};

/// Enum of template classes an agent config can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateClass {
    Input,
    TextToImage,
    ImageToImage,
    Inpainting,
    PaliGemmaInference,
    PaliGemmaDetection,
}

impl TemplateClass {
    pub const ALL: [TemplateClass; 6] = [
        TemplateClass::Input,
        TemplateClass::TextToImage,
        TemplateClass::ImageToImage,
        TemplateClass::Inpainting,
        TemplateClass::PaliGemmaInference,
        TemplateClass::PaliGemmaDetection,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            TemplateClass::Input => "InputTemplate",
            TemplateClass::TextToImage => "TextToImageDiffusers",
            TemplateClass::ImageToImage => "ImageToImageDiffusers",
            TemplateClass::Inpainting => "InpaintingDiffusers",
            TemplateClass::PaliGemmaInference => "PaliGemmaInference",
            TemplateClass::PaliGemmaDetection => "PaliGemmaDetection",
        }
    }

    pub fn from_name(class_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| class.class_name() == class_name)
    }
}

/// Builds the template a config entry describes, loading its model if it has one.
pub fn build_template(config: &TemplateConfig) -> Result<Box<dyn Template>> {
    let class = TemplateClass::from_name(&config.class_name)
        .ok_or_else(|| ConfigError::UnknownClass(config.class_name.clone()))?;
    let name = config.template_name.as_str();
    let attributes = config.attributes.clone();

    tracing::info!(
        "Building template: {} (class: {:?})",
        name,
        class
    );

    let template: Box<dyn Template> = match class {
        TemplateClass::Input => Box::new(InputTemplate::new(name)),
        TemplateClass::TextToImage => Box::new(TextToImageDiffusers::new(
            name,
            parse_attributes(name, attributes)?,
        )?),
        TemplateClass::ImageToImage => Box::new(ImageToImageDiffusers::new(
            name,
            parse_attributes(name, attributes)?,
        )?),
        TemplateClass::Inpainting => Box::new(InpaintingDiffusers::new(
            name,
            parse_attributes(name, attributes)?,
        )?),
        TemplateClass::PaliGemmaInference => Box::new(PaliGemmaInference::new(
            name,
            parse_attributes(name, attributes)?,
        )?),
        TemplateClass::PaliGemmaDetection => Box::new(PaliGemmaDetection::new(
            name,
            parse_attributes(name, attributes)?,
        )?),
    };
    Ok(template)
}
