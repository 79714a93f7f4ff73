use anyhow::Result;

use super::{PaliGemmaBase, PaliGemmaModel, TextGenerator};
use crate::{Annotation, DataContainer, PaliGemmaAttributes, Template, TextPacket};

/// Free-form prompting: captions, questions and the like.
pub struct PaliGemmaInference<G: TextGenerator = PaliGemmaModel> {
    base: PaliGemmaBase<G>,
}

impl PaliGemmaInference {
    pub fn new(name: impl Into<String>, attributes: PaliGemmaAttributes) -> Result<Self> {
        Ok(Self {
            base: PaliGemmaBase::new(name, attributes)?,
        })
    }
}

impl<G: TextGenerator> PaliGemmaInference<G> {
    pub fn with_generator(
        name: impl Into<String>,
        attributes: PaliGemmaAttributes,
        generator: G,
    ) -> Self {
        Self {
            base: PaliGemmaBase::with_generator(name, attributes, generator),
        }
    }
}

impl<G: TextGenerator> Template for PaliGemmaInference<G> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        let Some(prompt) = self.base.prompt(&container) else {
            tracing::warn!(template = %self.base.name(), "no prompt available, skipping");
            return Ok(container);
        };
        let mut answers = Vec::with_capacity(container.images.len());
        for packet in &mut container.images {
            let text = self.base.generate(&packet.content, &prompt)?;
            tracing::debug!(template = %self.base.name(), %text, "paligemma answer");
            packet.annotations.push(Annotation::text(text.as_str()));
            answers.push(TextPacket::new(text, self.base.name()));
        }
        container.texts.extend(answers);
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::paligemma::tests::{attributes, CannedGenerator};
    use crate::ImagePacket;

    #[test]
    fn annotates_each_image_and_emits_text() -> Result<()> {
        let generator = CannedGenerator::new("a cat on a sofa");
        let prompts = generator.prompts.clone();
        let mut template = PaliGemmaInference::with_generator("caption", attributes(""), generator);

        let mut container = DataContainer::default();
        container.images.push(ImagePacket::new(RgbImage::new(4, 4), "input"));
        container.images.push(ImagePacket::new(RgbImage::new(4, 4), "input"));
        container.texts.push(TextPacket::new("caption en", "input"));

        let container = template.execute(container)?;
        assert_eq!(*prompts.lock().unwrap(), vec!["caption en", "caption en"]);
        assert_eq!(
            container.images[0].annotations[0].text.as_deref(),
            Some("a cat on a sofa")
        );
        assert_eq!(container.texts.len(), 3);
        assert_eq!(container.texts[2].source, "caption");
        assert_eq!(container.last_text(), Some("a cat on a sofa"));
        Ok(())
    }

    #[test]
    fn missing_prompt_leaves_container_untouched() -> Result<()> {
        let generator = CannedGenerator::new("x");
        let mut template = PaliGemmaInference::with_generator("caption", attributes(""), generator);
        let mut container = DataContainer::default();
        container.images.push(ImagePacket::new(RgbImage::new(4, 4), "input"));
        let container = template.execute(container)?;
        assert!(container.images[0].annotations.is_empty());
        assert!(container.texts.is_empty());
        Ok(())
    }
}
