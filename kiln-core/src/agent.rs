//! Agent configs and the driver that runs their templates in order.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{build_template, ConfigError, DataContainer, Template};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One template entry of an agent config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub template_name: String,
    pub class_name: String,
    /// Name of the template whose output feeds this one.
    #[serde(default)]
    pub template_input: Option<String>,
    #[serde(default = "empty_mapping")]
    pub attributes: serde_yaml::Value,
}

fn empty_mapping() -> serde_yaml::Value {
    serde_yaml::Value::Mapping(Default::default())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentInfo,
    pub templates: Vec<TemplateConfig>,
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Checks template names are unique and every input names an earlier template.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.templates.is_empty() {
            return Err(ConfigError::invalid(
                "templates",
                "an agent needs at least one template",
            ));
        }
        let mut seen = HashSet::new();
        for template in &self.templates {
            if let Some(input) = &template.template_input {
                if !seen.contains(input.as_str()) {
                    return Err(ConfigError::UnknownInput {
                        template: template.template_name.clone(),
                        input: input.clone(),
                    });
                }
            }
            if !seen.insert(template.template_name.as_str()) {
                return Err(ConfigError::DuplicateTemplate(template.template_name.clone()));
            }
        }
        Ok(())
    }
}

impl FromStr for AgentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: AgentConfig = serde_yaml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }
}

/// Reports whether `config` contains a template of any of the given classes.
pub fn needs_input_output(config: &AgentConfig, class_names: &[&str]) -> bool {
    config
        .templates
        .iter()
        .any(|t| class_names.contains(&t.class_name.as_str()))
}

/// Loaded templates of one agent.
pub struct Agent {
    name: String,
    templates: Vec<Box<dyn Template>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, templates: Vec<Box<dyn Template>>) -> Self {
        Self {
            name: name.into(),
            templates,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            agent = %config.agent.name,
            templates = config.templates.len(),
            "building agent"
        );
        let templates = config
            .templates
            .iter()
            .map(|t| {
                build_template(t)
                    .with_context(|| format!("failed to build template `{}`", t.template_name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(config.agent.name.clone(), templates))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        for template in &mut self.templates {
            tracing::debug!(
                agent = %self.name,
                template = template.name(),
                "executing template"
            );
            let name = template.name().to_string();
            container = template
                .execute(container)
                .with_context(|| format!("template `{name}` failed"))?;
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use image::RgbImage;

    use super::*;
    use crate::{ImagePacket, TextPacket};

    const CONFIG: &str = r#"
agent:
  name: text_to_image
  description: generates images from a prompt
templates:
  - template_name: InputTemplate
    class_name: InputTemplate
    attributes: {}
  - template_name: TextToImageDiffusers
    class_name: TextToImageDiffusers
    template_input: InputTemplate
    attributes:
      model_path: stabilityai/stable-diffusion-2-1
      device: cuda
      generation_params:
        prompt: a red fox
"#;

    struct Stamp(&'static str);

    impl Template for Stamp {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
            container.texts.push(TextPacket::new(self.0, self.0));
            Ok(container)
        }
    }

    #[test]
    fn parses_agent_config() {
        let config: AgentConfig = CONFIG.parse().unwrap();
        assert_eq!(config.agent.name, "text_to_image");
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.templates[0].template_input, None);
        assert_eq!(
            config.templates[1].template_input.as_deref(),
            Some("InputTemplate")
        );
        assert!(config.templates[1].attributes.get("model_path").is_some());
    }

    #[test]
    fn rejects_unknown_input() {
        let yaml = CONFIG.replace("template_input: InputTemplate", "template_input: Missing");
        let err = yaml.parse::<AgentConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInput { input, .. } if input == "Missing"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let yaml = CONFIG.replace(
            "template_name: TextToImageDiffusers",
            "template_name: InputTemplate",
        );
        let err = yaml.parse::<AgentConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTemplate(name) if name == "InputTemplate"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = "agent: [".parse::<AgentConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn detects_classes_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(CONFIG.as_bytes())?;
        let config = AgentConfig::from_file(file.path())?;
        assert!(needs_input_output(&config, &["TextToImageDiffusers"]));
        assert!(!needs_input_output(
            &config,
            &["ImageToImageDiffusers", "InpaintingDiffusers"]
        ));
        Ok(())
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = AgentConfig::from_file("/nonexistent/agent.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn runs_templates_in_order() -> Result<()> {
        let mut agent = Agent::new(
            "test",
            vec![Box::new(Stamp("first")), Box::new(Stamp("second"))],
        );
        let mut container = DataContainer::default();
        container.images.push(ImagePacket::new(RgbImage::new(1, 1), "input"));
        let container = agent.run(container)?;
        let sources: Vec<_> = container.texts.iter().map(|t| t.source.as_str()).collect();
        assert_eq!(sources, vec!["first", "second"]);
        assert_eq!(container.images.len(), 1);
        Ok(())
    }

    #[test]
    fn sample_configs_are_valid() -> Result<()> {
        use crate::attributes::parse_attributes;
        use crate::{DiffusersAttributes, PaliGemmaAttributes};

        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let mut checked = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "yml") {
                continue;
            }
            let config = AgentConfig::from_file(&path)?;
            for template in &config.templates {
                let name = template.template_name.as_str();
                let attributes = template.attributes.clone();
                if template.class_name.ends_with("Diffusers") {
                    parse_attributes::<DiffusersAttributes>(name, attributes)?;
                } else if template.class_name.starts_with("PaliGemma") {
                    parse_attributes::<PaliGemmaAttributes>(name, attributes)?;
                }
            }
            checked += 1;
        }
        assert_eq!(checked, 5);
        Ok(())
    }

    #[test]
    fn builds_input_only_agent() -> Result<()> {
        let yaml = "agent: {name: passthrough}\n\
                    templates:\n  - {template_name: in, class_name: InputTemplate}\n";
        let config: AgentConfig = yaml.parse()?;
        let mut agent = Agent::from_config(&config)?;
        assert_eq!(agent.name(), "passthrough");
        let mut container = DataContainer::default();
        container.texts.push(TextPacket::new("hello", "input"));
        assert_eq!(agent.run(container.clone())?, container);
        Ok(())
    }
}
