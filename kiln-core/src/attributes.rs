//! Typed, validated template attributes.
//!
//! Attributes are deserialized from the `attributes` block of a template entry in an
//! agent config. Unknown keys are rejected, enum values must match their lowercase
//! names, and numeric generation parameters are range-checked before any model is
//! loaded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache_dir::default_cache_dir;
use crate::diffusers::StableDiffusionVersion;
use crate::{ConfigError, DeviceKind, Precision};

/// Seed specification for the diffusers templates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedSpec {
    Single(u64),
    List(Vec<u64>),
}

/// Generation parameters forwarded to the diffusion pipeline on every call.
///
/// Keys the pipelines do not understand are kept in `extra` and reported once when
/// the template is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub num_inference_steps: Option<usize>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default = "one")]
    pub num_images_per_prompt: usize,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub strength: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn one() -> usize {
    1
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: None,
            negative_prompt: None,
            num_inference_steps: None,
            guidance_scale: None,
            num_images_per_prompt: 1,
            height: None,
            width: None,
            strength: None,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_images_per_prompt == 0 {
            return Err(ConfigError::invalid(
                "num_images_per_prompt",
                "must be at least 1",
            ));
        }
        if self.num_inference_steps == Some(0) {
            return Err(ConfigError::invalid(
                "num_inference_steps",
                "must be at least 1",
            ));
        }
        for (field, value) in [("height", self.height), ("width", self.width)] {
            if let Some(value) = value {
                if value == 0 || value % 8 != 0 {
                    return Err(ConfigError::invalid(
                        field,
                        format!("{value} is not a positive multiple of 8"),
                    ));
                }
            }
        }
        if let Some(scale) = self.guidance_scale {
            if !scale.is_finite() || scale < 0.0 {
                return Err(ConfigError::invalid(
                    "guidance_scale",
                    format!("{scale} is not a finite, non-negative number"),
                ));
            }
        }
        if let Some(strength) = self.strength {
            if !(strength > 0.0 && strength <= 1.0) {
                return Err(ConfigError::invalid(
                    "strength",
                    format!("{strength} is outside (0, 1]"),
                ));
            }
        }
        Ok(())
    }
}

/// Attributes shared by every diffusers template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiffusersAttributes {
    /// Hub repository id (e.g. `stabilityai/stable-diffusion-2-1`) or a local
    /// directory laid out like a diffusers checkpoint.
    pub model_path: String,
    #[serde(default = "default_cache_dir")]
    pub model_cache_dir: PathBuf,
    pub device: DeviceKind,
    #[serde(default)]
    pub torch_dtype: Precision,
    /// Keeps the text encoders on the CPU so only the UNet and VAE occupy the
    /// accelerator.
    #[serde(default)]
    pub enable_model_cpu_offload: bool,
    pub generation_params: GenerationParams,
    #[serde(default)]
    pub seed: Option<SeedSpec>,
    #[serde(default)]
    pub overwrite_images: bool,
    /// Overrides the version detected from `model_path`.
    #[serde(default)]
    pub sd_version: Option<StableDiffusionVersion>,
}

/// Attributes shared by the PaliGemma templates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaliGemmaAttributes {
    pub model_path: String,
    pub processor_path: String,
    #[serde(default = "default_cache_dir")]
    pub model_cache_dir: PathBuf,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub torch_dtype: Precision,
    /// Used when the container carries no text packet.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Whether detection paints box outlines onto the image. Disable when a later
    /// template consumes the pixels.
    #[serde(default = "default_draw_boxes")]
    pub draw_boxes: bool,
}

fn default_max_new_tokens() -> usize {
    200
}

fn default_draw_boxes() -> bool {
    true
}

/// Attribute records that can be checked after deserialization.
pub trait Attributes: DeserializeOwned {
    fn validate(&self) -> Result<(), ConfigError>;
}

impl Attributes for DiffusersAttributes {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.model_path.trim().is_empty() {
            return Err(ConfigError::invalid("model_path", "must not be empty"));
        }
        self.generation_params.validate()
    }
}

impl Attributes for PaliGemmaAttributes {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.model_path.trim().is_empty() {
            return Err(ConfigError::invalid("model_path", "must not be empty"));
        }
        if self.processor_path.trim().is_empty() {
            return Err(ConfigError::invalid("processor_path", "must not be empty"));
        }
        if self.max_new_tokens == 0 {
            return Err(ConfigError::invalid("max_new_tokens", "must be at least 1"));
        }
        Ok(())
    }
}

/// Deserializes and validates the attribute block of the template named `template`.
pub fn parse_attributes<T: Attributes>(
    template: &str,
    value: serde_yaml::Value,
) -> Result<T, ConfigError> {
    let attributes: T =
        serde_yaml::from_value(value).map_err(|source| ConfigError::Attributes {
            template: template.to_string(),
            source,
        })?;
    attributes.validate()?;
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diffusers(yaml: &str) -> Result<DiffusersAttributes, ConfigError> {
        parse_attributes("TextToImageDiffusers", serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn applies_defaults() {
        let attrs = diffusers(
            "model_path: stabilityai/stable-diffusion-2-1\n\
             device: cpu\n\
             generation_params:\n  prompt: a red fox\n",
        )
        .unwrap();
        assert_eq!(attrs.torch_dtype, Precision::Float16);
        assert!(!attrs.enable_model_cpu_offload);
        assert!(!attrs.overwrite_images);
        assert_eq!(attrs.seed, None);
        assert_eq!(attrs.generation_params.num_images_per_prompt, 1);
        assert_eq!(attrs.generation_params.prompt.as_deref(), Some("a red fox"));
        assert!(!attrs.model_cache_dir.as_os_str().is_empty());
    }

    #[test]
    fn accepts_single_and_list_seeds() {
        let single = diffusers("model_path: x\ndevice: cpu\ngeneration_params: {}\nseed: 42\n")
            .unwrap();
        assert_eq!(single.seed, Some(SeedSpec::Single(42)));

        let list =
            diffusers("model_path: x\ndevice: cuda\ngeneration_params: {}\nseed: [7, 8]\n")
                .unwrap();
        assert_eq!(list.seed, Some(SeedSpec::List(vec![7, 8])));
        assert_eq!(list.device, DeviceKind::Cuda);
    }

    #[test]
    fn rejects_malformed_seeds() {
        for seed in ["abc", "-3", "[1.5]"] {
            let yaml = format!("model_path: x\ndevice: cpu\ngeneration_params: {{}}\nseed: {seed}");
            assert!(diffusers(&yaml).is_err(), "seed: {seed}");
        }
    }

    #[test]
    fn rejects_schema_violations() {
        let missing_device = diffusers("model_path: x\ngeneration_params: {}\n");
        assert!(matches!(missing_device, Err(ConfigError::Attributes { .. })));

        let bad_device = diffusers("model_path: x\ndevice: tpu\ngeneration_params: {}\n");
        assert!(bad_device.is_err());

        let bad_dtype =
            diffusers("model_path: x\ndevice: cpu\ntorch_dtype: int8\ngeneration_params: {}\n");
        assert!(bad_dtype.is_err());

        let unknown = diffusers("model_path: x\ndevice: cpu\ngeneration_params: {}\nfoo: 1\n");
        assert!(unknown.is_err());

        let empty_path = diffusers("model_path: ' '\ndevice: cpu\ngeneration_params: {}\n");
        assert!(matches!(
            empty_path,
            Err(ConfigError::Invalid { field: "model_path", .. })
        ));
    }

    #[test]
    fn validates_generation_params() {
        let zero_images = diffusers(
            "model_path: x\ndevice: cpu\ngeneration_params: {num_images_per_prompt: 0}\n",
        );
        assert!(matches!(
            zero_images,
            Err(ConfigError::Invalid { field: "num_images_per_prompt", .. })
        ));

        let odd_height =
            diffusers("model_path: x\ndevice: cpu\ngeneration_params: {height: 500}\n");
        assert!(matches!(odd_height, Err(ConfigError::Invalid { field: "height", .. })));

        let bad_strength =
            diffusers("model_path: x\ndevice: cpu\ngeneration_params: {strength: 1.5}\n");
        assert!(matches!(bad_strength, Err(ConfigError::Invalid { field: "strength", .. })));
    }

    #[test]
    fn keeps_unknown_generation_params() {
        let attrs = diffusers(
            "model_path: x\ndevice: cpu\ngeneration_params: {eta: 0.5, num_images_per_prompt: 2}\n",
        )
        .unwrap();
        assert_eq!(attrs.generation_params.num_images_per_prompt, 2);
        assert!(attrs.generation_params.extra.contains_key("eta"));
    }

    #[test]
    fn explicit_cache_dir_is_kept() {
        let attrs = diffusers(
            "model_path: x\nmodel_cache_dir: /tmp/models\ndevice: cpu\ngeneration_params: {}\n",
        )
        .unwrap();
        assert_eq!(attrs.model_cache_dir, PathBuf::from("/tmp/models"));
    }

    #[test]
    fn paligemma_defaults() {
        let yaml = "model_path: google/paligemma-3b-mix-224\n\
                    processor_path: google/paligemma-3b-mix-224\n";
        let attrs: PaliGemmaAttributes =
            parse_attributes("PaliGemmaInference", serde_yaml::from_str(yaml).unwrap()).unwrap();
        assert_eq!(attrs.device, DeviceKind::Cpu);
        assert_eq!(attrs.max_new_tokens, 200);
        assert_eq!(attrs.torch_dtype, Precision::Float16);
        assert_eq!(attrs.prompt, None);
        assert!(attrs.draw_boxes);
    }

    #[test]
    fn paligemma_rejects_zero_tokens() {
        let result: Result<PaliGemmaAttributes, _> = parse_attributes(
            "PaliGemmaInference",
            serde_yaml::from_str("model_path: a\nprocessor_path: b\nmax_new_tokens: 0\n").unwrap(),
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "max_new_tokens", .. })
        ));
    }
}
