pub mod agent;
pub mod attributes;
pub mod cache_dir;
pub mod container;
pub mod device_map;
pub mod diffusers;
pub mod error;
pub mod generator;
pub mod hub;
pub mod loader;
mod loader_factory;
pub mod memory;
pub mod paligemma;
pub mod template;
mod util;

pub use agent::{needs_input_output, Agent, AgentConfig, TemplateConfig};
pub use attributes::{DiffusersAttributes, GenerationParams, PaliGemmaAttributes, SeedSpec};
pub use container::{Annotation, BoundingBox, DataContainer, ImagePacket, TextPacket};
pub use device_map::*;
pub use error::ConfigError;
pub use generator::{Generator, Generators};
pub use loader::*;
pub use loader_factory::*;
pub use template::Template;
pub use util::*;
