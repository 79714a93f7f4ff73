use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::ValueEnum;
use image::{DynamicImage, RgbImage};
use kiln_core::{needs_input_output, AgentConfig, DataContainer, ImagePacket, TextPacket};
use serde::{Deserialize, Serialize};

/// Source name given to packets built from form input.
pub const INPUT_SOURCE: &str = "live_stream";

const IMAGE_CLASSES: [&str; 2] = ["ImageToImageDiffusers", "InpaintingDiffusers"];
const TEXT_CLASSES: [&str; 1] = ["PaliGemmaInference"];
/// Templates that read their instruction from the form prompt.
const PROMPT_CLASSES: [&str; 2] = ["PaliGemmaDetection", "PaliGemmaInference"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    Diffusers,
    Paligemma,
}

impl Demo {
    pub fn default_config(self) -> &'static str {
        match self {
            Demo::Diffusers => "configs/text_to_image.yml",
            Demo::Paligemma => "configs/paligemma_detection.yml",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Demo::Diffusers => "Kiln Diffusers Demo",
            Demo::Paligemma => "Kiln PaliGemma Demo",
        }
    }
}

/// Which inputs the form asks for and what it returns, derived from the template
/// classes in the agent config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FormLayout {
    pub image_input: bool,
    pub prompt_required: bool,
    pub text_output: bool,
}

impl FormLayout {
    pub fn for_demo(demo: Demo, config: &AgentConfig) -> Self {
        match demo {
            Demo::Diffusers => Self {
                image_input: needs_input_output(config, &IMAGE_CLASSES),
                prompt_required: needs_input_output(config, &PROMPT_CLASSES),
                text_output: false,
            },
            Demo::Paligemma => Self {
                image_input: true,
                prompt_required: true,
                text_output: needs_input_output(config, &TEXT_CLASSES),
            },
        }
    }

    /// Warning to show instead of running the agent, if an input is missing.
    pub fn missing_input(&self, request: &ProcessRequest) -> Option<&'static str> {
        let has_image = request.image.as_deref().is_some_and(|i| !i.trim().is_empty());
        let has_prompt = request.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        match (self.image_input && !has_image, self.prompt_required && !has_prompt) {
            (true, true) => Some("Please provide both image and prompt"),
            (true, false) => Some("Please provide an input image"),
            (false, true) => Some("Please provide a prompt"),
            (false, false) => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProcessRequest {
    /// Base64-encoded PNG or JPEG.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProcessResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ProcessResponse {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            warning: Some(message.into()),
            ..Default::default()
        }
    }
}

pub fn decode_image(data: &str) -> Result<RgbImage> {
    // Accept data URLs as produced by FileReader.
    let data = data.split_once(',').map_or(data, |(_, payload)| payload);
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .context("image is not valid base64")?;
    let image = image::load_from_memory(&bytes).context("failed to decode image")?;
    Ok(image.to_rgb8())
}

pub fn encode_png(image: &RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

pub fn build_container(layout: &FormLayout, request: &ProcessRequest) -> Result<DataContainer> {
    let mut container = DataContainer::default();
    if layout.image_input {
        if let Some(data) = request.image.as_deref() {
            container
                .images
                .push(ImagePacket::new(decode_image(data)?, INPUT_SOURCE));
        }
    }
    if let Some(prompt) = request.prompt.as_deref().map(str::trim) {
        if !prompt.is_empty() {
            container.texts.push(TextPacket::new(prompt, INPUT_SOURCE));
        }
    }
    Ok(container)
}

pub fn render_response(
    demo: Demo,
    layout: &FormLayout,
    result: &DataContainer,
) -> Result<ProcessResponse> {
    match demo {
        Demo::Diffusers => {
            let generated: Vec<_> = result
                .images
                .iter()
                .filter(|p| p.source != INPUT_SOURCE)
                .collect();
            let images = generated
                .iter()
                .map(|p| encode_png(&p.content))
                .collect::<Result<Vec<_>>>()?;
            Ok(ProcessResponse {
                images,
                ..Default::default()
            })
        }
        Demo::Paligemma => {
            let packet = result
                .images
                .first()
                .ok_or_else(|| anyhow!("agent returned no images"))?;
            if layout.text_output {
                let text = packet
                    .annotations
                    .iter()
                    .find_map(|a| a.text.clone())
                    .unwrap_or_default();
                Ok(ProcessResponse {
                    text: Some(text),
                    ..Default::default()
                })
            } else {
                Ok(ProcessResponse {
                    images: vec![encode_png(&packet.content)?],
                    ..Default::default()
                })
            }
        }
    }
}

pub fn render_form(demo: Demo, layout: &FormLayout) -> String {
    let image_field = if layout.image_input {
        r#"<label>Image <input type="file" id="image" accept="image/*"></label>"#
    } else {
        ""
    };
    let output = if layout.text_output {
        r#"<textarea id="text" rows="6" readonly></textarea>"#
    } else {
        r#"<div id="images"></div>"#
    };
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<h1>{title}</h1>
<form id="form">
  {image_field}
  <label>Prompt <input type="text" id="prompt" size="60"></label>
  <button type="submit">Run</button>
</form>
<p id="warning" style="color: #b00"></p>
{output}
<script>
const readImage = (input) => new Promise((resolve) => {{
  if (!input || !input.files.length) return resolve(null);
  const reader = new FileReader();
  reader.onload = () => resolve(reader.result);
  reader.readAsDataURL(input.files[0]);
}});
document.getElementById("form").addEventListener("submit", async (event) => {{
  event.preventDefault();
  const body = {{
    image: await readImage(document.getElementById("image")),
    prompt: document.getElementById("prompt").value,
  }};
  const response = await fetch("/v1/process", {{
    method: "POST",
    headers: {{ "Content-Type": "application/json" }},
    body: JSON.stringify(body),
  }});
  const warning = document.getElementById("warning");
  if (!response.ok) {{ warning.textContent = await response.text(); return; }}
  const result = await response.json();
  warning.textContent = result.warning || "";
  const text = document.getElementById("text");
  if (text) text.value = result.text || "";
  const images = document.getElementById("images");
  if (images) images.innerHTML = (result.images || [])
    .map((data) => `<img src="data:image/png;base64,${{data}}">`).join("");
}});
</script>
</body>
</html>
"#,
        title = demo.title(),
    )
}
