use anyhow::Result;
use image::{Rgb, RgbImage};

use super::{PaliGemmaBase, PaliGemmaModel, TextGenerator};
use crate::{Annotation, BoundingBox, DataContainer, PaliGemmaAttributes, Template};

/// Location tokens quantize each axis into this many bins.
const LOC_BINS: f32 = 1024.0;
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;

fn take_loc(text: &str) -> Option<(u32, &str)> {
    let rest = text.strip_prefix("<loc")?;
    let end = rest.find('>')?;
    let value = rest[..end].parse().ok()?;
    Some((value, &rest[end + 1..]))
}

/// Parses `<locYYYY><locXXXX><locYYYY><locXXXX> label` groups separated by `;` into
/// detections scaled to a `width` x `height` image. Malformed groups are skipped.
pub fn parse_detections(text: &str, width: u32, height: u32) -> Vec<Annotation> {
    let (width, height) = (width as f32, height as f32);
    let mut detections = Vec::new();
    'groups: for group in text.split(';') {
        let mut rest = group.trim();
        let mut coords = [0f32; 4];
        for coord in coords.iter_mut() {
            let Some((value, tail)) = take_loc(rest) else {
                continue 'groups;
            };
            *coord = (value as f32 / LOC_BINS).min(1.0);
            rest = tail;
        }
        let [y_min, x_min, y_max, x_max] = coords;
        let bbox = BoundingBox {
            x: x_min * width,
            y: y_min * height,
            w: ((x_max - x_min) * width).max(0.0),
            h: ((y_max - y_min) * height).max(0.0),
        };
        detections.push(Annotation::detection(rest.trim(), bbox));
    }
    detections
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    let (width, height) = image.dimensions();
    // Same pixel range as `ImagePacket::bbox_mask`, end exclusive.
    let x0 = bbox.x.max(0.0).floor() as u32;
    let y0 = bbox.y.max(0.0).floor() as u32;
    let x1 = ((bbox.x + bbox.w).ceil().max(0.0) as u32).min(width);
    let y1 = ((bbox.y + bbox.h).ceil().max(0.0) as u32).min(height);
    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x < x0 + BOX_THICKNESS
                || x + BOX_THICKNESS >= x1
                || y < y0 + BOX_THICKNESS
                || y + BOX_THICKNESS >= y1;
            if on_edge {
                image.put_pixel(x, y, BOX_COLOR);
            }
        }
    }
}

/// Open-vocabulary detection: the prompt lists the labels to look for.
pub struct PaliGemmaDetection<G: TextGenerator = PaliGemmaModel> {
    base: PaliGemmaBase<G>,
}

impl PaliGemmaDetection {
    pub fn new(name: impl Into<String>, attributes: PaliGemmaAttributes) -> Result<Self> {
        Ok(Self {
            base: PaliGemmaBase::new(name, attributes)?,
        })
    }
}

impl<G: TextGenerator> PaliGemmaDetection<G> {
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

impl<G: TextGenerator> Template for PaliGemmaDetection<G> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn execute(&mut self, mut container: DataContainer) -> Result<DataContainer> {
        let Some(labels) = self.base.prompt(&container) else {
            tracing::warn!(template = %self.base.name(), "no labels to detect, skipping");
            return Ok(container);
        };
        let labels = labels.trim();
        let prompt = if labels.starts_with("detect ") {
            labels.to_string()
        } else {
            format!("detect {labels}")
        };
        let draw_boxes = self.base.attributes().draw_boxes;
        for packet in &mut container.images {
            let text = self.base.generate(&packet.content, &prompt)?;
            let (width, height) = packet.content.dimensions();
            let detections = parse_detections(&text, width, height);
            tracing::info!(
                template = %self.base.name(),
                count = detections.len(),
                "detected objects"
            );
            if draw_boxes {
                for bbox in detections.iter().filter_map(|d| d.bbox.as_ref()) {
                    draw_box(&mut packet.content, bbox);
                }
            }
            packet.annotations.extend(detections);
        }
        Ok(container)
    }
}
