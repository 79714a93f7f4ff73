use image::{GrayImage, Luma, RgbImage};

/// Axis-aligned box in pixel coordinates of the packet's image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Annotation {
    pub label: Option<String>,
    pub text: Option<String>,
    pub bbox: Option<BoundingBox>,
}

impl Annotation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn detection(label: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            label: Some(label.into()),
            bbox: Some(bbox),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImagePacket {
    pub content: RgbImage,
    pub source: String,
    pub annotations: Vec<Annotation>,
}

impl ImagePacket {
    pub fn new(content: RgbImage, source: impl Into<String>) -> Self {
        Self {
            content,
            source: source.into(),
            annotations: Vec::new(),
        }
    }

    /// Mask covering the union of the packet's annotation boxes, or `None` when no
    /// annotation carries a box.
    pub fn bbox_mask(&self) -> Option<GrayImage> {
        let (width, height) = self.content.dimensions();
        let mut mask = GrayImage::new(width, height);
        let mut any = false;
        for bbox in self.annotations.iter().filter_map(|a| a.bbox) {
            any = true;
            let x0 = bbox.x.max(0.0).floor() as u32;
            let y0 = bbox.y.max(0.0).floor() as u32;
            let x1 = ((bbox.x + bbox.w).ceil().max(0.0) as u32).min(width);
            let y1 = ((bbox.y + bbox.h).ceil().max(0.0) as u32).min(height);
            for y in y0..y1 {
                for x in x0..x1 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        any.then_some(mask)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextPacket {
    pub content: String,
    pub source: String,
}

impl TextPacket {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
        }
    }
}

/// Packets threaded through every template of an agent run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataContainer {
    pub images: Vec<ImagePacket>,
    pub texts: Vec<TextPacket>,
}

impl DataContainer {
    /// Replaces the image packets when `overwrite` is set, appends otherwise.
    pub fn update_images(&mut self, packets: Vec<ImagePacket>, overwrite: bool) {
        if overwrite {
            self.images = packets;
        } else {
            self.images.extend(packets);
        }
    }

    pub fn last_text(&self) -> Option<&str> {
        self.texts
            .last()
            .map(|t| t.content.as_str())
            .filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(shade: u8, source: &str) -> ImagePacket {
        ImagePacket::new(RgbImage::from_pixel(2, 2, image::Rgb([shade; 3])), source)
    }

    fn sources(container: &DataContainer) -> Vec<&str> {
        container.images.iter().map(|p| p.source.as_str()).collect()
    }

    #[test]
    fn append_keeps_prior_packets_first() {
        let mut container = DataContainer::default();
        container.images = vec![packet(1, "a"), packet(2, "b"), packet(3, "c")];
        container.update_images(vec![packet(4, "d"), packet(5, "e")], false);
        assert_eq!(container.images.len(), 5);
        assert_eq!(sources(&container), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn overwrite_keeps_only_new_packets() {
        let mut container = DataContainer::default();
        container.images = vec![packet(1, "a"), packet(2, "b")];
        container.update_images(vec![packet(3, "c"), packet(4, "d")], true);
        assert_eq!(sources(&container), vec!["c", "d"]);
    }

    #[test]
    fn overwrite_with_empty_batch_clears_images() {
        let mut container = DataContainer::default();
        container.images = vec![packet(1, "a")];
        container.update_images(Vec::new(), true);
        assert!(container.images.is_empty());
    }

    #[test]
    fn texts_are_untouched_by_image_updates() {
        let mut container = DataContainer::default();
        container.texts.push(TextPacket::new("prompt", "live_stream"));
        container.update_images(vec![packet(1, "a")], true);
        assert_eq!(container.last_text(), Some("prompt"));
    }

    #[test]
    fn blank_text_is_not_a_prompt() {
        let mut container = DataContainer::default();
        container.texts.push(TextPacket::new("  ", "live_stream"));
        assert_eq!(container.last_text(), None);
    }

    #[test]
    fn bbox_mask_covers_union_of_boxes() {
        let mut p = ImagePacket::new(RgbImage::new(10, 10), "src");
        assert!(p.bbox_mask().is_none());
        p.annotations.push(Annotation::text("caption"));
        assert!(p.bbox_mask().is_none());
        p.annotations.push(Annotation::detection(
            "cat",
            BoundingBox { x: 1.0, y: 1.0, w: 2.0, h: 2.0 },
        ));
        p.annotations.push(Annotation::detection(
            "dog",
            BoundingBox { x: 8.0, y: 8.0, w: 5.0, h: 5.0 },
        ));
        let mask = p.bbox_mask().unwrap();
        let set = mask.pixels().filter(|px| px.0[0] == 255).count();
        assert_eq!(set, 4 + 4);
        assert_eq!(mask.get_pixel(1, 1).0, [255]);
        assert_eq!(mask.get_pixel(0, 0).0, [0]);
        assert_eq!(mask.get_pixel(9, 9).0, [255]);
    }
}
