//! Box and label rendering.
//!
//! The annotator takes ownership of a frame the caller already cloned, draws
//! one rectangle plus a filled label per detection, and hands the frame back.
//! Drawing is a pure function of its inputs: detections are rendered in the
//! order given and the label font is embedded in the binary, so identical
//! inputs always produce byte-identical pixels.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

static FONT_BYTES: &[u8] = include_bytes!("../../fonts/DejaVuSans.ttf");

/// Class drawn in the primary color unless overridden.
pub const PRIMARY_CLASS: &str = "pothole";

const PRIMARY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const SECONDARY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Vertical padding inside the label background, split above and below the text.
const LABEL_PADDING: u32 = 10;

const DEFAULT_FONT_SIZE: f32 = 20.0;

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(err) => {
            log::error!("embedded label font is unreadable, labels drawn without text: {err}");
            None
        }
    })
    .as_ref()
}

/// Class name to box color.
///
/// The default scheme is two colors: one for the primary hazard class and one
/// for everything else. Per-class overrides take precedence over both.
#[derive(Clone, Debug)]
pub struct Palette {
    primary_class: String,
    primary: Rgb<u8>,
    secondary: Rgb<u8>,
    overrides: BTreeMap<String, Rgb<u8>>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            primary_class: PRIMARY_CLASS.to_string(),
            primary: PRIMARY_COLOR,
            secondary: SECONDARY_COLOR,
            overrides: BTreeMap::new(),
        }
    }
}

impl Palette {
    pub fn two_color(primary_class: impl Into<String>, primary: Rgb<u8>, secondary: Rgb<u8>) -> Self {
        Self {
            primary_class: primary_class.into(),
            primary,
            secondary,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_color(mut self, class_name: impl Into<String>, color: Rgb<u8>) -> Self {
        self.overrides.insert(class_name.into(), color);
        self
    }

    pub fn color_for(&self, class_name: &str) -> Rgb<u8> {
        if let Some(color) = self.overrides.get(class_name) {
            return *color;
        }
        if class_name == self.primary_class {
            self.primary
        } else {
            self.secondary
        }
    }
}

#[derive(Clone, Debug)]
pub struct Annotator {
    palette: Palette,
    line_thickness: u32,
    font_size: f32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            palette: Palette::default(),
            line_thickness: 2,
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

impl Annotator {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            ..Self::default()
        }
    }

    pub fn with_line_thickness(mut self, thickness: u32) -> Self {
        self.line_thickness = thickness.max(1);
        self
    }

    /// Label text height in pixels.
    pub fn with_font_size(mut self, px: f32) -> Self {
        if px.is_finite() && px >= 1.0 {
            self.font_size = px;
        }
        self
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Draw every detection onto `frame` and return it.
    pub fn annotate(&self, mut frame: Frame, detections: &[Detection]) -> Frame {
        let image = frame.image_mut();
        for det in detections {
            let color = self.palette.color_for(&det.class_name);
            let corners = pixel_corners(det, image.width(), image.height());
            self.draw_box(image, corners, color);
            self.draw_label(image, det, corners, color);
        }
        frame
    }

    fn draw_box(&self, image: &mut RgbImage, (x1, y1, x2, y2): (i32, i32, i32, i32), color: Rgb<u8>) {
        for inset in 0..self.line_thickness as i32 {
            let width = x2 - x1 + 1 - 2 * inset;
            let height = y2 - y1 + 1 - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, color);
        }
    }

    /// Rendered width and height of `label`, without padding.
    pub(crate) fn label_size(&self, label: &str) -> (u32, u32) {
        match label_font() {
            Some(font) => text_size(PxScale::from(self.font_size), font, label),
            None => (0, self.font_size.ceil() as u32),
        }
    }

    fn draw_label(
        &self,
        image: &mut RgbImage,
        det: &Detection,
        (x1, y1, _, _): (i32, i32, i32, i32),
        color: Rgb<u8>,
    ) {
        let label = format!("{} {:.2}", det.class_name, det.confidence);
        let (text_w, text_h) = self.label_size(&label);
        let bg_w = text_w.max(1);
        let bg_h = text_h + LABEL_PADDING;

        // Keep the label on canvas when the box hugs the top or right edge.
        let max_left = (image.width() as i32 - bg_w as i32).max(0);
        let left = x1.clamp(0, max_left);
        let top = (y1 - bg_h as i32).max(0);

        draw_filled_rect_mut(image, Rect::at(left, top).of_size(bg_w, bg_h), color);
        if let Some(font) = label_font() {
            draw_text_mut(
                image,
                LABEL_TEXT_COLOR,
                left,
                top + (LABEL_PADDING / 2) as i32,
                PxScale::from(self.font_size),
                font,
                &label,
            );
        }
    }
}

/// Inclusive pixel corners of a detection, clamped to the image.
fn pixel_corners(det: &Detection, width: u32, height: u32) -> (i32, i32, i32, i32) {
    let max_x = width.saturating_sub(1) as i32;
    let max_y = height.saturating_sub(1) as i32;
    let px = |v: f32, max: i32| {
        if v.is_finite() {
            (v.round() as i32).clamp(0, max)
        } else {
            0
        }
    };
    let x1 = px(det.bbox.x, max_x);
    let y1 = px(det.bbox.y, max_y);
    let x2 = px(det.bbox.right(), max_x).max(x1);
    let y2 = px(det.bbox.bottom(), max_y).max(y1);
    (x1, y1, x2, y2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn det(class: &str, bbox: [f32; 4]) -> Detection {
        Detection {
            class_name: class.to_string(),
            confidence: 0.87,
            bbox: BBox::from(bbox),
            frame_index: None,
        }
    }

    #[test]
    fn pothole_is_primary_color_others_secondary() {
        let palette = Palette::default();
        assert_eq!(palette.color_for("pothole"), PRIMARY_COLOR);
        assert_eq!(palette.color_for("speed_bump"), SECONDARY_COLOR);
        assert_eq!(palette.color_for("class_99"), SECONDARY_COLOR);

        let custom = palette.with_color("speed_bump", Rgb([0, 0, 255]));
        assert_eq!(custom.color_for("speed_bump"), Rgb([0, 0, 255]));
    }

    #[test]
    fn draws_box_edges_in_class_color() {
        let frame = Frame::filled(200, 120, [0, 0, 0]).unwrap();
        let out = Annotator::default().annotate(frame, &[det("pothole", [10.0, 40.0, 100.0, 50.0])]);
        assert_eq!(out.pixel(10, 70), Some([255, 0, 0]));
        assert_eq!(out.pixel(11, 70), Some([255, 0, 0]));
        assert_eq!(out.pixel(110, 70), Some([255, 0, 0]));
        assert_eq!(out.pixel(60, 90), Some([255, 0, 0]));
        assert_eq!(out.pixel(60, 70), Some([0, 0, 0]));
    }

    #[test]
    fn label_sits_above_box_with_white_text() {
        let frame = Frame::filled(200, 120, [0, 0, 0]).unwrap();
        let annotator = Annotator::default();
        let out = annotator.annotate(frame, &[det("speed_bump", [10.0, 60.0, 100.0, 40.0])]);
        let (text_w, text_h) = annotator.label_size("speed_bump 0.87");
        assert!(text_w > 0 && text_h > 0);
        let top = 60 - (text_h + LABEL_PADDING);
        // White glyphs blended over the green background raise red and blue.
        let text_pixels = out
            .as_image()
            .enumerate_pixels()
            .filter(|(_, y, p)| *y >= top && *y < 60 && p.0[0] > 128 && p.0[2] > 128)
            .count();
        assert!(text_pixels > 0);
        assert_eq!(out.pixel(10, top), Some([0, 255, 0]));
        assert_eq!(out.pixel(10, top - 1), Some([0, 0, 0]));
    }

    #[test]
    fn boxes_at_canvas_edges_do_not_panic() {
        let frame = Frame::filled(40, 30, [0, 0, 0]).unwrap();
        let dets = [
            det("pothole", [0.0, 0.0, 40.0, 30.0]),
            det("pothole", [35.0, 0.0, 0.0, 0.0]),
            det("speed_bump", [-5.0, -5.0, 100.0, 100.0]),
        ];
        let out = Annotator::default().annotate(frame, &dets);
        assert_eq!(out.pixel(0, 29), Some([0, 255, 0]));
    }

    #[test]
    fn label_near_top_right_is_clamped_inside_canvas() {
        let frame = Frame::filled(400, 120, [0, 0, 0]).unwrap();
        let annotator = Annotator::default();
        let (text_w, text_h) = annotator.label_size("speed_bump 0.87");
        let (bg_w, bg_h) = (text_w, text_h + LABEL_PADDING);
        assert!(8 < bg_h && bg_w < 340);

        let out = annotator.annotate(frame, &[det("speed_bump", [350.0, 8.0, 40.0, 30.0])]);
        let left = 400 - bg_w;
        // Background starts on row 0 and ends flush with the right edge.
        assert!((left..400).all(|x| out.pixel(x, 0) == Some([0, 255, 0])));
        assert_eq!(out.pixel(left - 1, 0), Some([0, 0, 0]));
        assert_eq!(out.pixel(left, bg_h), Some([0, 0, 0]));
    }

    #[test]
    fn identical_inputs_render_identically() {
        let frame = Frame::filled(160, 90, [30, 30, 30]).unwrap();
        let dets = [
            det("pothole", [5.0, 30.0, 50.0, 40.0]),
            det("speed_bump", [40.0, 35.0, 60.0, 30.0]),
        ];
        let annotator = Annotator::default();
        let a = annotator.annotate(frame.clone(), &dets);
        let b = annotator.annotate(frame.clone(), &dets);
        assert_eq!(a.pixels(), b.pixels());
        assert_ne!(a.pixels(), frame.pixels());
    }
}
