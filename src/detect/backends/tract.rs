#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use super::apply_thresholds;
use crate::detect::backend::{HazardModel, RawBox, Thresholds};
use crate::detect::normalize::ClassTable;
use crate::frame::Frame;

/// Gray used by YOLO exports for letterbox padding.
const PAD_VALUE: u8 = 114;

type YoloPlan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// Tract-based backend for YOLO-style ONNX exports.
///
/// Expects a single `[1, 3, S, S]` float input and a single output laid out as
/// `[1, 4 + C, N]` (or its transpose), where the first four attributes are the
/// box center and size in input pixels and the rest are per-class scores.
/// Loading the model is the only disk access; inference keeps no state.
pub struct TractYolo {
    model: YoloPlan,
    input_size: u32,
    classes: ClassTable,
}

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractYolo {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P, input_size: u32, classes: ClassTable) -> Result<Self> {
        let model_path = model_path.as_ref();
        if input_size == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            classes,
        })
    }

    fn build_input(&self, frame: &Frame) -> (Tensor, Letterbox) {
        let size = self.input_size;
        let (width, height) = (frame.width(), frame.height());
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        let resized = image::imageops::resize(frame.as_image(), new_w, new_h, FilterType::Triangle);

        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
        image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });

        (
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        )
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        letterbox: &Letterbox,
        frame: &Frame,
        thresholds: &Thresholds,
    ) -> Result<Vec<RawBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a 3D model output")?;

        let (_, d1, d2) = view.dim();
        let attrs_first = d1 < d2;
        let (num_attrs, num_boxes) = if attrs_first { (d1, d2) } else { (d2, d1) };
        if num_attrs < 5 {
            return Err(anyhow!(
                "model output has {} attributes per box, need at least 5",
                num_attrs
            ));
        }
        let attr = |a: usize, i: usize| {
            if attrs_first {
                view[[0, a, i]]
            } else {
                view[[0, i, a]]
            }
        };

        let max_x = frame.width() as f32;
        let max_y = frame.height() as f32;
        let mut candidates = Vec::new();
        for i in 0..num_boxes {
            let (class_id, score) = (4..num_attrs)
                .map(|a| (a - 4, attr(a, i)))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < thresholds.confidence {
                continue;
            }

            let (cx, cy, w, h) = (attr(0, i), attr(1, i), attr(2, i), attr(3, i));
            let unpad = |v: f32, pad: f32, max: f32| ((v - pad) / letterbox.scale).clamp(0.0, max);
            candidates.push(RawBox {
                x1: unpad(cx - w / 2.0, letterbox.pad_x, max_x),
                y1: unpad(cy - h / 2.0, letterbox.pad_y, max_y),
                x2: unpad(cx + w / 2.0, letterbox.pad_x, max_x),
                y2: unpad(cy + h / 2.0, letterbox.pad_y, max_y),
                class_id,
                confidence: score.min(1.0),
            });
        }

        Ok(apply_thresholds(candidates, thresholds))
    }
}

impl HazardModel for TractYolo {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn classes(&self) -> &ClassTable {
        &self.classes
    }

    fn infer(&self, frame: &Frame, thresholds: &Thresholds) -> Result<Vec<RawBox>> {
        let (input, letterbox) = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let boxes = self.decode(outputs, &letterbox, frame, thresholds)?;
        log::debug!("tract-yolo: {} boxes after suppression", boxes.len());
        Ok(boxes)
    }

    fn warm_up(&self) -> Result<()> {
        let frame = Frame::filled(self.input_size, self.input_size, [PAD_VALUE; 3])?;
        self.infer(&frame, &Thresholds::default()).map(|_| ())
    }
}
