//! Single-frame detection: model, normalizer, annotator.
//!
//! `FrameDetector` is the unit of work every entry point reuses. It holds no
//! mutable state, so one instance is shared across request threads.

use std::sync::Arc;

use crate::annotate::Annotator;
use crate::detect::{normalize, Detection, HazardModel, Thresholds};
use crate::error::{DetectError, Result};
use crate::frame::Frame;

#[derive(Clone)]
pub struct FrameDetector {
    model: Arc<dyn HazardModel>,
    thresholds: Thresholds,
    annotator: Annotator,
}

impl FrameDetector {
    pub fn new(model: Arc<dyn HazardModel>, thresholds: Thresholds) -> Self {
        Self {
            model,
            thresholds,
            annotator: Annotator::default(),
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Detections only, no rendering.
    pub fn detections(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let raw = self
            .model
            .infer(frame, &self.thresholds)
            .map_err(DetectError::inference)?;
        let classes = self.model.classes();
        let detections = raw
            .iter()
            .map(|b| normalize(b, classes))
            .collect::<Result<Vec<_>>>()?;
        for det in &detections {
            log::debug!(
                "{} {:.2} at [{:.1}, {:.1}, {:.1}, {:.1}]",
                det.class_name,
                det.confidence,
                det.bbox.x,
                det.bbox.y,
                det.bbox.width,
                det.bbox.height
            );
        }
        Ok(detections)
    }

    /// Run detection on `frame` and render the results onto a copy of it.
    ///
    /// Finding nothing is a successful empty result. The input frame is left
    /// untouched.
    pub fn detect_one(&self, frame: &Frame) -> Result<(Frame, Vec<Detection>)> {
        let detections = self.detections(frame)?;
        let annotated = self.annotator.annotate(frame.clone(), &detections);
        Ok((annotated, detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ClassTable, RawBox, ScriptedModel};

    fn pothole_box() -> RawBox {
        RawBox {
            x1: 10.0,
            y1: 20.0,
            x2: 110.0,
            y2: 70.0,
            class_id: 0,
            confidence: 0.87,
        }
    }

    fn detector(model: ScriptedModel) -> FrameDetector {
        FrameDetector::new(Arc::new(model), Thresholds::default())
    }

    #[test]
    fn single_pothole_end_to_end() {
        let det = detector(ScriptedModel::with_boxes(
            ClassTable::road_hazards(),
            vec![pothole_box()],
        ));
        let frame = Frame::filled(200, 120, [0, 0, 0]).unwrap();
        let (annotated, detections) = det.detect_one(&frame).unwrap();

        assert_eq!(
            serde_json::to_value(&detections).unwrap(),
            serde_json::json!([
                {"class": "pothole", "confidence": 0.87f32, "bbox": [10.0, 20.0, 100.0, 50.0]}
            ])
        );
        assert_eq!(annotated.pixel(10, 45), Some([255, 0, 0]));
        assert_eq!(annotated.pixel(110, 45), Some([255, 0, 0]));
        assert_eq!(annotated.pixel(60, 70), Some([255, 0, 0]));
        assert_eq!(annotated.pixel(60, 45), Some([0, 0, 0]));
        assert!(frame.pixels().iter().all(|&v| v == 0));
    }

    #[test]
    fn nothing_found_is_success() {
        let det = detector(ScriptedModel::empty(ClassTable::road_hazards()));
        let frame = Frame::filled(32, 32, [9, 9, 9]).unwrap();
        let (annotated, detections) = det.detect_one(&frame).unwrap();
        assert!(detections.is_empty());
        assert_eq!(annotated, frame);
    }

    #[test]
    fn unknown_class_gets_synthesized_label() {
        let mut raw = pothole_box();
        raw.class_id = 99;
        let det = detector(ScriptedModel::with_boxes(ClassTable::road_hazards(), vec![raw]));
        let frame = Frame::filled(200, 120, [0, 0, 0]).unwrap();
        let detections = det.detections(&frame).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "class_99");
    }

    #[test]
    fn repeated_runs_are_identical() {
        let det = detector(ScriptedModel::with_boxes(
            ClassTable::road_hazards(),
            vec![pothole_box()],
        ));
        let frame = Frame::filled(200, 120, [40, 40, 40]).unwrap();
        let first = det.detect_one(&frame).unwrap();
        let second = det.detect_one(&frame).unwrap();
        assert_eq!(first.1, second.1);
        assert_eq!(first.0.pixels(), second.0.pixels());
    }

    #[test]
    fn model_failure_is_inference_failure() {
        let det = detector(ScriptedModel::from_fn(ClassTable::road_hazards(), |_| {
            Err(anyhow::anyhow!("backend crashed"))
        }));
        let frame = Frame::filled(8, 8, [0, 0, 0]).unwrap();
        let err = det.detect_one(&frame).unwrap_err();
        assert!(matches!(err, DetectError::InferenceFailure(ref m) if m.contains("backend crashed")));
    }
}
